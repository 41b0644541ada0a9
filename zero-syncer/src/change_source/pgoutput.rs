//! Decoding the `pgoutput` logical replication protocol.
//!
//! Two layers share this module: the outer CopyData frames of the
//! streaming replication protocol (`w` XLogData / `k` keepalive, and the
//! `r` standby status update we send back), and the pgoutput messages
//! carried inside XLogData payloads. Only the message shapes the change
//! source consumes are modeled; everything else decodes to
//! [`PgOutputMessage::Skipped`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use zero_core::{change::ReplicaIdentity, version::Lsn};

/// Microseconds between the Unix and Postgres epochs (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("truncated replication frame")]
    Truncated,
    #[error("unknown replication frame tag {0:#x}")]
    UnknownFrame(u8),
    #[error("unknown tuple value tag {0:#x}")]
    UnknownTupleTag(u8),
    #[error("malformed string in replication message")]
    BadString,
}

/// One CopyData frame from the upstream walsender.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    XLogData { start: Lsn, end: Lsn, payload: Bytes },
    Keepalive { end: Lsn, reply_requested: bool },
}

pub fn decode_frame(mut data: Bytes) -> Result<ReplicationFrame, DecodeError> {
    if data.remaining() < 1 {
        return Err(DecodeError::Truncated);
    }
    match data.get_u8() {
        b'w' => {
            if data.remaining() < 24 {
                return Err(DecodeError::Truncated);
            }
            let start = Lsn(data.get_u64());
            let end = Lsn(data.get_u64());
            let _timestamp = data.get_i64();
            Ok(ReplicationFrame::XLogData { start, end, payload: data })
        }
        b'k' => {
            if data.remaining() < 17 {
                return Err(DecodeError::Truncated);
            }
            let end = Lsn(data.get_u64());
            let _timestamp = data.get_i64();
            let reply_requested = data.get_u8() != 0;
            Ok(ReplicationFrame::Keepalive { end, reply_requested })
        }
        tag => Err(DecodeError::UnknownFrame(tag)),
    }
}

/// Encodes a standby status update (`r`) acknowledging `ack` for all
/// three positions.
pub fn encode_standby_status(ack: Lsn, request_reply: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(ack.0); // written
    buf.put_u64(ack.0); // flushed
    buf.put_u64(ack.0); // applied
    buf.put_i64(pg_now_micros());
    buf.put_u8(request_reply as u8);
    buf.freeze()
}

fn pg_now_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    micros - PG_EPOCH_OFFSET_MICROS
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    /// TOASTed and unchanged; the column must be treated as omitted.
    Unchanged,
    Text(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TupleData(pub Vec<TupleValue>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumn {
    pub is_key: bool,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PgOutputMessage {
    Begin {
        final_lsn: Lsn,
        xid: u32,
    },
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
    },
    Relation(RelationBody),
    Insert {
        relation_id: u32,
        new: TupleData,
    },
    Update {
        relation_id: u32,
        /// Key columns of the old row (`K`) or the full old row (`O`).
        old: Option<(TupleData, bool)>,
        new: TupleData,
    },
    Delete {
        relation_id: u32,
        old: TupleData,
        /// True when `old` is a full row (replica identity FULL).
        full_old_row: bool,
    },
    Truncate {
        relation_ids: Vec<u32>,
    },
    /// A transactional logical-decoding message (`pg_logical_emit_message`);
    /// DDL event triggers use these.
    Message {
        prefix: String,
        content: Bytes,
    },
    /// Origin/Type/etc: carried by the protocol, irrelevant here.
    Skipped,
}

pub fn decode_message(mut data: Bytes) -> Result<PgOutputMessage, DecodeError> {
    if data.remaining() < 1 {
        return Err(DecodeError::Truncated);
    }
    match data.get_u8() {
        b'B' => {
            ensure(&data, 20)?;
            let final_lsn = Lsn(data.get_u64());
            let _timestamp = data.get_i64();
            let xid = data.get_u32();
            Ok(PgOutputMessage::Begin { final_lsn, xid })
        }
        b'C' => {
            ensure(&data, 25)?;
            let _flags = data.get_u8();
            let commit_lsn = Lsn(data.get_u64());
            let end_lsn = Lsn(data.get_u64());
            let _timestamp = data.get_i64();
            Ok(PgOutputMessage::Commit { commit_lsn, end_lsn })
        }
        b'R' => {
            ensure(&data, 4)?;
            let id = data.get_u32();
            let namespace = get_cstr(&mut data)?;
            let name = get_cstr(&mut data)?;
            ensure(&data, 3)?;
            let replica_identity = match data.get_u8() {
                b'd' => ReplicaIdentity::Default,
                b'f' => ReplicaIdentity::Full,
                b'i' => ReplicaIdentity::Index,
                _ => ReplicaIdentity::Nothing,
            };
            let ncols = data.get_u16();
            let mut columns = Vec::with_capacity(ncols as usize);
            for _ in 0..ncols {
                ensure(&data, 1)?;
                let flags = data.get_u8();
                let name = get_cstr(&mut data)?;
                ensure(&data, 8)?;
                let type_oid = data.get_u32();
                let type_modifier = data.get_i32();
                columns.push(RelationColumn {
                    is_key: flags & 1 != 0,
                    name,
                    type_oid,
                    type_modifier,
                });
            }
            Ok(PgOutputMessage::Relation(RelationBody {
                id,
                namespace,
                name,
                replica_identity,
                columns,
            }))
        }
        b'I' => {
            ensure(&data, 5)?;
            let relation_id = data.get_u32();
            if data.get_u8() != b'N' {
                return Err(DecodeError::Truncated);
            }
            Ok(PgOutputMessage::Insert { relation_id, new: get_tuple(&mut data)? })
        }
        b'U' => {
            ensure(&data, 5)?;
            let relation_id = data.get_u32();
            let mut old = None;
            let mut tag = data.get_u8();
            if tag == b'K' || tag == b'O' {
                old = Some((get_tuple(&mut data)?, tag == b'O'));
                ensure(&data, 1)?;
                tag = data.get_u8();
            }
            if tag != b'N' {
                return Err(DecodeError::Truncated);
            }
            Ok(PgOutputMessage::Update { relation_id, old, new: get_tuple(&mut data)? })
        }
        b'D' => {
            ensure(&data, 5)?;
            let relation_id = data.get_u32();
            let tag = data.get_u8();
            if tag != b'K' && tag != b'O' {
                return Err(DecodeError::Truncated);
            }
            Ok(PgOutputMessage::Delete {
                relation_id,
                old: get_tuple(&mut data)?,
                full_old_row: tag == b'O',
            })
        }
        b'T' => {
            ensure(&data, 5)?;
            let nrelations = data.get_u32();
            let _options = data.get_u8();
            let mut relation_ids = Vec::with_capacity(nrelations as usize);
            for _ in 0..nrelations {
                ensure(&data, 4)?;
                relation_ids.push(data.get_u32());
            }
            Ok(PgOutputMessage::Truncate { relation_ids })
        }
        b'M' => {
            ensure(&data, 9)?;
            let _transactional = data.get_u8();
            let _lsn = data.get_u64();
            let prefix = get_cstr(&mut data)?;
            ensure(&data, 4)?;
            let length = data.get_u32() as usize;
            ensure(&data, length)?;
            let content = data.split_to(length);
            Ok(PgOutputMessage::Message { prefix, content })
        }
        b'O' | b'Y' => Ok(PgOutputMessage::Skipped),
        tag => Err(DecodeError::UnknownFrame(tag)),
    }
}

fn ensure(data: &Bytes, len: usize) -> Result<(), DecodeError> {
    if data.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    Ok(())
}

fn get_cstr(data: &mut Bytes) -> Result<String, DecodeError> {
    let end = data
        .iter()
        .position(|b| *b == 0)
        .ok_or(DecodeError::Truncated)?;
    let raw = data.split_to(end);
    data.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::BadString)
}

fn get_tuple(data: &mut Bytes) -> Result<TupleData, DecodeError> {
    ensure(data, 2)?;
    let ncols = data.get_u16();
    let mut values = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        ensure(data, 1)?;
        match data.get_u8() {
            b'n' => values.push(TupleValue::Null),
            b'u' => values.push(TupleValue::Unchanged),
            b't' => {
                ensure(data, 4)?;
                let len = data.get_u32() as usize;
                ensure(data, len)?;
                values.push(TupleValue::Text(data.split_to(len)));
            }
            b'b' => {
                ensure(data, 4)?;
                let len = data.get_u32() as usize;
                ensure(data, len)?;
                // Binary mode is not requested; tolerate it as raw text.
                values.push(TupleValue::Text(data.split_to(len)));
            }
            tag => return Err(DecodeError::UnknownTupleTag(tag)),
        }
    }
    Ok(TupleData(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_cstr(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    #[test]
    fn decodes_xlogdata_and_keepalive_frames() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(0x16_0000_0010);
        buf.put_u64(0x16_0000_0020);
        buf.put_i64(0);
        buf.put_slice(b"payload");
        let frame = decode_frame(buf.freeze()).unwrap();
        assert_eq!(
            frame,
            ReplicationFrame::XLogData {
                start: Lsn(0x16_0000_0010),
                end: Lsn(0x16_0000_0020),
                payload: Bytes::from_static(b"payload"),
            }
        );

        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(42);
        buf.put_i64(0);
        buf.put_u8(1);
        let frame = decode_frame(buf.freeze()).unwrap();
        assert_eq!(frame, ReplicationFrame::Keepalive { end: Lsn(42), reply_requested: true });
    }

    #[test]
    fn standby_status_carries_the_ack_three_times() {
        let encoded = encode_standby_status(Lsn(0xABCD), false);
        assert_eq!(encoded[0], b'r');
        let mut body = encoded.slice(1..);
        assert_eq!(body.get_u64(), 0xABCD);
        assert_eq!(body.get_u64(), 0xABCD);
        assert_eq!(body.get_u64(), 0xABCD);
    }

    #[test]
    fn decodes_begin_relation_insert_commit() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(1000);
        buf.put_i64(0);
        buf.put_u32(77);
        let begin = decode_message(buf.freeze()).unwrap();
        assert_eq!(begin, PgOutputMessage::Begin { final_lsn: Lsn(1000), xid: 77 });

        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(16384);
        put_cstr(&mut buf, "public");
        put_cstr(&mut buf, "foo");
        buf.put_u8(b'd');
        buf.put_u16(2);
        buf.put_u8(1);
        put_cstr(&mut buf, "id");
        buf.put_u32(20); // int8
        buf.put_i32(-1);
        buf.put_u8(0);
        put_cstr(&mut buf, "label");
        buf.put_u32(25); // text
        buf.put_i32(-1);
        let relation = decode_message(buf.freeze()).unwrap();
        let PgOutputMessage::Relation(body) = relation else { panic!("relation expected") };
        assert_eq!(body.namespace, "public");
        assert_eq!(body.name, "foo");
        assert_eq!(body.replica_identity, ReplicaIdentity::Default);
        assert!(body.columns[0].is_key);
        assert!(!body.columns[1].is_key);

        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(16384);
        buf.put_u8(b'N');
        buf.put_u16(2);
        buf.put_u8(b't');
        buf.put_u32(1);
        buf.put_slice(b"1");
        buf.put_u8(b'u');
        let insert = decode_message(buf.freeze()).unwrap();
        let PgOutputMessage::Insert { relation_id, new } = insert else { panic!() };
        assert_eq!(relation_id, 16384);
        assert_eq!(new.0[0], TupleValue::Text(Bytes::from_static(b"1")));
        assert_eq!(new.0[1], TupleValue::Unchanged, "unchanged TOAST column");

        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(1000);
        buf.put_u64(1001);
        buf.put_i64(0);
        let commit = decode_message(buf.freeze()).unwrap();
        assert_eq!(commit, PgOutputMessage::Commit { commit_lsn: Lsn(1000), end_lsn: Lsn(1001) });
    }

    #[test]
    fn truncated_messages_error_instead_of_panicking() {
        for bytes in [&b"I\x00\x00"[..], &b"R\x00"[..], &b"w\x00"[..]] {
            let result = decode_frame(Bytes::copy_from_slice(bytes));
            let message = decode_message(Bytes::copy_from_slice(bytes));
            assert!(result.is_err() || message.is_err());
        }
    }
}
