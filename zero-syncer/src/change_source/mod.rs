//! The Postgres logical-replication change source.
//!
//! Opens a replication session against upstream, decodes the `pgoutput`
//! stream, assembles raw messages into contiguous transaction bursts,
//! and feeds them through the multiplexer. Acks from the consumer are
//! converted to standby status updates so the slot's
//! `confirmed_flush_lsn` tracks what was durably applied.
//!
//! Stream lifecycle: `Opening → Streaming ⇄ Paused → Closing → Closed`.
//! The stream closes on cancellation, upstream errors, unsupported
//! schema changes, or takeover by another worker; unsupported schema
//! changes additionally emit `rollback` + `control(reset-required)` so
//! consumers know a resync is coming.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures03::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tokio_postgres::{error::SqlState, NoTls};
use tracing::{debug, error, info, instrument, warn};
use zero_core::{
    change::{
        ChangeStreamMessage, ColumnSpec, ControlMessage, DataChange, Relation, ReplicaIdentity,
        Row, RowKeySpec, TableId,
    },
    error::AutoResetSignal,
    version::StateVersion,
};
use zero_storage::{
    cdc::{CdcStore, ReplicationConfig},
    cvr::StoreError,
    postgres::Shard,
};

pub mod acker;
pub mod pgoutput;
pub mod schema_watch;
pub mod values;

use crate::multiplexer::{Multiplexer, MuxError};
use acker::Acker;
use pgoutput::{
    decode_frame, decode_message, DecodeError, PgOutputMessage, RelationBody, ReplicationFrame,
    TupleData, TupleValue,
};

pub const MAX_ATTEMPTS_IF_REPLICATION_SLOT_ACTIVE: usize = 10;
pub const SLOT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);
const REPLICA_IDENTITY_DEBOUNCE: Duration = Duration::from_secs(60);
/// Prefix of transactional messages emitted by the DDL event triggers.
pub const DDL_MESSAGE_PREFIX: &str = "zero/ddl";

#[derive(Error, Debug)]
pub enum ChangeSourceError {
    #[error("replication aborted: {0}")]
    Abort(String),
    #[error(transparent)]
    AutoReset(#[from] AutoResetSignal),
    #[error("unsupported schema change: {0}")]
    UnsupportedSchemaChange(String),
    #[error("unsupported table schema: {0}")]
    UnsupportedTableSchema(String),
    #[error("upstream error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("protocol decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("bookkeeping error: {0}")]
    Store(#[from] StoreError),
    #[error("multiplexer error: {0}")]
    Mux(#[from] MuxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Streaming,
    Paused,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChangeSourceConfig {
    pub upstream_url: String,
    pub shard: Shard,
    pub publications: Vec<String>,
    pub ignored_tables: HashSet<TableId>,
    /// Whether DDL event triggers are installed upstream. Without them,
    /// schema drift is detected from relation metadata and anything
    /// ambiguous fails the stream.
    pub ddl_triggers: bool,
}

impl ChangeSourceConfig {
    pub fn slot_name(&self) -> String {
        format!("zero_{}", self.shard.ident())
    }

    fn replication_config(&self) -> ReplicationConfig {
        let mut ignored: Vec<String> = self
            .ignored_tables
            .iter()
            .map(|t| t.to_string())
            .collect();
        ignored.sort();
        ReplicationConfig {
            slot_name: self.slot_name(),
            publications: self.publications.clone(),
            ignored_tables: ignored,
        }
    }
}

/// A running change stream: the consumer acks watermarks through
/// `acks`; changes arrive via the multiplexer this source was given.
pub struct ChangeStream {
    pub acks: mpsc::Sender<StateVersion>,
    pub handle: JoinHandle<Result<(), ChangeSourceError>>,
}

pub struct ChangeSource {
    config: ChangeSourceConfig,
    cdc: Arc<CdcStore>,
    mux: Multiplexer,
}

impl ChangeSource {
    pub fn new(config: ChangeSourceConfig, cdc: Arc<CdcStore>, mux: Multiplexer) -> Self {
        ChangeSource { config, cdc, mux }
    }

    /// Opens the replication session and starts streaming just after
    /// `start` (or the durable resume point when absent).
    pub async fn start_stream(
        &self,
        start: Option<StateVersion>,
    ) -> Result<ChangeStream, ChangeSourceError> {
        // Durable config must match what we were started with.
        self.cdc
            .load_or_init_config(&self.config.replication_config())
            .await?;
        let resume_at = match start {
            Some(watermark) => watermark,
            None => self.cdc.last_watermark().await?,
        };

        let mut state = StreamState::Opening;
        info!(?state, slot = %self.config.slot_name(), %resume_at, "opening change stream");

        // The replication session; the `replication` parameter rides the
        // connection string.
        let (client, connection) =
            tokio_postgres::connect(&replication_url(&self.config.upstream_url), NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(%err, "replication connection error");
            }
        });
        // A plain session for administrative statements (replica
        // identity repair).
        let (admin, admin_connection) =
            tokio_postgres::connect(&self.config.upstream_url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = admin_connection.await {
                debug!(%err, "admin connection closed");
            }
        });

        ensure_slot(&client, &self.config.slot_name()).await?;

        let start_lsn = resume_at
            .to_lsn()
            .map_err(|e| ChangeSourceError::Abort(e.to_string()))?;
        let publications = self.config.publications.join(",");
        let sql = format!(
            "START_REPLICATION SLOT \"{}\" LOGICAL {} (proto_version '1', publication_names '{}', messages 'true')",
            self.config.slot_name(),
            start_lsn,
            publications,
        );
        let duplex = client.copy_both_simple::<Bytes>(&sql).await?;
        state = StreamState::Streaming;
        info!(?state, "slot confirmed; streaming");

        let (acks_tx, acks_rx) = mpsc::channel(64);
        let worker = StreamWorker {
            assembler: TransactionAssembler::new(
                self.config.ignored_tables.clone(),
                self.config.ddl_triggers,
            ),
            mux: self.mux.clone(),
            cdc: self.cdc.clone(),
            acker: Acker::new(start_lsn),
            admin,
            identity_fixes: HashMap::new(),
        };
        let handle = tokio::spawn(worker.run(duplex, acks_rx));
        Ok(ChangeStream { acks: acks_tx, handle })
    }

    /// Tables of the configured publications, for initial sync.
    pub async fn published_tables(&self) -> Result<Vec<TableId>, ChangeSourceError> {
        let (client, connection) =
            tokio_postgres::connect(&self.config.upstream_url, NoTls).await?;
        tokio::spawn(async move {
            let _ = connection.await;
        });
        let rows = client
            .query(
                "SELECT schemaname, tablename FROM pg_publication_tables
                   WHERE pubname = ANY($1) ORDER BY schemaname, tablename",
                &[&self.config.publications],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| TableId::new(row.get::<_, String>(0), row.get::<_, String>(1)))
            .filter(|t| !self.config.ignored_tables.contains(t))
            .collect())
    }
}

fn replication_url(url: &str) -> String {
    format!("{url} replication=database")
}

async fn ensure_slot(
    client: &tokio_postgres::Client,
    slot: &str,
) -> Result<(), ChangeSourceError> {
    let sql = format!("CREATE_REPLICATION_SLOT \"{slot}\" LOGICAL pgoutput NOEXPORT_SNAPSHOT");
    for attempt in 1..=MAX_ATTEMPTS_IF_REPLICATION_SLOT_ACTIVE {
        match client.simple_query(&sql).await {
            Ok(_) => return Ok(()),
            Err(err) => match err.code() {
                Some(&SqlState::DUPLICATE_OBJECT) => return Ok(()),
                Some(&SqlState::OBJECT_IN_USE)
                    if attempt < MAX_ATTEMPTS_IF_REPLICATION_SLOT_ACTIVE =>
                {
                    debug!(slot, attempt, "slot busy; retrying");
                    sleep(SLOT_RETRY_INTERVAL).await;
                }
                _ => return Err(err.into()),
            },
        }
    }
    Err(ChangeSourceError::Abort(format!("replication slot {slot} stayed active")))
}

struct StreamWorker {
    assembler: TransactionAssembler,
    mux: Multiplexer,
    cdc: Arc<CdcStore>,
    acker: Acker,
    admin: tokio_postgres::Client,
    identity_fixes: HashMap<TableId, std::time::Instant>,
}

impl StreamWorker {
    #[instrument(skip_all)]
    async fn run(
        mut self,
        duplex: tokio_postgres::CopyBothDuplex<Bytes>,
        mut acks: mpsc::Receiver<StateVersion>,
    ) -> Result<(), ChangeSourceError> {
        let (mut sink, mut frames) = duplex.split();
        let mut status_timer = interval(STATUS_INTERVAL);
        status_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = StreamState::Streaming;

        let result = loop {
            tokio::select! {
                frame = frames.next() => {
                    let Some(frame) = frame else {
                        break Err(ChangeSourceError::Abort("replication stream ended".to_string()));
                    };
                    if state == StreamState::Paused {
                        state = StreamState::Streaming;
                    }
                    match self.handle_frame(frame?).await {
                        Ok(Some(reply)) => sink.send(reply).await?,
                        Ok(None) => {}
                        Err(err) => break Err(err),
                    }
                }
                ack = acks.recv() => {
                    let Some(watermark) = ack else {
                        break Err(ChangeSourceError::Abort("consumer went away".to_string()));
                    };
                    match self.acker.ack(&watermark) {
                        Ok(Some(frame)) => {
                            sink.send(frame).await?;
                            // Everything at or below the confirmed point
                            // is durable downstream.
                            if let Err(err) = self.cdc.purge_through(&watermark).await {
                                warn!(%err, "change log purge failed");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => break Err(err),
                    }
                }
                _ = status_timer.tick() => {
                    if state == StreamState::Streaming {
                        state = StreamState::Paused;
                    }
                    sink.send(self.acker.keepalive()).await?;
                }
            }
        };

        state = StreamState::Closing;
        debug!(?state, "closing change stream");
        if let Err(err) = &result {
            if matches!(err, ChangeSourceError::UnsupportedSchemaChange(_)) {
                self.abort_current_txn().await;
                let _ = self
                    .mux
                    .push_status(ChangeStreamMessage::Control(ControlMessage::ResetRequired))
                    .await;
            }
            warn!(%err, "change stream failed");
        }
        state = StreamState::Closed;
        info!(?state, "change stream closed");
        result
    }

    async fn handle_frame(
        &mut self,
        frame: Bytes,
    ) -> Result<Option<Bytes>, ChangeSourceError> {
        match decode_frame(frame)? {
            ReplicationFrame::Keepalive { reply_requested, .. } => {
                Ok(reply_requested.then(|| self.acker.keepalive()))
            }
            ReplicationFrame::XLogData { payload, .. } => {
                let message = decode_message(payload)?;
                if let PgOutputMessage::Relation(body) = &message {
                    self.maybe_fix_replica_identity(body).await;
                }
                if let Some(burst) = self.assembler.apply(message)? {
                    self.emit(burst).await?;
                }
                Ok(None)
            }
        }
    }

    /// Pushes one complete transaction burst through the multiplexer
    /// and records it for restart/resume.
    async fn emit(&mut self, burst: Vec<ChangeStreamMessage>) -> Result<(), ChangeSourceError> {
        let Some(ChangeStreamMessage::Commit { watermark }) = burst.last().cloned() else {
            // Rolled-back transactions are forwarded but not persisted.
            let resume_at = self.mux.reserve().await;
            for message in burst {
                self.mux.push(message).await?;
            }
            self.mux.release(resume_at);
            return Ok(());
        };

        let resume_at = self.mux.reserve().await;
        if watermark <= resume_at {
            // Replayed by upstream after a restart; downstream has it.
            debug!(%watermark, %resume_at, "skipping already-delivered transaction");
            self.mux.release(resume_at);
            return Ok(());
        }

        let logged: Vec<serde_json::Value> = burst
            .iter()
            .filter_map(|m| match m {
                ChangeStreamMessage::Data(change) => serde_json::to_value(change).ok(),
                _ => None,
            })
            .collect();
        for message in burst {
            self.mux.push(message).await?;
        }
        self.mux.release(watermark.clone());
        self.cdc.append_changes(&watermark, &logged).await?;
        metrics::counter!("change_source_transactions").increment(1);
        Ok(())
    }

    /// Flushes whatever was buffered as `begin … rollback` so downstream
    /// observes a complete (abandoned) burst.
    async fn abort_current_txn(&mut self) {
        if let Some(mut burst) = self.assembler.abort() {
            burst.push(ChangeStreamMessage::Rollback);
            let resume_at = self.mux.reserve().await;
            for message in burst {
                if self.mux.push(message).await.is_err() {
                    break;
                }
            }
            self.mux.release(resume_at);
        }
    }

    /// Best-effort, debounced upgrade of a table's replica identity when
    /// a suitable unique index over NOT NULL columns exists.
    async fn maybe_fix_replica_identity(&mut self, body: &RelationBody) {
        if body.replica_identity != ReplicaIdentity::Nothing {
            return;
        }
        let table = TableId::new(&body.namespace, &body.name);
        let now = std::time::Instant::now();
        if self
            .identity_fixes
            .get(&table)
            .is_some_and(|last| now.duration_since(*last) < REPLICA_IDENTITY_DEBOUNCE)
        {
            return;
        }
        self.identity_fixes.insert(table.clone(), now);

        let index: Option<String> = match self
            .admin
            .query_opt(
                r#"
                SELECT ci.relname FROM pg_index i
                  JOIN pg_class ct ON ct.oid = i.indrelid
                  JOIN pg_namespace n ON n.oid = ct.relnamespace
                  JOIN pg_class ci ON ci.oid = i.indexrelid
                 WHERE n.nspname = $1 AND ct.relname = $2 AND i.indisunique
                   AND NOT EXISTS (
                     SELECT 1 FROM unnest(i.indkey) k
                       JOIN pg_attribute a ON a.attrelid = ct.oid AND a.attnum = k
                      WHERE NOT a.attnotnull)
                 ORDER BY ci.relname LIMIT 1
                "#,
                &[&body.namespace, &body.name],
            )
            .await
        {
            Ok(row) => row.map(|r| r.get(0)),
            Err(err) => {
                debug!(%err, %table, "replica identity probe failed");
                return;
            }
        };
        let Some(index) = index else { return };
        info!(%table, index, "setting replica identity from unique index");
        if let Err(err) = self
            .admin
            .execute(
                &format!(
                    "ALTER TABLE \"{}\".\"{}\" REPLICA IDENTITY USING INDEX \"{}\"",
                    body.namespace, body.name, index
                ),
                &[],
            )
            .await
        {
            warn!(%err, %table, "replica identity fix failed");
        }
    }
}

// ---------------------------------------------------------------------
// Transaction assembly
// ---------------------------------------------------------------------

/// Assembles raw pgoutput messages into contiguous transaction bursts:
/// `begin, data*, commit` (or `rollback`). Data changes for ignored
/// tables are dropped; relation metadata drift is converted to DDL
/// changes (or fails the stream) depending on the trigger mode.
pub struct TransactionAssembler {
    relations: HashMap<u32, Relation>,
    column_oids: HashMap<u32, Vec<u32>>,
    ignored: HashSet<TableId>,
    ddl_triggers: bool,
    current: Option<TxnBuffer>,
}

struct TxnBuffer {
    commit_watermark: StateVersion,
    messages: Vec<ChangeStreamMessage>,
}

impl TransactionAssembler {
    pub fn new(ignored: HashSet<TableId>, ddl_triggers: bool) -> Self {
        TransactionAssembler {
            relations: HashMap::new(),
            column_oids: HashMap::new(),
            ignored,
            ddl_triggers,
            current: None,
        }
    }

    /// Feeds one message; returns a complete burst when the transaction
    /// closed.
    pub fn apply(
        &mut self,
        message: PgOutputMessage,
    ) -> Result<Option<Vec<ChangeStreamMessage>>, ChangeSourceError> {
        match message {
            PgOutputMessage::Begin { final_lsn, .. } => {
                let commit_watermark = StateVersion::from_lsn(final_lsn);
                self.current = Some(TxnBuffer {
                    messages: vec![ChangeStreamMessage::Begin {
                        commit_watermark: commit_watermark.clone(),
                    }],
                    commit_watermark,
                });
                Ok(None)
            }
            PgOutputMessage::Commit { commit_lsn, .. } => {
                let Some(mut buffer) = self.current.take() else {
                    warn!("commit without begin; ignoring");
                    return Ok(None);
                };
                let watermark = StateVersion::from_lsn(commit_lsn);
                debug_assert_eq!(watermark, buffer.commit_watermark);
                buffer
                    .messages
                    .push(ChangeStreamMessage::Commit { watermark });
                Ok(Some(buffer.messages))
            }
            PgOutputMessage::Relation(body) => {
                self.handle_relation(body)?;
                Ok(None)
            }
            PgOutputMessage::Insert { relation_id, new } => {
                if let Some((relation, row)) = self.data_row(relation_id, &new)? {
                    self.push_data(DataChange::Insert { relation, new: row });
                }
                Ok(None)
            }
            PgOutputMessage::Update { relation_id, old, new } => {
                if let Some((relation, row)) = self.data_row(relation_id, &new)? {
                    let key = match old {
                        Some((tuple, _full)) => {
                            Some(self.key_row(&relation, relation_id, &tuple))
                        }
                        None => None,
                    };
                    self.push_data(DataChange::Update { relation, key, new: row });
                }
                Ok(None)
            }
            PgOutputMessage::Delete { relation_id, old, .. } => {
                if let Some(relation) = self.live_relation(relation_id) {
                    let key = self.key_row(&relation, relation_id, &old);
                    self.push_data(DataChange::Delete { relation, key });
                }
                Ok(None)
            }
            PgOutputMessage::Truncate { relation_ids } => {
                let relations: Vec<Relation> = relation_ids
                    .iter()
                    .filter_map(|id| self.live_relation(*id))
                    .collect();
                if !relations.is_empty() {
                    self.push_data(DataChange::Truncate { relations });
                }
                Ok(None)
            }
            PgOutputMessage::Message { prefix, content } => {
                if prefix == DDL_MESSAGE_PREFIX {
                    let change: DataChange = serde_json::from_slice(&content).map_err(|e| {
                        ChangeSourceError::UnsupportedSchemaChange(format!(
                            "malformed ddl message: {e}"
                        ))
                    })?;
                    let ignored = change
                        .table()
                        .is_some_and(|t| self.ignored.contains(t));
                    if !ignored {
                        self.push_data(change);
                    }
                }
                Ok(None)
            }
            PgOutputMessage::Skipped => Ok(None),
        }
    }

    /// Abandons the open transaction, handing back what was buffered.
    pub fn abort(&mut self) -> Option<Vec<ChangeStreamMessage>> {
        self.current.take().map(|b| b.messages)
    }

    fn handle_relation(&mut self, body: RelationBody) -> Result<(), ChangeSourceError> {
        let relation = convert_relation(&body)?;
        self.column_oids.insert(
            body.id,
            body.columns.iter().map(|c| c.type_oid).collect(),
        );
        if let Some(known) = self.relations.get(&body.id) {
            if *known != relation && !self.ddl_triggers {
                // Trigger-less mode: derive DDL from the drift, or fail.
                let changes = schema_watch::diff_relations(known, &relation)?;
                let ignored = self.ignored.contains(&relation.id);
                for change in changes {
                    if !ignored {
                        self.push_data(change);
                    }
                }
            }
        }
        self.relations.insert(body.id, relation);
        Ok(())
    }

    fn live_relation(&self, relation_id: u32) -> Option<Relation> {
        let relation = self.relations.get(&relation_id)?;
        if self.ignored.contains(&relation.id) {
            return None;
        }
        Some(relation.clone())
    }

    fn data_row(
        &mut self,
        relation_id: u32,
        tuple: &TupleData,
    ) -> Result<Option<(Relation, Row)>, ChangeSourceError> {
        let Some(relation) = self.live_relation(relation_id) else { return Ok(None) };
        let oids = self
            .column_oids
            .get(&relation_id)
            .cloned()
            .unwrap_or_default();
        let mut row = Row::new();
        for (i, value) in tuple.0.iter().enumerate() {
            let Some(column) = relation.columns.get(i) else { break };
            match value {
                // Unchanged TOAST columns are omitted, not null.
                TupleValue::Unchanged => {}
                TupleValue::Null => {
                    row.insert(column.name.clone(), serde_json::Value::Null);
                }
                TupleValue::Text(bytes) => {
                    let text = String::from_utf8_lossy(bytes);
                    let oid = oids.get(i).copied().unwrap_or(25);
                    row.insert(column.name.clone(), values::parse_by_oid(&text, oid));
                }
            }
        }
        Ok(Some((relation, row)))
    }

    /// Reduces an old-row tuple to the key columns.
    fn key_row(&self, relation: &Relation, relation_id: u32, tuple: &TupleData) -> Row {
        let oids = self.column_oids.get(&relation_id);
        let mut key = Row::new();
        for (i, value) in tuple.0.iter().enumerate() {
            let Some(column) = relation.columns.get(i) else { break };
            if !relation
                .row_key
                .columns
                .contains(&column.name)
            {
                continue;
            }
            if let TupleValue::Text(bytes) = value {
                let text = String::from_utf8_lossy(bytes);
                let oid = oids
                    .and_then(|o| o.get(i))
                    .copied()
                    .unwrap_or(25);
                key.insert(column.name.clone(), values::parse_by_oid(&text, oid));
            }
        }
        key
    }

    fn push_data(&mut self, change: DataChange) {
        if let Some(buffer) = self.current.as_mut() {
            buffer.messages.push(ChangeStreamMessage::Data(change));
        } else {
            warn!("data change outside a transaction; dropping");
        }
    }
}

fn convert_relation(body: &RelationBody) -> Result<Relation, ChangeSourceError> {
    let key_columns: Vec<String> = body
        .columns
        .iter()
        .filter(|c| c.is_key)
        .map(|c| c.name.clone())
        .collect();
    if key_columns.is_empty() && body.replica_identity != ReplicaIdentity::Full {
        return Err(ChangeSourceError::UnsupportedTableSchema(format!(
            "{}.{} has no usable replica identity",
            body.namespace, body.name
        )));
    }
    Ok(Relation {
        id: TableId::new(&body.namespace, &body.name),
        oid: body.id,
        row_key: RowKeySpec { columns: key_columns, identity: body.replica_identity },
        columns: body
            .columns
            .iter()
            .map(|c| ColumnSpec {
                name: c.name.clone(),
                metadata: zero_core::lite::ColumnMetadata::of(values::type_name(c.type_oid)),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;
    use zero_core::version::Lsn;

    use super::pgoutput::RelationColumn;
    use super::*;

    fn relation_body(id: u32, namespace: &str, name: &str) -> RelationBody {
        RelationBody {
            id,
            namespace: namespace.to_string(),
            name: name.to_string(),
            replica_identity: ReplicaIdentity::Default,
            columns: vec![
                RelationColumn { is_key: true, name: "id".to_string(), type_oid: 20, type_modifier: -1 },
                RelationColumn { is_key: false, name: "label".to_string(), type_oid: 25, type_modifier: -1 },
            ],
        }
    }

    fn text(s: &str) -> TupleValue {
        TupleValue::Text(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn assembler(ignored: &[(&str, &str)]) -> TransactionAssembler {
        TransactionAssembler::new(
            ignored
                .iter()
                .map(|(s, t)| TableId::new(*s, *t))
                .collect(),
            true,
        )
    }

    #[test]
    fn assembles_contiguous_bursts() {
        let mut assembler = assembler(&[]);
        assert!(assembler
            .apply(PgOutputMessage::Begin { final_lsn: Lsn(1000), xid: 1 })
            .unwrap()
            .is_none());
        assembler
            .apply(PgOutputMessage::Relation(relation_body(1, "public", "foo")))
            .unwrap();
        assert!(assembler
            .apply(PgOutputMessage::Insert {
                relation_id: 1,
                new: TupleData(vec![text("7"), text("seven")]),
            })
            .unwrap()
            .is_none());
        let burst = assembler
            .apply(PgOutputMessage::Commit { commit_lsn: Lsn(1000), end_lsn: Lsn(1001) })
            .unwrap()
            .unwrap();

        assert_eq!(burst.len(), 3);
        let watermark = StateVersion::from_lsn(Lsn(1000));
        assert_eq!(
            burst[0],
            ChangeStreamMessage::Begin { commit_watermark: watermark.clone() }
        );
        let ChangeStreamMessage::Data(DataChange::Insert { relation, new }) = &burst[1] else {
            panic!("insert expected");
        };
        assert_eq!(relation.id, TableId::new("public", "foo"));
        assert_eq!(new["id"], json!(7), "int8 parsed by oid");
        assert_eq!(new["label"], json!("seven"));
        assert_eq!(burst[2], ChangeStreamMessage::Commit { watermark });
    }

    #[test]
    fn ignored_tables_are_filtered_from_the_burst() {
        let mut assembler = assembler(&[("my", "boo")]);
        assembler
            .apply(PgOutputMessage::Begin { final_lsn: Lsn(2000), xid: 2 })
            .unwrap();
        assembler
            .apply(PgOutputMessage::Relation(relation_body(1, "public", "foo")))
            .unwrap();
        assembler
            .apply(PgOutputMessage::Relation(relation_body(2, "my", "boo")))
            .unwrap();
        assembler
            .apply(PgOutputMessage::Insert {
                relation_id: 1,
                new: TupleData(vec![text("1"), text("test2")]),
            })
            .unwrap();
        assembler
            .apply(PgOutputMessage::Insert {
                relation_id: 2,
                new: TupleData(vec![text("x"), text("y")]),
            })
            .unwrap();
        let burst = assembler
            .apply(PgOutputMessage::Commit { commit_lsn: Lsn(2000), end_lsn: Lsn(2001) })
            .unwrap()
            .unwrap();

        // begin, insert(foo), commit; nothing for my.boo.
        assert_eq!(burst.len(), 3);
        let ChangeStreamMessage::Data(DataChange::Insert { relation, .. }) = &burst[1] else {
            panic!("insert expected");
        };
        assert_eq!(relation.id, TableId::new("public", "foo"));
    }

    #[test]
    fn unchanged_toast_columns_are_omitted() {
        let mut assembler = assembler(&[]);
        assembler
            .apply(PgOutputMessage::Begin { final_lsn: Lsn(3000), xid: 3 })
            .unwrap();
        assembler
            .apply(PgOutputMessage::Relation(relation_body(1, "public", "foo")))
            .unwrap();
        assembler
            .apply(PgOutputMessage::Update {
                relation_id: 1,
                old: None,
                new: TupleData(vec![text("7"), TupleValue::Unchanged]),
            })
            .unwrap();
        let burst = assembler
            .apply(PgOutputMessage::Commit { commit_lsn: Lsn(3000), end_lsn: Lsn(3001) })
            .unwrap()
            .unwrap();

        let ChangeStreamMessage::Data(DataChange::Update { new, key, .. }) = &burst[1] else {
            panic!("update expected");
        };
        assert_eq!(key, &None);
        assert!(new.contains_key("id"));
        assert!(!new.contains_key("label"), "unchanged TOAST column omitted");
    }

    #[test]
    fn delete_reduces_old_row_to_key_columns() {
        let mut assembler = assembler(&[]);
        assembler
            .apply(PgOutputMessage::Begin { final_lsn: Lsn(4000), xid: 4 })
            .unwrap();
        assembler
            .apply(PgOutputMessage::Relation(relation_body(1, "public", "foo")))
            .unwrap();
        assembler
            .apply(PgOutputMessage::Delete {
                relation_id: 1,
                old: TupleData(vec![text("7"), TupleValue::Null]),
                full_old_row: false,
            })
            .unwrap();
        let burst = assembler
            .apply(PgOutputMessage::Commit { commit_lsn: Lsn(4000), end_lsn: Lsn(4001) })
            .unwrap()
            .unwrap();

        let ChangeStreamMessage::Data(DataChange::Delete { key, .. }) = &burst[1] else {
            panic!("delete expected");
        };
        assert_eq!(key.len(), 1);
        assert_eq!(key["id"], json!(7));
    }

    #[test]
    fn ddl_messages_become_schema_changes() {
        let mut assembler = assembler(&[]);
        assembler
            .apply(PgOutputMessage::Begin { final_lsn: Lsn(5000), xid: 5 })
            .unwrap();
        let ddl = json!({
            "tag": "drop-table",
            "id": {"schema": "public", "table": "gone"},
        });
        assembler
            .apply(PgOutputMessage::Message {
                prefix: DDL_MESSAGE_PREFIX.to_string(),
                content: Bytes::from(serde_json::to_vec(&ddl).unwrap()),
            })
            .unwrap();
        let burst = assembler
            .apply(PgOutputMessage::Commit { commit_lsn: Lsn(5000), end_lsn: Lsn(5001) })
            .unwrap()
            .unwrap();
        assert!(matches!(
            &burst[1],
            ChangeStreamMessage::Data(DataChange::DropTable { id }) if id.table == "gone"
        ));
    }

    #[test]
    fn trigger_less_drift_fails_on_key_change() {
        let mut assembler = TransactionAssembler::new(HashSet::new(), false);
        assembler
            .apply(PgOutputMessage::Begin { final_lsn: Lsn(6000), xid: 6 })
            .unwrap();
        assembler
            .apply(PgOutputMessage::Relation(relation_body(1, "public", "foo")))
            .unwrap();

        let mut drifted = relation_body(1, "public", "foo");
        drifted.columns[0].is_key = false;
        drifted.columns[1].is_key = true;
        let err = assembler
            .apply(PgOutputMessage::Relation(drifted))
            .unwrap_err();
        assert!(matches!(err, ChangeSourceError::UnsupportedSchemaChange(_)));

        // The buffered transaction is recoverable for the rollback path.
        let aborted = assembler.abort().unwrap();
        assert!(matches!(aborted[0], ChangeStreamMessage::Begin { .. }));
    }
}
