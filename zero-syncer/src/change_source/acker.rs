//! Standby status updates back to the upstream walsender.
//!
//! The acker turns consumer acks (watermarks) into standby status
//! frames, keeping `confirmed_flush_lsn` monotonically non-decreasing:
//! re-acking an already-acked watermark is a no-op. When nothing was
//! acked for a while, a zero-position keepalive status is sent so the
//! upstream does not declare the standby dead.

use bytes::Bytes;
use tracing::trace;
use zero_core::version::{Lsn, StateVersion};

use super::{pgoutput::encode_standby_status, ChangeSourceError};

pub struct Acker {
    confirmed: Lsn,
}

impl Acker {
    pub fn new(confirmed: Lsn) -> Self {
        Acker { confirmed }
    }

    pub fn confirmed(&self) -> Lsn {
        self.confirmed
    }

    /// Produces the status frame for an ack, or `None` when the
    /// watermark does not advance the confirmed position.
    pub fn ack(&mut self, watermark: &StateVersion) -> Result<Option<Bytes>, ChangeSourceError> {
        let lsn = watermark
            .to_lsn()
            .map_err(|e| ChangeSourceError::Abort(format!("unencodable ack watermark: {e}")))?;
        if lsn <= self.confirmed {
            trace!(%lsn, confirmed = %self.confirmed, "ignoring stale ack");
            return Ok(None);
        }
        self.confirmed = lsn;
        Ok(Some(encode_standby_status(lsn, false)))
    }

    /// The periodic keepalive status; reports the current confirmed
    /// position (or `0/0` before anything was acked).
    pub fn keepalive(&self) -> Bytes {
        encode_standby_status(self.confirmed, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watermark(n: u64) -> StateVersion {
        StateVersion::from_lsn(Lsn(n))
    }

    #[test]
    fn acks_advance_monotonically() {
        let mut acker = Acker::new(Lsn(0));
        assert!(acker.ack(&watermark(100)).unwrap().is_some());
        assert_eq!(acker.confirmed(), Lsn(100));

        // Idempotent: re-acking the same or an older watermark is a
        // no-op and never regresses confirmed_flush_lsn.
        assert!(acker.ack(&watermark(100)).unwrap().is_none());
        assert!(acker.ack(&watermark(50)).unwrap().is_none());
        assert_eq!(acker.confirmed(), Lsn(100));

        assert!(acker.ack(&watermark(101)).unwrap().is_some());
        assert_eq!(acker.confirmed(), Lsn(101));
    }

    #[test]
    fn keepalive_reports_zero_before_first_ack() {
        let acker = Acker::new(Lsn(0));
        let frame = acker.keepalive();
        assert_eq!(frame[0], b'r');
        assert!(frame[1..25].iter().all(|b| *b == 0), "0/0 in all three positions");
    }
}
