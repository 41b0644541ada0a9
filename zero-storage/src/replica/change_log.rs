//! Reading the replica's change log.
//!
//! The replicator appends one row per applied change, keyed
//! `(stateVersion, pos)`; both halves of the key are ordered (lexi
//! version, then position within the transaction) so a single range scan
//! yields changes in exactly the order they were applied.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use zero_core::{change::DataChange, version::StateVersion};

use super::ReplicaError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub state_version: StateVersion,
    pub pos: i64,
    pub change: DataChange,
}

/// Changes committed in the window `(after, up_to]`.
pub fn read_range(
    conn: &Connection,
    after: &StateVersion,
    up_to: &StateVersion,
) -> Result<Vec<ChangeLogEntry>, ReplicaError> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT stateVersion, pos, change FROM "_zero.changeLog"
          WHERE stateVersion > ?1 AND stateVersion <= ?2
          ORDER BY stateVersion, pos
        "#,
    )?;
    let rows = stmt.query_map(params![after.as_str(), up_to.as_str()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
    })?;
    let mut entries = Vec::new();
    for row in rows {
        let (version, pos, change) = row?;
        entries.push(ChangeLogEntry {
            state_version: StateVersion::parse(&version)
                .map_err(|e| ReplicaError::MalformedChange(e.to_string()))?,
            pos,
            change: serde_json::from_str(&change)?,
        });
    }
    Ok(entries)
}

/// Drops entries at or below `watermark` once no snapshot can still need
/// them.
pub fn purge_through(conn: &Connection, watermark: &StateVersion) -> Result<usize, ReplicaError> {
    let purged = conn.execute(
        r#"DELETE FROM "_zero.changeLog" WHERE stateVersion <= ?1"#,
        params![watermark.as_str()],
    )?;
    Ok(purged)
}
