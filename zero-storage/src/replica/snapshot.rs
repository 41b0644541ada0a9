//! Read-only snapshots of the replica.
//!
//! Each [`Snapshot`] is its own connection with an open read transaction,
//! pinned to the `stateVersion` that was current when it was taken. The
//! [`Snapshotter`] hands the view-syncer its current snapshot and, on
//! `advance`, the change-log entries that separate it from the next one;
//! that diff set is what drives incremental pipeline maintenance.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use rusqlite::{params_from_iter, Connection};
use zero_core::{
    change::{Row, TableId},
    version::StateVersion,
};

use super::{
    change_log::{read_range, ChangeLogEntry},
    json_to_sql, open_read_only, quote_ident, sql_to_json, state_version, table_columns,
    table_name, ReplicaError,
};

pub struct Snapshot {
    conn: Connection,
    version: StateVersion,
}

impl Snapshot {
    pub fn open(path: &Path) -> Result<Self, ReplicaError> {
        let conn = open_read_only(path)?;
        conn.execute_batch("BEGIN")?;
        // The first read pins the WAL snapshot; it also tells us which
        // version we are pinned at.
        let version = state_version(&conn)?;
        Ok(Snapshot { conn, version })
    }

    pub fn version(&self) -> &StateVersion {
        &self.version
    }

    fn column_metadata(
        &self,
        table: &TableId,
    ) -> Result<HashMap<String, zero_core::lite::ColumnMetadata>, ReplicaError> {
        Ok(table_columns(&self.conn, table)?
            .into_iter()
            .map(|c| (c.name, c.metadata))
            .collect())
    }

    /// Fetches a single row by its key columns. The returned row includes
    /// the `_0_version` stamp.
    pub fn get_row(&self, table: &TableId, key: &Row) -> Result<Option<Row>, ReplicaError> {
        let metadata = self.column_metadata(table)?;
        let predicates = key
            .keys()
            .enumerate()
            .map(|(i, column)| format!("{} = ?{}", quote_ident(column), i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT * FROM {} WHERE {predicates}",
            quote_ident(&table_name(table))
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let values = key.values().map(json_to_sql);
        let mut rows = stmt.query(params_from_iter(values))?;
        match rows.next()? {
            None => Ok(None),
            Some(row) => {
                let mut out = Row::new();
                for (i, name) in names.iter().enumerate() {
                    out.insert(name.clone(), sql_to_json(row.get_ref(i)?, metadata.get(name)));
                }
                Ok(Some(out))
            }
        }
    }

    /// Scans a whole table; the hydration path for freshly registered
    /// queries.
    pub fn scan_table(&self, table: &TableId) -> Result<Vec<Row>, ReplicaError> {
        let metadata = self.column_metadata(table)?;
        let sql = format!("SELECT * FROM {}", quote_ident(&table_name(table)));
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (i, name) in names.iter().enumerate() {
                record.insert(name.clone(), sql_to_json(row.get_ref(i)?, metadata.get(name)));
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Escape hatch for pipeline drivers that run their own SQL against
    /// the pinned snapshot.
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        f(&self.conn)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let _ = self.conn.execute_batch("ROLLBACK");
    }
}

/// The diff produced by [`Snapshotter::advance`].
pub struct Advancement<'a> {
    pub snapshot: &'a Snapshot,
    pub version: StateVersion,
    pub changes: Vec<ChangeLogEntry>,
}

pub struct Snapshotter {
    path: PathBuf,
    current: Snapshot,
}

impl Snapshotter {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ReplicaError> {
        let path = path.as_ref().to_path_buf();
        let current = Snapshot::open(&path)?;
        Ok(Snapshotter { path, current })
    }

    pub fn current(&self) -> &Snapshot {
        &self.current
    }

    /// Moves to the latest committed version, returning the change-log
    /// entries in `(previous, latest]`.
    pub fn advance(&mut self) -> Result<Advancement<'_>, ReplicaError> {
        let next = Snapshot::open(&self.path)?;
        let changes = read_range(&next.conn, &self.current.version, &next.version)?;
        let version = next.version.clone();
        self.current = next;
        Ok(Advancement { snapshot: &self.current, version, changes })
    }
}
