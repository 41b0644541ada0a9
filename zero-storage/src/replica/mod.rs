//! # The local replica
//!
//! An embedded SQLite file holding the serving snapshot of all replicated
//! upstream tables. There is exactly one writer (the replicator) and many
//! readers (snapshots, the read-transaction pool); write-ahead logging
//! keeps readers from ever blocking the writer.
//!
//! ## Design Decisions
//!
//! ### Reserved objects
//!
//! Bookkeeping tables carry a literal `_zero.` name prefix (the whole
//! name is quoted; SQLite has no schemas) so they can never collide with
//! replicated user tables. Upstream tables in the `public` schema keep
//! their bare name; other schemas are replicated as `"schema.table"`.
//!
//! ### Row versions
//!
//! Every user row carries a `_0_version` column equal to the
//! `stateVersion` of the transaction that last wrote it. Snapshots rely
//! on this being exactly the commit watermark, not merely monotone.
//!
//! ### Column types
//!
//! SQLite's type system is affinity based, so columns are declared with a
//! storage class derived from the upstream type while the lossless
//! upstream definition is kept in `"_zero.columnMetadata"` as a lite type
//! string. Type-only upstream changes therefore touch metadata, never the
//! table itself.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use rusqlite::{params, params_from_iter, Connection, OpenFlags, Transaction};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use zero_core::{
    change::{ColumnSpec, DataChange, Relation, Row, TableId, TableSpec},
    error::AutoResetSignal,
    lite::ColumnMetadata,
    version::StateVersion,
};

pub mod change_log;
pub mod migrations;
pub mod snapshot;

use migrations::{run_migrations, REPLICA_MIGRATIONS};

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("replica database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    AutoReset(#[from] AutoResetSignal),
    #[error("malformed change: {0}")]
    MalformedChange(String),
    #[error("unknown replicated table: {0}")]
    UnknownTable(String),
    #[error("change encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transaction pool is closed")]
    PoolClosed,
}

/// The replica-file table name for an upstream table.
pub fn table_name(id: &TableId) -> String {
    if id.schema == "public" {
        id.table.clone()
    } else {
        format!("{}.{}", id.schema, id.table)
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Storage class for a column declaration. The lossless upstream type
/// lives in the column metadata table.
fn storage_class(meta: &ColumnMetadata) -> &'static str {
    if meta.is_array || meta.is_enum {
        return "TEXT";
    }
    match meta.upstream_type.as_str() {
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "bool" | "boolean"
        | "oid" => "INTEGER",
        "float4" | "float8" | "real" | "double precision" | "numeric" => "REAL",
        "bytea" => "BLOB",
        _ => "TEXT",
    }
}

pub(crate) fn json_to_sql(value: &JsonValue) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Integer(*b as i64),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Value::Real(f)
            } else {
                Value::Text(n.to_string())
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        composite => Value::Text(composite.to_string()),
    }
}

pub(crate) fn sql_to_json(
    value: rusqlite::types::ValueRef<'_>,
    meta: Option<&ColumnMetadata>,
) -> JsonValue {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => {
            if meta.is_some_and(|m| matches!(m.upstream_type.as_str(), "bool" | "boolean")) {
                JsonValue::Bool(i != 0)
            } else {
                JsonValue::from(i)
            }
        }
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            let is_composite = meta.is_some_and(|m| {
                m.is_array || matches!(m.upstream_type.as_str(), "json" | "jsonb")
            });
            if is_composite {
                serde_json::from_str(&text).unwrap_or(JsonValue::String(text))
            } else {
                JsonValue::String(text)
            }
        }
        ValueRef::Blob(bytes) => JsonValue::String(hex_encode(bytes)),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2 + 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Handle on the replica file. The owning component (the replicator) is
/// the single writer; readers go through [`snapshot::Snapshotter`] or the
/// transaction pool.
pub struct Replica {
    conn: Connection,
    path: PathBuf,
}

impl Replica {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplicaError> {
        let conn = Connection::open(path.as_ref())?;
        configure(&conn)?;
        run_migrations(&conn, REPLICA_MIGRATIONS)?;
        Ok(Replica { conn, path: path.as_ref().to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state_version(&self) -> Result<StateVersion, ReplicaError> {
        state_version(&self.conn)
    }

    /// The version the replica was initially synced at. CVRs created
    /// against a newer replica file cannot be served by this one.
    pub fn replica_version(&self) -> Result<StateVersion, ReplicaError> {
        let v: String = self.conn.query_row(
            r#"SELECT replicaVersion FROM "_zero.replicationState""#,
            [],
            |row| row.get(0),
        )?;
        StateVersion::parse(&v).map_err(|e| ReplicaError::MalformedChange(e.to_string()))
    }

    /// Stamps the replica identity at the end of initial sync.
    pub fn set_replica_version(&self, version: &StateVersion) -> Result<(), ReplicaError> {
        self.conn.execute(
            r#"UPDATE "_zero.replicationState" SET replicaVersion = ?1, stateVersion = ?1"#,
            params![version.as_str()],
        )?;
        Ok(())
    }

    pub fn record_event(&self, event: &str) -> Result<(), ReplicaError> {
        self.conn.execute(
            r#"INSERT INTO "_zero.runtimeEvents" (event, occurredAt) VALUES (?1, datetime('now'))"#,
            params![event],
        )?;
        Ok(())
    }

    /// The replicated column definitions of a table, from the metadata
    /// shadow.
    pub fn table_columns(&self, id: &TableId) -> Result<Vec<ColumnSpec>, ReplicaError> {
        table_columns(&self.conn, id)
    }

    /// Opens the write transaction for one upstream transaction. All
    /// changes applied through it are stamped with `commit_version`.
    pub fn begin(
        &mut self,
        commit_version: StateVersion,
    ) -> Result<ReplicaTransaction<'_>, ReplicaError> {
        let tx = self.conn.transaction()?;
        Ok(ReplicaTransaction { tx, state_version: commit_version, pos: 0 })
    }
}

pub(crate) fn configure(conn: &Connection) -> Result<(), ReplicaError> {
    conn.busy_timeout(Duration::from_secs(5))?;
    // wal2 when the linked SQLite ships it, plain WAL otherwise.
    let mode: String = conn.query_row("PRAGMA journal_mode = wal2", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal2") && !mode.eq_ignore_ascii_case("memory") {
        let mode: String = conn.query_row("PRAGMA journal_mode = wal", [], |row| row.get(0))?;
        debug!(journal_mode = %mode, "wal2 unavailable, using wal");
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "OFF")?;
    Ok(())
}

pub(crate) fn open_read_only(path: &Path) -> Result<Connection, ReplicaError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

pub(crate) fn state_version(conn: &Connection) -> Result<StateVersion, ReplicaError> {
    let v: String = conn.query_row(
        r#"SELECT stateVersion FROM "_zero.replicationState""#,
        [],
        |row| row.get(0),
    )?;
    StateVersion::parse(&v).map_err(|e| ReplicaError::MalformedChange(e.to_string()))
}

pub(crate) fn table_columns(
    conn: &Connection,
    id: &TableId,
) -> Result<Vec<ColumnSpec>, ReplicaError> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT columnName, spec FROM "_zero.columnMetadata"
          WHERE schemaName = ?1 AND tableName = ?2
          ORDER BY rowid
        "#,
    )?;
    let rows = stmt.query_map(params![id.schema, id.table], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut columns = Vec::new();
    for row in rows {
        let (name, spec) = row?;
        let metadata = ColumnMetadata::parse(&spec)
            .map_err(|e| ReplicaError::MalformedChange(e.to_string()))?;
        columns.push(ColumnSpec { name, metadata });
    }
    Ok(columns)
}

/// One upstream transaction being applied to the replica. Changes are
/// applied to user tables and appended to the change log; [`commit`]
/// advances `stateVersion` and makes both visible atomically.
///
/// [`commit`]: ReplicaTransaction::commit
pub struct ReplicaTransaction<'a> {
    tx: Transaction<'a>,
    state_version: StateVersion,
    pos: i64,
}

impl ReplicaTransaction<'_> {
    pub fn state_version(&self) -> &StateVersion {
        &self.state_version
    }

    pub fn apply(&mut self, change: &DataChange) -> Result<(), ReplicaError> {
        match change {
            DataChange::Insert { relation, new } => self.insert(relation, new)?,
            DataChange::Update { relation, key, new } => self.update(relation, key.as_ref(), new)?,
            DataChange::Delete { relation, key } => self.delete(relation, key)?,
            DataChange::Truncate { relations } => {
                for relation in relations {
                    let name = table_name(&relation.id);
                    self.tx
                        .execute(&format!("DELETE FROM {}", quote_ident(&name)), [])?;
                }
            }
            DataChange::CreateTable { spec } => self.create_table(spec)?,
            DataChange::DropTable { id } => self.drop_table(id)?,
            DataChange::CreateIndex { spec } => {
                if spec.columns.is_empty() {
                    return Err(ReplicaError::MalformedChange(format!(
                        "index {} has no columns",
                        spec.name
                    )));
                }
                let columns = spec
                    .columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let unique = if spec.unique { "UNIQUE " } else { "" };
                let sql = format!(
                    "CREATE {unique}INDEX IF NOT EXISTS {} ON {} ({columns})",
                    quote_ident(&spec.name),
                    quote_ident(&table_name(&spec.table)),
                );
                self.tx.execute(&sql, [])?;
            }
            DataChange::DropIndex { name, .. } => {
                self.tx
                    .execute(&format!("DROP INDEX IF EXISTS {}", quote_ident(name)), [])?;
            }
            DataChange::AddColumn { id, column } => self.add_column(id, column)?,
            DataChange::DropColumn { id, column } => self.drop_column(id, column)?,
            DataChange::RenameColumn { id, old, new } => self.rename_column(id, old, new)?,
            DataChange::UpdateColumn { id, column } => {
                // Affinity is dynamic; only the metadata shadow changes.
                self.put_column_metadata(id, column)?;
            }
            DataChange::RenameTable { id, new } => self.rename_table(id, new)?,
            DataChange::ChangeReplicaIdentity { id, identity } => {
                debug!(table = %id, ?identity, "replica identity changed upstream");
            }
        }
        self.log(change)
    }

    fn insert(&mut self, relation: &Relation, new: &Row) -> Result<(), ReplicaError> {
        let name = table_name(&relation.id);
        let mut columns: Vec<&str> = new.keys().map(String::as_str).collect();
        columns.push("_0_version");
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({column_list}) VALUES ({placeholders})",
            quote_ident(&name)
        );
        let mut values: Vec<rusqlite::types::Value> = new.values().map(json_to_sql).collect();
        values.push(rusqlite::types::Value::Text(self.state_version.as_str().to_string()));
        self.tx.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn update(
        &mut self,
        relation: &Relation,
        key: Option<&Row>,
        new: &Row,
    ) -> Result<(), ReplicaError> {
        let name = table_name(&relation.id);
        // Omitted (unchanged TOAST) columns keep their stored value, so
        // only the present columns are assigned.
        let mut assignments = Vec::with_capacity(new.len() + 1);
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(new.len() + 4);
        for (i, (column, value)) in new.iter().enumerate() {
            assignments.push(format!("{} = ?{}", quote_ident(column), i + 1));
            values.push(json_to_sql(value));
        }
        assignments.push(format!("\"_0_version\" = ?{}", values.len() + 1));
        values.push(rusqlite::types::Value::Text(self.state_version.as_str().to_string()));

        let where_row = match key {
            Some(key) => key.clone(),
            None => key_from_row(relation, new)?,
        };
        let mut predicates = Vec::with_capacity(where_row.len());
        for (column, value) in &where_row {
            predicates.push(format!("{} = ?{}", quote_ident(column), values.len() + 1));
            values.push(json_to_sql(value));
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(&name),
            assignments.join(", "),
            predicates.join(" AND "),
        );
        let affected = self.tx.execute(&sql, params_from_iter(values))?;
        if affected == 0 {
            warn!(table = %relation.id, "update matched no rows; applying as insert");
            self.insert(relation, new)?;
        }
        Ok(())
    }

    fn delete(&mut self, relation: &Relation, key: &Row) -> Result<(), ReplicaError> {
        let name = table_name(&relation.id);
        let mut predicates = Vec::with_capacity(key.len());
        let mut values = Vec::with_capacity(key.len());
        for (i, (column, value)) in key.iter().enumerate() {
            predicates.push(format!("{} = ?{}", quote_ident(column), i + 1));
            values.push(json_to_sql(value));
        }
        let sql =
            format!("DELETE FROM {} WHERE {}", quote_ident(&name), predicates.join(" AND "));
        self.tx.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn create_table(&mut self, spec: &TableSpec) -> Result<(), ReplicaError> {
        let name = table_name(&spec.id);
        let mut decls: Vec<String> = spec
            .columns
            .iter()
            .map(|c| {
                let mut decl = format!("{} {}", quote_ident(&c.name), storage_class(&c.metadata));
                if c.metadata.is_not_null {
                    decl.push_str(" NOT NULL");
                }
                decl
            })
            .collect();
        decls.push("\"_0_version\" TEXT NOT NULL".to_string());
        if !spec.primary_key.is_empty() {
            decls.push(format!(
                "PRIMARY KEY ({})",
                spec.primary_key
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        // IF NOT EXISTS keeps replays and backfill-raced creates
        // idempotent, matching the INSERT OR REPLACE discipline.
        let sql =
            format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(&name), decls.join(", "));
        self.tx.execute(&sql, [])?;
        for column in &spec.columns {
            self.put_column_metadata(&spec.id, column)?;
        }
        Ok(())
    }

    fn drop_table(&mut self, id: &TableId) -> Result<(), ReplicaError> {
        self.tx.execute(
            &format!("DROP TABLE IF EXISTS {}", quote_ident(&table_name(id))),
            [],
        )?;
        self.tx.execute(
            r#"DELETE FROM "_zero.columnMetadata" WHERE schemaName = ?1 AND tableName = ?2"#,
            params![id.schema, id.table],
        )?;
        Ok(())
    }

    fn add_column(&mut self, id: &TableId, column: &ColumnSpec) -> Result<(), ReplicaError> {
        // NOT NULL is tracked in metadata only: SQLite cannot add a
        // NOT NULL column without a default to a populated table.
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(&table_name(id)),
            quote_ident(&column.name),
            storage_class(&column.metadata),
        );
        self.tx.execute(&sql, [])?;
        self.put_column_metadata(id, column)
    }

    fn drop_column(&mut self, id: &TableId, column: &str) -> Result<(), ReplicaError> {
        let sql = format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(&table_name(id)),
            quote_ident(column),
        );
        self.tx.execute(&sql, [])?;
        self.tx.execute(
            r#"
            DELETE FROM "_zero.columnMetadata"
              WHERE schemaName = ?1 AND tableName = ?2 AND columnName = ?3
            "#,
            params![id.schema, id.table, column],
        )?;
        Ok(())
    }

    fn rename_column(&mut self, id: &TableId, old: &str, new: &str) -> Result<(), ReplicaError> {
        let sql = format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            quote_ident(&table_name(id)),
            quote_ident(old),
            quote_ident(new),
        );
        self.tx.execute(&sql, [])?;
        self.tx.execute(
            r#"
            UPDATE "_zero.columnMetadata" SET columnName = ?4
              WHERE schemaName = ?1 AND tableName = ?2 AND columnName = ?3
            "#,
            params![id.schema, id.table, old, new],
        )?;
        Ok(())
    }

    fn rename_table(&mut self, id: &TableId, new: &TableId) -> Result<(), ReplicaError> {
        let sql = format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&table_name(id)),
            quote_ident(&table_name(new)),
        );
        self.tx.execute(&sql, [])?;
        self.tx.execute(
            r#"
            UPDATE "_zero.columnMetadata" SET schemaName = ?3, tableName = ?4
              WHERE schemaName = ?1 AND tableName = ?2
            "#,
            params![id.schema, id.table, new.schema, new.table],
        )?;
        Ok(())
    }

    fn put_column_metadata(&mut self, id: &TableId, column: &ColumnSpec) -> Result<(), ReplicaError> {
        self.tx.execute(
            r#"
            INSERT INTO "_zero.columnMetadata" (schemaName, tableName, columnName, spec)
              VALUES (?1, ?2, ?3, ?4)
              ON CONFLICT (schemaName, tableName, columnName)
                DO UPDATE SET spec = excluded.spec
            "#,
            params![id.schema, id.table, column.name, column.metadata.encode()],
        )?;
        Ok(())
    }

    fn log(&mut self, change: &DataChange) -> Result<(), ReplicaError> {
        let encoded = serde_json::to_string(change)?;
        self.tx.execute(
            r#"INSERT INTO "_zero.changeLog" (stateVersion, pos, change) VALUES (?1, ?2, ?3)"#,
            params![self.state_version.as_str(), self.pos, encoded],
        )?;
        self.pos += 1;
        Ok(())
    }

    /// Advances `stateVersion` to the transaction's commit watermark and
    /// commits everything atomically.
    pub fn commit(self) -> Result<(), ReplicaError> {
        self.tx.execute(
            r#"UPDATE "_zero.replicationState" SET stateVersion = ?1"#,
            params![self.state_version.as_str()],
        )?;
        self.tx.commit()?;
        Ok(())
    }

    /// Creates the table when absent, without a change-log entry.
    /// Backfill chunks deliver their rows through query hydration, not
    /// the change log.
    pub fn ensure_table(&mut self, spec: &TableSpec) -> Result<(), ReplicaError> {
        self.create_table(spec)
    }

    /// Upserts a backfilled row: only the columns present in `row` are
    /// assigned, so a column backfill cannot clobber the rest of an
    /// existing row. Not change-logged.
    pub fn upsert_row(&mut self, relation: &Relation, row: &Row) -> Result<(), ReplicaError> {
        let name = table_name(&relation.id);
        let mut columns: Vec<&str> = row.keys().map(String::as_str).collect();
        columns.push("_0_version");
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let key_list = relation
            .row_key
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let assignments: Vec<String> = columns
            .iter()
            .filter(|c| {
                !relation
                    .row_key
                    .columns
                    .iter()
                    .any(|k| k.as_str() == **c)
            })
            .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
            .collect();
        let conflict = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };
        let sql = format!(
            "INSERT INTO {} ({column_list}) VALUES ({placeholders}) ON CONFLICT ({key_list}) {conflict}",
            quote_ident(&name)
        );
        let mut values: Vec<rusqlite::types::Value> = row.values().map(json_to_sql).collect();
        values.push(rusqlite::types::Value::Text(self.state_version.as_str().to_string()));
        self.tx.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    /// Commits without advancing `stateVersion`. Backfill chunks use
    /// this: their rows are stamped with the backfill watermark, but the
    /// stream position belongs to the replication stream alone.
    pub fn commit_without_advance(self) -> Result<(), ReplicaError> {
        self.tx.commit()?;
        Ok(())
    }

    /// Abandons the transaction; nothing becomes visible.
    pub fn rollback(self) -> Result<(), ReplicaError> {
        self.tx.rollback()?;
        Ok(())
    }
}

fn key_from_row(relation: &Relation, row: &Row) -> Result<Row, ReplicaError> {
    let mut key = Row::new();
    for column in &relation.row_key.columns {
        let value = row.get(column).ok_or_else(|| {
            ReplicaError::MalformedChange(format!(
                "row for {} is missing key column {column}",
                relation.id
            ))
        })?;
        key.insert(column.clone(), value.clone());
    }
    Ok(key)
}

#[cfg(test)]
pub(crate) mod test_support {
    use serde_json::json;
    use zero_core::change::{ReplicaIdentity, RowKeySpec};

    use super::*;

    pub fn foo_relation() -> Relation {
        Relation {
            id: TableId::new("public", "foo"),
            oid: 16384,
            row_key: RowKeySpec {
                columns: vec!["id".to_string()],
                identity: ReplicaIdentity::Default,
            },
            columns: vec![
                ColumnSpec { name: "id".to_string(), metadata: ColumnMetadata::of("int8").not_null() },
                ColumnSpec { name: "label".to_string(), metadata: ColumnMetadata::of("text") },
                ColumnSpec { name: "payload".to_string(), metadata: ColumnMetadata::of("jsonb") },
            ],
        }
    }

    pub fn foo_spec() -> TableSpec {
        let relation = foo_relation();
        TableSpec {
            id: relation.id.clone(),
            columns: relation.columns.clone(),
            primary_key: vec!["id".to_string()],
        }
    }

    pub fn insert_foo(id: i64, label: &str) -> DataChange {
        DataChange::Insert {
            relation: foo_relation(),
            new: [
                ("id".to_string(), json!(id)),
                ("label".to_string(), json!(label)),
                ("payload".to_string(), json!({"n": id})),
            ]
            .into_iter()
            .collect(),
        }
    }

    pub fn version(n: u64) -> StateVersion {
        StateVersion::from_lsn(zero_core::version::Lsn(n))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use zero_core::change::ReplicaIdentity;

    use super::{test_support::*, *};

    fn temp_replica() -> (tempfile::TempDir, Replica) {
        let dir = tempfile::tempdir().unwrap();
        let replica = Replica::open(dir.path().join("replica.db")).unwrap();
        (dir, replica)
    }

    fn select_foo(replica: &Replica, id: i64) -> Option<(String, String, String)> {
        replica
            .conn
            .query_row(
                r#"SELECT label, payload, _0_version FROM foo WHERE id = ?1"#,
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .ok()
    }

    #[test]
    fn applies_a_transaction_and_stamps_versions() {
        let (_dir, mut replica) = temp_replica();
        let v = version(100);

        let mut tx = replica.begin(v.clone()).unwrap();
        tx.apply(&DataChange::CreateTable { spec: foo_spec() }).unwrap();
        tx.apply(&insert_foo(1, "one")).unwrap();
        tx.apply(&insert_foo(2, "two")).unwrap();
        tx.commit().unwrap();

        assert_eq!(replica.state_version().unwrap(), v);
        let (label, payload, row_version) = select_foo(&replica, 1).unwrap();
        assert_eq!(label, "one");
        assert_eq!(payload, r#"{"n":1}"#);
        assert_eq!(row_version, v.as_str());

        let logged: i64 = replica
            .conn
            .query_row(r#"SELECT count(*) FROM "_zero.changeLog""#, [], |r| r.get(0))
            .unwrap();
        assert_eq!(logged, 3);
    }

    #[test]
    fn update_with_omitted_column_preserves_value() {
        let (_dir, mut replica) = temp_replica();

        let mut tx = replica.begin(version(100)).unwrap();
        tx.apply(&DataChange::CreateTable { spec: foo_spec() }).unwrap();
        tx.apply(&insert_foo(1, "one")).unwrap();
        tx.commit().unwrap();

        // `payload` is an unchanged TOAST column: omitted entirely.
        let mut tx = replica.begin(version(101)).unwrap();
        tx.apply(&DataChange::Update {
            relation: foo_relation(),
            key: None,
            new: [("id".to_string(), json!(1)), ("label".to_string(), json!("uno"))]
                .into_iter()
                .collect(),
        })
        .unwrap();
        tx.commit().unwrap();

        let (label, payload, row_version) = select_foo(&replica, 1).unwrap();
        assert_eq!(label, "uno");
        assert_eq!(payload, r#"{"n":1}"#, "omitted column kept its value");
        assert_eq!(row_version, version(101).as_str());
    }

    #[test]
    fn update_with_key_change_moves_the_row() {
        let (_dir, mut replica) = temp_replica();

        let mut tx = replica.begin(version(100)).unwrap();
        tx.apply(&DataChange::CreateTable { spec: foo_spec() }).unwrap();
        tx.apply(&insert_foo(1, "one")).unwrap();
        tx.commit().unwrap();

        let mut tx = replica.begin(version(101)).unwrap();
        tx.apply(&DataChange::Update {
            relation: foo_relation(),
            key: Some([("id".to_string(), json!(1))].into_iter().collect()),
            new: [("id".to_string(), json!(9)), ("label".to_string(), json!("nine"))]
                .into_iter()
                .collect(),
        })
        .unwrap();
        tx.commit().unwrap();

        assert!(select_foo(&replica, 1).is_none());
        assert_eq!(select_foo(&replica, 9).unwrap().0, "nine");
    }

    #[test]
    fn rollback_leaves_no_trace() {
        let (_dir, mut replica) = temp_replica();

        let mut tx = replica.begin(version(100)).unwrap();
        tx.apply(&DataChange::CreateTable { spec: foo_spec() }).unwrap();
        tx.commit().unwrap();

        let mut tx = replica.begin(version(101)).unwrap();
        tx.apply(&insert_foo(1, "one")).unwrap();
        tx.rollback().unwrap();

        assert_eq!(replica.state_version().unwrap(), version(100));
        assert!(select_foo(&replica, 1).is_none());
    }

    #[test]
    fn schema_changes_keep_metadata_in_step() {
        let (_dir, mut replica) = temp_replica();
        let id = TableId::new("public", "foo");

        let mut tx = replica.begin(version(100)).unwrap();
        tx.apply(&DataChange::CreateTable { spec: foo_spec() }).unwrap();
        tx.apply(&DataChange::AddColumn {
            id: id.clone(),
            column: ColumnSpec {
                name: "tags".to_string(),
                metadata: ColumnMetadata::of("text").array(),
            },
        })
        .unwrap();
        tx.apply(&DataChange::RenameColumn {
            id: id.clone(),
            old: "label".to_string(),
            new: "title".to_string(),
        })
        .unwrap();
        tx.apply(&DataChange::DropColumn { id: id.clone(), column: "payload".to_string() })
            .unwrap();
        tx.commit().unwrap();

        let columns = replica.table_columns(&id).unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "title", "tags"]);
        assert!(columns[2].metadata.is_array);
    }

    #[test]
    fn delete_and_truncate() {
        let (_dir, mut replica) = temp_replica();

        let mut tx = replica.begin(version(100)).unwrap();
        tx.apply(&DataChange::CreateTable { spec: foo_spec() }).unwrap();
        for i in 1..=3 {
            tx.apply(&insert_foo(i, "x")).unwrap();
        }
        tx.apply(&DataChange::Delete {
            relation: foo_relation(),
            key: [("id".to_string(), json!(2))].into_iter().collect(),
        })
        .unwrap();
        tx.commit().unwrap();

        let count: i64 = replica
            .conn
            .query_row("SELECT count(*) FROM foo", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let mut tx = replica.begin(version(101)).unwrap();
        tx.apply(&DataChange::Truncate {
            relations: vec![Relation {
                row_key: zero_core::change::RowKeySpec {
                    columns: vec!["id".to_string()],
                    identity: ReplicaIdentity::Default,
                },
                ..foo_relation()
            }],
        })
        .unwrap();
        tx.commit().unwrap();

        let count: i64 = replica
            .conn
            .query_row("SELECT count(*) FROM foo", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
