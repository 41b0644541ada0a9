//! The pipeline-driver seam.
//!
//! Query evaluation is pluggable: anything that can take a query
//! definition and a replica snapshot and emit per-query row changes on
//! hydration and on advancement satisfies [`PipelineDriver`]. The
//! view-syncer does not interpret query definitions itself.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;
use zero_core::{
    change::{DataChange, Row, TableId},
    keys::RowKey,
    protocol::{QueryHash, QuerySpec},
};
use zero_storage::replica::{change_log::ChangeLogEntry, snapshot::Snapshot, ReplicaError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),
    #[error("unsupported query: {0}")]
    UnsupportedQuery(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOp {
    Add,
    Remove,
    Edit,
}

/// One row-level effect of hydrating or advancing a query.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineChange {
    pub query_hash: QueryHash,
    pub table: TableId,
    pub row_key: RowKey,
    /// Full row content; `None` for removes.
    pub row: Option<Row>,
    pub op: RowOp,
}

pub trait PipelineDriver: Send {
    /// Installs a query and returns its initial row set as adds.
    fn add_query(
        &mut self,
        hash: &QueryHash,
        spec: &QuerySpec,
        snapshot: &Snapshot,
    ) -> Result<Vec<PipelineChange>, PipelineError>;

    fn remove_query(&mut self, hash: &QueryHash);

    /// Applies a batch of replica changes, emitting the row effects for
    /// every installed query.
    fn advance(
        &mut self,
        snapshot: &Snapshot,
        changes: &[ChangeLogEntry],
    ) -> Result<Vec<PipelineChange>, PipelineError>;

    /// Deterministic hash of the executable form of a query. Queries
    /// with equal transformation hashes hydrate to identical row sets
    /// against the same snapshot.
    fn transformation_hash(&self, spec: &QuerySpec) -> String;
}

impl PipelineDriver for Box<dyn PipelineDriver> {
    fn add_query(
        &mut self,
        hash: &QueryHash,
        spec: &QuerySpec,
        snapshot: &Snapshot,
    ) -> Result<Vec<PipelineChange>, PipelineError> {
        (**self).add_query(hash, spec, snapshot)
    }

    fn remove_query(&mut self, hash: &QueryHash) {
        (**self).remove_query(hash)
    }

    fn advance(
        &mut self,
        snapshot: &Snapshot,
        changes: &[ChangeLogEntry],
    ) -> Result<Vec<PipelineChange>, PipelineError> {
        (**self).advance(snapshot, changes)
    }

    fn transformation_hash(&self, spec: &QuerySpec) -> String {
        (**self).transformation_hash(spec)
    }
}

/// A minimal driver that understands one query shape: `{"table": name}`,
/// materializing every row of that table. Used by tests and as the
/// fallback driver in single-table deployments.
#[derive(Default)]
pub struct TableScanDriver {
    queries: HashMap<QueryHash, TableId>,
}

impl TableScanDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn table_of(spec: &QuerySpec) -> Result<TableId, PipelineError> {
        let table = match spec {
            QuerySpec::Ast { ast } => ast.get("table").and_then(Value::as_str),
            QuerySpec::Named { .. } => None,
        }
        .ok_or_else(|| {
            PipelineError::UnsupportedQuery("table-scan driver needs an ast with a table".into())
        })?;
        match table.split_once('.') {
            Some((schema, table)) => Ok(TableId::new(schema, table)),
            None => Ok(TableId::new("public", table)),
        }
    }

    fn key_of(table: &TableId, row: &Row, key_columns: &[String]) -> RowKey {
        let entries = key_columns
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
            .collect::<Vec<_>>();
        debug_assert!(!entries.is_empty(), "row of {table} has no key columns");
        RowKey::new(entries)
    }

    fn key_columns(snapshot: &Snapshot, table: &TableId) -> Vec<String> {
        // Without upstream metadata the first column is the key; the
        // replica stores the real key columns for replicated tables.
        snapshot.with_conn(|conn| {
            let sql = format!(
                "SELECT name FROM pragma_table_info({}) WHERE pk > 0 ORDER BY pk",
                quoted_literal(&zero_storage::replica::table_name(table)),
            );
            let mut stmt = conn.prepare(&sql).expect("pragma_table_info");
            let columns: Vec<String> = stmt
                .query_map([], |row| row.get(0))
                .expect("pragma rows")
                .filter_map(Result::ok)
                .collect();
            columns
        })
    }
}

fn quoted_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl PipelineDriver for TableScanDriver {
    fn add_query(
        &mut self,
        hash: &QueryHash,
        spec: &QuerySpec,
        snapshot: &Snapshot,
    ) -> Result<Vec<PipelineChange>, PipelineError> {
        let table = Self::table_of(spec)?;
        self.queries.insert(hash.clone(), table.clone());

        let key_columns = Self::key_columns(snapshot, &table);
        let rows = snapshot.scan_table(&table)?;
        Ok(rows
            .into_iter()
            .map(|row| PipelineChange {
                query_hash: hash.clone(),
                table: table.clone(),
                row_key: Self::key_of(&table, &row, &key_columns),
                row: Some(row),
                op: RowOp::Add,
            })
            .collect())
    }

    fn remove_query(&mut self, hash: &QueryHash) {
        self.queries.remove(hash);
    }

    fn advance(
        &mut self,
        snapshot: &Snapshot,
        changes: &[ChangeLogEntry],
    ) -> Result<Vec<PipelineChange>, PipelineError> {
        let mut out = Vec::new();
        let mut key_columns: BTreeMap<TableId, Vec<String>> = BTreeMap::new();
        let watched: HashSet<&TableId> = self.queries.values().collect();

        for entry in changes {
            let (table, key, op) = match &entry.change {
                DataChange::Insert { relation, new } => {
                    (relation.id.clone(), new.clone(), RowOp::Add)
                }
                DataChange::Update { relation, key, new } => {
                    // A changed key surfaces as remove + add.
                    if let Some(old_key) = key {
                        let table = relation.id.clone();
                        if watched.contains(&table) {
                            for (hash, query_table) in &self.queries {
                                if *query_table == table {
                                    out.push(PipelineChange {
                                        query_hash: hash.clone(),
                                        table: table.clone(),
                                        row_key: RowKey::new(
                                            old_key.clone().into_iter().collect(),
                                        ),
                                        row: None,
                                        op: RowOp::Remove,
                                    });
                                }
                            }
                        }
                        (table, new.clone(), RowOp::Add)
                    } else {
                        (relation.id.clone(), new.clone(), RowOp::Edit)
                    }
                }
                DataChange::Delete { relation, key } => {
                    (relation.id.clone(), key.clone(), RowOp::Remove)
                }
                _ => continue,
            };

            if !watched.contains(&table) {
                continue;
            }
            let columns = key_columns
                .entry(table.clone())
                .or_insert_with(|| Self::key_columns(snapshot, &table));
            let row_key = Self::key_of(&table, &key, columns);
            let row = match op {
                RowOp::Remove => None,
                // Re-read through the snapshot for the full row: the
                // change may carry only changed columns.
                _ => {
                    let mut lookup = Row::new();
                    for (column, value) in row_key.entries() {
                        lookup.insert(column.clone(), value.clone());
                    }
                    snapshot.get_row(&table, &lookup)?
                }
            };
            for (hash, query_table) in &self.queries {
                if *query_table == table {
                    out.push(PipelineChange {
                        query_hash: hash.clone(),
                        table: table.clone(),
                        row_key: row_key.clone(),
                        row: row.clone(),
                        op,
                    });
                }
            }
        }
        Ok(out)
    }

    fn transformation_hash(&self, spec: &QuerySpec) -> String {
        match Self::table_of(spec) {
            Ok(table) => format!("scan:{table}"),
            Err(_) => "unsupported".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use zero_core::change::DataChange;
    use zero_storage::replica::{snapshot::Snapshotter, Replica};

    use super::*;

    fn version(n: u64) -> zero_core::version::StateVersion {
        zero_core::version::StateVersion::from_lsn(zero_core::version::Lsn(n))
    }

    fn foo_spec() -> zero_core::change::TableSpec {
        zero_core::change::TableSpec {
            id: TableId::new("public", "foo"),
            columns: vec![
                zero_core::change::ColumnSpec {
                    name: "id".to_string(),
                    metadata: zero_core::lite::ColumnMetadata::of("int8").not_null(),
                },
                zero_core::change::ColumnSpec {
                    name: "label".to_string(),
                    metadata: zero_core::lite::ColumnMetadata::of("text"),
                },
            ],
            primary_key: vec!["id".to_string()],
        }
    }

    fn foo_relation() -> zero_core::change::Relation {
        zero_core::change::Relation {
            id: TableId::new("public", "foo"),
            oid: 16384,
            row_key: zero_core::change::RowKeySpec {
                columns: vec!["id".to_string()],
                identity: zero_core::change::ReplicaIdentity::Default,
            },
            columns: foo_spec().columns,
        }
    }

    fn insert_foo(id: i64, label: &str) -> DataChange {
        DataChange::Insert {
            relation: foo_relation(),
            new: [("id".to_string(), json!(id)), ("label".to_string(), json!(label))]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn hydration_then_incremental_advance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        let mut replica = Replica::open(&path).unwrap();

        let mut tx = replica.begin(version(100)).unwrap();
        tx.apply(&DataChange::CreateTable { spec: foo_spec() }).unwrap();
        tx.apply(&insert_foo(1, "one")).unwrap();
        tx.apply(&insert_foo(2, "two")).unwrap();
        tx.commit().unwrap();

        let mut snapshotter = Snapshotter::new(&path).unwrap();
        let mut driver = TableScanDriver::new();
        let hash = "q1".to_string();
        let spec = QuerySpec::Ast { ast: json!({"table": "foo"}) };

        let adds = driver
            .add_query(&hash, &spec, snapshotter.current())
            .unwrap();
        assert_eq!(adds.len(), 2);
        assert!(adds.iter().all(|c| c.op == RowOp::Add));

        // Same transformation hash hydrates identically (same snapshot).
        let mut other = TableScanDriver::new();
        assert_eq!(driver.transformation_hash(&spec), other.transformation_hash(&spec));
        let other_adds = other
            .add_query(&"q2".to_string(), &spec, snapshotter.current())
            .unwrap();
        assert_eq!(
            adds.iter()
                .map(|c| c.row_key.canonical().to_string())
                .collect::<Vec<_>>(),
            other_adds
                .iter()
                .map(|c| c.row_key.canonical().to_string())
                .collect::<Vec<_>>(),
        );

        let mut tx = replica.begin(version(101)).unwrap();
        tx.apply(&insert_foo(3, "three")).unwrap();
        tx.apply(&DataChange::Delete {
            relation: foo_relation(),
            key: [("id".to_string(), json!(1))].into_iter().collect(),
        })
        .unwrap();
        tx.commit().unwrap();

        let advancement = snapshotter.advance().unwrap();
        let changes = driver
            .advance(advancement.snapshot, &advancement.changes)
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].op, RowOp::Add);
        assert_eq!(changes[0].row.as_ref().unwrap()["label"], json!("three"));
        assert_eq!(changes[1].op, RowOp::Remove);
        assert!(changes[1].row.is_none());
    }
}
