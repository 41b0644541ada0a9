//! The change-stream message vocabulary.
//!
//! Everything that flows from the change source through the multiplexer
//! into the replicator is a [`ChangeStreamMessage`]. Data changes carry
//! their relation metadata inline so that downstream consumers never need
//! a side channel to interpret rows. Within a transaction, messages are
//! ordered by their position; only `Begin`/`Commit` carry watermarks.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{lite::ColumnMetadata, version::StateVersion};

/// A row image. TOASTed columns that were absent and unchanged are
/// omitted from the map, which is distinct from a column that is present
/// with a SQL NULL (`Value::Null`).
pub type Row = BTreeMap<String, Value>;

/// `schema.table`, the unit of filtering and DDL addressing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        TableId { schema: schema.into(), table: table.into() }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// How much of the old row upstream sends for updates and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaIdentity {
    Default,
    Full,
    Index,
    Nothing,
}

/// The key half of a relation: which columns identify a row, and the
/// replica-identity policy that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowKeySpec {
    pub columns: Vec<String>,
    pub identity: ReplicaIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(flatten)]
    pub metadata: ColumnMetadata,
}

/// Relation metadata carried on every data change and backfill chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(flatten)]
    pub id: TableId,
    /// Upstream relation OID, used by backfill schema validation.
    pub oid: u32,
    #[serde(rename = "rowKey")]
    pub row_key: RowKeySpec,
    pub columns: Vec<ColumnSpec>,
}

impl Relation {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A full table definition, as used by DDL changes and initial sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    #[serde(flatten)]
    pub id: TableId,
    pub columns: Vec<ColumnSpec>,
    #[serde(rename = "primaryKey")]
    pub primary_key: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    #[serde(flatten)]
    pub table: TableId,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// A single data or schema change inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum DataChange {
    Insert {
        relation: Relation,
        new: Row,
    },
    Update {
        relation: Relation,
        /// Key columns of the previous identity; `None` when the key did
        /// not change and replica identity is not FULL.
        key: Option<Row>,
        new: Row,
    },
    Delete {
        relation: Relation,
        key: Row,
    },
    Truncate {
        relations: Vec<Relation>,
    },
    CreateTable {
        spec: TableSpec,
    },
    DropTable {
        id: TableId,
    },
    CreateIndex {
        spec: IndexSpec,
    },
    DropIndex {
        id: TableId,
        name: String,
    },
    AddColumn {
        id: TableId,
        column: ColumnSpec,
    },
    DropColumn {
        id: TableId,
        column: String,
    },
    RenameColumn {
        id: TableId,
        old: String,
        new: String,
    },
    UpdateColumn {
        id: TableId,
        column: ColumnSpec,
    },
    RenameTable {
        id: TableId,
        new: TableId,
    },
    ChangeReplicaIdentity {
        id: TableId,
        identity: ReplicaIdentity,
    },
}

impl DataChange {
    /// The table this change addresses; `None` for multi-relation
    /// truncates.
    pub fn table(&self) -> Option<&TableId> {
        match self {
            DataChange::Insert { relation, .. }
            | DataChange::Update { relation, .. }
            | DataChange::Delete { relation, .. } => Some(&relation.id),
            DataChange::Truncate { .. } => None,
            DataChange::CreateTable { spec } => Some(&spec.id),
            DataChange::CreateIndex { spec } => Some(&spec.table),
            DataChange::DropTable { id }
            | DataChange::DropIndex { id, .. }
            | DataChange::AddColumn { id, .. }
            | DataChange::DropColumn { id, .. }
            | DataChange::RenameColumn { id, .. }
            | DataChange::UpdateColumn { id, .. }
            | DataChange::RenameTable { id, .. }
            | DataChange::ChangeReplicaIdentity { id, .. } => Some(id),
        }
    }

    pub fn is_ddl(&self) -> bool {
        !matches!(
            self,
            DataChange::Insert { .. }
                | DataChange::Update { .. }
                | DataChange::Delete { .. }
                | DataChange::Truncate { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlMessage {
    ResetRequired,
}

/// Client-to-server acknowledgement of the stream up to a watermark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub watermark: StateVersion,
}

/// One chunk of a snapshot backfill, at most `flush_threshold_bytes` of
/// row data. `rows` are value vectors ordered row-key columns first,
/// then `relation.columns`; all rows are consistent as of `watermark`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillChunk {
    pub relation: Relation,
    pub watermark: StateVersion,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillCompleted {
    pub table: TableId,
    pub watermark: StateVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChangeStreamMessage {
    Begin {
        #[serde(rename = "commitWatermark")]
        commit_watermark: StateVersion,
    },
    Data(DataChange),
    Commit {
        watermark: StateVersion,
    },
    Rollback,
    Control(ControlMessage),
    Status(StatusMessage),
    Backfill(BackfillChunk),
    BackfillCompleted(BackfillCompleted),
}

impl ChangeStreamMessage {
    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            ChangeStreamMessage::Begin { .. }
                | ChangeStreamMessage::Data(_)
                | ChangeStreamMessage::Commit { .. }
                | ChangeStreamMessage::Rollback
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::lite::ColumnMetadata;

    fn relation() -> Relation {
        Relation {
            id: TableId::new("public", "foo"),
            oid: 16384,
            row_key: RowKeySpec {
                columns: vec!["id".to_string()],
                identity: ReplicaIdentity::Default,
            },
            columns: vec![ColumnSpec {
                name: "id".to_string(),
                metadata: ColumnMetadata::of("int8"),
            }],
        }
    }

    #[test]
    fn data_change_tags_are_kebab_case() {
        let change = DataChange::CreateTable {
            spec: TableSpec {
                id: TableId::new("public", "foo"),
                columns: vec![],
                primary_key: vec!["id".to_string()],
            },
        };
        let encoded = serde_json::to_value(&change).unwrap();
        assert_eq!(encoded["tag"], "create-table");

        let change = DataChange::ChangeReplicaIdentity {
            id: TableId::new("public", "foo"),
            identity: ReplicaIdentity::Full,
        };
        let encoded = serde_json::to_value(&change).unwrap();
        assert_eq!(encoded["tag"], "change-replica-identity");
    }

    #[test]
    fn omitted_toast_column_differs_from_null() {
        let with_null: Row = [("a".to_string(), Value::Null)].into_iter().collect();
        let omitted: Row = Row::new();

        let change = DataChange::Update { relation: relation(), key: None, new: with_null };
        let encoded = serde_json::to_value(&change).unwrap();
        assert_eq!(encoded["new"], json!({"a": null}));

        let change = DataChange::Update { relation: relation(), key: None, new: omitted };
        let encoded = serde_json::to_value(&change).unwrap();
        assert_eq!(encoded["new"], json!({}));
    }

    #[test]
    fn message_roundtrip() {
        let messages = vec![
            ChangeStreamMessage::Begin {
                commit_watermark: StateVersion::parse("101").unwrap(),
            },
            ChangeStreamMessage::Data(DataChange::Insert {
                relation: relation(),
                new: [("id".to_string(), json!(1))].into_iter().collect(),
            }),
            ChangeStreamMessage::Commit { watermark: StateVersion::parse("101").unwrap() },
            ChangeStreamMessage::Rollback,
            ChangeStreamMessage::Control(ControlMessage::ResetRequired),
        ];
        for message in messages {
            let encoded = serde_json::to_string(&message).unwrap();
            let decoded: ChangeStreamMessage = serde_json::from_str(&encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }
}
