//! Applying the multiplexed change stream to the local replica.
//!
//! One replicator per replica file: it consumes transaction bursts
//! serially, applies each inside a single replica write transaction
//! (DML, DDL, and the change-log append commit atomically), then
//! signals `version-ready` to subscribed view-syncers and acks the
//! commit watermark back to the change source.

use std::path::PathBuf;

use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, warn};
use zero_core::{
    change::{
        BackfillChunk, ChangeStreamMessage, ColumnSpec, ControlMessage, DataChange, Row,
        TableSpec,
    },
    subscription::Subscription,
    version::StateVersion,
};
use zero_storage::replica::{Replica, ReplicaError};

#[derive(Error, Debug)]
pub enum ReplicatorError {
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),
    #[error("replication reset required")]
    ResetRequired,
    #[error("malformed change stream: {0}")]
    Protocol(String),
}

pub struct ReplicatorHandle {
    /// Latest committed state version; changes signal version-ready.
    pub version_ready: watch::Receiver<StateVersion>,
    pub join: JoinHandle<Result<(), ReplicatorError>>,
}

/// Spawns the replicator over a change-stream subscription. Applied
/// watermarks are acked through `acks`.
pub fn spawn(
    replica_path: PathBuf,
    changes: Subscription<ChangeStreamMessage>,
    acks: mpsc::Sender<StateVersion>,
) -> Result<ReplicatorHandle, ReplicatorError> {
    let replica = Replica::open(&replica_path)?;
    let initial = replica.state_version()?;
    let (version_tx, version_ready) = watch::channel(initial);
    let worker = Worker { replica, version_tx, acks };
    let join = tokio::spawn(worker.run(changes));
    Ok(ReplicatorHandle { version_ready, join })
}

struct Worker {
    replica: Replica,
    version_tx: watch::Sender<StateVersion>,
    acks: mpsc::Sender<StateVersion>,
}

impl Worker {
    #[instrument(skip_all)]
    async fn run(
        mut self,
        mut changes: Subscription<ChangeStreamMessage>,
    ) -> Result<(), ReplicatorError> {
        info!(version = %self.replica.state_version()?, "replicator started");
        let mut current: Option<OpenTxn> = None;

        while let Some(message) = changes.recv().await {
            let message = message.into_value();
            match message {
                ChangeStreamMessage::Begin { commit_watermark } => {
                    if current.is_some() {
                        return Err(ReplicatorError::Protocol("begin inside a transaction".into()));
                    }
                    current = Some(OpenTxn { watermark: commit_watermark, changes: Vec::new() });
                }
                ChangeStreamMessage::Data(change) => {
                    let Some(txn) = current.as_mut() else {
                        return Err(ReplicatorError::Protocol(
                            "data change outside a transaction".into(),
                        ));
                    };
                    txn.changes.push(change);
                }
                ChangeStreamMessage::Commit { watermark } => {
                    let Some(txn) = current.take() else {
                        return Err(ReplicatorError::Protocol("commit without begin".into()));
                    };
                    if txn.watermark != watermark {
                        return Err(ReplicatorError::Protocol(format!(
                            "commit watermark {watermark} does not match begin {}",
                            txn.watermark
                        )));
                    }
                    self.apply_txn(txn)?;
                    let _ = self.acks.send(watermark.clone()).await;
                    let _ = self.version_tx.send(watermark);
                }
                ChangeStreamMessage::Rollback => {
                    if let Some(txn) = current.take() {
                        debug!(watermark = %txn.watermark, "transaction rolled back upstream");
                    }
                }
                ChangeStreamMessage::Control(ControlMessage::ResetRequired) => {
                    self.replica.record_event("reset-required")?;
                    error!("change stream demands a reset; stopping replicator");
                    return Err(ReplicatorError::ResetRequired);
                }
                ChangeStreamMessage::Status(_) => {
                    // Client→server only; nothing to apply.
                }
                ChangeStreamMessage::Backfill(chunk) => {
                    self.apply_backfill(chunk)?;
                }
                ChangeStreamMessage::BackfillCompleted(done) => {
                    info!(table = %done.table, watermark = %done.watermark, "backfill applied");
                    self.replica
                        .record_event(&format!("backfill-completed:{}", done.table))?;
                }
            }
        }
        info!("change stream ended; replicator stopping");
        Ok(())
    }

    fn apply_txn(&mut self, txn: OpenTxn) -> Result<(), ReplicaError> {
        let count = txn.changes.len();
        let mut tx = self.replica.begin(txn.watermark.clone())?;
        for change in &txn.changes {
            tx.apply(change)?;
        }
        tx.commit()?;
        metrics::counter!("replicator_transactions").increment(1);
        metrics::counter!("replicator_changes").increment(count as u64);
        debug!(watermark = %txn.watermark, changes = count, "transaction applied");
        Ok(())
    }

    /// Applies one backfill chunk: rows are upserted with the backfill
    /// watermark as their row version, without advancing the stream
    /// position and without change-log entries (backfilled rows reach
    /// clients through query hydration).
    fn apply_backfill(&mut self, chunk: BackfillChunk) -> Result<(), ReplicaError> {
        let spec = backfill_table_spec(&chunk);
        let row_count = chunk.rows.len();
        let mut tx = self.replica.begin(chunk.watermark.clone())?;
        tx.ensure_table(&spec)?;

        let column_names: Vec<&str> = spec.columns.iter().map(|c| c.name.as_str()).collect();
        let relation = zero_core::change::Relation {
            id: chunk.relation.id.clone(),
            oid: chunk.relation.oid,
            row_key: chunk.relation.row_key.clone(),
            columns: spec.columns.clone(),
        };
        for values in &chunk.rows {
            if values.len() != column_names.len() {
                warn!(
                    table = %chunk.relation.id,
                    expected = column_names.len(),
                    found = values.len(),
                    "skipping malformed backfill row"
                );
                continue;
            }
            let mut row = Row::new();
            for (name, value) in column_names.iter().zip(values) {
                row.insert(name.to_string(), value.clone());
            }
            tx.upsert_row(&relation, &row)?;
        }
        tx.commit_without_advance()?;
        metrics::counter!("replicator_backfilled_rows").increment(row_count as u64);
        debug!(table = %chunk.relation.id, rows = row_count, "backfill chunk applied");
        Ok(())
    }
}

struct OpenTxn {
    watermark: StateVersion,
    changes: Vec<DataChange>,
}

/// Reconstructs the full column list of a backfill chunk: row-key
/// columns first (their metadata defaults to text when the chunk does
/// not carry it), then the declared non-key columns.
fn backfill_table_spec(chunk: &BackfillChunk) -> TableSpec {
    let mut columns: Vec<ColumnSpec> = chunk
        .relation
        .row_key
        .columns
        .iter()
        .map(|name| {
            chunk
                .relation
                .column(name)
                .cloned()
                .unwrap_or_else(|| ColumnSpec {
                    name: name.clone(),
                    metadata: zero_core::lite::ColumnMetadata::of("text").not_null(),
                })
        })
        .collect();
    columns.extend(chunk.relation.columns.iter().cloned());
    TableSpec {
        id: chunk.relation.id.clone(),
        columns,
        primary_key: chunk.relation.row_key.columns.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use zero_core::{
        change::{Relation, ReplicaIdentity, RowKeySpec, TableId},
        lite::ColumnMetadata,
        subscription::subscription,
        version::Lsn,
    };
    use zero_storage::replica::snapshot::Snapshot;

    use super::*;

    fn version(n: u64) -> StateVersion {
        StateVersion::from_lsn(Lsn(n))
    }

    fn foo_relation() -> Relation {
        Relation {
            id: TableId::new("public", "foo"),
            oid: 16384,
            row_key: RowKeySpec {
                columns: vec!["id".to_string()],
                identity: ReplicaIdentity::Default,
            },
            columns: vec![
                ColumnSpec {
                    name: "id".to_string(),
                    metadata: ColumnMetadata::of("int8").not_null(),
                },
                ColumnSpec { name: "label".to_string(), metadata: ColumnMetadata::of("text") },
            ],
        }
    }

    fn foo_spec() -> TableSpec {
        TableSpec {
            id: TableId::new("public", "foo"),
            columns: foo_relation().columns,
            primary_key: vec!["id".to_string()],
        }
    }

    fn insert(id: i64, label: &str) -> ChangeStreamMessage {
        ChangeStreamMessage::Data(DataChange::Insert {
            relation: foo_relation(),
            new: [("id".to_string(), json!(id)), ("label".to_string(), json!(label))]
                .into_iter()
                .collect(),
        })
    }

    #[test_log::test(tokio::test)]
    async fn applies_transactions_and_signals_version_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        // Create the file so the replicator can open it.
        drop(Replica::open(&path).unwrap());

        let (publisher, consumer) = subscription();
        let (acks_tx, mut acks_rx) = mpsc::channel(16);
        let handle = spawn(path.clone(), consumer, acks_tx).unwrap();
        let mut version_ready = handle.version_ready.clone();

        publisher
            .push(ChangeStreamMessage::Begin { commit_watermark: version(100) })
            .await
            .unwrap();
        publisher
            .push(ChangeStreamMessage::Data(DataChange::CreateTable { spec: foo_spec() }))
            .await
            .unwrap();
        publisher.push(insert(1, "one")).await.unwrap();
        publisher
            .push(ChangeStreamMessage::Commit { watermark: version(100) })
            .await
            .unwrap();

        version_ready.changed().await.unwrap();
        assert_eq!(*version_ready.borrow(), version(100));
        assert_eq!(acks_rx.recv().await.unwrap(), version(100));

        let snapshot = Snapshot::open(&path).unwrap();
        let row = snapshot
            .get_row(
                &TableId::new("public", "foo"),
                &[("id".to_string(), json!(1))].into_iter().collect(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(row["label"], json!("one"));
        assert_eq!(row["_0_version"], json!(version(100).as_str()));

        drop(publisher);
        handle.join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rolled_back_transactions_leave_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        drop(Replica::open(&path).unwrap());

        let (publisher, consumer) = subscription();
        let (acks_tx, mut acks_rx) = mpsc::channel(16);
        let handle = spawn(path.clone(), consumer, acks_tx).unwrap();

        publisher
            .push(ChangeStreamMessage::Begin { commit_watermark: version(100) })
            .await
            .unwrap();
        publisher
            .push(ChangeStreamMessage::Data(DataChange::CreateTable { spec: foo_spec() }))
            .await
            .unwrap();
        publisher.push(ChangeStreamMessage::Rollback).await.unwrap();
        drop(publisher);
        handle.join.await.unwrap().unwrap();

        assert!(acks_rx.try_recv().is_err(), "rollback is never acked");
        let snapshot = Snapshot::open(&path).unwrap();
        assert_eq!(snapshot.version(), &version(0));
    }

    #[tokio::test]
    async fn reset_required_stops_the_replicator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        drop(Replica::open(&path).unwrap());

        let (publisher, consumer) = subscription();
        let (acks_tx, _acks_rx) = mpsc::channel(16);
        let handle = spawn(path, consumer, acks_tx).unwrap();

        publisher
            .push(ChangeStreamMessage::Control(ControlMessage::ResetRequired))
            .await
            .unwrap();
        let result = handle.join.await.unwrap();
        assert!(matches!(result, Err(ReplicatorError::ResetRequired)));
    }

    #[tokio::test]
    async fn backfill_chunks_create_and_fill_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        drop(Replica::open(&path).unwrap());

        let (publisher, consumer) = subscription();
        let (acks_tx, _acks_rx) = mpsc::channel(16);
        let handle = spawn(path.clone(), consumer, acks_tx).unwrap();

        let relation = Relation {
            // Backfill relations carry only the non-key columns.
            columns: vec![ColumnSpec {
                name: "label".to_string(),
                metadata: ColumnMetadata::of("text"),
            }],
            ..foo_relation()
        };
        publisher
            .push(ChangeStreamMessage::Backfill(BackfillChunk {
                relation: relation.clone(),
                watermark: version(500),
                rows: vec![vec![json!(1), json!("one")], vec![json!(2), json!("two")]],
            }))
            .await
            .unwrap();
        publisher
            .push(ChangeStreamMessage::BackfillCompleted(
                zero_core::change::BackfillCompleted {
                    table: relation.id.clone(),
                    watermark: version(500),
                },
            ))
            .await
            .unwrap();
        drop(publisher);
        handle.join.await.unwrap().unwrap();

        let snapshot = Snapshot::open(&path).unwrap();
        // The stream position did not move.
        assert_eq!(snapshot.version(), &version(0));
        let row = snapshot
            .get_row(
                &TableId::new("public", "foo"),
                &[("id".to_string(), json!(2))].into_iter().collect(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(row["label"], json!("two"));
        assert_eq!(row["_0_version"], json!(version(500).as_str()));
    }
}
