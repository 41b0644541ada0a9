//! Snapshot-consistent bulk row transfer.
//!
//! A backfill copies `(table, columns)` as of an exact LSN: a temporary
//! replication slot exports a snapshot and names the consistent point, a
//! read-only transaction adopts that snapshot, and `COPY … TO STDOUT`
//! streams the rows out in batches. Before copying, the live catalog is
//! compared against the metadata the request was planned with; any drift
//! terminates just this backfill with a `SchemaIncompatibility` error
//! naming the exact cause.
//!
//! Certain ALTERs are not MVCC-safe under an imported snapshot, so
//! `UndefinedTable`/`UndefinedColumn` raised by Postgres mid-copy is
//! re-raised as a schema incompatibility as well.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use futures03::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio_postgres::{error::SqlState, NoTls, SimpleQueryMessage};
use tracing::{debug, info};
use zero_core::{
    change::{
        BackfillChunk, BackfillCompleted, ChangeStreamMessage, ColumnSpec, Relation,
        ReplicaIdentity, RowKeySpec, TableId,
    },
    lite::ColumnMetadata,
    version::{Lsn, StateVersion},
};
use zero_storage::{cdc::CdcStore, cvr::StoreError};

use crate::{
    change_source::values::{parse_by_metadata, unescape_copy_field},
    multiplexer::{Multiplexer, MuxError},
};

/// Default batch size, matching the Postgres COPY chunk size.
pub const DEFAULT_FLUSH_THRESHOLD_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("Cannot backfill {context}: {cause}")]
    SchemaIncompatibility { context: String, cause: String },
    #[error("upstream error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("multiplexer error: {0}")]
    Mux(#[from] MuxError),
    #[error("bookkeeping error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed copy stream: {0}")]
    MalformedCopy(String),
}

/// Column identity as captured when the backfill was planned.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillColumn {
    pub name: String,
    pub attnum: i16,
    pub metadata: ColumnMetadata,
}

/// The catalog facts a backfill validates against before copying.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillMetadata {
    pub relation_oid: u32,
    pub schema_oid: u32,
    pub row_key: Vec<String>,
    pub columns: Vec<BackfillColumn>,
}

#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub table: TableId,
    pub columns: Vec<String>,
    pub metadata: BackfillMetadata,
    pub flush_threshold_bytes: usize,
}

impl BackfillRequest {
    /// `schema.table[c1,c2]`, the context string of every error.
    fn context(&self) -> String {
        format!("{}[{}]", self.table, self.columns.join(","))
    }

    fn incompatible(&self, cause: impl Into<String>) -> BackfillError {
        BackfillError::SchemaIncompatibility {
            context: self.context(),
            cause: cause.into(),
        }
    }
}

/// The columns actually copied: row-key columns first, then the
/// requested columns, deduped.
pub fn output_columns(row_key: &[String], requested: &[String]) -> Vec<String> {
    let mut out: Vec<String> = row_key.to_vec();
    for column in requested {
        if !out.contains(column) {
            out.push(column.clone());
        }
    }
    out
}

/// What the live catalog says right now; compared against the request's
/// metadata.
#[derive(Debug, Clone)]
pub struct ObservedSchema {
    pub relation_oid: u32,
    pub schema_oid: u32,
    pub row_key: Vec<String>,
    /// attnum by column name.
    pub attnums: HashMap<String, i16>,
}

/// The schema-compatibility gate. Each mismatch maps to a stable,
/// human-readable cause.
pub fn validate_schema(
    request: &BackfillRequest,
    observed: Option<&ObservedSchema>,
) -> Result<(), BackfillError> {
    let Some(observed) = observed else {
        return Err(request.incompatible("Table has been renamed or dropped"));
    };
    if observed.relation_oid != request.metadata.relation_oid {
        return Err(request.incompatible("Table has been renamed or dropped"));
    }
    if observed.schema_oid != request.metadata.schema_oid {
        return Err(request.incompatible("Table has moved to another schema"));
    }
    if observed.row_key != request.metadata.row_key {
        return Err(request.incompatible("Row key (e.g. PRIMARY KEY or INDEX) has changed"));
    }
    for column in &request.metadata.columns {
        match observed.attnums.get(&column.name) {
            None => {
                return Err(request.incompatible(format!(
                    "Column {} has been renamed or dropped",
                    column.name
                )))
            }
            Some(attnum) if *attnum != column.attnum => {
                return Err(request.incompatible(format!(
                    "Column {} no longer corresponds to the original column",
                    column.name
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Incremental parser for COPY text-format output. Bytes may arrive in
/// arbitrary chunk boundaries; complete rows come out typed.
pub struct CopyRowParser {
    columns: Vec<ColumnMetadata>,
    pending: Vec<u8>,
}

impl CopyRowParser {
    pub fn new(columns: Vec<ColumnMetadata>) -> Self {
        CopyRowParser { columns, pending: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<Value>>, BackfillError> {
        self.pending.extend_from_slice(chunk);
        let mut rows = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let line = &line[..line.len() - 1];
            if line == b"\\." {
                continue;
            }
            rows.push(self.parse_line(line)?);
        }
        Ok(rows)
    }

    fn parse_line(&self, line: &[u8]) -> Result<Vec<Value>, BackfillError> {
        let text = std::str::from_utf8(line)
            .map_err(|e| BackfillError::MalformedCopy(e.to_string()))?;
        let fields: Vec<&str> = split_copy_fields(text);
        if fields.len() != self.columns.len() {
            return Err(BackfillError::MalformedCopy(format!(
                "expected {} fields, found {}",
                self.columns.len(),
                fields.len()
            )));
        }
        Ok(fields
            .iter()
            .zip(&self.columns)
            .map(|(field, meta)| {
                if *field == "\\N" {
                    Value::Null
                } else {
                    parse_by_metadata(&unescape_copy_field(field), meta)
                }
            })
            .collect())
    }
}

/// Splits on tabs that are not part of an escape sequence. COPY escapes
/// literal tabs as `\t`, so raw 0x09 bytes are always separators.
fn split_copy_fields(line: &str) -> Vec<&str> {
    line.split('\t').collect()
}

pub struct BackfillStreamer {
    upstream_url: String,
    mux: Multiplexer,
    cdc: Arc<CdcStore>,
}

impl BackfillStreamer {
    pub fn new(upstream_url: String, mux: Multiplexer, cdc: Arc<CdcStore>) -> Self {
        BackfillStreamer { upstream_url, mux, cdc }
    }

    /// Runs one backfill to completion, returning the LSN the copied
    /// rows are consistent with.
    pub async fn run(&self, request: BackfillRequest) -> Result<StateVersion, BackfillError> {
        info!(table = %request.table, columns = ?request.columns, "starting backfill");
        self.cdc
            .begin_backfill(&request.table.schema, &request.table.table, &request.columns)
            .await?;

        let result = self.copy(&request).await;
        self.cdc
            .end_backfill(&request.table.schema, &request.table.table)
            .await?;
        result
    }

    async fn copy(&self, request: &BackfillRequest) -> Result<StateVersion, BackfillError> {
        // 1. A temporary slot pins a snapshot and names the exact LSN.
        let (repl_client, repl_connection) = tokio_postgres::connect(
            &format!("{} replication=database", self.upstream_url),
            NoTls,
        )
        .await?;
        let repl_driver = tokio::spawn(async move {
            let _ = repl_connection.await;
        });
        let slot = format!("zero_backfill_{}", uuid::Uuid::new_v4().simple());
        let created = repl_client
            .simple_query(&format!(
                "CREATE_REPLICATION_SLOT \"{slot}\" TEMPORARY LOGICAL pgoutput EXPORT_SNAPSHOT"
            ))
            .await?;
        let (consistent_point, snapshot_name) = parse_slot_result(&created)?;
        let watermark = StateVersion::from_lsn(consistent_point);

        // 2. A plain session adopts the snapshot; the slot can then go.
        let (client, connection) = tokio_postgres::connect(&self.upstream_url, NoTls).await?;
        tokio::spawn(async move {
            let _ = connection.await;
        });
        client
            .batch_execute(&format!(
                "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY;
                 SET TRANSACTION SNAPSHOT '{snapshot_name}'"
            ))
            .await?;
        let _ = repl_client
            .simple_query(&format!("DROP_REPLICATION_SLOT \"{slot}\" WAIT"))
            .await;
        drop(repl_client);
        repl_driver.abort();

        // 3. The live catalog must still match the planned metadata.
        let observed = observe_schema(&client, &request.table)
            .await
            .map_err(|err| map_mvcc_error(request, err))?;
        validate_schema(request, observed.as_ref())?;

        // 4. Copy out, batching on accumulated bytes.
        let columns = output_columns(&request.metadata.row_key, &request.columns);
        let column_metadata: Vec<ColumnMetadata> = columns
            .iter()
            .map(|name| {
                request
                    .metadata
                    .columns
                    .iter()
                    .find(|c| &c.name == name)
                    .map(|c| c.metadata.clone())
                    .unwrap_or_else(|| ColumnMetadata::of("text"))
            })
            .collect();
        let select_list = columns
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "COPY (SELECT {select_list} FROM \"{}\".\"{}\") TO STDOUT",
            request.table.schema, request.table.table
        );
        let stream = client
            .copy_out(&sql)
            .await
            .map_err(|err| map_mvcc_error(request, err))?;
        futures03::pin_mut!(stream);

        let relation = backfill_relation(request);
        let mut parser = CopyRowParser::new(column_metadata);
        let mut batch: Vec<Vec<Value>> = Vec::new();
        let mut batched_bytes = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = chunk.map_err(|err| map_mvcc_error(request, err))?;
            batched_bytes += chunk.len();
            batch.extend(parser.push(&chunk)?);
            if batched_bytes >= request.flush_threshold_bytes && !batch.is_empty() {
                self.emit_chunk(&relation, &watermark, std::mem::take(&mut batch))
                    .await?;
                batched_bytes = 0;
            }
        }
        if !batch.is_empty() {
            self.emit_chunk(&relation, &watermark, batch).await?;
        }
        client.batch_execute("ROLLBACK").await.ok();

        // 5. Close out.
        let resume_at = self.mux.reserve().await;
        self.mux
            .push(ChangeStreamMessage::BackfillCompleted(BackfillCompleted {
                table: request.table.clone(),
                watermark: watermark.clone(),
            }))
            .await?;
        self.mux.release(resume_at);
        info!(table = %request.table, %watermark, "backfill complete");
        Ok(watermark)
    }

    async fn emit_chunk(
        &self,
        relation: &Relation,
        watermark: &StateVersion,
        rows: Vec<Vec<Value>>,
    ) -> Result<(), BackfillError> {
        debug!(table = %relation.id, rows = rows.len(), "emitting backfill chunk");
        let resume_at = self.mux.reserve().await;
        let result = self
            .mux
            .push(ChangeStreamMessage::Backfill(BackfillChunk {
                relation: relation.clone(),
                watermark: watermark.clone(),
                rows,
            }))
            .await;
        self.mux.release(resume_at);
        result?;
        Ok(())
    }
}

/// The relation a backfill declares: row-key columns in the key spec,
/// the non-key requested columns in `columns`; chunk rows are ordered
/// key-first to match.
fn backfill_relation(request: &BackfillRequest) -> Relation {
    let non_key: Vec<ColumnSpec> = request
        .columns
        .iter()
        .filter(|c| !request.metadata.row_key.contains(*c))
        .map(|name| ColumnSpec {
            name: name.clone(),
            metadata: request
                .metadata
                .columns
                .iter()
                .find(|c| &c.name == name)
                .map(|c| c.metadata.clone())
                .unwrap_or_else(|| ColumnMetadata::of("text")),
        })
        .collect();
    Relation {
        id: request.table.clone(),
        oid: request.metadata.relation_oid,
        row_key: RowKeySpec {
            columns: request.metadata.row_key.clone(),
            identity: ReplicaIdentity::Default,
        },
        columns: non_key,
    }
}

fn parse_slot_result(
    messages: &[SimpleQueryMessage],
) -> Result<(Lsn, String), BackfillError> {
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            let consistent_point = row
                .get(1)
                .ok_or_else(|| BackfillError::MalformedCopy("no consistent_point".into()))?;
            let snapshot_name = row
                .get(2)
                .ok_or_else(|| BackfillError::MalformedCopy("no snapshot_name".into()))?;
            let lsn: Lsn = consistent_point
                .parse()
                .map_err(|e| BackfillError::MalformedCopy(format!("bad LSN: {e}")))?;
            return Ok((lsn, snapshot_name.to_string()));
        }
    }
    Err(BackfillError::MalformedCopy("CREATE_REPLICATION_SLOT returned no row".into()))
}

/// Plans a full-table backfill against the live catalog: captures the
/// relation identity, row key, and per-column metadata that the copy
/// phase later re-validates.
pub async fn plan_backfill(
    client: &tokio_postgres::Client,
    table: &TableId,
) -> Result<BackfillRequest, BackfillError> {
    let observed = observe_schema(client, table)
        .await?
        .ok_or_else(|| BackfillError::SchemaIncompatibility {
            context: table.to_string(),
            cause: "Table has been renamed or dropped".to_string(),
        })?;

    let rows = client
        .query(
            "SELECT a.attname, a.attnum, t.typname, a.attnotnull, a.atttypmod,
                    t.typtype = 'e' AS is_enum
               FROM pg_attribute a JOIN pg_type t ON t.oid = a.atttypid
              WHERE a.attrelid = $1::int8::oid AND a.attnum > 0 AND NOT a.attisdropped
              ORDER BY a.attnum",
            &[&(observed.relation_oid as i64)],
        )
        .await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.get(0);
        let attnum: i16 = row.get(1);
        let typname: String = row.get(2);
        let not_null: bool = row.get(3);
        let typmod: i32 = row.get(4);
        let is_enum: bool = row.get(5);

        // Array element types carry a leading underscore in pg_type.
        let (base, is_array) = match typname.strip_prefix('_') {
            Some(base) => (base.to_string(), true),
            None => (typname, false),
        };
        let mut metadata = ColumnMetadata::of(base);
        if not_null {
            metadata = metadata.not_null();
        }
        if is_array {
            metadata = metadata.array();
        }
        if is_enum {
            metadata = metadata.enum_type();
        }
        if typmod > 4 && matches!(metadata.upstream_type.as_str(), "varchar" | "bpchar") {
            metadata = metadata.max_length((typmod - 4) as u32);
        }
        columns.push(BackfillColumn { name, attnum, metadata });
    }

    let requested = columns.iter().map(|c| c.name.clone()).collect();
    Ok(BackfillRequest {
        table: table.clone(),
        columns: requested,
        metadata: BackfillMetadata {
            relation_oid: observed.relation_oid,
            schema_oid: observed.schema_oid,
            row_key: observed.row_key,
            columns,
        },
        flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD_BYTES,
    })
}

async fn observe_schema(
    client: &tokio_postgres::Client,
    table: &TableId,
) -> Result<Option<ObservedSchema>, tokio_postgres::Error> {
    let identity = client
        .query_opt(
            "SELECT c.oid::int8, n.oid::int8 FROM pg_class c
               JOIN pg_namespace n ON n.oid = c.relnamespace
              WHERE n.nspname = $1 AND c.relname = $2",
            &[&table.schema, &table.table],
        )
        .await?;
    let Some(identity) = identity else { return Ok(None) };
    let relation_oid = identity.get::<_, i64>(0) as u32;
    let schema_oid = identity.get::<_, i64>(1) as u32;

    let row_key: Vec<String> = client
        .query(
            "SELECT a.attname FROM pg_index i
               JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
              WHERE i.indrelid = $1::int8::oid AND i.indisprimary
              ORDER BY array_position(i.indkey, a.attnum)",
            &[&(relation_oid as i64)],
        )
        .await?
        .into_iter()
        .map(|row| row.get(0))
        .collect();

    let attnums: HashMap<String, i16> = client
        .query(
            "SELECT attname, attnum FROM pg_attribute
              WHERE attrelid = $1::int8::oid AND attnum > 0 AND NOT attisdropped",
            &[&(relation_oid as i64)],
        )
        .await?
        .into_iter()
        .map(|row| (row.get::<_, String>(0), row.get::<_, i16>(1)))
        .collect();

    Ok(Some(ObservedSchema { relation_oid, schema_oid, row_key, attnums }))
}

fn map_mvcc_error(request: &BackfillRequest, err: tokio_postgres::Error) -> BackfillError {
    match err.code() {
        Some(&SqlState::UNDEFINED_TABLE) => {
            request.incompatible("Table has been renamed or dropped")
        }
        Some(&SqlState::UNDEFINED_COLUMN) => {
            request.incompatible("Column has been renamed or dropped")
        }
        _ => BackfillError::Postgres(err),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn metadata() -> BackfillMetadata {
        BackfillMetadata {
            relation_oid: 16384,
            schema_oid: 2200,
            row_key: vec!["id2".to_string(), "id1".to_string()],
            columns: vec![
                BackfillColumn {
                    name: "id1".to_string(),
                    attnum: 1,
                    metadata: ColumnMetadata::of("int8").not_null(),
                },
                BackfillColumn {
                    name: "id2".to_string(),
                    attnum: 2,
                    metadata: ColumnMetadata::of("int4").not_null(),
                },
                BackfillColumn {
                    name: "a".to_string(),
                    attnum: 3,
                    metadata: ColumnMetadata::of("text"),
                },
                BackfillColumn {
                    name: "b".to_string(),
                    attnum: 4,
                    metadata: ColumnMetadata::of("json"),
                },
                BackfillColumn {
                    name: "c".to_string(),
                    attnum: 5,
                    metadata: ColumnMetadata::of("json").array(),
                },
            ],
        }
    }

    fn request() -> BackfillRequest {
        BackfillRequest {
            table: TableId::new("public", "foo"),
            columns: vec![
                "id1".to_string(),
                "id2".to_string(),
                "a".to_string(),
                "c".to_string(),
                "b".to_string(),
            ],
            metadata: metadata(),
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD_BYTES,
        }
    }

    fn observed() -> ObservedSchema {
        ObservedSchema {
            relation_oid: 16384,
            schema_oid: 2200,
            row_key: vec!["id2".to_string(), "id1".to_string()],
            attnums: [
                ("id1".to_string(), 1i16),
                ("id2".to_string(), 2),
                ("a".to_string(), 3),
                ("b".to_string(), 4),
                ("c".to_string(), 5),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn output_columns_are_key_first_and_deduped() {
        let request = request();
        let columns = output_columns(&request.metadata.row_key, &request.columns);
        assert_eq!(columns, vec!["id2", "id1", "a", "c", "b"]);

        let relation = backfill_relation(&request);
        assert_eq!(relation.row_key.columns, vec!["id2", "id1"]);
        let names: Vec<&str> = relation
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "c", "b"]);
    }

    #[test]
    fn schema_validation_causes() {
        let request = request();
        assert!(validate_schema(&request, Some(&observed())).is_ok());

        let err = validate_schema(&request, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot backfill public.foo[id1,id2,a,c,b]: Table has been renamed or dropped"
        );

        let mut drifted = observed();
        drifted.row_key = vec!["id".to_string()];
        let err = validate_schema(&request, Some(&drifted)).unwrap_err();
        assert!(err
            .to_string()
            .ends_with("Row key (e.g. PRIMARY KEY or INDEX) has changed"));

        let mut drifted = observed();
        drifted.attnums.remove("b");
        let err = validate_schema(&request, Some(&drifted)).unwrap_err();
        assert!(err
            .to_string()
            .ends_with("Column b has been renamed or dropped"));

        // Swapped columns: names survive but attnums moved.
        let mut drifted = observed();
        drifted.attnums.insert("a".to_string(), 4);
        drifted.attnums.insert("b".to_string(), 3);
        let err = validate_schema(&request, Some(&drifted)).unwrap_err();
        assert!(err
            .to_string()
            .ends_with("Column a no longer corresponds to the original column"));

        let mut drifted = observed();
        drifted.relation_oid = 99999;
        let err = validate_schema(&request, Some(&drifted)).unwrap_err();
        assert!(err
            .to_string()
            .ends_with("Table has been renamed or dropped"));
    }

    #[test]
    fn copy_parser_types_values_and_handles_split_chunks() {
        let columns = vec![
            ColumnMetadata::of("int4").not_null(),
            ColumnMetadata::of("int8").not_null(),
            ColumnMetadata::of("text"),
            ColumnMetadata::of("json").array(),
            ColumnMetadata::of("json"),
        ];
        let mut parser = CopyRowParser::new(columns);

        // Row layout: id2, id1, a, c, b — key columns first. The array
        // element `{"e":4}` is quoted in the array literal (inner quotes
        // backslash-escaped), and COPY doubles those backslashes.
        let array_field = r#"{1,2,"3","{\\"e\\":4}"}"#;
        let line = format!("2\t1\tiiiiiiiiii\t{array_field}\t{{\"d\":1}}\n");
        let (head, tail) = line.split_at(10);
        assert!(parser.push(head.as_bytes()).unwrap().is_empty(), "no full line yet");
        let rows = parser.push(tail.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], json!(2));
        assert_eq!(rows[0][1], json!(1));
        assert_eq!(rows[0][2], json!("iiiiiiiiii"));
        assert_eq!(rows[0][3], json!([1, 2, 3, {"e": 4}]));
        assert_eq!(rows[0][4], json!({"d": 1}));
    }

    #[test]
    fn copy_parser_handles_null_and_escapes() {
        let columns = vec![ColumnMetadata::of("text"), ColumnMetadata::of("text")];
        let mut parser = CopyRowParser::new(columns);
        let rows = parser.push(b"\\N\ta\\tb\n\\.\n").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::Null);
        assert_eq!(rows[0][1], json!("a\tb"));
    }

    #[test]
    fn field_count_mismatch_is_an_error() {
        let mut parser = CopyRowParser::new(vec![ColumnMetadata::of("text")]);
        assert!(parser.push(b"a\tb\n").is_err());
    }
}
