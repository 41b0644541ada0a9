//! Durable change-streamer bookkeeping.
//!
//! The change source persists, per shard, the replication configuration
//! it was started with, its last committed watermark, and a change log
//! that lets a restarted (or lagging) replicator catch up without
//! touching upstream. Everything lives in the shard's
//! `"{app}_{n}/cdc"` schema.
//!
//! A configuration mismatch between the stored record and the running
//! process (publications, ignored tables) means upstream state no longer
//! corresponds to what this shard replicated; that is not recoverable in
//! place and raises `AutoResetSignal`.

use diesel::{
    sql_query,
    sql_types::{Array, Integer, Jsonb, Nullable, Text},
};
use diesel_async::{
    scoped_futures::ScopedFutureExt, AsyncConnection, RunQueryDsl, SimpleAsyncConnection,
};
use serde_json::Value;
use tracing::info;
use zero_core::{error::AutoResetSignal, version::StateVersion};

use crate::{
    cvr::StoreError,
    postgres::{checkout, quote_ident, PgConn, PgPool, Shard},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    pub slot_name: String,
    pub publications: Vec<String>,
    pub ignored_tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedChange {
    pub watermark: StateVersion,
    pub pos: i32,
    pub change: Value,
}

pub struct CdcStore {
    pool: PgPool,
    shard: Shard,
}

impl CdcStore {
    pub fn new(pool: PgPool, shard: Shard) -> Self {
        CdcStore { pool, shard }
    }

    async fn conn(&self) -> Result<PgConn, StoreError> {
        checkout(&self.pool, &self.shard.cdc_schema()).await
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let schema = quote_ident(&self.shard.cdc_schema());
        let ddl = format!(
            r#"
            CREATE SCHEMA IF NOT EXISTS {schema};
            CREATE TABLE IF NOT EXISTS {schema}."replicationConfig" (
              "lock" INTEGER PRIMARY KEY DEFAULT 1 CHECK ("lock" = 1),
              "slotName" TEXT NOT NULL,
              "publications" TEXT[] NOT NULL,
              "ignoredTables" TEXT[] NOT NULL,
              "resetRequired" BOOLEAN NOT NULL DEFAULT false
            );
            CREATE TABLE IF NOT EXISTS {schema}."replicationState" (
              "lock" INTEGER PRIMARY KEY DEFAULT 1 CHECK ("lock" = 1),
              "lastWatermark" TEXT NOT NULL,
              "owner" TEXT
            );
            CREATE TABLE IF NOT EXISTS {schema}."changeLog" (
              "watermark" TEXT NOT NULL,
              "pos" INTEGER NOT NULL,
              "change" JSONB NOT NULL,
              PRIMARY KEY ("watermark", "pos")
            );
            CREATE TABLE IF NOT EXISTS {schema}."tableMetadata" (
              "schema" TEXT NOT NULL,
              "table" TEXT NOT NULL,
              "metadata" JSONB NOT NULL,
              PRIMARY KEY ("schema", "table")
            );
            CREATE TABLE IF NOT EXISTS {schema}."backfilling" (
              "schema" TEXT NOT NULL,
              "table" TEXT NOT NULL,
              "columns" TEXT[] NOT NULL,
              PRIMARY KEY ("schema", "table")
            );
            "#
        );
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| StoreError::Pool(err.to_string()))?;
        conn.batch_execute(&ddl).await?;
        Ok(())
    }

    /// Loads the stored replication config, initialising it on first
    /// start. A mismatch with `desired` raises `AutoResetSignal`: the
    /// durable state was produced under a different configuration.
    pub async fn load_or_init_config(
        &self,
        desired: &ReplicationConfig,
    ) -> Result<ReplicationConfig, StoreError> {
        #[derive(diesel::QueryableByName)]
        struct ConfigRow {
            #[diesel(sql_type = Text)]
            slot_name: String,
            #[diesel(sql_type = Array<Text>)]
            publications: Vec<String>,
            #[diesel(sql_type = Array<Text>)]
            ignored_tables: Vec<String>,
        }

        let mut conn = self.conn().await?;
        let stored: Vec<ConfigRow> = sql_query(
            r#"
            SELECT "slotName" AS slot_name, "publications" AS publications,
                   "ignoredTables" AS ignored_tables
              FROM "replicationConfig"
            "#,
        )
        .load(&mut conn)
        .await?;

        match stored.into_iter().next() {
            None => {
                info!(slot = %desired.slot_name, "initializing replication config");
                sql_query(
                    r#"
                    INSERT INTO "replicationConfig" ("slotName", "publications", "ignoredTables")
                      VALUES ($1, $2, $3)
                    "#,
                )
                .bind::<Text, _>(&desired.slot_name)
                .bind::<Array<Text>, _>(&desired.publications)
                .bind::<Array<Text>, _>(&desired.ignored_tables)
                .execute(&mut conn)
                .await?;
                sql_query(
                    r#"
                    INSERT INTO "replicationState" ("lastWatermark") VALUES ('00')
                      ON CONFLICT ("lock") DO NOTHING
                    "#,
                )
                .execute(&mut conn)
                .await?;
                Ok(desired.clone())
            }
            Some(row) => {
                let stored = ReplicationConfig {
                    slot_name: row.slot_name,
                    publications: row.publications,
                    ignored_tables: row.ignored_tables,
                };
                if stored != *desired {
                    return Err(AutoResetSignal::new(format!(
                        "replication config changed: stored {stored:?}, configured {desired:?}"
                    ))
                    .into());
                }
                Ok(stored)
            }
        }
    }

    pub async fn last_watermark(&self) -> Result<StateVersion, StoreError> {
        #[derive(diesel::QueryableByName)]
        struct WatermarkRow {
            #[diesel(sql_type = Text)]
            last_watermark: String,
        }
        let mut conn = self.conn().await?;
        let row: Vec<WatermarkRow> =
            sql_query(r#"SELECT "lastWatermark" AS last_watermark FROM "replicationState""#)
                .load(&mut conn)
                .await?;
        let raw = row
            .into_iter()
            .next()
            .map(|r| r.last_watermark)
            .unwrap_or_else(|| "00".to_string());
        StateVersion::parse(&raw).map_err(|e| StoreError::Malformed(e.to_string()))
    }

    /// Appends one transaction's changes and advances the watermark
    /// atomically.
    pub async fn append_changes(
        &self,
        watermark: &StateVersion,
        changes: &[Value],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.transaction::<(), StoreError, _>(|conn| {
            async move {
                for (pos, change) in changes.iter().enumerate() {
                    sql_query(
                        r#"
                        INSERT INTO "changeLog" ("watermark", "pos", "change")
                          VALUES ($1, $2, $3)
                          ON CONFLICT ("watermark", "pos") DO NOTHING
                        "#,
                    )
                    .bind::<Text, _>(watermark.as_str())
                    .bind::<Integer, _>(pos as i32)
                    .bind::<Jsonb, _>(change)
                    .execute(conn)
                    .await?;
                }
                sql_query(r#"UPDATE "replicationState" SET "lastWatermark" = $1"#)
                    .bind::<Text, _>(watermark.as_str())
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    /// Changes strictly after `watermark`, in `(watermark, pos)` order.
    pub async fn changes_after(
        &self,
        watermark: &StateVersion,
    ) -> Result<Vec<LoggedChange>, StoreError> {
        #[derive(diesel::QueryableByName)]
        struct ChangeRow {
            #[diesel(sql_type = Text)]
            watermark: String,
            #[diesel(sql_type = Integer)]
            pos: i32,
            #[diesel(sql_type = Jsonb)]
            change: Value,
        }
        let mut conn = self.conn().await?;
        let rows: Vec<ChangeRow> = sql_query(
            r#"
            SELECT "watermark" AS watermark, "pos" AS pos, "change" AS change
              FROM "changeLog" WHERE "watermark" > $1
              ORDER BY "watermark", "pos"
            "#,
        )
        .bind::<Text, _>(watermark.as_str())
        .load(&mut conn)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(LoggedChange {
                    watermark: StateVersion::parse(&r.watermark)
                        .map_err(|e| StoreError::Malformed(e.to_string()))?,
                    pos: r.pos,
                    change: r.change,
                })
            })
            .collect()
    }

    /// Drops log entries at or below `watermark` once every consumer has
    /// acked past it.
    pub async fn purge_through(&self, watermark: &StateVersion) -> Result<usize, StoreError> {
        let mut conn = self.conn().await?;
        let purged = sql_query(r#"DELETE FROM "changeLog" WHERE "watermark" <= $1"#)
            .bind::<Text, _>(watermark.as_str())
            .execute(&mut conn)
            .await?;
        Ok(purged)
    }

    /// Marks a backfill as in flight so an interrupted one is detected at
    /// restart.
    pub async fn begin_backfill(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        sql_query(
            r#"
            INSERT INTO "backfilling" ("schema", "table", "columns") VALUES ($1, $2, $3)
              ON CONFLICT ("schema", "table") DO UPDATE SET "columns" = excluded."columns"
            "#,
        )
        .bind::<Text, _>(schema)
        .bind::<Text, _>(table)
        .bind::<Array<Text>, _>(columns)
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    pub async fn end_backfill(&self, schema: &str, table: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        sql_query(r#"DELETE FROM "backfilling" WHERE "schema" = $1 AND "table" = $2"#)
            .bind::<Text, _>(schema)
            .bind::<Text, _>(table)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Stores published relation metadata for trigger-less drift
    /// detection.
    pub async fn put_table_metadata(
        &self,
        schema: &str,
        table: &str,
        metadata: &Value,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        sql_query(
            r#"
            INSERT INTO "tableMetadata" ("schema", "table", "metadata") VALUES ($1, $2, $3)
              ON CONFLICT ("schema", "table") DO UPDATE SET "metadata" = excluded."metadata"
            "#,
        )
        .bind::<Text, _>(schema)
        .bind::<Text, _>(table)
        .bind::<Jsonb, _>(metadata)
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    pub async fn table_metadata(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Option<Value>, StoreError> {
        #[derive(diesel::QueryableByName)]
        struct MetadataRow {
            #[diesel(sql_type = Nullable<Jsonb>)]
            metadata: Option<Value>,
        }
        let mut conn = self.conn().await?;
        let rows: Vec<MetadataRow> = sql_query(
            r#"SELECT "metadata" AS metadata FROM "tableMetadata" WHERE "schema" = $1 AND "table" = $2"#,
        )
        .bind::<Text, _>(schema)
        .bind::<Text, _>(table)
        .load(&mut conn)
        .await?;
        Ok(rows.into_iter().next().and_then(|r| r.metadata))
    }
}
