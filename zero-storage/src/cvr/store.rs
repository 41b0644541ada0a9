//! Durable CVR operations: load, flush, catch-up.
//!
//! All writes for a client group go through [`CvrStore::flush`], which
//! serializes on the `instances` row (`SELECT … FOR UPDATE`) and
//! compare-and-sets `version`. Batched entity writes are single
//! `jsonb_to_recordset` statements so a flush costs a bounded number of
//! round trips regardless of how many records changed. Row records are
//! flushed separately ([`CvrStore::flush_rows`]) so their `rowsVersion`
//! may lag the instance version; the load path waits out that lag.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::{
    sql_query,
    sql_types::{Double, Jsonb, Nullable, Text, Timestamptz},
};
use diesel_async::{scoped_futures::ScopedFutureExt, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde_json::{json, Value};
use tracing::{debug, warn};
use zero_core::{
    protocol::{ClientId, QueriesPatchOp, QueryHash, QuerySpec},
    version::{CvrVersion, StateVersion},
};

use super::{
    orm::{self, ms_to_interval},
    ClientRecord, Cvr, StoreError, DesireRecord, QueryRecord, RowRecord, LOAD_ATTEMPT_INTERVAL,
    MAX_LOAD_ATTEMPTS,
};
use crate::postgres::{checkout, PgPool, Shard};

/// Everything one CVR update wants to persist. Entity writes are keyed
/// by their conflict key, so only the latest write per key is issued.
#[derive(Debug, Clone, Default)]
pub struct CvrFlush {
    pub last_active: Option<DateTime<Utc>>,
    pub ttl_clock: Option<f64>,
    pub replica_version: Option<StateVersion>,
    pub client_schema: Option<Value>,
    pub profile_id: Option<String>,
    pub query_puts: BTreeMap<QueryHash, QueryRecord>,
    pub client_puts: BTreeMap<ClientId, ClientRecord>,
    pub client_deletes: BTreeSet<ClientId>,
    pub desire_puts: BTreeMap<(ClientId, QueryHash), DesireRecord>,
}

impl CvrFlush {
    pub fn is_empty(&self) -> bool {
        self.query_puts.is_empty()
            && self.client_puts.is_empty()
            && self.client_deletes.is_empty()
            && self.desire_puts.is_empty()
            && self.client_schema.is_none()
            && self.replica_version.is_none()
    }
}

/// Config patches accumulated in a catch-up window.
#[derive(Debug, Default, PartialEq)]
pub struct ConfigPatches {
    pub queries: Vec<(CvrVersion, QueriesPatchOp)>,
    pub desires: Vec<(CvrVersion, ClientId, QueriesPatchOp)>,
}

/// The persistence operations a view-syncer needs from its CVR store.
///
/// [`CvrStore`] is the production implementation; keeping the seam a
/// trait lets conflict and failure paths be exercised without a
/// database.
#[async_trait]
pub trait CvrPersistence: Send + Sync {
    async fn load(
        &self,
        client_group_id: &str,
        last_connect_time: DateTime<Utc>,
        live_replica_version: Option<&StateVersion>,
    ) -> Result<Cvr, StoreError>;

    async fn flush(
        &self,
        client_group_id: &str,
        expected: &CvrVersion,
        version: &CvrVersion,
        last_connect_time: DateTime<Utc>,
        flush: &CvrFlush,
    ) -> Result<(), StoreError>;

    async fn flush_rows(
        &self,
        client_group_id: &str,
        records: &[RowRecord],
        version: &CvrVersion,
    ) -> Result<(), StoreError>;

    async fn row_records(&self, client_group_id: &str) -> Result<Vec<RowRecord>, StoreError>;

    async fn catchup_config_patches(
        &self,
        after: &CvrVersion,
        up_to: &Cvr,
    ) -> Result<ConfigPatches, StoreError>;

    async fn catchup_row_patches(
        &self,
        after: &CvrVersion,
        up_to: &Cvr,
        exclude_hashes: &HashSet<QueryHash>,
    ) -> Result<Vec<RowRecord>, StoreError>;
}

#[async_trait]
impl CvrPersistence for CvrStore {
    async fn load(
        &self,
        client_group_id: &str,
        last_connect_time: DateTime<Utc>,
        live_replica_version: Option<&StateVersion>,
    ) -> Result<Cvr, StoreError> {
        CvrStore::load(self, client_group_id, last_connect_time, live_replica_version).await
    }

    async fn flush(
        &self,
        client_group_id: &str,
        expected: &CvrVersion,
        version: &CvrVersion,
        last_connect_time: DateTime<Utc>,
        flush: &CvrFlush,
    ) -> Result<(), StoreError> {
        CvrStore::flush(self, client_group_id, expected, version, last_connect_time, flush).await
    }

    async fn flush_rows(
        &self,
        client_group_id: &str,
        records: &[RowRecord],
        version: &CvrVersion,
    ) -> Result<(), StoreError> {
        CvrStore::flush_rows(self, client_group_id, records, version).await
    }

    async fn row_records(&self, client_group_id: &str) -> Result<Vec<RowRecord>, StoreError> {
        CvrStore::row_records(self, client_group_id).await
    }

    async fn catchup_config_patches(
        &self,
        after: &CvrVersion,
        up_to: &Cvr,
    ) -> Result<ConfigPatches, StoreError> {
        CvrStore::catchup_config_patches(self, after, up_to).await
    }

    async fn catchup_row_patches(
        &self,
        after: &CvrVersion,
        up_to: &Cvr,
        exclude_hashes: &HashSet<QueryHash>,
    ) -> Result<Vec<RowRecord>, StoreError> {
        CvrStore::catchup_row_patches(self, after, up_to, exclude_hashes).await
    }
}

pub struct CvrStore {
    pool: PgPool,
    shard: Shard,
    /// This process's task identity, used for the ownership lease.
    task_id: String,
}

impl CvrStore {
    pub fn new(pool: PgPool, shard: Shard, task_id: impl Into<String>) -> Self {
        CvrStore { pool, shard, task_id: task_id.into() }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    async fn conn(&self) -> Result<crate::postgres::PgConn, StoreError> {
        checkout(&self.pool, &self.shard.cvr_schema()).await
    }

    /// Loads (or creates) the CVR for a client group, retrying while the
    /// deferred row flush catches up. Exhaustion surfaces as
    /// `ClientNotFound` per the connection contract.
    pub async fn load(
        &self,
        client_group_id: &str,
        last_connect_time: DateTime<Utc>,
        live_replica_version: Option<&StateVersion>,
    ) -> Result<Cvr, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .load_once(client_group_id, last_connect_time, live_replica_version)
                .await
            {
                Err(StoreError::RowsVersionBehind { rows, instance }) => {
                    if attempt >= MAX_LOAD_ATTEMPTS {
                        warn!(
                            client_group_id,
                            rows, instance, "rows version still behind after max load attempts"
                        );
                        return Err(StoreError::ClientNotFound(client_group_id.to_string()));
                    }
                    debug!(client_group_id, rows, instance, attempt, "rows version behind; retrying");
                    tokio::time::sleep(LOAD_ATTEMPT_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    async fn load_once(
        &self,
        client_group_id: &str,
        last_connect_time: DateTime<Utc>,
        live_replica_version: Option<&StateVersion>,
    ) -> Result<Cvr, StoreError> {
        let mut conn = self.conn().await?;
        let cvr = conn
            .transaction::<Cvr, StoreError, _>(|conn| {
                async move {
                    let Some((instance, rows_version)) =
                        orm::Instance::with_rows_version(client_group_id, conn).await?
                    else {
                        return Ok(Cvr::new(client_group_id));
                    };

                    let version = instance.version()?;
                    let rows_version = rows_version.unwrap_or_else(|| "00".to_string());
                    if rows_version != instance.version {
                        return Err(StoreError::RowsVersionBehind {
                            rows: rows_version,
                            instance: instance.version.clone(),
                        });
                    }

                    if let (Some(owner), Some(granted_at)) =
                        (instance.owner.as_deref(), instance.granted_at)
                    {
                        if owner != self.task_id && granted_at > last_connect_time {
                            return Err(StoreError::Ownership {
                                owner: owner.to_string(),
                                granted_at,
                            });
                        }
                    }

                    let mut cvr = Cvr::new(client_group_id);
                    cvr.version = version;
                    cvr.replica_version = instance
                        .replica_version
                        .as_deref()
                        .map(StateVersion::parse)
                        .transpose()
                        .map_err(|e| StoreError::Malformed(e.to_string()))?;
                    cvr.last_active = instance.last_active;
                    cvr.ttl_clock = instance.ttl_clock;
                    cvr.client_schema = instance.client_schema;
                    cvr.profile_id = instance.profile_id;

                    for client in orm::Client::for_group(client_group_id, conn).await? {
                        let record = client.into_record()?;
                        cvr.clients.insert(record.client_id.clone(), record);
                    }
                    for query in orm::Query::non_deleted_for_group(client_group_id, conn).await? {
                        let record = query.into_record()?;
                        cvr.queries.insert(record.query_hash.clone(), record);
                    }
                    for desire in orm::Desire::for_group(client_group_id, conn).await? {
                        let record = desire.into_record()?;
                        cvr.desires
                            .insert((record.client_id.clone(), record.query_hash.clone()), record);
                    }
                    Ok(cvr)
                }
                .scope_boxed()
            })
            .await?;

        if let (Some(cvr_replica), Some(live)) = (&cvr.replica_version, live_replica_version) {
            if cvr_replica > live {
                return Err(StoreError::OlderReplica {
                    cvr: cvr_replica.as_str().to_string(),
                    db: live.as_str().to_string(),
                });
            }
        }

        self.take_ownership(client_group_id, last_connect_time);
        Ok(cvr)
    }

    /// Fire-and-forget CAS on the ownership lease: last connect wins.
    fn take_ownership(&self, client_group_id: &str, last_connect_time: DateTime<Utc>) {
        let pool = self.pool.clone();
        let schema = self.shard.cvr_schema();
        let task_id = self.task_id.clone();
        let client_group_id = client_group_id.to_string();
        tokio::spawn(async move {
            let result = async {
                let mut conn = checkout(&pool, &schema).await?;
                sql_query(
                    r#"
                    UPDATE "instances" SET "owner" = $2, "grantedAt" = $3
                      WHERE "clientGroupID" = $1
                        AND ("grantedAt" IS NULL OR "grantedAt" <= $3)
                    "#,
                )
                .bind::<Text, _>(&client_group_id)
                .bind::<Text, _>(&task_id)
                .bind::<Timestamptz, _>(last_connect_time)
                .execute(&mut conn)
                .await
                .map_err(StoreError::from)
            }
            .await;
            if let Err(err) = result {
                warn!(client_group_id, %err, "ownership CAS failed");
            }
        });
    }

    /// Flushes one CVR update, advancing `expected` → `version`.
    ///
    /// Fails with `ConcurrentModification` when another writer advanced
    /// the instance first, and with `Ownership` when the lease moved to a
    /// newer connection.
    pub async fn flush(
        &self,
        client_group_id: &str,
        expected: &CvrVersion,
        version: &CvrVersion,
        last_connect_time: DateTime<Utc>,
        flush: &CvrFlush,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.transaction::<(), StoreError, _>(|conn| {
            async move {
                self.lock_and_check(conn, client_group_id, expected, last_connect_time)
                    .await?;
                self.upsert_instance(conn, client_group_id, version, flush)
                    .await?;
                if !flush.query_puts.is_empty() {
                    self.upsert_queries(conn, client_group_id, flush.query_puts.values())
                        .await?;
                }
                if !flush.client_puts.is_empty() {
                    self.upsert_clients(conn, client_group_id, flush.client_puts.values())
                        .await?;
                }
                if !flush.desire_puts.is_empty() {
                    self.upsert_desires(conn, client_group_id, flush.desire_puts.values())
                        .await?;
                }
                if !flush.client_deletes.is_empty() {
                    let ids: Vec<&str> = flush
                        .client_deletes
                        .iter()
                        .map(String::as_str)
                        .collect();
                    sql_query(
                        r#"DELETE FROM "clients" WHERE "clientGroupID" = $1 AND "clientID" = ANY($2)"#,
                    )
                    .bind::<Text, _>(client_group_id)
                    .bind::<diesel::sql_types::Array<Text>, _>(&ids)
                    .execute(conn)
                    .await?;
                    sql_query(
                        r#"DELETE FROM "desires" WHERE "clientGroupID" = $1 AND "clientID" = ANY($2)"#,
                    )
                    .bind::<Text, _>(client_group_id)
                    .bind::<diesel::sql_types::Array<Text>, _>(&ids)
                    .execute(conn)
                    .await?;
                }
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn lock_and_check(
        &self,
        conn: &mut AsyncPgConnection,
        client_group_id: &str,
        expected: &CvrVersion,
        last_connect_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        #[derive(diesel::QueryableByName)]
        struct Gate {
            #[diesel(sql_type = Text)]
            version: String,
            #[diesel(sql_type = Nullable<Text>)]
            owner: Option<String>,
            #[diesel(sql_type = Nullable<Timestamptz>)]
            granted_at: Option<DateTime<Utc>>,
        }

        let gate: Vec<Gate> = sql_query(
            r#"
            SELECT "version" AS version, "owner" AS owner, "grantedAt" AS granted_at
              FROM "instances" WHERE "clientGroupID" = $1 FOR UPDATE
            "#,
        )
        .bind::<Text, _>(client_group_id)
        .load(conn)
        .await?;

        match gate.into_iter().next() {
            None => {
                // First flush for this group; the instance upsert will
                // create the row. Only the initial version may do so.
                if *expected != CvrVersion::initial() {
                    return Err(StoreError::ConcurrentModification {
                        expected: expected.cookie(),
                        actual: "<absent>".to_string(),
                    });
                }
                Ok(())
            }
            Some(gate) => {
                if gate.version != expected.cookie() {
                    return Err(StoreError::ConcurrentModification {
                        expected: expected.cookie(),
                        actual: gate.version,
                    });
                }
                if let (Some(owner), Some(granted_at)) = (gate.owner, gate.granted_at) {
                    if owner != self.task_id && granted_at > last_connect_time {
                        return Err(StoreError::Ownership { owner, granted_at });
                    }
                }
                Ok(())
            }
        }
    }

    async fn upsert_instance(
        &self,
        conn: &mut AsyncPgConnection,
        client_group_id: &str,
        version: &CvrVersion,
        flush: &CvrFlush,
    ) -> Result<(), StoreError> {
        sql_query(
            r#"
            INSERT INTO "instances"
                ("clientGroupID", "version", "replicaVersion", "lastActive", "ttlClock",
                 "clientSchema", "profileID")
              VALUES ($1, $2, $3, $4, $5, $6, $7)
              ON CONFLICT ("clientGroupID") DO UPDATE SET
                "version" = excluded."version",
                "replicaVersion" = COALESCE(excluded."replicaVersion", "instances"."replicaVersion"),
                "lastActive" = excluded."lastActive",
                "ttlClock" = excluded."ttlClock",
                "clientSchema" = COALESCE(excluded."clientSchema", "instances"."clientSchema"),
                "profileID" = COALESCE(excluded."profileID", "instances"."profileID")
            "#,
        )
        .bind::<Text, _>(client_group_id)
        .bind::<Text, _>(version.cookie())
        .bind::<Nullable<Text>, _>(flush.replica_version.as_ref().map(|v| v.as_str()))
        .bind::<Timestamptz, _>(flush.last_active.unwrap_or_else(Utc::now))
        .bind::<Double, _>(flush.ttl_clock.unwrap_or(0.0))
        .bind::<Nullable<Jsonb>, _>(flush.client_schema.as_ref())
        .bind::<Nullable<Text>, _>(flush.profile_id.as_deref())
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn upsert_queries(
        &self,
        conn: &mut AsyncPgConnection,
        client_group_id: &str,
        records: impl Iterator<Item = &QueryRecord>,
    ) -> Result<(), StoreError> {
        let rows: Vec<Value> = records
            .map(|q| {
                let (ast, name, args) = match &q.spec {
                    QuerySpec::Ast { ast } => (Some(ast.clone()), None, None),
                    QuerySpec::Named { name, args } => {
                        (None, Some(name.clone()), Some(args.clone()))
                    }
                };
                json!({
                    "queryHash": q.query_hash,
                    "clientAST": ast,
                    "queryName": name,
                    "queryArgs": args,
                    "patchVersion": q.patch_version.as_ref().map(CvrVersion::cookie),
                    "transformationHash": q.transformation_hash,
                    "transformationVersion": q.transformation_version.as_ref().map(|v| v.as_str()),
                    "internal": q.internal,
                    "deleted": q.deleted,
                    "errorMessage": q.error_message,
                    "errorVersion": q.error_version.as_ref().map(CvrVersion::cookie),
                })
            })
            .collect();

        sql_query(
            r#"
            INSERT INTO "queries"
                ("clientGroupID", "queryHash", "clientAST", "queryName", "queryArgs",
                 "patchVersion", "transformationHash", "transformationVersion",
                 "internal", "deleted", "errorMessage", "errorVersion")
              SELECT $1, x."queryHash", x."clientAST", x."queryName", x."queryArgs",
                     x."patchVersion", x."transformationHash", x."transformationVersion",
                     x."internal", x."deleted", x."errorMessage", x."errorVersion"
                FROM jsonb_to_recordset($2) AS x(
                  "queryHash" TEXT, "clientAST" JSONB, "queryName" TEXT, "queryArgs" JSONB,
                  "patchVersion" TEXT, "transformationHash" TEXT, "transformationVersion" TEXT,
                  "internal" BOOLEAN, "deleted" BOOLEAN, "errorMessage" TEXT, "errorVersion" TEXT)
              ON CONFLICT ("clientGroupID", "queryHash") DO UPDATE SET
                "clientAST" = excluded."clientAST",
                "queryName" = excluded."queryName",
                "queryArgs" = excluded."queryArgs",
                "patchVersion" = excluded."patchVersion",
                "transformationHash" = excluded."transformationHash",
                "transformationVersion" = excluded."transformationVersion",
                "internal" = excluded."internal",
                "deleted" = excluded."deleted",
                "errorMessage" = excluded."errorMessage",
                "errorVersion" = excluded."errorVersion"
            "#,
        )
        .bind::<Text, _>(client_group_id)
        .bind::<Jsonb, _>(Value::Array(rows))
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn upsert_clients(
        &self,
        conn: &mut AsyncPgConnection,
        client_group_id: &str,
        records: impl Iterator<Item = &ClientRecord>,
    ) -> Result<(), StoreError> {
        let rows: Vec<Value> = records
            .map(|c| {
                json!({
                    "clientID": c.client_id,
                    "patchVersion": c.patch_version.cookie(),
                    "lastMutationID": c.last_mutation_id,
                })
            })
            .collect();

        sql_query(
            r#"
            INSERT INTO "clients" ("clientGroupID", "clientID", "patchVersion", "lastMutationID")
              SELECT $1, x."clientID", x."patchVersion", x."lastMutationID"
                FROM jsonb_to_recordset($2) AS x(
                  "clientID" TEXT, "patchVersion" TEXT, "lastMutationID" BIGINT)
              ON CONFLICT ("clientGroupID", "clientID") DO UPDATE SET
                "patchVersion" = excluded."patchVersion",
                "lastMutationID" = GREATEST("clients"."lastMutationID", excluded."lastMutationID")
            "#,
        )
        .bind::<Text, _>(client_group_id)
        .bind::<Jsonb, _>(Value::Array(rows))
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn upsert_desires(
        &self,
        conn: &mut AsyncPgConnection,
        client_group_id: &str,
        records: impl Iterator<Item = &DesireRecord>,
    ) -> Result<(), StoreError> {
        let rows: Vec<Value> = records
            .map(|d| {
                // Writers fill both TTL generations.
                let legacy_ttl = d.ttl_ms.map(|ms| {
                    let interval = ms_to_interval(ms);
                    format!("{} microseconds", interval.microseconds)
                });
                let legacy_inactivated = d.inactivated_at_ms.and_then(|ms| {
                    chrono::DateTime::from_timestamp_millis(ms as i64)
                        .map(|t| t.to_rfc3339())
                });
                json!({
                    "clientID": d.client_id,
                    "queryHash": d.query_hash,
                    "patchVersion": d.patch_version.cookie(),
                    "deleted": d.deleted,
                    "ttl": legacy_ttl,
                    "inactivatedAt": legacy_inactivated,
                    "ttlMs": d.ttl_ms,
                    "inactivatedAtMs": d.inactivated_at_ms,
                    "retryErrorVersion": d.retry_error_version.as_ref().map(CvrVersion::cookie),
                })
            })
            .collect();

        sql_query(
            r#"
            INSERT INTO "desires"
                ("clientGroupID", "clientID", "queryHash", "patchVersion", "deleted",
                 "ttl", "inactivatedAt", "ttlMs", "inactivatedAtMs", "retryErrorVersion")
              SELECT $1, x."clientID", x."queryHash", x."patchVersion", x."deleted",
                     x."ttl"::interval, x."inactivatedAt"::timestamptz,
                     x."ttlMs", x."inactivatedAtMs", x."retryErrorVersion"
                FROM jsonb_to_recordset($2) AS x(
                  "clientID" TEXT, "queryHash" TEXT, "patchVersion" TEXT, "deleted" BOOLEAN,
                  "ttl" TEXT, "inactivatedAt" TEXT,
                  "ttlMs" DOUBLE PRECISION, "inactivatedAtMs" DOUBLE PRECISION,
                  "retryErrorVersion" TEXT)
              ON CONFLICT ("clientGroupID", "clientID", "queryHash") DO UPDATE SET
                "patchVersion" = excluded."patchVersion",
                "deleted" = excluded."deleted",
                "ttl" = excluded."ttl",
                "inactivatedAt" = excluded."inactivatedAt",
                "ttlMs" = excluded."ttlMs",
                "inactivatedAtMs" = excluded."inactivatedAtMs",
                "retryErrorVersion" = excluded."retryErrorVersion"
            "#,
        )
        .bind::<Text, _>(client_group_id)
        .bind::<Jsonb, _>(Value::Array(rows))
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Flushes row records and advances `rowsVersion`. Runs outside the
    /// instance lock so it can be deferred past the instance commit.
    pub async fn flush_rows(
        &self,
        client_group_id: &str,
        records: &[RowRecord],
        version: &CvrVersion,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        conn.transaction::<(), StoreError, _>(|conn| {
            async move {
                if !records.is_empty() {
                    let rows: Vec<Value> = records
                        .iter()
                        .map(|r| {
                            json!({
                                "schema": r.id.schema,
                                "table": r.id.table,
                                "rowKey": r.id.key.canonical(),
                                "rowVersion": r.row_version.as_str(),
                                "patchVersion": r.patch_version.cookie(),
                                "refCounts": r.ref_counts,
                            })
                        })
                        .collect();
                    sql_query(
                        r#"
                        INSERT INTO "rows"
                            ("clientGroupID", "schema", "table", "rowKey",
                             "rowVersion", "patchVersion", "refCounts")
                          SELECT $1, x."schema", x."table", x."rowKey",
                                 x."rowVersion", x."patchVersion", x."refCounts"
                            FROM jsonb_to_recordset($2) AS x(
                              "schema" TEXT, "table" TEXT, "rowKey" TEXT,
                              "rowVersion" TEXT, "patchVersion" TEXT, "refCounts" JSONB)
                          ON CONFLICT ("clientGroupID", "schema", "table", "rowKey")
                            DO UPDATE SET
                              "rowVersion" = excluded."rowVersion",
                              "patchVersion" = excluded."patchVersion",
                              "refCounts" = excluded."refCounts"
                        "#,
                    )
                    .bind::<Text, _>(client_group_id)
                    .bind::<Jsonb, _>(Value::Array(rows))
                    .execute(conn)
                    .await?;
                }
                sql_query(
                    r#"
                    INSERT INTO "rowsVersion" ("clientGroupID", "version") VALUES ($1, $2)
                      ON CONFLICT ("clientGroupID") DO UPDATE SET "version" = excluded."version"
                    "#,
                )
                .bind::<Text, _>(client_group_id)
                .bind::<Text, _>(version.cookie())
                .execute(conn)
                .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    /// All row records of a group; rebuilds the row-record cache.
    pub async fn row_records(&self, client_group_id: &str) -> Result<Vec<RowRecord>, StoreError> {
        let mut conn = self.conn().await?;
        orm::RowRecordRow::for_group(client_group_id, &mut conn)
            .await?
            .into_iter()
            .map(orm::RowRecordRow::into_record)
            .collect()
    }

    /// Query and desire patches whose `patchVersion` falls in
    /// `(after, up_to.version]`, verifying that the persisted instance
    /// still matches `up_to.version`.
    pub async fn catchup_config_patches(
        &self,
        after: &CvrVersion,
        up_to: &Cvr,
    ) -> Result<ConfigPatches, StoreError> {
        let mut conn = self.conn().await?;
        self.verify_version(&mut conn, &up_to.client_group_id, &up_to.version)
            .await?;

        let mut patches = ConfigPatches::default();
        for query in orm::Query::in_patch_window(
            &up_to.client_group_id,
            &after.cookie(),
            &up_to.version.cookie(),
            &mut conn,
        )
        .await?
        {
            let version = CvrVersion::parse_cookie(
                query
                    .patch_version
                    .as_deref()
                    .unwrap_or_default(),
            )
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
            let op = if query.deleted {
                QueriesPatchOp::Del { hash: query.query_hash }
            } else {
                QueriesPatchOp::Put { hash: query.query_hash }
            };
            patches.queries.push((version, op));
        }

        for desire in orm::Desire::in_patch_window(
            &up_to.client_group_id,
            &after.cookie(),
            &up_to.version.cookie(),
            &mut conn,
        )
        .await?
        {
            let version = CvrVersion::parse_cookie(&desire.patch_version)
                .map_err(|e| StoreError::Malformed(e.to_string()))?;
            let op = if desire.deleted {
                QueriesPatchOp::Del { hash: desire.query_hash }
            } else {
                QueriesPatchOp::Put { hash: desire.query_hash }
            };
            patches.desires.push((version, desire.client_id, op));
        }
        Ok(patches)
    }

    /// Row patches in `(after, up_to.version]`. Rows referenced by any of
    /// `exclude_hashes` are skipped: a concurrent hydration is already
    /// delivering their full data.
    pub async fn catchup_row_patches(
        &self,
        after: &CvrVersion,
        up_to: &Cvr,
        exclude_hashes: &HashSet<QueryHash>,
    ) -> Result<Vec<RowRecord>, StoreError> {
        let mut conn = self.conn().await?;
        self.verify_version(&mut conn, &up_to.client_group_id, &up_to.version)
            .await?;

        let rows = orm::RowRecordRow::in_patch_window(
            &up_to.client_group_id,
            &after.cookie(),
            &up_to.version.cookie(),
            &mut conn,
        )
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record()?;
            let excluded = record
                .ref_counts
                .as_ref()
                .is_some_and(|counts| counts.keys().any(|hash| exclude_hashes.contains(hash)));
            if !excluded {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn verify_version(
        &self,
        conn: &mut AsyncPgConnection,
        client_group_id: &str,
        expected: &CvrVersion,
    ) -> Result<(), StoreError> {
        let instance = orm::Instance::with_rows_version(client_group_id, conn)
            .await?
            .ok_or_else(|| StoreError::ClientNotFound(client_group_id.to_string()))?;
        if instance.0.version != expected.cookie() {
            return Err(StoreError::ConcurrentModification {
                expected: expected.cookie(),
                actual: instance.0.version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use zero_core::keys::{RowId, RowKey};

    use super::*;

    #[test]
    fn flush_latest_write_per_key_wins() {
        let mut flush = CvrFlush::default();
        let spec = QuerySpec::Ast { ast: json!({"table": "foo"}) };
        flush
            .query_puts
            .insert("h1".to_string(), QueryRecord::new("h1".to_string(), spec.clone()));
        // A later write to the same conflict key replaces the earlier one.
        let mut newer = QueryRecord::new("h1".to_string(), spec);
        newer.deleted = true;
        flush.query_puts.insert("h1".to_string(), newer);

        assert_eq!(flush.query_puts.len(), 1);
        assert!(flush.query_puts["h1"].deleted);
    }

    #[test]
    fn row_record_json_shape() {
        let record = RowRecord {
            id: RowId::new(
                "public",
                "foo",
                RowKey::new(vec![("id".to_string(), json!(1))]),
            ),
            row_version: StateVersion::parse("101").unwrap(),
            patch_version: CvrVersion::parse_cookie("101").unwrap(),
            ref_counts: Some([("h1".to_string(), 1)].into_iter().collect()),
        };
        let encoded = json!({
            "schema": record.id.schema,
            "table": record.id.table,
            "rowKey": record.id.key.canonical(),
            "rowVersion": record.row_version.as_str(),
            "patchVersion": record.patch_version.cookie(),
            "refCounts": record.ref_counts,
        });
        assert_eq!(encoded["rowKey"], json!("[[\"id\",1]]"));
        assert_eq!(encoded["refCounts"], json!({"h1": 1}));
    }
}
