//! # Client view records
//!
//! The durable per-client-group record of exactly which rows, at which
//! versions, each client has observed, and which queries are active.
//!
//! ## Design Decisions
//!
//! ### Version cookies as text
//!
//! CVR versions `(stateVersion, minorVersion)` are stored as their cookie
//! string (`"<state>"` or `"<state>:<minor-lexi>"`). Both components are
//! lexi encodings, so plain string comparison — in Rust and in SQL range
//! predicates over `patchVersion` columns — reproduces version order. No
//! column is ever parsed on the hot path.
//!
//! ### Single-writer discipline
//!
//! All writes for a client group are serialized by a `FOR UPDATE` lock on
//! its `instances` row plus a compare-and-set on `version`. The
//! view-syncer additionally holds a transient ownership lease
//! (`owner`/`grantedAt`), transferred only to connections with a newer
//! `lastConnectTime`.
//!
//! ### Tombstones
//!
//! Rows that leave every query result keep their record with
//! `refCounts = NULL` so that catch-up can still deliver `del` patches to
//! clients poking forward from an older cookie.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use diesel_async::SimpleAsyncConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use zero_core::{
    keys::RowId,
    protocol::{ClientId, QueryHash, QuerySpec},
    version::{CvrVersion, StateVersion},
};

use crate::postgres::{quote_ident, PgPool, Shard};

pub mod orm;
pub mod rows_cache;
pub mod schema;
pub mod store;

pub const MAX_LOAD_ATTEMPTS: usize = 10;
pub const LOAD_ATTEMPT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("client not found: {0}")]
    ClientNotFound(String),
    #[error("concurrent modification: expected version {expected}, actual {actual}")]
    ConcurrentModification { expected: String, actual: String },
    #[error("ownership held by {owner} since {granted_at}")]
    Ownership { owner: String, granted_at: DateTime<Utc> },
    #[error("invalid client schema: {0}")]
    InvalidClientSchema(String),
    #[error("rows version {rows} behind instance version {instance}")]
    RowsVersionBehind { rows: String, instance: String },
    #[error("Cannot sync from older replica: CVR={cvr}, DB={db}")]
    OlderReplica { cvr: String, db: String },
    #[error(transparent)]
    AutoReset(#[from] zero_core::error::AutoResetSignal),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("pool error: {0}")]
    Pool(String),
    #[error("malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub client_id: ClientId,
    pub patch_version: CvrVersion,
    pub last_mutation_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    pub query_hash: QueryHash,
    pub spec: QuerySpec,
    /// Version at which the query transitioned desired → gotten; `None`
    /// until first hydration completes.
    pub patch_version: Option<CvrVersion>,
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<StateVersion>,
    /// Internal queries are never ref-counted on client desire.
    pub internal: bool,
    pub deleted: bool,
    pub error_message: Option<String>,
    pub error_version: Option<CvrVersion>,
}

impl QueryRecord {
    pub fn new(query_hash: QueryHash, spec: QuerySpec) -> Self {
        QueryRecord {
            query_hash,
            spec,
            patch_version: None,
            transformation_hash: None,
            transformation_version: None,
            internal: false,
            deleted: false,
            error_message: None,
            error_version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesireRecord {
    pub client_id: ClientId,
    pub query_hash: QueryHash,
    pub patch_version: CvrVersion,
    pub deleted: bool,
    /// `None` means the desire never expires. Negative client-supplied
    /// TTLs are normalised to `None` before they get here.
    pub ttl_ms: Option<f64>,
    pub inactivated_at_ms: Option<f64>,
    pub retry_error_version: Option<CvrVersion>,
}

/// Normalises a client-supplied TTL: negative values mean "never
/// expires".
pub fn normalize_ttl(ttl_ms: Option<f64>) -> Option<f64> {
    ttl_ms.filter(|t| *t >= 0.0)
}

impl DesireRecord {
    /// Whether an inactivated desire has outlived its TTL at the given
    /// ttlClock reading.
    pub fn expired_at(&self, ttl_clock: f64) -> bool {
        match (self.inactivated_at_ms, self.ttl_ms) {
            (Some(inactivated), Some(ttl)) => inactivated + ttl <= ttl_clock,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub id: RowId,
    pub row_version: StateVersion,
    pub patch_version: CvrVersion,
    /// Reference counts by query hash. `None` marks a tombstone kept for
    /// catch-up.
    pub ref_counts: Option<BTreeMap<QueryHash, i32>>,
}

impl RowRecord {
    pub fn is_tombstone(&self) -> bool {
        self.ref_counts.is_none()
    }
}

/// The in-memory reconstruction of a client group's CVR.
#[derive(Debug, Clone)]
pub struct Cvr {
    pub client_group_id: String,
    pub version: CvrVersion,
    pub replica_version: Option<StateVersion>,
    pub last_active: DateTime<Utc>,
    pub ttl_clock: f64,
    pub clients: BTreeMap<ClientId, ClientRecord>,
    pub queries: BTreeMap<QueryHash, QueryRecord>,
    pub desires: BTreeMap<(ClientId, QueryHash), DesireRecord>,
    pub client_schema: Option<Value>,
    pub profile_id: Option<String>,
}

impl Cvr {
    pub fn new(client_group_id: impl Into<String>) -> Self {
        Cvr {
            client_group_id: client_group_id.into(),
            version: CvrVersion::initial(),
            replica_version: None,
            last_active: Utc::now(),
            ttl_clock: 0.0,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            desires: BTreeMap::new(),
            client_schema: None,
            profile_id: None,
        }
    }

    /// Client-desired (non-internal, non-deleted) queries that some
    /// non-expired desire still references.
    pub fn desired_query_hashes(&self) -> Vec<QueryHash> {
        self.queries
            .values()
            .filter(|q| !q.internal && !q.deleted)
            .filter(|q| {
                self.desires.values().any(|d| {
                    d.query_hash == q.query_hash && !d.deleted && !d.expired_at(self.ttl_clock)
                })
            })
            .map(|q| q.query_hash.clone())
            .collect()
    }
}

/// Creates the shard's CVR schema and tables when absent.
pub async fn ensure_schema(pool: &PgPool, shard: &Shard) -> Result<(), StoreError> {
    let schema = quote_ident(&shard.cvr_schema());
    let ddl = format!(
        r#"
        CREATE SCHEMA IF NOT EXISTS {schema};
        CREATE TABLE IF NOT EXISTS {schema}."instances" (
          "clientGroupID" TEXT PRIMARY KEY,
          "version" TEXT NOT NULL,
          "replicaVersion" TEXT,
          "lastActive" TIMESTAMPTZ NOT NULL,
          "ttlClock" DOUBLE PRECISION NOT NULL DEFAULT 0,
          "owner" TEXT,
          "grantedAt" TIMESTAMPTZ,
          "clientSchema" JSONB,
          "profileID" TEXT
        );
        CREATE TABLE IF NOT EXISTS {schema}."rowsVersion" (
          "clientGroupID" TEXT PRIMARY KEY,
          "version" TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS {schema}."clients" (
          "clientGroupID" TEXT NOT NULL,
          "clientID" TEXT NOT NULL,
          "patchVersion" TEXT NOT NULL,
          "lastMutationID" BIGINT NOT NULL DEFAULT 0,
          PRIMARY KEY ("clientGroupID", "clientID")
        );
        CREATE TABLE IF NOT EXISTS {schema}."queries" (
          "clientGroupID" TEXT NOT NULL,
          "queryHash" TEXT NOT NULL,
          "clientAST" JSONB,
          "queryName" TEXT,
          "queryArgs" JSONB,
          "patchVersion" TEXT,
          "transformationHash" TEXT,
          "transformationVersion" TEXT,
          "internal" BOOLEAN NOT NULL DEFAULT false,
          "deleted" BOOLEAN NOT NULL DEFAULT false,
          "errorMessage" TEXT,
          "errorVersion" TEXT,
          PRIMARY KEY ("clientGroupID", "queryHash")
        );
        CREATE TABLE IF NOT EXISTS {schema}."desires" (
          "clientGroupID" TEXT NOT NULL,
          "clientID" TEXT NOT NULL,
          "queryHash" TEXT NOT NULL,
          "patchVersion" TEXT NOT NULL,
          "deleted" BOOLEAN NOT NULL DEFAULT false,
          "ttl" INTERVAL,
          "inactivatedAt" TIMESTAMPTZ,
          "ttlMs" DOUBLE PRECISION,
          "inactivatedAtMs" DOUBLE PRECISION,
          "retryErrorVersion" TEXT,
          PRIMARY KEY ("clientGroupID", "clientID", "queryHash")
        );
        CREATE TABLE IF NOT EXISTS {schema}."rows" (
          "clientGroupID" TEXT NOT NULL,
          "schema" TEXT NOT NULL,
          "table" TEXT NOT NULL,
          "rowKey" TEXT NOT NULL,
          "rowVersion" TEXT NOT NULL,
          "patchVersion" TEXT NOT NULL,
          "refCounts" JSONB,
          PRIMARY KEY ("clientGroupID", "schema", "table", "rowKey")
        );
        CREATE INDEX IF NOT EXISTS "rows_patch_version"
          ON {schema}."rows" ("clientGroupID", "patchVersion");
        "#
    );
    let mut conn = pool
        .get()
        .await
        .map_err(|err| StoreError::Pool(err.to_string()))?;
    conn.batch_execute(&ddl).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_ttl_never_expires() {
        assert_eq!(normalize_ttl(Some(-1.0)), None);
        assert_eq!(normalize_ttl(Some(0.0)), Some(0.0));
        assert_eq!(normalize_ttl(Some(600_000.0)), Some(600_000.0));
        assert_eq!(normalize_ttl(None), None);
    }

    #[test]
    fn desire_expiry_is_ttl_clock_based() {
        let desire = DesireRecord {
            client_id: "c1".to_string(),
            query_hash: "q1".to_string(),
            patch_version: CvrVersion::initial(),
            deleted: false,
            ttl_ms: Some(1_000.0),
            inactivated_at_ms: Some(5_000.0),
            retry_error_version: None,
        };
        assert!(!desire.expired_at(5_500.0));
        assert!(desire.expired_at(6_000.0));

        let never = DesireRecord { ttl_ms: None, ..desire };
        assert!(!never.expired_at(f64::MAX));
    }

    #[test]
    fn desired_queries_exclude_internal_and_expired() {
        let mut cvr = Cvr::new("g1");
        cvr.ttl_clock = 10_000.0;
        cvr.queries.insert(
            "q1".to_string(),
            QueryRecord::new(
                "q1".to_string(),
                QuerySpec::Ast { ast: serde_json::json!({"table": "foo"}) },
            ),
        );
        cvr.queries.insert(
            "lmids".to_string(),
            QueryRecord {
                internal: true,
                ..QueryRecord::new(
                    "lmids".to_string(),
                    QuerySpec::Ast { ast: serde_json::json!({"table": "clients"}) },
                )
            },
        );
        cvr.desires.insert(
            ("c1".to_string(), "q1".to_string()),
            DesireRecord {
                client_id: "c1".to_string(),
                query_hash: "q1".to_string(),
                patch_version: CvrVersion::initial(),
                deleted: false,
                ttl_ms: None,
                inactivated_at_ms: None,
                retry_error_version: None,
            },
        );

        assert_eq!(cvr.desired_query_hashes(), vec!["q1".to_string()]);
    }
}
