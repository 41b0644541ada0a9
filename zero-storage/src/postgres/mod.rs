//! # Postgres access layer
//!
//! Connection pooling and shard addressing shared by the CVR store and
//! the CDC bookkeeping store.
//!
//! ## Design Decisions
//!
//! ### Per-shard schemas via `search_path`
//!
//! Every shard owns two schemas, `"{appID}_{shardNum}/cvr"` and
//! `"{appID}_{shardNum}/cdc"`. Diesel resolves schema names at compile
//! time, so instead of qualifying tables we set the connection's
//! `search_path` to the shard schema on checkout. All table names in the
//! generated DSL are unqualified and resolve against that path.
//!
//! ### Atomic transactions
//!
//! As in the rest of the storage layer, individual operations receive a
//! connection reference that may already be inside a transaction;
//! beginning/committing is owned by the caller so multiple operations can
//! share one transactional context.

use diesel::sql_query;
use diesel_async::{
    pooled_connection::{
        deadpool::{Object, Pool},
        AsyncDieselConnectionManager,
    },
    AsyncPgConnection, RunQueryDsl,
};

use crate::cvr::StoreError;

pub type PgPool = Pool<AsyncPgConnection>;
pub type PgConn = Object<AsyncPgConnection>;

/// The unit of isolation: one publication set, one replication slot, one
/// replica file, one pair of Postgres schemas.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shard {
    pub app_id: String,
    pub shard_num: u16,
}

impl Shard {
    pub fn new(app_id: impl Into<String>, shard_num: u16) -> Self {
        Shard { app_id: app_id.into(), shard_num }
    }

    pub fn cvr_schema(&self) -> String {
        format!("{}_{}/cvr", self.app_id, self.shard_num)
    }

    pub fn cdc_schema(&self) -> String {
        format!("{}_{}/cdc", self.app_id, self.shard_num)
    }

    /// The replica-file schema prefix, also used for slot naming.
    pub fn ident(&self) -> String {
        format!("{}_{}", self.app_id, self.shard_num)
    }
}

impl std::fmt::Display for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.ident())
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Establishes a connection pool against the given database URL.
pub fn connect(db_url: &str) -> Result<PgPool, StoreError> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    Pool::builder(config)
        .build()
        .map_err(|err| StoreError::Pool(err.to_string()))
}

/// Checks a connection out of the pool with its `search_path` set to the
/// given shard schema.
pub async fn checkout(pool: &PgPool, schema: &str) -> Result<PgConn, StoreError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|err| StoreError::Pool(err.to_string()))?;
    sql_query(format!("SET search_path TO {}", quote_ident(schema)))
        .execute(&mut conn)
        .await?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_schemas() {
        let shard = Shard::new("zbugs", 0);
        assert_eq!(shard.cvr_schema(), "zbugs_0/cvr");
        assert_eq!(shard.cdc_schema(), "zbugs_0/cdc");
        assert_eq!(shard.ident(), "zbugs_0");
    }

    #[test]
    fn quoting_handles_embedded_quotes() {
        assert_eq!(quote_ident(r#"app"0/cvr"#), r#""app""0/cvr""#);
    }
}
