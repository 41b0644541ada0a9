//! Queryable models over the CVR schema and their conversions into the
//! in-memory record types.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::pg::data_types::PgInterval;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde_json::Value;
use zero_core::{
    keys::{RowId, RowKey},
    protocol::QuerySpec,
    version::{CvrVersion, StateVersion},
};

use super::{
    schema::{clients, desires, instances, queries, rows, rows_version},
    ClientRecord, StoreError, DesireRecord, QueryRecord, RowRecord,
};

fn parse_cookie(raw: &str) -> Result<CvrVersion, StoreError> {
    CvrVersion::parse_cookie(raw).map_err(|e| StoreError::Malformed(e.to_string()))
}

fn parse_cookie_opt(raw: &Option<String>) -> Result<Option<CvrVersion>, StoreError> {
    raw.as_deref().map(parse_cookie).transpose()
}

#[derive(Identifiable, Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = instances)]
#[diesel(primary_key(client_group_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Instance {
    pub client_group_id: String,
    pub version: String,
    pub replica_version: Option<String>,
    pub last_active: DateTime<Utc>,
    pub ttl_clock: f64,
    pub owner: Option<String>,
    pub granted_at: Option<DateTime<Utc>>,
    pub client_schema: Option<Value>,
    pub profile_id: Option<String>,
}

impl Instance {
    /// The instance row joined with its (possibly lagging) rows version.
    pub async fn with_rows_version(
        client_group_id: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Option<(Instance, Option<String>)>> {
        instances::table
            .left_join(
                rows_version::table
                    .on(rows_version::client_group_id.eq(instances::client_group_id)),
            )
            .filter(instances::client_group_id.eq(client_group_id))
            .select((Instance::as_select(), rows_version::version.nullable()))
            .first::<(Instance, Option<String>)>(conn)
            .await
            .optional()
    }

    pub fn version(&self) -> Result<CvrVersion, StoreError> {
        parse_cookie(&self.version)
    }
}

#[derive(Identifiable, Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = clients)]
#[diesel(primary_key(client_group_id, client_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Client {
    pub client_group_id: String,
    pub client_id: String,
    pub patch_version: String,
    pub last_mutation_id: i64,
}

impl Client {
    pub async fn for_group(
        client_group_id: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<Client>> {
        clients::table
            .filter(clients::client_group_id.eq(client_group_id))
            .select(Client::as_select())
            .load(conn)
            .await
    }

    pub fn into_record(self) -> Result<ClientRecord, StoreError> {
        Ok(ClientRecord {
            client_id: self.client_id,
            patch_version: parse_cookie(&self.patch_version)?,
            last_mutation_id: self.last_mutation_id as u64,
        })
    }
}

#[derive(Identifiable, Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = queries)]
#[diesel(primary_key(client_group_id, query_hash))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Query {
    pub client_group_id: String,
    pub query_hash: String,
    pub client_ast: Option<Value>,
    pub query_name: Option<String>,
    pub query_args: Option<Value>,
    pub patch_version: Option<String>,
    pub transformation_hash: Option<String>,
    pub transformation_version: Option<String>,
    pub internal: bool,
    pub deleted: bool,
    pub error_message: Option<String>,
    pub error_version: Option<String>,
}

impl Query {
    pub async fn non_deleted_for_group(
        client_group_id: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<Query>> {
        queries::table
            .filter(queries::client_group_id.eq(client_group_id))
            .filter(queries::deleted.eq(false))
            .select(Query::as_select())
            .load(conn)
            .await
    }

    /// Queries whose got/del transition falls inside `(after, up_to]`,
    /// deleted ones included; the catch-up source.
    pub async fn in_patch_window(
        client_group_id: &str,
        after: &str,
        up_to: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<Query>> {
        queries::table
            .filter(queries::client_group_id.eq(client_group_id))
            .filter(queries::patch_version.gt(after))
            .filter(queries::patch_version.le(up_to))
            .select(Query::as_select())
            .load(conn)
            .await
    }

    pub fn into_record(self) -> Result<QueryRecord, StoreError> {
        let spec = match (self.client_ast, self.query_name, self.query_args) {
            (Some(ast), None, None) => QuerySpec::Ast { ast },
            (None, Some(name), args) => {
                QuerySpec::Named { name, args: args.unwrap_or(Value::Null) }
            }
            _ => {
                return Err(StoreError::Malformed(format!(
                    "query {} must carry exactly one of clientAST or queryName",
                    self.query_hash
                )))
            }
        };
        Ok(QueryRecord {
            query_hash: self.query_hash,
            spec,
            patch_version: parse_cookie_opt(&self.patch_version)?,
            transformation_hash: self.transformation_hash,
            transformation_version: self
                .transformation_version
                .as_deref()
                .map(StateVersion::parse)
                .transpose()
                .map_err(|e| StoreError::Malformed(e.to_string()))?,
            internal: self.internal,
            deleted: self.deleted,
            error_message: self.error_message,
            error_version: parse_cookie_opt(&self.error_version)?,
        })
    }
}

#[derive(Identifiable, Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = desires)]
#[diesel(primary_key(client_group_id, client_id, query_hash))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Desire {
    pub client_group_id: String,
    pub client_id: String,
    pub query_hash: String,
    pub patch_version: String,
    pub deleted: bool,
    pub ttl: Option<PgInterval>,
    pub inactivated_at: Option<DateTime<Utc>>,
    pub ttl_ms: Option<f64>,
    pub inactivated_at_ms: Option<f64>,
    pub retry_error_version: Option<String>,
}

impl Desire {
    pub async fn for_group(
        client_group_id: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<Desire>> {
        desires::table
            .filter(desires::client_group_id.eq(client_group_id))
            .select(Desire::as_select())
            .load(conn)
            .await
    }

    pub async fn in_patch_window(
        client_group_id: &str,
        after: &str,
        up_to: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<Desire>> {
        desires::table
            .filter(desires::client_group_id.eq(client_group_id))
            .filter(desires::patch_version.gt(after))
            .filter(desires::patch_version.le(up_to))
            .select(Desire::as_select())
            .load(conn)
            .await
    }

    pub fn into_record(self) -> Result<DesireRecord, StoreError> {
        // Readers prefer the Ms columns; the legacy INTERVAL/TIMESTAMPTZ
        // pair only backs them up.
        let ttl_ms = self.ttl_ms.or_else(|| {
            self.ttl
                .as_ref()
                .map(interval_to_ms)
        });
        let inactivated_at_ms = self.inactivated_at_ms.or_else(|| {
            self.inactivated_at
                .map(|t| t.timestamp_millis() as f64)
        });
        Ok(DesireRecord {
            client_id: self.client_id,
            query_hash: self.query_hash,
            patch_version: parse_cookie(&self.patch_version)?,
            deleted: self.deleted,
            ttl_ms: super::normalize_ttl(ttl_ms),
            inactivated_at_ms,
            retry_error_version: parse_cookie_opt(&self.retry_error_version)?,
        })
    }
}

pub(crate) fn interval_to_ms(interval: &PgInterval) -> f64 {
    const MS_PER_DAY: f64 = 24.0 * 60.0 * 60.0 * 1000.0;
    interval.microseconds as f64 / 1000.0
        + interval.days as f64 * MS_PER_DAY
        + interval.months as f64 * 30.0 * MS_PER_DAY
}

pub(crate) fn ms_to_interval(ms: f64) -> PgInterval {
    PgInterval::from_microseconds((ms * 1000.0) as i64)
}

#[derive(Identifiable, Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = rows)]
#[diesel(primary_key(client_group_id, schema, table_name, row_key))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RowRecordRow {
    pub client_group_id: String,
    pub schema: String,
    pub table_name: String,
    pub row_key: String,
    pub row_version: String,
    pub patch_version: String,
    pub ref_counts: Option<Value>,
}

impl RowRecordRow {
    pub async fn for_group(
        client_group_id: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<RowRecordRow>> {
        rows::table
            .filter(rows::client_group_id.eq(client_group_id))
            .select(RowRecordRow::as_select())
            .load(conn)
            .await
    }

    pub async fn in_patch_window(
        client_group_id: &str,
        after: &str,
        up_to: &str,
        conn: &mut AsyncPgConnection,
    ) -> QueryResult<Vec<RowRecordRow>> {
        rows::table
            .filter(rows::client_group_id.eq(client_group_id))
            .filter(rows::patch_version.gt(after))
            .filter(rows::patch_version.le(up_to))
            .select(RowRecordRow::as_select())
            .load(conn)
            .await
    }

    pub fn into_record(self) -> Result<RowRecord, StoreError> {
        let key: RowKey = serde_json::from_str(&self.row_key)
            .map_err(|e| StoreError::Malformed(format!("rowKey: {e}")))?;
        let ref_counts = self
            .ref_counts
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Malformed(format!("refCounts: {e}")))?;
        Ok(RowRecord {
            id: RowId::new(self.schema, self.table_name, key),
            row_version: StateVersion::parse(&self.row_version)
                .map_err(|e| StoreError::Malformed(e.to_string()))?,
            patch_version: parse_cookie(&self.patch_version)?,
            ref_counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_conversion_roundtrip() {
        let ms = 90_061_000.0; // 1d 1h 1m 1s
        let interval = ms_to_interval(ms);
        assert_eq!(interval_to_ms(&interval), ms);
    }

    #[test]
    fn query_record_requires_exactly_one_form() {
        let base = Query {
            client_group_id: "g".into(),
            query_hash: "h".into(),
            client_ast: None,
            query_name: None,
            query_args: None,
            patch_version: None,
            transformation_hash: None,
            transformation_version: None,
            internal: false,
            deleted: false,
            error_message: None,
            error_version: None,
        };

        assert!(base.clone().into_record().is_err(), "neither form set");

        let both = Query {
            client_ast: Some(serde_json::json!({})),
            query_name: Some("n".into()),
            ..base.clone()
        };
        assert!(both.into_record().is_err(), "both forms set");

        let ast = Query { client_ast: Some(serde_json::json!({"table": "foo"})), ..base };
        let record = ast.into_record().unwrap();
        assert!(matches!(record.spec, QuerySpec::Ast { .. }));
    }
}
