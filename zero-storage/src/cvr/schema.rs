//! Diesel table definitions for the per-shard CVR schema.
//!
//! Column names on the wire are camelCase (matching the client
//! protocol); `#[sql_name]` maps them onto snake_case Rust identifiers.
//! Tables are unqualified: the connection's `search_path` selects the
//! shard schema.

use diesel::table;

table! {
    instances (client_group_id) {
        #[sql_name = "clientGroupID"]
        client_group_id -> Text,
        version -> Text,
        #[sql_name = "replicaVersion"]
        replica_version -> Nullable<Text>,
        #[sql_name = "lastActive"]
        last_active -> Timestamptz,
        #[sql_name = "ttlClock"]
        ttl_clock -> Double,
        owner -> Nullable<Text>,
        #[sql_name = "grantedAt"]
        granted_at -> Nullable<Timestamptz>,
        #[sql_name = "clientSchema"]
        client_schema -> Nullable<Jsonb>,
        #[sql_name = "profileID"]
        profile_id -> Nullable<Text>,
    }
}

table! {
    #[sql_name = "rowsVersion"]
    rows_version (client_group_id) {
        #[sql_name = "clientGroupID"]
        client_group_id -> Text,
        version -> Text,
    }
}

table! {
    clients (client_group_id, client_id) {
        #[sql_name = "clientGroupID"]
        client_group_id -> Text,
        #[sql_name = "clientID"]
        client_id -> Text,
        #[sql_name = "patchVersion"]
        patch_version -> Text,
        #[sql_name = "lastMutationID"]
        last_mutation_id -> Int8,
    }
}

table! {
    queries (client_group_id, query_hash) {
        #[sql_name = "clientGroupID"]
        client_group_id -> Text,
        #[sql_name = "queryHash"]
        query_hash -> Text,
        #[sql_name = "clientAST"]
        client_ast -> Nullable<Jsonb>,
        #[sql_name = "queryName"]
        query_name -> Nullable<Text>,
        #[sql_name = "queryArgs"]
        query_args -> Nullable<Jsonb>,
        #[sql_name = "patchVersion"]
        patch_version -> Nullable<Text>,
        #[sql_name = "transformationHash"]
        transformation_hash -> Nullable<Text>,
        #[sql_name = "transformationVersion"]
        transformation_version -> Nullable<Text>,
        internal -> Bool,
        deleted -> Bool,
        #[sql_name = "errorMessage"]
        error_message -> Nullable<Text>,
        #[sql_name = "errorVersion"]
        error_version -> Nullable<Text>,
    }
}

table! {
    desires (client_group_id, client_id, query_hash) {
        #[sql_name = "clientGroupID"]
        client_group_id -> Text,
        #[sql_name = "clientID"]
        client_id -> Text,
        #[sql_name = "queryHash"]
        query_hash -> Text,
        #[sql_name = "patchVersion"]
        patch_version -> Text,
        deleted -> Bool,
        // Legacy columns; writers fill both generations, readers prefer
        // the Ms variants.
        ttl -> Nullable<Interval>,
        #[sql_name = "inactivatedAt"]
        inactivated_at -> Nullable<Timestamptz>,
        #[sql_name = "ttlMs"]
        ttl_ms -> Nullable<Double>,
        #[sql_name = "inactivatedAtMs"]
        inactivated_at_ms -> Nullable<Double>,
        #[sql_name = "retryErrorVersion"]
        retry_error_version -> Nullable<Text>,
    }
}

table! {
    rows (client_group_id, schema, table_name, row_key) {
        #[sql_name = "clientGroupID"]
        client_group_id -> Text,
        schema -> Text,
        #[sql_name = "table"]
        table_name -> Text,
        #[sql_name = "rowKey"]
        row_key -> Text,
        #[sql_name = "rowVersion"]
        row_version -> Text,
        #[sql_name = "patchVersion"]
        patch_version -> Text,
        #[sql_name = "refCounts"]
        ref_counts -> Nullable<Jsonb>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(instances, rows_version);
