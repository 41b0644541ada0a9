//! Types exchanged with connected clients.
//!
//! The websocket framing itself lives outside this system; these are the
//! message bodies it carries. Wire names are camelCase to match the
//! client implementation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{change::Row, error::ErrorKind, keys::RowId};

pub type ClientId = String;
pub type ClientGroupId = String;
/// Hash of a query's normalised definition; assigned by the client.
pub type QueryHash = String;

/// A query definition: either a raw AST or a reference to a named server
/// query with arguments. Exactly one form is ever present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuerySpec {
    Ast {
        ast: Value,
    },
    Named {
        #[serde(rename = "name")]
        name: String,
        #[serde(rename = "args")]
        args: Value,
    },
}

/// One entry of a desired-queries patch (client → server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum DesiredQueriesPatchOp {
    Put {
        hash: QueryHash,
        #[serde(flatten)]
        query: QuerySpec,
        #[serde(rename = "ttlMs", skip_serializing_if = "Option::is_none")]
        ttl_ms: Option<f64>,
    },
    Del {
        hash: QueryHash,
    },
}

/// One entry of a queries patch (server → client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum QueriesPatchOp {
    Put { hash: QueryHash },
    Del { hash: QueryHash },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RowPatchOp {
    Put {
        id: RowId,
        value: Row,
    },
    Del {
        id: RowId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: u64,
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
    pub mutations: Vec<Mutation>,
    pub push_version: u32,
    pub schema_version: Option<String>,
}

/// Per-mutation outcome, demuxed from the push endpoint's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MutationOutcome {
    Ok,
    AppError { details: Value },
    Ooo,
    UnsupportedPushVersion,
    UnsupportedSchemaVersion,
    Http { status: u16, details: String },
    Network { details: String },
    Auth { details: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub id: u64,
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    pub result: MutationOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub mutations: Vec<MutationResult>,
}

// ---------------------------------------------------------------------
// Upstream (client → server)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConnectionBody {
    pub desired_queries_patch: Vec<DesiredQueriesPatchOp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_clients: Option<Vec<ClientId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Upstream {
    InitConnection(InitConnectionBody),
    ChangeDesiredQueries {
        #[serde(rename = "desiredQueriesPatch")]
        patch: Vec<DesiredQueriesPatchOp>,
    },
    DeleteClients {
        #[serde(rename = "clientIDs")]
        client_ids: Vec<ClientId>,
    },
    Push(PushBody),
    UpdateAuth {
        auth: String,
    },
    Inspect {
        body: Value,
    },
}

// ---------------------------------------------------------------------
// Downstream (server → client)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersions {
    pub min_supported_version: u32,
    pub max_supported_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStart {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    /// Cookie the client must currently hold; `None` for a client with no
    /// prior state.
    pub base_cookie: Option<String>,
    pub cookie: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_versions: Option<SchemaVersions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePart {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(rename = "lastMutationIDChanges", skip_serializing_if = "Option::is_none")]
    pub last_mutation_id_changes: Option<BTreeMap<ClientId, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_queries_patches: Option<BTreeMap<ClientId, Vec<QueriesPatchOp>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub got_queries_patch: Option<Vec<QueriesPatchOp>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_patch: Option<Vec<RowPatchOp>>,
}

impl PokePart {
    pub fn is_empty(&self) -> bool {
        self.last_mutation_id_changes.is_none()
            && self.desired_queries_patches.is_none()
            && self.got_queries_patch.is_none()
            && self.rows_patch.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEnd {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    pub cookie: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_params: Option<BTreeMap<String, String>>,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorBody {
            kind,
            message: message.into(),
            origin: None,
            max_backoff_ms: None,
            min_backoff_ms: None,
            reconnect_params: None,
        }
    }

    /// The ownership-transfer error: clients should reconnect to the new
    /// owner immediately.
    pub fn rehome(message: impl Into<String>) -> Self {
        ErrorBody { max_backoff_ms: Some(0), ..ErrorBody::new(ErrorKind::Rehome, message) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Downstream {
    PokeStart(PokeStart),
    PokePart(PokePart),
    PokeEnd(PokeEnd),
    DeleteClients {
        #[serde(rename = "clientIDs")]
        client_ids: Vec<ClientId>,
    },
    PushResponse(PushResponse),
    Inspect {
        body: Value,
    },
    Error(ErrorBody),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn query_spec_forms_are_distinct() {
        let ast: QuerySpec = serde_json::from_value(json!({"ast": {"table": "foo"}})).unwrap();
        assert!(matches!(ast, QuerySpec::Ast { .. }));

        let named: QuerySpec =
            serde_json::from_value(json!({"name": "issuesByOwner", "args": [42]})).unwrap();
        assert!(matches!(named, QuerySpec::Named { .. }));
    }

    #[test]
    fn desired_patch_wire_format() {
        let op = DesiredQueriesPatchOp::Put {
            hash: "h1".to_string(),
            query: QuerySpec::Ast { ast: json!({"table": "foo"}) },
            ttl_ms: Some(60_000.0),
        };
        let encoded = serde_json::to_value(&op).unwrap();
        assert_eq!(
            encoded,
            json!({"op": "put", "hash": "h1", "ast": {"table": "foo"}, "ttlMs": 60000.0})
        );
    }

    #[test]
    fn rehome_reconnects_immediately() {
        let body = ErrorBody::rehome("moved");
        assert_eq!(body.kind, ErrorKind::Rehome);
        assert_eq!(body.max_backoff_ms, Some(0));
    }

    #[test]
    fn downstream_roundtrip() {
        let poke = Downstream::PokeStart(PokeStart {
            poke_id: "p1".to_string(),
            base_cookie: Some("121".to_string()),
            cookie: "123".to_string(),
            schema_versions: None,
        });
        let encoded = serde_json::to_string(&poke).unwrap();
        assert!(encoded.contains("\"pokeStart\""));
        let decoded: Downstream = serde_json::from_str(&encoded).unwrap();
        assert_eq!(poke, decoded);
    }
}
