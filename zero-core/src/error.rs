use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VersionError {
    #[error("malformed lexi version: {0}")]
    Malformed(String),
    #[error("malformed LSN: {0}")]
    MalformedLsn(String),
}

/// Raised when durable replication state no longer matches the running
/// configuration (publications, ignored tables, bookkeeping downgrades).
/// The process must resync the replica from scratch.
#[derive(Error, Debug, Clone)]
#[error("auto reset required: {reason}")]
pub struct AutoResetSignal {
    pub reason: String,
}

impl AutoResetSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// The closed set of error kinds surfaced to clients over the sync
/// protocol. Anything not representable here is reported as `Internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AuthInvalidated,
    ClientNotFound,
    InvalidConnectionRequestBaseCookie,
    InvalidConnectionRequestLastMutationID,
    InvalidPush,
    MutationFailed,
    MutationRateLimited,
    Rebalance,
    Rehome,
    SchemaVersionNotSupported,
    ServerOverloaded,
    Unauthorized,
    VersionNotSupported,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
