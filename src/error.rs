//! Error types for the discovery catalog.
//!
//! Three families, one per layer:
//!
//! | Type | Raised by | Escalation |
//! |------|-----------|------------|
//! | [`ConnectorError`] | a single connector's fetch | isolated; reported per connector |
//! | [`PersistenceError`] | the catalog store | logged; degrades to in-memory mode |
//! | [`ServiceError`] | [`DiscoveryService`](crate::discovery::DiscoveryService) | returned to the caller |
//!
//! Connector and persistence failures never abort a refresh. They show up
//! as structured status in the [`RefreshReport`](crate::models::RefreshReport).

use std::time::Duration;

use thiserror::Error;

/// Failure of one connector during one fetch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// No rate-limiter token became available within the allowed wait,
    /// or the upstream answered HTTP 429.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transport failure or an unexpected upstream status.
    #[error("source unreachable: {0}")]
    Unreachable(String),

    /// The upstream answered, but not in the shape the connector expects.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Missing or rejected credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The fetch did not settle before the per-connector deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectorError {
    /// Short, stable label used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorError::RateLimited(_) => "rate_limited",
            ConnectorError::Unreachable(_) => "unreachable",
            ConnectorError::SchemaMismatch(_) => "schema_mismatch",
            ConnectorError::AuthFailed(_) => "auth_failed",
            ConnectorError::Timeout(_) => "timeout",
        }
    }
}

/// Failure of the durable catalog store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("row '{id}' could not be deserialized: {reason}")]
    DeserializationFailed { id: String, reason: String },
}

/// Misuse of the service boundary, surfaced synchronously.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("a refresh is already in progress")]
    RefreshAlreadyInProgress,

    #[error("service is not open; call open() first")]
    NotInitialized,

    #[error("service has been closed")]
    Closed,

    #[error("dataset not found: {0}")]
    NotFound(String),

    /// An operator deletion could not be applied to the store; the
    /// in-memory catalog was left as it was.
    #[error("store rejected the change: {0}")]
    Persistence(#[from] PersistenceError),
}
