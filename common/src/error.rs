use std::time::Duration;

use thiserror::Error;

// Core error taxonomy shared by every pipeline crate. Callers dispatch on
// kinds, never on messages.
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Schema validation failed: {0}")]
    SchemaInvalid(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport closed: {0}")]
    TransportClosed(String),
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        retryable: bool,
    },
    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RagError {
    /// Stable identifier surfaced to callers, e.g. in structured error
    /// responses and DLQ records.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SchemaInvalid(_) => "schema_invalid",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
            Self::TransportClosed(_) => "transport_closed",
            Self::Rpc { .. } => "rpc_error",
            Self::DependencyUnavailable(_) => "dependency_unavailable",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a failed operation may be attempted again.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::TransportClosed(_) | Self::DependencyUnavailable(_) => true,
            Self::Rpc { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Caller errors that must neither be retried nor dead-lettered.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SchemaInvalid(_) | Self::PermissionDenied(_))
    }
}
