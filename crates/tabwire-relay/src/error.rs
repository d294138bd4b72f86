//! Error types for the tabwire relay.

use thiserror::Error;

/// Errors that can occur while running or using a relay instance.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The request carried a missing or invalid bearer token.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// No extension is currently connected to the relay.
    #[error("extension unavailable: {reason}")]
    ExtensionUnavailable { reason: String },

    /// An extension call did not complete within its deadline.
    #[error("extension call '{method}' timed out after {seconds}s")]
    Timeout { method: String, seconds: u64 },

    /// The request was malformed (bad JSON, unknown discovered-tab id, ...).
    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    /// A CDP frame referenced a session the registry does not know.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// A CDP command carried invalid parameters.
    #[error("invalid params: {reason}")]
    InvalidParams { reason: String },

    /// The relay instance is shutting down.
    #[error("relay shutting down")]
    Shutdown,

    /// A protocol-level error (malformed reply, unexpected frame shape).
    #[error("relay protocol error: {detail}")]
    Protocol { detail: String },

    /// Binding the relay listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The relay URL could not be parsed into a host and port.
    #[error("invalid relay URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl RelayError {
    /// HTTP status code for this error when surfaced on a JSON endpoint.
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::Unauthorized { .. } => 401,
            RelayError::BadRequest { .. } | RelayError::InvalidUrl { .. } => 400,
            RelayError::ExtensionUnavailable { .. } | RelayError::Shutdown => 503,
            RelayError::Timeout { .. } => 504,
            _ => 500,
        }
    }

    /// JSON-RPC error code for this error when surfaced on a CDP socket.
    pub fn rpc_code(&self) -> i64 {
        match self {
            RelayError::SessionNotFound { .. } => -32001,
            RelayError::InvalidParams { .. } => -32602,
            _ => -32000,
        }
    }
}
