//! Transport-level error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// `-32600`: the request object was not valid JSON-RPC.
pub const INVALID_REQUEST: i64 = -32600;
/// `-32601`: the node does not expose the requested method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Local code for server errors without a well-known code.
pub const UNKNOWN: i64 = -99999;

/// Errors that can occur during an RPC transport operation.
///
/// The type is `Clone` so a single in-flight outcome can be handed to every
/// caller that attached to the same cache entry.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Malformed wire message (bad version tag, wrong shape, bad JSON).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC application error returned by the node.
    #[error("RPC error {0}")]
    Rpc(JsonRpcError),

    /// Operation attempted without an open connection.
    #[error("Not connected")]
    NotConnected,

    /// In-flight operation invalidated by connection loss.
    #[error("Disconnected: {reason}")]
    Disconnected { reason: String },

    /// No response within the configured window.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Subscription API on a transport without subscription capability.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid construction parameters.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle call made in the wrong connection state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// HTTP request failed (connection refused, bad status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A failure annotated with the request that caused it.
    #[error("{source}\nFailed request: {request}")]
    Request {
        request: String,
        source: Box<TransportError>,
    },

    /// Result could not be deserialized into the requested type.
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl TransportError {
    /// Returns `true` if this error is transient (transport fault or timeout).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_)
            | Self::WebSocket(_)
            | Self::Timeout { .. }
            | Self::NotConnected
            | Self::Disconnected { .. } => true,
            Self::Request { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns `true` if this is a node-side execution error (not retryable).
    pub fn is_execution_error(&self) -> bool {
        match self {
            Self::Rpc(_) => true,
            Self::Request { source, .. } => source.is_execution_error(),
            _ => false,
        }
    }

    /// Returns `true` if the error was caused by a missing or lost connection.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Disconnected { .. })
    }

    /// Server-reported JSON-RPC code, if any.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::Rpc(err) => Some(err.code),
            Self::Request { source, .. } => source.rpc_code(),
            _ => None,
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}
