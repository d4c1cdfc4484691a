//! Transport client error types.

use thiserror::Error;

/// Errors that can occur while talking to a tool server subprocess.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (serialization, write or flush failure).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error: {message}")]
    ServerError {
        code: Option<i64>,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived within the request deadline.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The pending request was dropped before a response arrived.
    #[error("request {id} to server '{server}' was abandoned")]
    RequestAbandoned { server: String, id: u64 },
}

impl McpError {
    /// Whether this error came from the remote server rather than the channel.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, McpError::ServerError { .. })
    }
}
