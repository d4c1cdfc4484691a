//! Shared types for the transport client.
//!
//! JSON-RPC 2.0 message types, the initialize handshake payload, and the
//! per-server process configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Protocol version announced in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// An inbound JSON-RPC message: a response (has `id`) or a notification.
///
/// Servers in the wild omit `jsonrpc` and `code`, so both are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── Handshake ──────────────────────────────────────────────────────────────

/// Identifies this client in the `initialize` handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Build the `params` object for the `initialize` request.
pub fn initialize_params(client_info: &ClientInfo) -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": client_info,
    })
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// How to launch one tool server process.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides, e.g. upstream URLs or credentials.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

// ─── Call Results ───────────────────────────────────────────────────────────

/// Parsed result of one `tools/call` request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallOutcome {
    pub success: bool,
    /// First text content block, or the raw `result` when there is none.
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl CallOutcome {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

// ─── Standard Error Codes ───────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ──────────────────────────────────────────────────────────────────
