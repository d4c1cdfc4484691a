//! MCP Client: JSON-RPC over stdio transport for tool server processes.
//!
//! This module handles:
//! - Spawning and supervising one tool server child process per client
//! - Line-delimited JSON-RPC 2.0 framing over process stdio
//! - Correlating concurrent requests to responses by id, with deadlines
//! - Surfacing server stderr as leveled diagnostics
//!
//! The `TransportClient` is used by the agent core's `ToolRouter` to reach
//! the remote tool servers.

pub mod client;
pub mod errors;
pub mod lifecycle;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{TransportClient, LONG_CALL_TIMEOUT, SHORT_CALL_TIMEOUT};
pub use errors::McpError;
pub use types::{CallOutcome, ClientInfo, ServerConfig};
