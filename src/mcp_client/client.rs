//! TransportClient: one-shot tool calls against a single server process.
//!
//! The client owns at most one live subprocess. It is spawned lazily on the
//! first call, re-spawned if it has exited, and torn down by `close()`.
//! All methods take `&self`, so concurrent callers share the process and are
//! told apart by JSON-RPC id.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::process::ChildStdin;

use super::errors::McpError;
use super::lifecycle::{spawn_server, ServerProcess};
use super::transport::{call_outcome, extract_result, PendingRequests, RequestIds, RpcChannel};
use super::types::{initialize_params, CallOutcome, ClientInfo, ServerConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for administrative-style tool calls.
pub const SHORT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for calls that scan large datasets.
pub const LONG_CALL_TIMEOUT: Duration = Duration::from_secs(120);

// ─── Connection ──────────────────────────────────────────────────────────────

/// A spawned, handshaken server process.
struct Connection {
    process: Mutex<ServerProcess>,
    channel: RpcChannel<ChildStdin>,
    pending: Arc<PendingRequests>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_alive()
    }

    async fn shutdown(&self) {
        self.channel.shutdown().await;
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .terminate();
        self.pending.clear();
    }
}

// ─── TransportClient ─────────────────────────────────────────────────────────

/// JSON-RPC client for one out-of-process tool server.
pub struct TransportClient {
    name: String,
    config: ServerConfig,
    client_info: ClientInfo,
    call_timeout: Duration,
    init_timeout: Duration,
    ids: Arc<RequestIds>,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl TransportClient {
    /// Create a client. Nothing is spawned until the first call.
    pub fn new(name: &str, config: ServerConfig, call_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            config,
            client_info: ClientInfo::default(),
            call_timeout,
            init_timeout: SHORT_CALL_TIMEOUT,
            ids: Arc::new(RequestIds::new()),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Override the identity announced in the handshake.
    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    /// Override the handshake timeout.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the server and complete the `initialize` handshake.
    ///
    /// No-op while a live, initialized process exists. If the previous process
    /// has exited, a new one is spawned.
    pub async fn initialize(&self) -> Result<(), McpError> {
        self.connection().await.map(|_| ())
    }

    /// Whether a live, initialized process is attached.
    pub async fn is_initialized(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.is_alive())
    }

    /// Terminate the subprocess and reset initialization state.
    ///
    /// Requests still waiting on this process are abandoned.
    pub async fn close(&self) {
        let conn = self.connection.lock().await.take();
        if let Some(conn) = conn {
            conn.shutdown().await;
            tracing::info!(server = %self.name, "transport client closed");
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, McpError> {
        let mut guard = self.connection.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.is_alive() {
                return Ok(conn.clone());
            }
            tracing::warn!(server = %self.name, "server process gone, re-spawning");
        }
        // Requests still in flight on the old process keep their own handle and
        // simply run out their deadlines.
        *guard = None;

        let conn = Arc::new(self.connect().await?);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn connect(&self) -> Result<Connection, McpError> {
        let pending = Arc::new(PendingRequests::new());
        let (process, stdin) = spawn_server(&self.name, &self.config, pending.clone())?;
        let conn = Connection {
            process: Mutex::new(process),
            channel: RpcChannel::new(&self.name, stdin, pending.clone(), self.ids.clone()),
            pending,
        };

        let handshake = conn
            .channel
            .request(
                "initialize",
                Some(initialize_params(&self.client_info)),
                self.init_timeout,
            )
            .await
            .and_then(extract_result);

        match handshake {
            Ok(result) => {
                tracing::info!(
                    server = %self.name,
                    server_info = %result.get("serverInfo").cloned().unwrap_or_default(),
                    "server initialized"
                );
                Ok(conn)
            }
            Err(e) => {
                conn.shutdown().await;
                Err(McpError::InitFailed {
                    name: self.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Invoke a tool on the server.
    ///
    /// Initializes lazily. A JSON-RPC `error` member comes back as a failed
    /// `CallOutcome`; spawn, write, and timeout failures come back as `Err`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallOutcome, McpError> {
        let conn = self.connection().await?;

        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });

        let response = conn
            .channel
            .request("tools/call", Some(params), self.call_timeout)
            .await?;

        Ok(call_outcome(response))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
