//! JSON-RPC over stdio transport.
//!
//! Low-level message plumbing for one tool server process:
//! - Writing line-delimited JSON-RPC requests to the child's stdin
//! - Reassembling stdout bytes into complete lines (`LineAssembler`)
//! - Correlating responses to waiting callers by id (`PendingRequests`)
//! - Racing each request against its deadline

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use super::errors::McpError;
use super::types::{error_codes, CallOutcome, JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Monotonic request id source, owned by one transport client.
///
/// Ids are never reused, even across subprocess restarts, so a late line
/// from a previous process can never resolve a newer request.
#[derive(Debug)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Allocate the next request id.
    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Line Assembly ───────────────────────────────────────────────────────────

/// Accumulates raw stdout bytes and yields complete `\n`-terminated lines.
///
/// Works on bytes rather than text so a multi-byte UTF-8 character split
/// across two reads is decoded correctly once the line is complete.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, trimmed.
    ///
    /// Blank lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Bytes received after the last newline.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

// ─── Pending Requests ────────────────────────────────────────────────────────

/// In-flight requests keyed by JSON-RPC id.
///
/// Each entry is removed exactly once: by its response, by its timeout, or
/// by `clear()` on shutdown. Whoever removes it owns the resolution.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new request and return the receiver its response lands on.
    pub fn register(&self, id: u64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.map().insert(id, tx);
        rx
    }

    /// Deliver a response. Returns `false` if no request with this id is pending.
    pub fn resolve(&self, id: u64, response: JsonRpcResponse) -> bool {
        let Some(tx) = self.map().remove(&id) else {
            return false;
        };
        // The caller may have given up between removal and send; that's fine.
        let _ = tx.send(response);
        true
    }

    /// Drop a request without resolving it (timeout or write failure).
    pub fn retire(&self, id: u64) -> bool {
        self.map().remove(&id).is_some()
    }

    /// Abandon every pending request; waiting callers see a closed channel.
    pub fn clear(&self) {
        self.map().clear();
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.map().contains_key(&id)
    }
}

// ─── Inbound Dispatch ────────────────────────────────────────────────────────

/// What happened to one inbound stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineDisposition {
    /// Resolved the pending request with this id.
    Resolved(u64),
    /// Valid JSON with no matching pending id: a notification or a late reply.
    Unsolicited,
    /// Not parseable as a JSON-RPC message; dropped.
    Malformed,
}

/// Route one complete stdout line to its waiting caller.
///
/// Never fails: unmatched and malformed lines are logged and dropped so a
/// single bad line cannot desynchronize the stream.
pub fn dispatch_line(server: &str, pending: &PendingRequests, line: &str) -> LineDisposition {
    let message: JsonRpcResponse = match serde_json::from_str(line) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(server, error = %e, line, "dropping malformed line from server");
            return LineDisposition::Malformed;
        }
    };

    match message.id {
        Some(id) if pending.resolve(id, message.clone()) => {
            tracing::trace!(server, id, "response matched pending request");
            LineDisposition::Resolved(id)
        }
        id => {
            tracing::debug!(
                server,
                id = ?id,
                method = message.method.as_deref().unwrap_or(""),
                "unsolicited message from server"
            );
            LineDisposition::Unsolicited
        }
    }
}

// ─── Outbound Channel ────────────────────────────────────────────────────────

/// Writes requests to a server and awaits correlated responses.
///
/// Generic over the writer so tests can drive it with an in-memory pipe.
pub struct RpcChannel<W> {
    server_name: String,
    writer: tokio::sync::Mutex<W>,
    pending: std::sync::Arc<PendingRequests>,
    ids: std::sync::Arc<RequestIds>,
}

impl<W> RpcChannel<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        server_name: &str,
        writer: W,
        pending: std::sync::Arc<PendingRequests>,
        ids: std::sync::Arc<RequestIds>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            pending,
            ids,
        }
    }

    /// Send a request and wait up to `timeout` for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.ids.next_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        json.push('\n');

        // Register before writing so a fast reply cannot race past us.
        let rx = self.pending.register(id);

        if let Err(e) = self.write_all(json.as_bytes()).await {
            self.pending.retire(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::RequestAbandoned {
                server: self.server_name.clone(),
                id,
            }),
            Err(_) => {
                self.pending.retire(id);
                Err(McpError::Timeout {
                    server: self.server_name.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }

    /// Close the write half so the server sees EOF.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: Some(error_codes::INTERNAL_ERROR),
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Turn a `tools/call` response into a `CallOutcome`.
///
/// An `error` member is a failure carrying its message. Otherwise the payload
/// is the first `{"type":"text"}` content block, or the raw result when the
/// server did not use the content array.
pub fn call_outcome(response: JsonRpcResponse) -> CallOutcome {
    match extract_result(response) {
        Ok(result) => {
            let first_text = result
                .get("content")
                .and_then(|c| c.as_array())
                .and_then(|blocks| {
                    blocks.iter().find_map(|block| {
                        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                            block.get("text").and_then(|t| t.as_str())
                        } else {
                            None
                        }
                    })
                })
                .map(|text| serde_json::Value::String(text.to_string()));
            CallOutcome::ok(first_text.unwrap_or(result))
        }
        Err(McpError::ServerError { message, .. }) => CallOutcome::failed(message),
        Err(e) => CallOutcome::failed(e.to_string()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
