//! Shared types for the agent core.
//!
//! Tool invocations and outcomes, conversation turns, query results, and the
//! event types emitted by the engine and the router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Backends ───────────────────────────────────────────────────────────────

/// Where a tool invocation is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Audit-log tool server (large scans, long timeout).
    Audit,
    /// Cluster administration tool server.
    Cluster,
    /// In-process handlers, no subprocess.
    Local,
    /// The catalog did not recognise the requested tool.
    #[serde(other)]
    Unknown,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Audit => "audit",
            Backend::Cluster => "cluster",
            Backend::Local => "local",
            Backend::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Invocations & Outcomes ─────────────────────────────────────────────────

/// One tool call, already translated to the backend's internal name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub backend: Backend,
    /// Backend-internal dotted name, e.g. `audit.search_events`.
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolInvocation {
    pub fn new(backend: Backend, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            backend,
            name: name.into(),
            arguments,
        }
    }
}

/// Result of one tool invocation. `payload` is set iff `success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub backend: Backend,
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolOutcome {
    pub fn success(
        invocation: &ToolInvocation,
        payload: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            backend: invocation.backend,
            name: invocation.name.clone(),
            success: true,
            payload: Some(payload),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(
        invocation: &ToolInvocation,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            backend: invocation.backend,
            name: invocation.name.clone(),
            success: false,
            payload: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    /// Text shown to the model for this outcome.
    ///
    /// String payloads are passed through as-is (no JSON quoting); other
    /// payloads are JSON-encoded.
    pub fn model_text(&self) -> String {
        if !self.success {
            return self
                .error
                .clone()
                .unwrap_or_else(|| "Tool execution failed".to_string());
        }
        match &self.payload {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(value) => serde_json::to_string(value).unwrap_or_default(),
            None => "No result returned.".to_string(),
        }
    }
}

// ─── Conversation ───────────────────────────────────────────────────────────

/// Conversation role. System instructions are not part of the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Provider-neutral structured content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// The model asked for a tool. `id` is the provider's own correlation id.
    ToolRequest {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// An outcome sent back to the model, addressed to a `ToolRequest` id.
    ToolResult {
        request_id: String,
        outcome: ToolOutcome,
    },
}

/// Turn content: plain text, or blocks for tool traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// One entry in a session's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: TurnContent,
}

impl ConversationTurn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text(text.into()),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::Text(text.into()),
        }
    }

    /// Tool request ids carried by this turn, in order.
    pub fn tool_request_ids(&self) -> Vec<&str> {
        match &self.content {
            TurnContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolRequest { id, .. } => Some(id.as_str()),
                    _ => None,
                })
                .collect(),
            TurnContent::Text(_) => Vec::new(),
        }
    }

    /// Request ids this turn answers, in order.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        match &self.content {
            TurnContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult { request_id, .. } => Some(request_id.as_str()),
                    _ => None,
                })
                .collect(),
            TurnContent::Text(_) => Vec::new(),
        }
    }
}

// ─── Query Results ──────────────────────────────────────────────────────────

/// Terminal output of one `execute_query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub query: String,
    pub response: String,
    /// Every invocation across all rounds, in request order.
    pub tool_calls: Vec<ToolInvocation>,
    /// One outcome per invocation, same order.
    pub tool_results: Vec<ToolOutcome>,
    pub timestamp: DateTime<Utc>,
}

/// Events emitted by the streaming engine, terminated by `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Text { content: String },
    ToolCall { invocation: ToolInvocation },
    ToolResult { outcome: ToolOutcome },
    Done { result: QueryResult },
}

// ─── Observability ──────────────────────────────────────────────────────────

/// Final status of a routed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failure,
}

/// One event per routed invocation, sent to the router's observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    pub backend: Backend,
    pub name: String,
    pub status: ToolStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&ToolOutcome> for ToolEvent {
    fn from(outcome: &ToolOutcome) -> Self {
        Self {
            backend: outcome.backend,
            name: outcome.name.clone(),
            status: if outcome.success {
                ToolStatus::Success
            } else {
                ToolStatus::Failure
            },
            duration_ms: outcome.duration_ms,
            error: outcome.error.clone(),
        }
    }
}

// ─── Local Tools ────────────────────────────────────────────────────────────

/// A structured suggestion recorded by the local `record_suggestion` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

// ─── Tests ──────────────────────────────────────────────────────────────────
