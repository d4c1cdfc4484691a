//! Provider-neutral model types.
//!
//! Adapters decode each provider's native response into a `ModelTurn`; the
//! engine never looks at provider JSON directly.

use serde::{Deserialize, Serialize};

// ─── Model Output ────────────────────────────────────────────────────────────

/// A tool the model asked for, by catalog name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Provider-assigned correlation id (`toolu_…`, `call_…`).
    pub id: String,
    /// Catalog name, e.g. `search_audit_events`.
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Why the model stopped generating, normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSignal {
    /// Natural end of the answer.
    EndTurn,
    /// The model is waiting on tool results.
    ToolUse,
    /// Output was cut off by the token limit.
    MaxTokens,
    /// Anything else the provider reported, verbatim.
    Other(String),
}

/// One complete model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTurn {
    pub text: String,
    pub tool_requests: Vec<ToolRequest>,
    pub stop: StopSignal,
}

impl ModelTurn {
    /// Whether the turn ends in tool requests rather than a final answer.
    ///
    /// Driven by the provider's stop signal; a tool-use stop with no
    /// decodable requests is treated as final.
    pub fn wants_tools(&self) -> bool {
        self.stop == StopSignal::ToolUse && !self.tool_requests.is_empty()
    }
}

// ─── Streaming ───────────────────────────────────────────────────────────────

/// One server-sent event: optional `event:` name and joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
