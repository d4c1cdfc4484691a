//! Provider adapters: one per model API.
//!
//! An adapter owns everything provider-specific:
//! - the request body shape (messages, system instructions, tool schemas)
//! - the tool-result envelope, addressed by the provider's own call id
//! - decoding responses and SSE streams into a `ModelTurn`
//! - mapping catalog names to routed invocations
//!
//! Adding a provider means adding one `ProviderAdapter` implementation.

pub mod anthropic;
pub mod openai;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent_core::catalog::ToolCatalog;
use crate::agent_core::types::{ConversationTurn, ToolInvocation, ToolOutcome};

use super::errors::InferenceError;
use super::types::{ModelTurn, SseEvent, ToolRequest};

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default cap on tool result text sent back to the model.
pub const MAX_TOOL_RESULT_CHARS: usize = 6_000;

/// Shared system instructions; adapters add their own provider notes.
const BASE_SYSTEM_PROMPT: &str = "You are OpsPilot, an assistant for operators of an \
infrastructure access platform. Answer questions by calling the provided tools to read \
audit events and cluster state. Only call a tool when its data is needed, never invent \
results, and base your answer on what the tools returned. When you notice something the \
operator should act on, record it with record_suggestion.";

// ─── ProviderKind ────────────────────────────────────────────────────────────

/// Which model API a deployment talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
        }
    }

    /// Full URL of the completion endpoint under `base_url`.
    pub fn endpoint(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            ProviderKind::Anthropic => format!("{base}/messages"),
            ProviderKind::OpenAi => format!("{base}/chat/completions"),
        }
    }

    /// Authentication and versioning headers.
    pub fn headers(&self, api_key: &str) -> Vec<(&'static str, String)> {
        match self {
            ProviderKind::Anthropic => vec![
                ("x-api-key", api_key.to_string()),
                ("anthropic-version", "2023-06-01".to_string()),
            ],
            ProviderKind::OpenAi => vec![("authorization", format!("Bearer {api_key}"))],
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Settings ────────────────────────────────────────────────────────────────

/// Per-request generation settings shared by all adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_tool_result_chars: usize,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_tokens: 4096,
            temperature: 0.2,
            max_tool_result_chars: MAX_TOOL_RESULT_CHARS,
        }
    }
}

// ─── Traits ──────────────────────────────────────────────────────────────────

/// Translation layer between the engine and one provider's wire format.
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// The catalog whose tools are offered and whose names are mapped.
    fn catalog(&self) -> &ToolCatalog;

    /// Catalog tools in the provider's native schema format.
    fn tool_definitions(&self) -> Vec<serde_json::Value>;

    /// Full request body for the given history.
    fn build_request(&self, history: &[ConversationTurn], stream: bool) -> serde_json::Value;

    /// The provider's tool-result envelope for one outcome.
    fn encode_tool_result(&self, request_id: &str, outcome: &ToolOutcome) -> serde_json::Value;

    /// Decode a non-streaming response body.
    fn parse_response(&self, body: &serde_json::Value) -> Result<ModelTurn, InferenceError>;

    /// A fresh decoder for one streaming response.
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;

    /// Map a tool request onto its routed invocation via the catalog.
    fn to_invocation(&self, request: &ToolRequest) -> ToolInvocation {
        self.catalog().to_invocation(request)
    }
}

/// Incremental decoder for one streamed response.
pub trait StreamDecoder: Send {
    /// Consume one event. Returns any text to forward immediately; tool
    /// request fragments are buffered until `finish`.
    fn feed(&mut self, event: &SseEvent) -> Result<Option<String>, InferenceError>;

    /// Whether the response is complete. A stream that ends while this is
    /// still false was cut off.
    fn is_done(&self) -> bool;

    /// Assemble the complete turn from everything fed so far.
    fn finish(self: Box<Self>) -> Result<ModelTurn, InferenceError>;
}

/// Build the adapter for `kind`.
pub fn adapter_for(
    kind: ProviderKind,
    settings: RequestSettings,
    catalog: ToolCatalog,
) -> Arc<dyn ProviderAdapter> {
    match kind {
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(settings, catalog)),
        ProviderKind::OpenAi => Arc::new(OpenAiAdapter::new(settings, catalog)),
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Truncate to at most `max_bytes`, backing off to a char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Text sent to the model for one outcome, capped at `max_chars`.
///
/// Keeps the head of the result (usually the most useful part) and appends a
/// truncation notice. The outcome itself is left untouched.
pub(crate) fn tool_result_text(outcome: &ToolOutcome, max_chars: usize) -> String {
    let text = outcome.model_text();
    if text.len() <= max_chars {
        return text;
    }

    tracing::warn!(
        tool = %outcome.name,
        original_len = text.len(),
        truncated_to = max_chars,
        "tool result truncated before sending to model"
    );
    format!(
        "{}\n\n[... truncated: showing first {max_chars} of {} chars]",
        truncate_utf8(&text, max_chars),
        text.len()
    )
}

pub(crate) fn system_prompt(provider_note: &str) -> String {
    format!("{BASE_SYSTEM_PROMPT}\n\n{provider_note}")
}

/// Parse streamed or stringified tool arguments; empty means no arguments.
pub(crate) fn parse_arguments(
    provider: &str,
    tool: &str,
    raw: &str,
) -> Result<serde_json::Value, InferenceError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw).map_err(|e| {
        InferenceError::parse(provider, format!("invalid arguments for tool '{tool}': {e}"))
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
