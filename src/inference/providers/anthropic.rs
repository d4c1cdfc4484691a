//! Anthropic Messages API adapter.
//!
//! Tool requests arrive as `tool_use` content blocks with `stop_reason:
//! "tool_use"`; results go back as `tool_result` blocks inside a user turn,
//! addressed by `tool_use_id`.

use std::collections::BTreeMap;

use serde_json::json;

use crate::agent_core::catalog::ToolCatalog;
use crate::agent_core::types::{ContentBlock, ConversationTurn, Role, ToolOutcome, TurnContent};
use crate::inference::errors::InferenceError;
use crate::inference::types::{ModelTurn, SseEvent, StopSignal, ToolRequest};

use super::{
    parse_arguments, system_prompt, tool_result_text, ProviderAdapter, ProviderKind,
    RequestSettings, StreamDecoder,
};

const PROVIDER: &str = "anthropic";

/// Stands in for an empty assistant answer; the Messages API rejects empty
/// assistant content anywhere but the final turn.
const EMPTY_ASSISTANT_TEXT: &str = "(no response)";

const PROVIDER_NOTE: &str = "You may call several tools in one turn when they are independent.";

fn stop_signal(reason: Option<&str>) -> StopSignal {
    match reason {
        None | Some("end_turn") | Some("stop_sequence") => StopSignal::EndTurn,
        Some("tool_use") => StopSignal::ToolUse,
        Some("max_tokens") => StopSignal::MaxTokens,
        Some(other) => StopSignal::Other(other.to_string()),
    }
}

// ─── AnthropicAdapter ────────────────────────────────────────────────────────

pub struct AnthropicAdapter {
    settings: RequestSettings,
    catalog: ToolCatalog,
    system: String,
}

impl AnthropicAdapter {
    pub fn new(settings: RequestSettings, catalog: ToolCatalog) -> Self {
        Self {
            settings,
            catalog,
            system: system_prompt(PROVIDER_NOTE),
        }
    }

    fn encode_turn(&self, turn: &ConversationTurn) -> serde_json::Value {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = match &turn.content {
            TurnContent::Text(text) if turn.role == Role::Assistant && text.trim().is_empty() => {
                json!(EMPTY_ASSISTANT_TEXT)
            }
            TurnContent::Text(text) => json!(text),
            TurnContent::Blocks(blocks) => serde_json::Value::Array(
                blocks.iter().map(|b| self.encode_block(b)).collect(),
            ),
        };
        json!({"role": role, "content": content})
    }

    fn encode_block(&self, block: &ContentBlock) -> serde_json::Value {
        match block {
            ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            ContentBlock::ToolRequest {
                id,
                name,
                arguments,
            } => json!({"type": "tool_use", "id": id, "name": name, "input": arguments}),
            ContentBlock::ToolResult {
                request_id,
                outcome,
            } => self.encode_tool_result(request_id, outcome),
        }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    fn tool_definitions(&self) -> Vec<serde_json::Value> {
        self.catalog
            .specs()
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "description": spec.description,
                    "input_schema": spec.input_schema,
                })
            })
            .collect()
    }

    fn build_request(&self, history: &[ConversationTurn], stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "system": self.system,
            "messages": history.iter().map(|t| self.encode_turn(t)).collect::<Vec<_>>(),
            "stream": stream,
        });
        if !self.catalog.is_empty() {
            body["tools"] = serde_json::Value::Array(self.tool_definitions());
        }
        body
    }

    fn encode_tool_result(&self, request_id: &str, outcome: &ToolOutcome) -> serde_json::Value {
        json!({
            "type": "tool_result",
            "tool_use_id": request_id,
            "content": tool_result_text(outcome, self.settings.max_tool_result_chars),
            "is_error": !outcome.success,
        })
    }

    fn parse_response(&self, body: &serde_json::Value) -> Result<ModelTurn, InferenceError> {
        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(InferenceError::parse(PROVIDER, format!("error response: {message}")));
        }

        let blocks = body
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| InferenceError::parse(PROVIDER, "missing 'content' array"))?;

        let mut text = String::new();
        let mut tool_requests = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => tool_requests.push(ToolRequest {
                    id: str_field(block, "id")?,
                    name: str_field(block, "name")?,
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                }),
                _ => {}
            }
        }

        Ok(ModelTurn {
            text,
            tool_requests,
            stop: stop_signal(body.get("stop_reason").and_then(|r| r.as_str())),
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicStreamDecoder::default())
    }
}

fn str_field(value: &serde_json::Value, field: &str) -> Result<String, InferenceError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| InferenceError::parse(PROVIDER, format!("tool_use block missing '{field}'")))
}

// ─── Streaming ───────────────────────────────────────────────────────────────

#[derive(Debug)]
enum PartialBlock {
    Text,
    ToolUse { id: String, name: String, json: String },
}

/// Accumulates `content_block_*` events keyed by block index.
#[derive(Debug, Default)]
struct AnthropicStreamDecoder {
    text: String,
    blocks: BTreeMap<u64, PartialBlock>,
    stop_reason: Option<String>,
    done: bool,
}

impl StreamDecoder for AnthropicStreamDecoder {
    fn feed(&mut self, event: &SseEvent) -> Result<Option<String>, InferenceError> {
        if event.data.trim().is_empty() {
            return Ok(None);
        }
        let data: serde_json::Value = serde_json::from_str(&event.data).map_err(|e| {
            InferenceError::StreamError {
                reason: format!("failed to parse SSE event: {e} (data: {})", event.data),
            }
        })?;

        let kind = data
            .get("type")
            .and_then(|t| t.as_str())
            .or(event.event.as_deref())
            .unwrap_or_default();
        let index = data.get("index").and_then(|i| i.as_u64()).unwrap_or(0);

        match kind {
            "content_block_start" => {
                let block = data.get("content_block").cloned().unwrap_or_default();
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("tool_use") => {
                        self.blocks.insert(
                            index,
                            PartialBlock::ToolUse {
                                id: str_field(&block, "id")?,
                                name: str_field(&block, "name")?,
                                json: String::new(),
                            },
                        );
                    }
                    _ => {
                        self.blocks.insert(index, PartialBlock::Text);
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            if !t.is_empty() {
                                self.text.push_str(t);
                                return Ok(Some(t.to_string()));
                            }
                        }
                    }
                }
            }
            "content_block_delta" => {
                let delta = data.get("delta").cloned().unwrap_or_default();
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        let t = delta.get("text").and_then(|t| t.as_str()).unwrap_or_default();
                        if !t.is_empty() {
                            self.text.push_str(t);
                            return Ok(Some(t.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(PartialBlock::ToolUse { json, .. }) =
                            self.blocks.get_mut(&index)
                        {
                            json.push_str(
                                delta
                                    .get("partial_json")
                                    .and_then(|p| p.as_str())
                                    .unwrap_or_default(),
                            );
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|r| r.as_str())
                {
                    self.stop_reason = Some(reason.to_string());
                }
            }
            "message_stop" => self.done = true,
            "error" => {
                let message = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown stream error");
                return Err(InferenceError::StreamError {
                    reason: message.to_string(),
                });
            }
            // message_start, content_block_stop, ping
            _ => {}
        }

        Ok(None)
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn finish(self: Box<Self>) -> Result<ModelTurn, InferenceError> {
        let mut tool_requests = Vec::new();
        for block in self.blocks.into_values() {
            if let PartialBlock::ToolUse { id, name, json } = block {
                let arguments = parse_arguments(PROVIDER, &name, &json)?;
                tool_requests.push(ToolRequest {
                    id,
                    name,
                    arguments,
                });
            }
        }

        Ok(ModelTurn {
            text: self.text,
            tool_requests,
            stop: stop_signal(self.stop_reason.as_deref()),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
