//! OpenAI Chat Completions adapter.
//!
//! Tool requests arrive as `message.tool_calls` with stringified arguments and
//! `finish_reason: "tool_calls"`; results go back as one `role: "tool"`
//! message per call, addressed by `tool_call_id`.

use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::agent_core::catalog::ToolCatalog;
use crate::agent_core::types::{ContentBlock, ConversationTurn, Role, ToolOutcome, TurnContent};
use crate::inference::errors::InferenceError;
use crate::inference::types::{ModelTurn, SseEvent, StopSignal, ToolRequest};

use super::{
    parse_arguments, system_prompt, tool_result_text, ProviderAdapter, ProviderKind,
    RequestSettings, StreamDecoder,
};

const PROVIDER: &str = "openai";

const PROVIDER_NOTE: &str =
    "Call tools only through the function-calling interface; never write tool calls as text.";

/// Normalize `finish_reason`. Some compatible servers report `stop` even when
/// tool calls are present, so calls win.
fn stop_signal(reason: Option<&str>, has_tool_calls: bool) -> StopSignal {
    if has_tool_calls {
        return StopSignal::ToolUse;
    }
    match reason {
        None | Some("stop") => StopSignal::EndTurn,
        Some("tool_calls") | Some("function_call") => StopSignal::ToolUse,
        Some("length") => StopSignal::MaxTokens,
        Some(other) => StopSignal::Other(other.to_string()),
    }
}

fn generated_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

// ─── OpenAiAdapter ───────────────────────────────────────────────────────────

pub struct OpenAiAdapter {
    settings: RequestSettings,
    catalog: ToolCatalog,
    system: String,
}

impl OpenAiAdapter {
    pub fn new(settings: RequestSettings, catalog: ToolCatalog) -> Self {
        Self {
            settings,
            catalog,
            system: system_prompt(PROVIDER_NOTE),
        }
    }

    /// One history turn becomes one or more chat messages: tool results are
    /// flattened into separate `tool` messages.
    fn encode_turn(&self, turn: &ConversationTurn, out: &mut Vec<serde_json::Value>) {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        let blocks = match &turn.content {
            TurnContent::Text(text) => {
                out.push(json!({"role": role, "content": text}));
                return;
            }
            TurnContent::Blocks(blocks) => blocks,
        };

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut results = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text: t } => text.push_str(t),
                ContentBlock::ToolRequest {
                    id,
                    name,
                    arguments,
                } => tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": arguments.to_string()},
                })),
                ContentBlock::ToolResult {
                    request_id,
                    outcome,
                } => results.push(self.encode_tool_result(request_id, outcome)),
            }
        }

        if !tool_calls.is_empty() {
            // Empty string rather than null: several compatible runtimes
            // mishandle null content on tool-call turns.
            out.push(json!({"role": role, "content": text, "tool_calls": tool_calls}));
        } else if !text.is_empty() {
            out.push(json!({"role": role, "content": text}));
        }
        out.extend(results);
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
                    "type": "function",
                    "function": {
                        "name": spec.name,
                        "description": spec.description,
                        "parameters": spec.input_schema,
                    }
                })
            })
            .collect()
    }

    fn build_request(&self, history: &[ConversationTurn], stream: bool) -> serde_json::Value {
        let mut messages = vec![json!({"role": "system", "content": self.system})];
        for turn in history {
            self.encode_turn(turn, &mut messages);
        }

        let mut body = json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "messages": messages,
            "stream": stream,
        });
        if !self.catalog.is_empty() {
            body["tools"] = serde_json::Value::Array(self.tool_definitions());
            body["tool_choice"] = json!("auto");
        }
        body
    }

    fn encode_tool_result(&self, request_id: &str, outcome: &ToolOutcome) -> serde_json::Value {
        json!({
            "role": "tool",
            "tool_call_id": request_id,
            "content": tool_result_text(outcome, self.settings.max_tool_result_chars),
        })
    }

    fn parse_response(&self, body: &serde_json::Value) -> Result<ModelTurn, InferenceError> {
        let resp: CompletionResponse = serde_json::from_value(body.clone())
            .map_err(|e| InferenceError::parse(PROVIDER, e.to_string()))?;

        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::parse(PROVIDER, "empty choices array"))?;

        let mut tool_requests = Vec::new();
        for tc in choice.message.tool_calls.unwrap_or_default() {
            let arguments = parse_arguments(PROVIDER, &tc.function.name, &tc.function.arguments)?;
            tool_requests.push(ToolRequest {
                id: tc.id.unwrap_or_else(generated_call_id),
                name: tc.function.name,
                arguments,
            });
        }

        let stop = stop_signal(choice.finish_reason.as_deref(), !tool_requests.is_empty());
        Ok(ModelTurn {
            text: choice.message.content.unwrap_or_default(),
            tool_requests,
            stop,
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder::default())
    }
}

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    tool_calls: Option<Vec<CompletionToolCall>>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: Option<String>,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Raw SSE chunk.
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    index: Option<u32>,
    id: Option<String>,
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

// ─── Streaming ───────────────────────────────────────────────────────────────

/// A tool call being assembled from deltas.
#[derive(Debug)]
struct PendingCall {
    index: u32,
    id: Option<String>,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
struct OpenAiStreamDecoder {
    text: String,
    pending: Vec<PendingCall>,
    finish_reason: Option<String>,
    done: bool,
}

impl OpenAiStreamDecoder {
    fn accumulate(&mut self, tc: ChunkToolCall) {
        let index = tc.index.unwrap_or(0);
        let (name, arguments) = match tc.function {
            Some(f) => (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()),
            None => (String::new(), String::new()),
        };

        match self.pending.iter_mut().find(|p| p.index == index) {
            Some(call) => {
                call.name.push_str(&name);
                call.arguments.push_str(&arguments);
                if tc.id.is_some() {
                    call.id = tc.id;
                }
            }
            None => self.pending.push(PendingCall {
                index,
                id: tc.id,
                name,
                arguments,
            }),
        }
    }
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn feed(&mut self, event: &SseEvent) -> Result<Option<String>, InferenceError> {
        let data = event.data.trim();
        if data.is_empty() {
            return Ok(None);
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(data).map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse SSE chunk: {e} (data: {data})"),
            })?;

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };

        if choice.finish_reason.is_some() {
            self.finish_reason = choice.finish_reason;
        }
        for tc in choice.delta.tool_calls.unwrap_or_default() {
            self.accumulate(tc);
        }

        match choice.delta.content {
            Some(content) if !content.is_empty() => {
                self.text.push_str(&content);
                Ok(Some(content))
            }
            _ => Ok(None),
        }
    }

    /// `[DONE]` ends the stream, but some compatible servers omit it; a
    /// `finish_reason` marks the message complete as well.
    fn is_done(&self) -> bool {
        self.done || self.finish_reason.is_some()
    }

    fn finish(self: Box<Self>) -> Result<ModelTurn, InferenceError> {
        let mut pending = self.pending;
        pending.sort_by_key(|p| p.index);

        let mut tool_requests = Vec::with_capacity(pending.len());
        for call in pending {
            let arguments = parse_arguments(PROVIDER, &call.name, &call.arguments)?;
            tool_requests.push(ToolRequest {
                id: call.id.unwrap_or_else(generated_call_id),
                name: call.name,
                arguments,
            });
        }

        let stop = stop_signal(self.finish_reason.as_deref(), !tool_requests.is_empty());
        Ok(ModelTurn {
            text: self.text,
            tool_requests,
            stop,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::conversation::ConversationHistory;
    use crate::agent_core::types::{Backend, ToolInvocation};

    fn adapter() -> OpenAiAdapter {
        OpenAiAdapter::new(
            RequestSettings {
                model: "gpt-test".into(),
                max_tool_result_chars: 20,
                ..Default::default()
            },
            ToolCatalog::standard(),
        )
    }

    #[test]
    fn test_tool_definitions_native_shape() {
        let defs = adapter().tool_definitions();
        assert_eq!(defs[0]["type"], "function");
        assert_eq!(defs[0]["function"]["name"], "search_audit_events");
        assert!(defs[0]["function"].get("parameters").is_some());
    }

    #[test]
    fn test_build_request_flattens_tool_results() {
        let inv = ToolInvocation::new(Backend::Cluster, "cluster.list_nodes", json!({}));
        let mut history = ConversationHistory::new();
        history.push_user("nodes?");
        history.push_tool_round(
            "",
            &[
                ToolRequest {
                    id: "call_a".into(),
                    name: "list_nodes".into(),
                    arguments: json!({}),
                },
                ToolRequest {
                    id: "call_b".into(),
                    name: "get_cluster_status".into(),
                    arguments: json!({}),
                },
            ],
            &[
                ToolOutcome::success(&inv, json!({"nodes": ["n1"]}), 1),
                ToolOutcome::failure(&inv, "timed out", 1),
            ],
        );
        history.push_assistant("One node.");

        let body = adapter().build_request(history.turns(), true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["tool_choice"], "auto");

        let messages = body["messages"].as_array().unwrap();
        let roles: Vec<_> = messages.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "tool", "assistant"]);

        assert_eq!(messages[2]["content"], "");
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_a");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(messages[3]["tool_call_id"], "call_a");
        assert_eq!(messages[3]["content"], r#"{"nodes":["n1"]}"#);
        assert_eq!(messages[4]["tool_call_id"], "call_b");
        assert_eq!(messages[4]["content"], "timed out");
    }

    #[test]
    fn test_tool_result_truncated_for_model() {
        let inv = ToolInvocation::new(Backend::Audit, "audit.search_events", json!({}));
        let outcome = ToolOutcome::success(&inv, json!("e".repeat(100)), 1);
        let msg = adapter().encode_tool_result("call_x", &outcome);
        assert!(msg["content"].as_str().unwrap().contains("truncated"));
    }

    #[test]
    fn test_parse_tool_calls_response() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "search_audit_events", "arguments": "{\"limit\": 5}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let turn = adapter().parse_response(&body).unwrap();
        assert!(turn.wants_tools());
        assert_eq!(turn.text, "");
        assert_eq!(turn.tool_requests[0].id, "call_abc");
        assert_eq!(turn.tool_requests[0].arguments, json!({"limit": 5}));
    }

    #[test]
    fn test_parse_tool_calls_with_stop_reason() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"name": "list_users", "arguments": ""}}]
                },
                "finish_reason": "stop"
            }]
        });
        let turn = adapter().parse_response(&body).unwrap();
        assert!(turn.wants_tools());
        assert!(turn.tool_requests[0].id.starts_with("call_"));
        assert_eq!(turn.tool_requests[0].arguments, json!({}));
    }

    #[test]
    fn test_parse_final_and_length() {
        let body = json!({"choices": [{"message": {"content": "Found 5 events."}, "finish_reason": "stop"}]});
        let turn = adapter().parse_response(&body).unwrap();
        assert_eq!(turn.stop, StopSignal::EndTurn);
        assert_eq!(turn.text, "Found 5 events.");

        let body = json!({"choices": [{"message": {"content": "Found"}, "finish_reason": "length"}]});
        assert_eq!(adapter().parse_response(&body).unwrap().stop, StopSignal::MaxTokens);
    }

    #[test]
    fn test_parse_empty_choices_fails() {
        assert!(adapter().parse_response(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_parse_bad_arguments_fails() {
        let body = json!({
            "choices": [{
                "message": {"tool_calls": [{"id": "c", "function": {"name": "list_nodes", "arguments": "{oops"}}]},
                "finish_reason": "tool_calls"
            }]
        });
        let err = adapter().parse_response(&body).unwrap_err();
        assert!(err.to_string().contains("list_nodes"));
    }

    #[test]
    fn test_stream_decoder_accumulates_fragments() {
        let mut decoder = adapter().stream_decoder();
        let chunks = [
            json!({"choices": [{"delta": {"role": "assistant", "content": "Look"}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {"content": "ing"}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "search_", "arguments": ""}}]}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"name": "audit_events", "arguments": "{\"limit\""}}]}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 1, "id": "call_2", "function": {"name": "list_nodes", "arguments": "{}"}}]}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": ":5}"}}]}, "finish_reason": null}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ];

        let mut texts = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(!decoder.is_done(), "done before chunk {i}");
            if let Some(t) = decoder.feed(&SseEvent::data(chunk.to_string())).unwrap() {
                texts.push(t);
            }
        }
        assert!(decoder.is_done());
        decoder.feed(&SseEvent::data("[DONE]")).unwrap();
        assert!(decoder.is_done());

        assert_eq!(texts, vec!["Look", "ing"]);
        let turn = decoder.finish().unwrap();
        assert!(turn.wants_tools());
        assert_eq!(turn.text, "Looking");
        assert_eq!(turn.tool_requests.len(), 2);
        assert_eq!(turn.tool_requests[0].name, "search_audit_events");
        assert_eq!(turn.tool_requests[0].arguments, json!({"limit": 5}));
        assert_eq!(turn.tool_requests[1].id, "call_2");
    }

    #[test]
    fn test_stream_decoder_bad_chunk() {
        let mut decoder = adapter().stream_decoder();
        let err = decoder.feed(&SseEvent::data("{not json")).unwrap_err();
        assert!(matches!(err, InferenceError::StreamError { .. }));
    }
}
