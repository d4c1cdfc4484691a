//! ConversationEngine: the provider-agnostic agent loop.
//!
//! Each query runs:
//!   user turn → model → (tool requests → router → results → model)* → answer
//!
//! The engine owns the session's history and router, so concurrent sessions
//! never share subprocesses or conversation state. The streaming variant runs
//! the same state machine and forwards text as it arrives.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::inference::{
    adapter_for, HttpModelBackend, InferenceError, ModelBackend, ModelTurn, ProviderAdapter,
    RequestSettings,
};
use crate::mcp_client::TransportClient;

use super::catalog::ToolCatalog;

use super::conversation::ConversationHistory;
use super::errors::AgentError;
use super::tool_router::ToolRouter;
use super::types::{EngineEvent, QueryResult, ToolInvocation};

// ─── Settings ───────────────────────────────────────────────────────────────

/// Loop behavior knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Maximum tool rounds per query before giving up.
    pub max_rounds: u32,
    /// Append `[Current time: …]` to each user turn.
    pub annotate_time: bool,
    /// Run the invocations of one round concurrently.
    pub parallel_tool_calls: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            annotate_time: true,
            parallel_tool_calls: false,
        }
    }
}

// ─── ConversationEngine ─────────────────────────────────────────────────────

pub struct ConversationEngine {
    backend: Arc<dyn ModelBackend>,
    adapter: Arc<dyn ProviderAdapter>,
    router: ToolRouter,
    history: ConversationHistory,
    settings: EngineSettings,
}

impl ConversationEngine {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        adapter: Arc<dyn ProviderAdapter>,
        router: ToolRouter,
        settings: EngineSettings,
    ) -> Self {
        Self {
            backend,
            adapter,
            router,
            history: ConversationHistory::new(),
            settings,
        }
    }

    /// Build a session from loaded configuration.
    ///
    /// Tool servers are not spawned here; each one starts on its first call.
    /// The audit server gets the long call timeout, the cluster server the
    /// short one, and both handshakes use the short one.
    pub fn from_config(config: &AppConfig) -> Result<Self, AgentError> {
        if config.engine.max_rounds == 0 {
            return Err(AgentError::ConfigError {
                reason: "max_rounds must be at least 1".to_string(),
            });
        }

        let provider = &config.provider;
        let backend = HttpModelBackend::new(
            provider.kind,
            provider.base_url(),
            &provider.api_key,
            provider.request_timeout(),
        )?;

        let adapter = adapter_for(
            provider.kind,
            RequestSettings {
                model: provider.model.clone(),
                max_tokens: provider.max_tokens,
                temperature: provider.temperature,
                max_tool_result_chars: config.engine.max_tool_result_chars,
            },
            ToolCatalog::standard(),
        );

        let short = config.timeouts.short();
        let audit = TransportClient::new(
            "audit",
            config.servers.audit.clone(),
            config.timeouts.long(),
        )
        .with_init_timeout(short);
        let cluster = TransportClient::new("cluster", config.servers.cluster.clone(), short)
            .with_init_timeout(short);

        let settings = EngineSettings {
            max_rounds: config.engine.max_rounds,
            annotate_time: config.engine.annotate_time,
            parallel_tool_calls: config.engine.parallel_tool_calls,
        };

        tracing::info!(
            provider = %provider.kind,
            model = %provider.model,
            max_rounds = settings.max_rounds,
            "conversation engine ready"
        );

        Ok(Self::new(
            Arc::new(backend),
            adapter,
            ToolRouter::new(audit, cluster),
            settings,
        ))
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    /// Answer one question, running as many tool rounds as the model asks for.
    ///
    /// Model failures abort the query; the history up to that point is kept.
    pub async fn execute_query(
        &mut self,
        text: &str,
        context: Option<&str>,
    ) -> Result<QueryResult, AgentError> {
        self.run(text, context, None).await
    }

    /// Streaming counterpart of `execute_query`.
    ///
    /// Emits `Text` fragments as they arrive, `ToolCall`/`ToolResult` around
    /// each round, and a final `Done` carrying the same result that is
    /// returned.
    pub async fn execute_query_stream(
        &mut self,
        text: &str,
        context: Option<&str>,
        tx: mpsc::Sender<EngineEvent>,
    ) -> Result<QueryResult, AgentError> {
        self.run(text, context, Some(&tx)).await
    }

    /// Tear down the session's tool server processes.
    pub async fn close(&self) {
        self.router.reset().await;
    }

    // ─── Loop ───────────────────────────────────────────────────────────

    async fn run(
        &mut self,
        text: &str,
        context: Option<&str>,
        events: Option<&mpsc::Sender<EngineEvent>>,
    ) -> Result<QueryResult, AgentError> {
        let user_turn = self.compose_user_turn(text, context);
        self.history.push_user(user_turn);

        let mut tool_calls: Vec<ToolInvocation> = Vec::new();
        let mut tool_results = Vec::new();
        let mut rounds = 0u32;

        loop {
            let turn = match events {
                Some(tx) => self.stream_turn(tx).await?,
                None => self.complete_turn().await?,
            };

            if !turn.wants_tools() {
                self.history.push_assistant(turn.text.clone());
                tracing::info!(
                    rounds,
                    tool_calls = tool_calls.len(),
                    response_len = turn.text.len(),
                    "query complete"
                );

                let result = QueryResult {
                    query: text.to_string(),
                    response: turn.text,
                    tool_calls,
                    tool_results,
                    timestamp: Utc::now(),
                };
                if let Some(tx) = events {
                    emit(tx, EngineEvent::Done {
                        result: result.clone(),
                    })
                    .await?;
                }
                return Ok(result);
            }

            if rounds >= self.settings.max_rounds {
                tracing::warn!(rounds, "model still requesting tools at round limit");
                return Err(AgentError::RoundLimitExceeded { rounds });
            }
            rounds += 1;

            let invocations: Vec<ToolInvocation> = turn
                .tool_requests
                .iter()
                .map(|r| self.adapter.to_invocation(r))
                .collect();

            tracing::info!(
                round = rounds,
                tools = ?invocations.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
                "executing tool round"
            );

            if let Some(tx) = events {
                for invocation in &invocations {
                    emit(tx, EngineEvent::ToolCall {
                        invocation: invocation.clone(),
                    })
                    .await?;
                }
            }

            let outcomes = self
                .router
                .execute_all(&invocations, self.settings.parallel_tool_calls)
                .await;
            self.history
                .push_tool_round(&turn.text, &turn.tool_requests, &outcomes);

            if let Some(tx) = events {
                for outcome in &outcomes {
                    emit(tx, EngineEvent::ToolResult {
                        outcome: outcome.clone(),
                    })
                    .await?;
                }
            }

            tool_calls.extend(invocations);
            tool_results.extend(outcomes);
        }
    }

    async fn complete_turn(&self) -> Result<ModelTurn, AgentError> {
        let request = self.adapter.build_request(self.history.turns(), false);
        let body = self.backend.complete(request).await?;
        Ok(self.adapter.parse_response(&body)?)
    }

    async fn stream_turn(&self, tx: &mpsc::Sender<EngineEvent>) -> Result<ModelTurn, AgentError> {
        let request = self.adapter.build_request(self.history.turns(), true);
        let mut stream = self.backend.stream(request).await?;
        let mut decoder = self.adapter.stream_decoder();

        while let Some(event) = stream.next().await {
            if let Some(content) = decoder.feed(&event?)? {
                emit(tx, EngineEvent::Text { content }).await?;
            }
            if decoder.is_done() {
                break;
            }
        }

        // A stream cut off mid-message is a failed call, not a short answer.
        if !decoder.is_done() {
            tracing::warn!("model stream ended before end-of-message marker");
            return Err(InferenceError::StreamError {
                reason: "stream ended before end-of-message marker".to_string(),
            }
            .into());
        }

        Ok(decoder.finish()?)
    }

    fn compose_user_turn(&self, text: &str, context: Option<&str>) -> String {
        let mut turn = text.to_string();
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            turn.push_str("\n\nContext:\n");
            turn.push_str(context);
        }
        if self.settings.annotate_time {
            turn.push_str(&format!(
                "\n\n[Current time: {}]",
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
        }
        turn
    }
}

async fn emit(tx: &mpsc::Sender<EngineEvent>, event: EngineEvent) -> Result<(), AgentError> {
    tx.send(event)
        .await
        .map_err(|_| AgentError::EventChannelClosed)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use serde_json::json;

    use super::*;
    use crate::agent_core::catalog::{ToolCatalog, RECORD_SUGGESTION};
    use crate::agent_core::tool_router::tests::offline_router;
    use crate::agent_core::types::{Backend, ContentBlock, Role, TurnContent};
    use crate::inference::providers::{AnthropicAdapter, OpenAiAdapter, RequestSettings};
    use crate::inference::SseEvent;

    // ─── Scripted backend ───────────────────────────────────────────────

    /// Replays canned responses and records every request body.
    #[derive(Default)]
    struct ScriptedBackend {
        responses: Mutex<VecDeque<serde_json::Value>>,
        streams: Mutex<VecDeque<Vec<SseEvent>>>,
        requests: Mutex<Vec<serde_json::Value>>,
    }

    impl ScriptedBackend {
        fn with_responses(responses: Vec<serde_json::Value>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            })
        }

        fn with_streams(streams: Vec<Vec<SseEvent>>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams.into()),
                ..Default::default()
            })
        }

        fn requests(&self) -> Vec<serde_json::Value> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn complete(
            &self,
            request: serde_json::Value,
        ) -> Result<serde_json::Value, InferenceError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(InferenceError::HttpError {
                    status: 503,
                    body: "script exhausted".into(),
                })
        }

        async fn stream(
            &self,
            request: serde_json::Value,
        ) -> Result<BoxStream<'static, Result<SseEvent, InferenceError>>, InferenceError> {
            self.requests.lock().unwrap().push(request);
            let events = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(InferenceError::HttpError {
                    status: 503,
                    body: "script exhausted".into(),
                })?;
            Ok(stream::iter(events.into_iter().map(Ok)).boxed())
        }
    }

    // ─── Anthropic fixtures ─────────────────────────────────────────────

    fn anthropic() -> Arc<dyn ProviderAdapter> {
        Arc::new(AnthropicAdapter::new(
            RequestSettings {
                model: "claude-test".into(),
                ..Default::default()
            },
            ToolCatalog::standard(),
        ))
    }

    fn openai() -> Arc<dyn ProviderAdapter> {
        Arc::new(OpenAiAdapter::new(
            RequestSettings {
                model: "gpt-test".into(),
                ..Default::default()
            },
            ToolCatalog::standard(),
        ))
    }

    fn tool_use(id: &str, name: &str, input: serde_json::Value) -> serde_json::Value {
        json!({
            "content": [{"type": "tool_use", "id": id, "name": name, "input": input}],
            "stop_reason": "tool_use"
        })
    }

    fn tool_uses(calls: &[(&str, &str, serde_json::Value)]) -> serde_json::Value {
        let content: Vec<_> = calls
            .iter()
            .map(|(id, name, input)| {
                json!({"type": "tool_use", "id": id, "name": name, "input": input})
            })
            .collect();
        json!({"content": content, "stop_reason": "tool_use"})
    }

    fn final_text(text: &str) -> serde_json::Value {
        json!({"content": [{"type": "text", "text": text}], "stop_reason": "end_turn"})
    }

    fn suggestion_args() -> serde_json::Value {
        json!({"title": "Review", "description": "Check failed logins"})
    }

    fn quiet() -> EngineSettings {
        EngineSettings {
            annotate_time: false,
            ..Default::default()
        }
    }

    fn engine(
        backend: Arc<ScriptedBackend>,
        adapter: Arc<dyn ProviderAdapter>,
        settings: EngineSettings,
    ) -> ConversationEngine {
        ConversationEngine::new(backend, adapter, offline_router(), settings)
    }

    // ─── Non-streaming ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_search_audit_events_scenario() {
        let backend = ScriptedBackend::with_responses(vec![
            tool_use("toolu_01", "search_audit_events", json!({"limit": 5})),
            final_text("Found 5 events."),
        ]);
        let mut engine = engine(backend.clone(), anthropic(), quiet());

        let result = engine.execute_query("Show recent audit events", None).await.unwrap();

        assert_eq!(result.response, "Found 5 events.");
        assert_eq!(
            serde_json::to_value(&result.tool_calls).unwrap(),
            json!([{"backend": "audit", "name": "audit.search_events", "arguments": {"limit": 5}}])
        );
        assert_eq!(result.tool_results.len(), 1);
        assert_eq!(result.tool_results[0].backend, Backend::Audit);
        assert_eq!(result.query, "Show recent audit events");

        // The second request carries the result addressed to the provider id.
        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        let messages = requests[1]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_01");

        assert_eq!(engine.history().len(), 4);
        assert!(engine.history().is_well_formed());
    }

    #[tokio::test]
    async fn test_n_rounds_execute_in_order() {
        let backend = ScriptedBackend::with_responses(vec![
            tool_uses(&[
                ("t1", "record_suggestion", suggestion_args()),
                ("t2", "list_nodes", json!({})),
            ]),
            tool_use("t3", "drop_tables", json!({})),
            tool_use("t4", "record_suggestion", suggestion_args()),
            final_text("done"),
        ]);
        let mut engine = engine(backend.clone(), anthropic(), quiet());

        let result = engine.execute_query("audit everything", None).await.unwrap();

        assert_eq!(backend.requests().len(), 4);
        let names: Vec<_> = result.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![RECORD_SUGGESTION, "cluster.list_nodes", "drop_tables", RECORD_SUGGESTION]
        );
        assert_eq!(result.tool_results.len(), result.tool_calls.len());
        for (call, outcome) in result.tool_calls.iter().zip(&result.tool_results) {
            assert_eq!(call.name, outcome.name);
        }
        assert_eq!(
            result.tool_results.iter().map(|o| o.success).collect::<Vec<_>>(),
            vec![true, false, false, true]
        );

        // user + 3 × (assistant, results) + final
        assert_eq!(engine.history().len(), 8);
        assert!(engine.history().is_well_formed());
    }

    #[tokio::test]
    async fn test_round_limit_exceeded() {
        let responses = (0..5)
            .map(|i| tool_use(&format!("t{i}"), "list_roles", json!({})))
            .collect();
        let backend = ScriptedBackend::with_responses(responses);
        let settings = EngineSettings {
            max_rounds: 2,
            ..quiet()
        };
        let mut engine = engine(backend.clone(), anthropic(), settings);

        let err = engine.execute_query("loop forever", None).await.unwrap_err();
        assert!(matches!(err, AgentError::RoundLimitExceeded { rounds: 2 }));
        assert_eq!(backend.requests().len(), 3);
        assert!(engine.history().is_well_formed());
    }

    #[tokio::test]
    async fn test_model_failure_propagates_and_keeps_history() {
        let backend = ScriptedBackend::with_responses(vec![tool_use(
            "t1",
            "get_cluster_status",
            json!({}),
        )]);
        let mut engine = engine(backend, anthropic(), quiet());

        let err = engine.execute_query("status?", None).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Inference {
                source: InferenceError::HttpError { status: 503, .. }
            }
        ));
        // user turn + the completed tool round survive
        assert_eq!(engine.history().len(), 3);
        assert!(engine.history().is_well_formed());
    }

    #[tokio::test]
    async fn test_user_turn_annotation_and_context() {
        let backend = ScriptedBackend::with_responses(vec![final_text("ok"), final_text("ok")]);
        let mut engine = engine(backend.clone(), anthropic(), EngineSettings::default());

        engine
            .execute_query("who logged in?", Some("cluster: prod-east"))
            .await
            .unwrap();

        let requests = backend.requests();
        let content = requests[0]["messages"][0]["content"].as_str().unwrap().to_string();
        assert!(content.starts_with("who logged in?\n\nContext:\ncluster: prod-east"));
        assert!(content.contains("[Current time: "));
        assert!(content.ends_with("Z]"));

        let mut plain =
            ConversationEngine::new(backend.clone(), anthropic(), offline_router(), quiet());
        plain.execute_query("who logged in?", None).await.unwrap();
        let requests = backend.requests();
        assert_eq!(requests[1]["messages"][0]["content"], "who logged in?");
    }

    #[tokio::test]
    async fn test_history_spans_queries() {
        let backend = ScriptedBackend::with_responses(vec![
            final_text("Three nodes."),
            final_text("All healthy."),
        ]);
        let mut engine = engine(backend.clone(), anthropic(), quiet());

        engine.execute_query("how many nodes?", None).await.unwrap();
        engine.execute_query("are they healthy?", None).await.unwrap();

        let requests = backend.requests();
        let messages = requests[1]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1], json!({"role": "assistant", "content": "Three nodes."}));
        assert_eq!(engine.history().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_answer_keeps_session_usable() {
        let backend = ScriptedBackend::with_responses(vec![
            json!({"content": [], "stop_reason": "end_turn"}),
            final_text("Two roles."),
        ]);
        let mut engine = engine(backend.clone(), anthropic(), quiet());

        let first = engine.execute_query("first", None).await.unwrap();
        assert_eq!(first.response, "");
        engine.execute_query("second", None).await.unwrap();

        assert_eq!(engine.history().len(), 4);
        assert!(engine.history().is_well_formed());

        let requests = backend.requests();
        let messages = requests[1]["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert!(!messages[1]["content"].as_str().unwrap().trim().is_empty());
        assert_eq!(messages[2]["content"], "second");
    }

    #[tokio::test]
    async fn test_parallel_round_keeps_request_order() {
        let backend = ScriptedBackend::with_responses(vec![
            tool_uses(&[
                ("a", "list_users", json!({})),
                ("b", "record_suggestion", suggestion_args()),
                ("c", "nope", json!({})),
            ]),
            final_text("done"),
        ]);
        let settings = EngineSettings {
            parallel_tool_calls: true,
            ..quiet()
        };
        let mut engine = engine(backend, anthropic(), settings);

        let result = engine.execute_query("q", None).await.unwrap();
        let names: Vec<_> = result.tool_results.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["cluster.list_users", RECORD_SUGGESTION, "nope"]);

        match &engine.history().turns()[2].content {
            TurnContent::Blocks(blocks) => {
                let ids: Vec<_> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolResult { request_id, .. } => Some(request_id.as_str()),
                        _ => None,
                    })
                    .collect();
                assert_eq!(ids, vec!["a", "b", "c"]);
            }
            TurnContent::Text(_) => panic!("expected tool results"),
        }
    }

    #[tokio::test]
    async fn test_openai_scenario() {
        let backend = ScriptedBackend::with_responses(vec![
            json!({"choices": [{"message": {"content": null, "tool_calls": [{
                "id": "call_1", "type": "function",
                "function": {"name": "search_audit_events", "arguments": "{\"limit\":5}"}
            }]}, "finish_reason": "tool_calls"}]}),
            json!({"choices": [{"message": {"content": "Found 5 events."}, "finish_reason": "stop"}]}),
        ]);
        let mut engine = engine(backend.clone(), openai(), quiet());

        let result = engine.execute_query("Show recent audit events", None).await.unwrap();
        assert_eq!(result.response, "Found 5 events.");
        assert_eq!(
            result.tool_calls,
            vec![ToolInvocation::new(Backend::Audit, "audit.search_events", json!({"limit": 5}))]
        );

        let requests = backend.requests();
        let messages = requests[1]["messages"].as_array().unwrap();
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
    }

    // ─── Streaming ──────────────────────────────────────────────────────

    fn anthropic_tool_stream() -> Vec<SseEvent> {
        vec![
            SseEvent::named("message_start", json!({"type": "message_start"}).to_string()),
            SseEvent::named("content_block_start", json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_01", "name": "search_audit_events", "input": {}}}).to_string()),
            SseEvent::named("content_block_delta", json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"limit\": 5}"}}).to_string()),
            SseEvent::named("message_delta", json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}).to_string()),
            SseEvent::named("message_stop", json!({"type": "message_stop"}).to_string()),
        ]
    }

    fn anthropic_text_stream(parts: &[&str]) -> Vec<SseEvent> {
        let mut events = vec![SseEvent::named(
            "content_block_start",
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}).to_string(),
        )];
        for part in parts {
            events.push(SseEvent::named(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": part}}).to_string(),
            ));
        }
        events.push(SseEvent::named(
            "message_delta",
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}}).to_string(),
        ));
        events.push(SseEvent::named("message_stop", json!({"type": "message_stop"}).to_string()));
        events
    }

    async fn drain(mut rx: mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_streaming_matches_non_streaming() {
        let streaming_backend = ScriptedBackend::with_streams(vec![
            anthropic_tool_stream(),
            anthropic_text_stream(&["Found 5 ", "events."]),
        ]);
        let mut streaming = engine(streaming_backend, anthropic(), quiet());

        let (tx, rx) = mpsc::channel(64);
        let streamed = streaming
            .execute_query_stream("Show recent audit events", None, tx)
            .await
            .unwrap();
        let events = drain(rx).await;

        let plain_backend = ScriptedBackend::with_responses(vec![
            tool_use("toolu_01", "search_audit_events", json!({"limit": 5})),
            final_text("Found 5 events."),
        ]);
        let mut plain = engine(plain_backend, anthropic(), quiet());
        let expected = plain.execute_query("Show recent audit events", None).await.unwrap();

        assert_eq!(streamed.response, expected.response);
        assert_eq!(streamed.tool_calls, expected.tool_calls);
        assert_eq!(streamed.tool_results.len(), expected.tool_results.len());
        assert_eq!(streamed.tool_results[0].success, expected.tool_results[0].success);
        assert_eq!(streaming.history().len(), plain.history().len());

        let tags: Vec<_> = events
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(tags, vec!["tool_call", "tool_result", "text", "text", "done"]);

        match events.last() {
            Some(EngineEvent::Done { result }) => assert_eq!(result, &streamed),
            other => panic!("expected done, got {other:?}"),
        }
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Found 5 events.");
    }

    #[tokio::test]
    async fn test_openai_streaming() {
        let backend = ScriptedBackend::with_streams(vec![
            vec![
                SseEvent::data(json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "record_suggestion", "arguments": ""}}]}, "finish_reason": null}]}).to_string()),
                SseEvent::data(json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"title\":\"Rotate\",\"description\":\"Certs expire\"}"}}]}, "finish_reason": null}]}).to_string()),
                SseEvent::data(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}).to_string()),
                SseEvent::data("[DONE]"),
            ],
            vec![
                SseEvent::data(json!({"choices": [{"delta": {"content": "Recorded."}, "finish_reason": null}]}).to_string()),
                SseEvent::data(json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}).to_string()),
                SseEvent::data("[DONE]"),
            ],
        ]);
        let mut engine = engine(backend, openai(), quiet());

        let (tx, rx) = mpsc::channel(64);
        let result = engine.execute_query_stream("suggest", None, tx).await.unwrap();
        let events = drain(rx).await;

        assert_eq!(result.response, "Recorded.");
        assert_eq!(result.tool_calls[0].backend, Backend::Local);
        assert!(result.tool_results[0].success);
        assert!(matches!(events.last(), Some(EngineEvent::Done { .. })));
        assert_eq!(engine.history().last().map(|t| t.role), Some(Role::Assistant));
    }

    #[tokio::test]
    async fn test_dropped_receiver_aborts_stream() {
        let backend = ScriptedBackend::with_streams(vec![anthropic_text_stream(&["hello"])]);
        let mut engine = engine(backend, anthropic(), quiet());

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = engine.execute_query_stream("hi", None, tx).await.unwrap_err();
        assert!(matches!(err, AgentError::EventChannelClosed));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let mut cut = anthropic_text_stream(&["There were 3 fail"]);
        cut.truncate(2);
        let backend = ScriptedBackend::with_streams(vec![cut]);
        let mut engine = engine(backend, anthropic(), quiet());

        let (tx, rx) = mpsc::channel(64);
        let err = engine.execute_query_stream("failed logins?", None, tx).await.unwrap_err();
        let events = drain(rx).await;

        assert!(matches!(
            err,
            AgentError::Inference {
                source: InferenceError::StreamError { .. }
            }
        ));
        assert!(!events.iter().any(|e| matches!(e, EngineEvent::Done { .. })));
        assert_eq!(engine.history().len(), 1);
    }

    #[tokio::test]
    async fn test_openai_stream_without_done_marker_finishes_on_finish_reason() {
        let backend = ScriptedBackend::with_streams(vec![vec![
            SseEvent::data(
                json!({"choices": [{"delta": {"content": "All healthy."}, "finish_reason": null}]})
                    .to_string(),
            ),
            SseEvent::data(
                json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}).to_string(),
            ),
        ]]);
        let mut engine = engine(backend, openai(), quiet());

        let (tx, rx) = mpsc::channel(64);
        let result = engine.execute_query_stream("status?", None, tx).await.unwrap();
        drain(rx).await;
        assert_eq!(result.response, "All healthy.");
    }

    #[tokio::test]
    async fn test_openai_stream_cut_before_finish_reason_is_an_error() {
        let backend = ScriptedBackend::with_streams(vec![vec![SseEvent::data(
            json!({"choices": [{"delta": {"content": "All heal"}, "finish_reason": null}]})
                .to_string(),
        )]]);
        let mut engine = engine(backend, openai(), quiet());

        let (tx, _rx) = mpsc::channel(64);
        let err = engine.execute_query_stream("status?", None, tx).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Inference {
                source: InferenceError::StreamError { .. }
            }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_end_to_end_with_stub_server() {
        use crate::mcp_client::client::tests::stub_server;
        use crate::mcp_client::{TransportClient, SHORT_CALL_TIMEOUT};

        let on_call = r#"printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"5 events"}]}}\n' "$id""#;
        let router = ToolRouter::new(
            TransportClient::new("audit", stub_server(on_call), SHORT_CALL_TIMEOUT),
            TransportClient::new("cluster", stub_server(on_call), SHORT_CALL_TIMEOUT),
        );
        let backend = ScriptedBackend::with_responses(vec![
            tool_use("toolu_01", "search_audit_events", json!({"limit": 5})),
            final_text("Found 5 events."),
        ]);
        let mut engine = ConversationEngine::new(backend.clone(), anthropic(), router, quiet());

        let result = engine.execute_query("Show recent audit events", None).await.unwrap();
        assert!(result.tool_results[0].success);
        assert_eq!(result.tool_results[0].payload, Some(json!("5 events")));

        let requests = backend.requests();
        assert_eq!(requests[1]["messages"][2]["content"][0]["content"], "5 events");
        engine.close().await;
    }

    #[test]
    fn test_from_config_builds_idle_session() {
        let config = crate::config::parse_config(
            r#"
provider:
  kind: openai
  api_key: test-key
  model: gpt-test
servers:
  audit:
    command: audit-mcp
  cluster:
    command: cluster-mcp
timeouts:
  short_ms: 1000
  long_ms: 9000
engine:
  max_rounds: 3
"#,
        )
        .unwrap();

        let engine = ConversationEngine::from_config(&config).unwrap();
        assert!(engine.history().is_empty());
        assert_eq!(engine.settings.max_rounds, 3);
        assert_eq!(engine.adapter.kind(), crate::inference::ProviderKind::OpenAi);
    }
}
