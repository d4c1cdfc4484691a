//! ToolRouter: dispatches tool invocations to their backends.
//!
//! The router is the bridge between the model's tool requests and the tool
//! servers. It handles:
//! - Dispatch by backend (audit / cluster subprocesses, local handlers)
//! - Lazy initialization of each transport client
//! - Timing and failure containment: every invocation yields one outcome
//! - One observability event per invocation
//! - Plans: ordered execution with short-circuit on critical failures

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;

use crate::mcp_client::TransportClient;

use super::catalog::RECORD_SUGGESTION;
use super::types::{Backend, Suggestion, ToolEvent, ToolInvocation, ToolOutcome, ToolStatus};

// ─── Observability ──────────────────────────────────────────────────────────

/// Receives one event per routed invocation.
pub trait ToolObserver: Send + Sync {
    fn on_tool_event(&self, event: &ToolEvent);
}

/// Default observer: logs each event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ToolObserver for TracingObserver {
    fn on_tool_event(&self, event: &ToolEvent) {
        match event.status {
            ToolStatus::Success => tracing::info!(
                backend = %event.backend,
                tool = %event.name,
                duration_ms = event.duration_ms,
                "tool call succeeded"
            ),
            ToolStatus::Failure => tracing::warn!(
                backend = %event.backend,
                tool = %event.name,
                duration_ms = event.duration_ms,
                error = event.error.as_deref().unwrap_or(""),
                "tool call failed"
            ),
        }
    }
}

/// Callback for suggestions recorded by the local backend.
pub type SuggestionSink = Arc<dyn Fn(Suggestion) + Send + Sync>;

// ─── Plans ──────────────────────────────────────────────────────────────────

/// One step of a plan. A failed critical step stops the plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub invocation: ToolInvocation,
    pub critical: bool,
}

impl PlanStep {
    pub fn critical(invocation: ToolInvocation) -> Self {
        Self {
            invocation,
            critical: true,
        }
    }

    pub fn optional(invocation: ToolInvocation) -> Self {
        Self {
            invocation,
            critical: false,
        }
    }
}

// ─── ToolRouter ─────────────────────────────────────────────────────────────

/// Routes invocations to the audit server, the cluster server, or the local
/// handlers. Owns one transport client per remote backend.
pub struct ToolRouter {
    audit: TransportClient,
    cluster: TransportClient,
    observer: Arc<dyn ToolObserver>,
    suggestion_sink: Option<SuggestionSink>,
}

impl ToolRouter {
    /// Create a router. Subprocesses are spawned on first use.
    pub fn new(audit: TransportClient, cluster: TransportClient) -> Self {
        Self {
            audit,
            cluster,
            observer: Arc::new(TracingObserver),
            suggestion_sink: None,
        }
    }

    /// Replace the observability sink.
    pub fn with_observer(mut self, observer: Arc<dyn ToolObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Forward recorded suggestions to `sink`.
    pub fn with_suggestion_sink(mut self, sink: SuggestionSink) -> Self {
        self.suggestion_sink = Some(sink);
        self
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Execute one invocation. Never fails: faults become failed outcomes.
    pub async fn execute_tool(&self, invocation: &ToolInvocation) -> ToolOutcome {
        let start = Instant::now();

        let result = match invocation.backend {
            Backend::Audit => self.call_remote(&self.audit, invocation).await,
            Backend::Cluster => self.call_remote(&self.cluster, invocation).await,
            Backend::Local => self.execute_local(invocation),
            Backend::Unknown => Err(format!(
                "unknown tool '{}': no backend handles it",
                invocation.name
            )),
        };

        let elapsed = start.elapsed().as_millis() as u64;
        let outcome = match result {
            Ok(payload) => ToolOutcome::success(invocation, payload, elapsed),
            Err(error) => ToolOutcome::failure(invocation, error, elapsed),
        };

        self.observer.on_tool_event(&ToolEvent::from(&outcome));
        outcome
    }

    /// Execute a round of invocations, outcomes in request order.
    ///
    /// With `parallel` the calls are issued concurrently; requests to the
    /// same server share its process and are told apart by id.
    pub async fn execute_all(
        &self,
        invocations: &[ToolInvocation],
        parallel: bool,
    ) -> Vec<ToolOutcome> {
        if parallel {
            return join_all(invocations.iter().map(|inv| self.execute_tool(inv))).await;
        }

        let mut outcomes = Vec::with_capacity(invocations.len());
        for inv in invocations {
            outcomes.push(self.execute_tool(inv).await);
        }
        outcomes
    }

    /// Execute invocations strictly in order, stopping after the first
    /// failure. Returns the outcomes of the steps that ran.
    pub async fn execute_plan(&self, invocations: &[ToolInvocation]) -> Vec<ToolOutcome> {
        let steps: Vec<PlanStep> = invocations.iter().cloned().map(PlanStep::critical).collect();
        self.execute_plan_steps(&steps).await
    }

    /// Like `execute_plan`, but only critical steps stop the plan.
    pub async fn execute_plan_steps(&self, steps: &[PlanStep]) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            let outcome = self.execute_tool(&step.invocation).await;
            let failed = !outcome.success;
            outcomes.push(outcome);

            if failed && step.critical {
                tracing::warn!(
                    step = index,
                    tool = %step.invocation.name,
                    skipped = steps.len() - index - 1,
                    "critical plan step failed, stopping plan"
                );
                break;
            }
        }

        outcomes
    }

    /// Close both transport clients. The next remote call re-spawns.
    pub async fn reset(&self) {
        self.audit.close().await;
        self.cluster.close().await;
    }

    // ─── Backends ───────────────────────────────────────────────────────

    async fn call_remote(
        &self,
        client: &TransportClient,
        invocation: &ToolInvocation,
    ) -> Result<serde_json::Value, String> {
        match client
            .call_tool(&invocation.name, invocation.arguments.clone())
            .await
        {
            Ok(out) if out.success => Ok(out.result.unwrap_or(serde_json::Value::Null)),
            Ok(out) => Err(out
                .error
                .unwrap_or_else(|| "tool server reported an error".to_string())),
            Err(e) => Err(e.to_string()),
        }
    }

    fn execute_local(&self, invocation: &ToolInvocation) -> Result<serde_json::Value, String> {
        if invocation.name != RECORD_SUGGESTION {
            return Err(format!("unknown local tool '{}'", invocation.name));
        }

        let suggestion = parse_suggestion(&invocation.arguments)?;
        let title = suggestion.title.clone();
        match &self.suggestion_sink {
            Some(sink) => sink(suggestion),
            None => tracing::info!(title = %suggestion.title, "suggestion recorded (no sink)"),
        }
        Ok(serde_json::Value::String(format!("Suggestion recorded: {title}")))
    }
}

// ─── Free Functions ─────────────────────────────────────────────────────────

/// Validate `record_suggestion` arguments.
fn parse_suggestion(arguments: &serde_json::Value) -> Result<Suggestion, String> {
    let obj = arguments
        .as_object()
        .ok_or_else(|| "arguments must be an object".to_string())?;

    let required = |field: &str| -> Result<String, String> {
        match obj.get(field) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            Some(serde_json::Value::String(_)) => Err(format!("'{field}' must not be empty")),
            Some(_) => Err(format!("'{field}' must be a string")),
            None => Err(format!("missing required field '{field}'")),
        }
    };

    let command = match obj.get("command") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(_) => return Err("'command' must be a string".to_string()),
    };

    Ok(Suggestion {
        title: required("title")?,
        description: required("description")?,
        command,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
