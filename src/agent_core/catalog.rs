//! Tool catalog: what the model may call, and where each call is routed.
//!
//! The model only ever sees catalog names (`search_audit_events`). Each entry
//! maps to a backend and that backend's internal dotted name
//! (`audit.search_events`), which is what travels over JSON-RPC.

use serde_json::json;

use crate::inference::types::ToolRequest;

use super::types::{Backend, ToolInvocation};

/// Internal name of the local suggestion tool.
pub const RECORD_SUGGESTION: &str = "local.record_suggestion";

// ─── ToolSpec ───────────────────────────────────────────────────────────────

/// One tool offered to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub input_schema: serde_json::Value,
    pub backend: Backend,
    pub internal_name: String,
}

impl ToolSpec {
    fn new(
        name: &str,
        backend: Backend,
        internal_name: &str,
        description: &str,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            backend,
            internal_name: internal_name.to_string(),
        }
    }
}

// ─── ToolCatalog ────────────────────────────────────────────────────────────

/// Ordered set of tools with name lookup.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    specs: Vec<ToolSpec>,
}

impl ToolCatalog {
    pub fn new(specs: Vec<ToolSpec>) -> Self {
        Self { specs }
    }

    /// The operations exposed by the audit and cluster servers plus the
    /// local suggestion tool.
    pub fn standard() -> Self {
        let empty = json!({"type": "object", "properties": {}});

        Self::new(vec![
            ToolSpec::new(
                "search_audit_events",
                Backend::Audit,
                "audit.search_events",
                "Search audit log events. Filter by event type, user, and time range. \
                 Returns matching events, newest first.",
                json!({
                    "type": "object",
                    "properties": {
                        "event_type": {"type": "string", "description": "Event type code, e.g. session.start"},
                        "user": {"type": "string", "description": "Only events by this user"},
                        "from": {"type": "string", "description": "Start of range (RFC 3339)"},
                        "to": {"type": "string", "description": "End of range (RFC 3339)"},
                        "limit": {"type": "integer", "description": "Maximum events to return"}
                    }
                }),
            ),
            ToolSpec::new(
                "get_audit_event",
                Backend::Audit,
                "audit.get_event",
                "Fetch one audit event by id with all of its fields.",
                json!({
                    "type": "object",
                    "properties": {"id": {"type": "string"}},
                    "required": ["id"]
                }),
            ),
            ToolSpec::new(
                "count_audit_events",
                Backend::Audit,
                "audit.count_events",
                "Count audit events grouped by a field (event_type, user, or day).",
                json!({
                    "type": "object",
                    "properties": {
                        "group_by": {"type": "string", "enum": ["event_type", "user", "day"]},
                        "from": {"type": "string"},
                        "to": {"type": "string"}
                    },
                    "required": ["group_by"]
                }),
            ),
            ToolSpec::new(
                "list_nodes",
                Backend::Cluster,
                "cluster.list_nodes",
                "List nodes joined to the cluster with their labels and status.",
                json!({
                    "type": "object",
                    "properties": {"label": {"type": "string", "description": "key=value label filter"}}
                }),
            ),
            ToolSpec::new(
                "list_users",
                Backend::Cluster,
                "cluster.list_users",
                "List local and SSO users with their assigned roles.",
                empty.clone(),
            ),
            ToolSpec::new(
                "list_roles",
                Backend::Cluster,
                "cluster.list_roles",
                "List roles and the permissions they grant.",
                empty.clone(),
            ),
            ToolSpec::new(
                "get_cluster_status",
                Backend::Cluster,
                "cluster.get_status",
                "Show cluster health: version, auth servers, proxies, and certificate expiry.",
                empty,
            ),
            ToolSpec::new(
                "record_suggestion",
                Backend::Local,
                RECORD_SUGGESTION,
                "Record a follow-up suggestion for the operator.",
                json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "description": {"type": "string"},
                        "command": {"type": "string", "description": "Optional command to run"}
                    },
                    "required": ["title", "description"]
                }),
            ),
        ])
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Look up a tool by catalog name.
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Translate a model tool request into a routed invocation.
    ///
    /// Names not in the catalog yield `Backend::Unknown` with the name kept
    /// as-is, so the router can report a failed outcome.
    pub fn to_invocation(&self, request: &ToolRequest) -> ToolInvocation {
        match self.get(&request.name) {
            Some(spec) => ToolInvocation::new(
                spec.backend,
                spec.internal_name.clone(),
                request.arguments.clone(),
            ),
            None => {
                tracing::warn!(tool = %request.name, "model requested a tool not in the catalog");
                ToolInvocation::new(
                    Backend::Unknown,
                    request.name.clone(),
                    request.arguments.clone(),
                )
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
