//! Agent Core: orchestration layer for OpsPilot.
//!
//! Submodules:
//! - `engine`: the agent loop (model ⇄ tools until a final answer)
//! - `conversation`: append-only conversation history
//! - `tool_router`: dispatches tool invocations to backends
//! - `catalog`: the tools offered to the model and their routing
//! - `types`: shared types across the agent core
//! - `errors`: agent-level error types

pub mod catalog;
pub mod conversation;
pub mod engine;
pub mod errors;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use catalog::{ToolCatalog, ToolSpec};
pub use conversation::ConversationHistory;
pub use engine::{ConversationEngine, EngineSettings};
pub use errors::AgentError;
pub use tool_router::{PlanStep, SuggestionSink, ToolObserver, ToolRouter, TracingObserver};
pub use types::{
    Backend, ContentBlock, ConversationTurn, EngineEvent, QueryResult, Role, Suggestion,
    ToolEvent, ToolInvocation, ToolOutcome, ToolStatus, TurnContent,
};
