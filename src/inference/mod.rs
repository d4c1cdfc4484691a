//! Inference: model API access and provider translation.
//!
//! This module handles all communication with the model endpoint:
//! - `backend`: the `ModelBackend` trait and its reqwest implementation
//! - `streaming`: SSE byte-stream splitting
//! - `providers`: one adapter per model API (Anthropic Messages, OpenAI
//!   Chat Completions) translating between the neutral conversation model
//!   and each wire format
//!
//! Switching providers is a config change, not a code change.

pub mod backend;
pub mod errors;
pub mod providers;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use backend::{HttpModelBackend, ModelBackend};
pub use errors::InferenceError;
pub use providers::{adapter_for, ProviderAdapter, ProviderKind, RequestSettings, StreamDecoder};
pub use types::{ModelTurn, SseEvent, StopSignal, ToolRequest};
