//! Agent Core error types.

use thiserror::Error;

use crate::inference::errors::InferenceError;

/// Errors that abort a query. Tool failures never surface here; they become
/// failed outcomes at the router.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model backend call failed.
    #[error("inference failed: {source}")]
    Inference {
        #[from]
        source: InferenceError,
    },

    /// The model kept requesting tools past the configured bound.
    #[error("round limit exceeded: model still requesting tools after {rounds} rounds")]
    RoundLimitExceeded { rounds: u32 },

    /// The receiving end of a streaming query was dropped.
    #[error("event channel closed")]
    EventChannelClosed,

    /// Engine configuration is invalid.
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },
}
