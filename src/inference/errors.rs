//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur while talking to a model backend.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// SSE stream read or event-level error.
    #[error("stream error: {reason}")]
    StreamError { reason: String },

    /// The provider response did not have the expected shape.
    #[error("malformed {provider} response: {reason}")]
    ParseError { provider: String, reason: String },

    /// Provider configuration is missing or invalid.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    pub(crate) fn parse(provider: &str, reason: impl Into<String>) -> Self {
        InferenceError::ParseError {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}
