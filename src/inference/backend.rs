//! Model backend: the HTTP boundary to the model API.
//!
//! `ModelBackend` is provider-blind: it moves JSON bodies and SSE events.
//! Request construction and response decoding belong to the provider adapters.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client as HttpClient;

use super::errors::InferenceError;
use super::providers::ProviderKind;
use super::streaming::sse_events;
use super::types::SseEvent;

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default total request timeout, including the streamed body.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ─── ModelBackend ────────────────────────────────────────────────────────────

/// A model endpoint that takes a provider request body.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Send a non-streaming request and return the response body.
    async fn complete(
        &self,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError>;

    /// Send a streaming request and return its SSE events.
    async fn stream(
        &self,
        request: serde_json::Value,
    ) -> Result<BoxStream<'static, Result<SseEvent, InferenceError>>, InferenceError>;
}

// ─── HttpModelBackend ────────────────────────────────────────────────────────

/// `ModelBackend` over HTTPS with reqwest.
pub struct HttpModelBackend {
    http: HttpClient,
    kind: ProviderKind,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl HttpModelBackend {
    pub fn new(
        kind: ProviderKind,
        base_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(InferenceError::ConfigError {
                reason: format!("base_url must be an http(s) URL, got '{base_url}'"),
            });
        }
        let endpoint = kind.endpoint(base_url);
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: endpoint.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            kind,
            endpoint,
            api_key: api_key.to_string(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(
        &self,
        request: &serde_json::Value,
        stream: bool,
    ) -> Result<reqwest::Response, InferenceError> {
        // Log request metadata only; bodies carry the whole conversation.
        tracing::info!(
            provider = %self.kind,
            url = %self.endpoint,
            model = request.get("model").and_then(|m| m.as_str()).unwrap_or_default(),
            message_count = request
                .get("messages")
                .and_then(|m| m.as_array())
                .map(Vec::len)
                .unwrap_or(0),
            stream,
            "sending model request"
        );

        let mut builder = self.http.post(&self.endpoint).json(request);
        for (name, value) in self.kind.headers(&self.api_key) {
            builder = builder.header(name, value);
        }
        if stream {
            builder = builder.header("accept", "text/event-stream");
        }

        let response = builder.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                provider = %self.kind,
                status = status.as_u16(),
                "model request rejected"
            );
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    fn map_send_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_timeout() {
            InferenceError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    async fn complete(
        &self,
        request: serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError> {
        let response = self.send(&request, false).await?;
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout {
                        timeout_secs: self.timeout.as_secs(),
                    }
                } else {
                    InferenceError::parse(self.kind.as_str(), format!("invalid JSON body: {e}"))
                }
            })
    }

    async fn stream(
        &self,
        request: serde_json::Value,
    ) -> Result<BoxStream<'static, Result<SseEvent, InferenceError>>, InferenceError> {
        let response = self.send(&request, true).await?;
        Ok(sse_events(Box::pin(response.bytes_stream())).boxed())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
