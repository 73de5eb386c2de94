//! HTTP transport to the chat-completions endpoint.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::Config;
use crate::core::models::Message;
use crate::errors::AssistantError;

/// Raw response body chunks of a streaming call.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, AssistantError>> + Send>>;

/// Body of a chat-completions request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

/// The remote completion function. Implementations own the credential.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Performs a non-streaming call and returns the assistant text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AssistantError>;

    /// Starts a streaming call and returns the SSE body.
    async fn stream(&self, request: &CompletionRequest) -> Result<ByteStream, AssistantError>;
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    http: Client,
    endpoint: String,
    api_key: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns `NotConfigured` without an API key and `HttpError` if the
    /// HTTP client cannot be built.
    pub fn new(config: &Config, timeout: Option<Duration>) -> Result<Self, AssistantError> {
        if !config.is_configured() {
            return Err(AssistantError::NotConfigured);
        }

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| AssistantError::HttpError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: config.completions_url(),
            api_key: config.api_key.clone(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn headers(&self, streaming: bool) -> Result<HeaderMap, AssistantError> {
        let mut headers = HeaderMap::new();
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| AssistantError::HttpError(format!("Invalid Authorization header: {e}")))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if streaming {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        Ok(headers)
    }

    async fn post(&self, request: &CompletionRequest) -> Result<reqwest::Response, AssistantError> {
        let response = self
            .http
            .post(&self.endpoint)
            .headers(self.headers(request.stream)?)
            .json(request)
            .send()
            .await
            .map_err(|e| AssistantError::HttpError(format!("Completion request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let status_text = status.canonical_reason().unwrap_or("Unknown status");
            let body = response.text().await.unwrap_or_else(|e| {
                format!("Failed to read error response body: {e}")
            });
            warn!(status = status.as_u16(), "Completion endpoint returned an error");
            debug!(body = %body, "Completion error body");
            return Err(AssistantError::RemoteError(format!(
                "{status_text} (status {})",
                status.as_u16()
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, AssistantError> {
        let response = self.post(request).await?;
        let response_json: Value = response.json().await.map_err(|e| {
            AssistantError::ParseError(format!("Failed to parse completion response: {e}"))
        })?;
        extract_message_content(&response_json)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ByteStream, AssistantError> {
        let response = self.post(request).await?;
        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| AssistantError::HttpError(format!("Error reading streaming response: {e}")))
        });
        Ok(Box::pin(stream))
    }
}

/// Pulls `choices[0].message.content` out of a non-streaming response.
///
/// # Errors
///
/// Returns `ParseError` when the response has no text content.
pub fn extract_message_content(response_json: &Value) -> Result<String, AssistantError> {
    response_json
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| AssistantError::ParseError("No text in completion response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_first_choice_content() {
        let body = json!({
            "choices": [{ "message": { "role": "assistant", "content": "Bonjour" } }]
        });
        assert_eq!(extract_message_content(&body).unwrap(), "Bonjour");
    }

    #[test]
    fn missing_content_is_a_parse_error() {
        let err = extract_message_content(&json!({ "choices": [] })).unwrap_err();
        assert!(matches!(err, AssistantError::ParseError(_)));
    }

    #[test]
    fn request_body_omits_stream_flag_when_false() {
        let request = CompletionRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![Message::user("hi")],
            temperature: 0.7,
            stream: false,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("stream").is_none());
        assert_eq!(body["messages"][0]["role"], "user");

        let streaming = CompletionRequest {
            stream: true,
            ..request
        };
        assert_eq!(serde_json::to_value(&streaming).unwrap()["stream"], true);
    }

    #[test]
    fn transport_requires_api_key() {
        let err = HttpTransport::new(&Config::new("", ""), None).unwrap_err();
        assert_eq!(err, AssistantError::NotConfigured);
    }

    #[test]
    fn transport_targets_completions_endpoint() {
        let transport =
            HttpTransport::new(&Config::new("sk-test", "https://example.com/v1"), None).unwrap();
        assert_eq!(transport.endpoint(), "https://example.com/v1/chat/completions");
        assert!(!format!("{transport:?}").contains("sk-test"));
    }
}
