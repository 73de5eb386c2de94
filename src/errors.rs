use thiserror::Error;

/// Every failure the bridge can surface, from the remote endpoint up to the
/// page-facing proxy. Payloads are plain strings so errors can be cloned,
/// compared, and relayed across the message boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssistantError {
    #[error("API key not configured")]
    NotConfigured,

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid parameters for {method}: {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("API Error: {0}")]
    RemoteError(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Failed to send HTTP request: {0}")]
    HttpError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Request {0} is already in flight")]
    DuplicateRequest(u64),

    #[error("Broker channel closed: {0}")]
    ChannelClosed(String),

    /// An error reported by the broker that has no more specific variant.
    #[error("{0}")]
    Broker(String),
}

impl AssistantError {
    /// Rebuilds an error from the string carried by a terminal `error` event.
    #[must_use]
    pub fn from_wire(message: &str) -> Self {
        if message == Self::Cancelled.to_string() {
            return Self::Cancelled;
        }
        if message == Self::NotConfigured.to_string() {
            return Self::NotConfigured;
        }
        if let Some(method) = message.strip_prefix("Unknown method: ") {
            return Self::UnknownMethod(method.to_string());
        }
        if let Some(detail) = message.strip_prefix("API Error: ") {
            return Self::RemoteError(detail.to_string());
        }
        Self::Broker(message.to_string())
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<reqwest::Error> for AssistantError {
    fn from(error: reqwest::Error) -> Self {
        AssistantError::HttpError(error.to_string())
    }
}

impl From<serde_json::Error> for AssistantError {
    fn from(error: serde_json::Error) -> Self {
        AssistantError::ParseError(error.to_string())
    }
}

impl From<std::io::Error> for AssistantError {
    fn from(error: std::io::Error) -> Self {
        AssistantError::StorageError(error.to_string())
    }
}

pub type AssistantResult<T> = Result<T, AssistantError>;
