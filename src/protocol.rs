//! Wire envelope between the page-facing proxy and the broker.
//!
//! Inbound messages are tagged by `type` (`ai-request`, `ai-cancel`). Outbound
//! event types embed the request id (`ai-chunk-7`, `ai-progress-7`,
//! `ai-response-7`) so a listener can subscribe to exactly one request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::str::FromStr;

use crate::core::models::Message;
use crate::errors::{AssistantError, AssistantResult};

/// Identifies the context a request came from (a tab, the popup, a panel).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContextId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ContextId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message sent to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "ai-request")]
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Without an `id` every request of every context is cancelled.
    #[serde(rename = "ai-cancel")]
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Summarize,
    Translate,
    TranslateLines,
    AnswerQuestion,
    AnswerWithHistory,
}

impl Method {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Translate => "translate",
            Self::TranslateLines => "translateLines",
            Self::AnswerQuestion => "answerQuestion",
            Self::AnswerWithHistory => "answerWithHistory",
        }
    }
}

impl FromStr for Method {
    type Err = AssistantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summarize" => Ok(Self::Summarize),
            "translate" => Ok(Self::Translate),
            "translateLines" => Ok(Self::TranslateLines),
            "answerQuestion" => Ok(Self::AnswerQuestion),
            "answerWithHistory" => Ok(Self::AnswerWithHistory),
            other => Err(AssistantError::UnknownMethod(other.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeParams {
    pub content: String,
    #[serde(default, alias = "isPDF")]
    pub is_long_form: bool,
    /// Emit cumulative `ai-chunk` events while the summary is produced.
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateParams {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lang: Option<String>,
    #[serde(default)]
    pub professional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateLinesParams {
    pub lines: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_lang: Option<String>,
    /// Emit `ai-progress` events after every line.
    #[serde(default)]
    pub on_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerQuestionParams {
    pub question: String,
    pub content: String,
    #[serde(default, alias = "isPDF")]
    pub is_long_form: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerWithHistoryParams {
    pub question: String,
    pub content: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default, alias = "isPDF")]
    pub is_long_form: bool,
    #[serde(default)]
    pub stream: bool,
}

/// A validated request, one variant per method.
#[derive(Debug, Clone, PartialEq)]
pub enum AiRequest {
    Summarize(SummarizeParams),
    Translate(TranslateParams),
    TranslateLines(TranslateLinesParams),
    AnswerQuestion(AnswerQuestionParams),
    AnswerWithHistory(AnswerWithHistoryParams),
}

impl AiRequest {
    /// Validates a raw method name and its params.
    ///
    /// # Errors
    ///
    /// `UnknownMethod` for an unrecognised method, `InvalidParams` when the
    /// params do not fit the method.
    pub fn from_parts(method: &str, params: Value) -> AssistantResult<Self> {
        let method: Method = method.parse()?;
        let params = if params.is_null() {
            Value::Object(Map::new())
        } else {
            params
        };
        let invalid = |e: serde_json::Error| AssistantError::InvalidParams {
            method: method.as_str().to_string(),
            reason: e.to_string(),
        };

        Ok(match method {
            Method::Summarize => Self::Summarize(serde_json::from_value(params).map_err(invalid)?),
            Method::Translate => Self::Translate(serde_json::from_value(params).map_err(invalid)?),
            Method::TranslateLines => {
                Self::TranslateLines(serde_json::from_value(params).map_err(invalid)?)
            }
            Method::AnswerQuestion => {
                Self::AnswerQuestion(serde_json::from_value(params).map_err(invalid)?)
            }
            Method::AnswerWithHistory => {
                Self::AnswerWithHistory(serde_json::from_value(params).map_err(invalid)?)
            }
        })
    }

    #[must_use]
    pub const fn method(&self) -> Method {
        match self {
            Self::Summarize(_) => Method::Summarize,
            Self::Translate(_) => Method::Translate,
            Self::TranslateLines(_) => Method::TranslateLines,
            Self::AnswerQuestion(_) => Method::AnswerQuestion,
            Self::AnswerWithHistory(_) => Method::AnswerWithHistory,
        }
    }

    /// Wraps the request in an `ai-request` envelope.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if the params cannot be serialized.
    pub fn into_envelope(self, id: u64) -> AssistantResult<InboundMessage> {
        let method = self.method().as_str().to_string();
        let params = match self {
            Self::Summarize(p) => serde_json::to_value(p)?,
            Self::Translate(p) => serde_json::to_value(p)?,
            Self::TranslateLines(p) => serde_json::to_value(p)?,
            Self::AnswerQuestion(p) => serde_json::to_value(p)?,
            Self::AnswerWithHistory(p) => serde_json::to_value(p)?,
        };
        Ok(InboundMessage::Request { id, method, params })
    }
}

const CHUNK_PREFIX: &str = "ai-chunk-";
const PROGRESS_PREFIX: &str = "ai-progress-";
const RESPONSE_PREFIX: &str = "ai-response-";

/// A message sent from the broker back to the originating context.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    /// Cumulative text produced so far.
    Chunk { id: u64, chunk: String },
    Progress { id: u64, current: usize, total: usize },
    /// The single terminal event of a request.
    Response {
        id: u64,
        outcome: Result<Value, String>,
    },
}

impl BrokerEvent {
    /// Builds a terminal success event carrying `data`.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if `data` cannot be serialized.
    pub fn success<T: Serialize>(id: u64, data: &T) -> AssistantResult<Self> {
        Ok(Self::Response {
            id,
            outcome: Ok(serde_json::to_value(data)?),
        })
    }

    #[must_use]
    pub fn failure(id: u64, error: &AssistantError) -> Self {
        Self::Response {
            id,
            outcome: Err(error.to_string()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Chunk { id, .. } | Self::Progress { id, .. } | Self::Response { id, .. } => *id,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Response { .. })
    }

    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Chunk { id, chunk } => json!({
                "type": format!("{CHUNK_PREFIX}{id}"),
                "chunk": chunk,
            }),
            Self::Progress { id, current, total } => json!({
                "type": format!("{PROGRESS_PREFIX}{id}"),
                "current": current,
                "total": total,
            }),
            Self::Response { id, outcome: Ok(data) } => json!({
                "type": format!("{RESPONSE_PREFIX}{id}"),
                "data": data,
            }),
            Self::Response { id, outcome: Err(error) } => json!({
                "type": format!("{RESPONSE_PREFIX}{id}"),
                "error": error,
            }),
        }
    }

    /// Parses an outbound event from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` for unknown event types or missing fields.
    pub fn from_wire(value: &Value) -> AssistantResult<Self> {
        let event_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AssistantError::ParseError("Event has no type".to_string()))?;

        let parse_id = |raw: &str| {
            raw.parse::<u64>().map_err(|e| {
                AssistantError::ParseError(format!("Bad request id in {event_type}: {e}"))
            })
        };
        let field = |name: &str| {
            value.get(name).ok_or_else(|| {
                AssistantError::ParseError(format!("{event_type} is missing {name}"))
            })
        };
        let count = |name: &str| {
            field(name)?
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| AssistantError::ParseError(format!("{event_type}: bad {name}")))
        };

        if let Some(raw_id) = event_type.strip_prefix(CHUNK_PREFIX) {
            let chunk = field("chunk")?
                .as_str()
                .ok_or_else(|| AssistantError::ParseError(format!("{event_type}: bad chunk")))?;
            return Ok(Self::Chunk {
                id: parse_id(raw_id)?,
                chunk: chunk.to_string(),
            });
        }

        if let Some(raw_id) = event_type.strip_prefix(PROGRESS_PREFIX) {
            return Ok(Self::Progress {
                id: parse_id(raw_id)?,
                current: count("current")?,
                total: count("total")?,
            });
        }

        if let Some(raw_id) = event_type.strip_prefix(RESPONSE_PREFIX) {
            let id = parse_id(raw_id)?;
            let outcome = match value.get("error").and_then(Value::as_str) {
                Some(error) => Err(error.to_string()),
                None => Ok(value.get("data").cloned().unwrap_or(Value::Null)),
            };
            return Ok(Self::Response { id, outcome });
        }

        Err(AssistantError::ParseError(format!(
            "Unknown event type: {event_type}"
        )))
    }
}
