//! Per-page summary and conversation history.
//!
//! Records are keyed by the normalized page URL so that query strings and
//! anchors resolve to the same bucket. Access is last-writer-wins.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::KeyValueStore;
use crate::core::models::{AiSummary, Message, Role};
use crate::errors::{AssistantError, AssistantResult};

pub const HISTORY_PREFIX: &str = "history_";
pub const MAX_SUMMARIES: usize = 10;
pub const SCHEMA_VERSION: u32 = 1;

/// Reduces a page URL to scheme, host and path.
///
/// Unparsable input is cut at the first `?` and then at the first `#`.
#[must_use]
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => {
            let host = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                (None, _) => String::new(),
            };
            format!("{}://{host}{}", url.scheme(), url.path())
        }
        Err(_) => {
            let no_query = raw.split('?').next().unwrap_or(raw);
            no_query.split('#').next().unwrap_or(no_query).to_string()
        }
    }
}

const fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEntry {
    #[serde(flatten)]
    pub summary: AiSummary,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Most recent first.
    #[serde(default)]
    pub summaries: Vec<SummaryEntry>,
    #[serde(default)]
    pub conversations: Conversation,
}

impl Default for HistoryRecord {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            summaries: Vec::new(),
            conversations: Conversation::default(),
        }
    }
}

#[derive(Clone)]
pub struct HistoryStore {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").finish_non_exhaustive()
    }
}

impl HistoryStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn key_for(url: &str) -> String {
        format!("{HISTORY_PREFIX}{}", normalize_url(url))
    }

    /// # Errors
    ///
    /// Returns `StorageError` when the stored record cannot be decoded.
    pub async fn get(&self, url: &str) -> AssistantResult<Option<HistoryRecord>> {
        let key = Self::key_for(url);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| AssistantError::StorageError(format!("Corrupt history record {key}: {e}")))
    }

    async fn load_or_default(&self, url: &str) -> AssistantResult<HistoryRecord> {
        Ok(self.get(url).await?.unwrap_or_default())
    }

    async fn put(&self, url: &str, record: &HistoryRecord) -> AssistantResult<()> {
        self.store
            .set(&Self::key_for(url), serde_json::to_value(record)?)
            .await
    }

    /// Prepends `summary`, keeping the newest [`MAX_SUMMARIES`] entries.
    ///
    /// # Errors
    ///
    /// Propagates backend and decoding failures.
    pub async fn save_summary(&self, url: &str, summary: &AiSummary) -> AssistantResult<HistoryRecord> {
        let mut record = self.load_or_default(url).await?;
        record.summaries.insert(
            0,
            SummaryEntry {
                summary: summary.clone(),
                timestamp: now_millis(),
                url: Some(normalize_url(url)),
            },
        );
        record.summaries.truncate(MAX_SUMMARIES);
        self.put(url, &record).await?;
        debug!(count = record.summaries.len(), "Saved summary to history");
        Ok(record)
    }

    /// Removes the summary at `index`. Returns `false` when there is none.
    ///
    /// # Errors
    ///
    /// Propagates backend and decoding failures.
    pub async fn delete_summary(&self, url: &str, index: usize) -> AssistantResult<bool> {
        let Some(mut record) = self.get(url).await? else {
            return Ok(false);
        };
        if index >= record.summaries.len() {
            return Ok(false);
        }
        record.summaries.remove(index);
        self.put(url, &record).await?;
        Ok(true)
    }

    /// # Errors
    ///
    /// Propagates backend and decoding failures.
    pub async fn clear_summaries(&self, url: &str) -> AssistantResult<()> {
        if let Some(mut record) = self.get(url).await? {
            record.summaries.clear();
            self.put(url, &record).await?;
        }
        Ok(())
    }

    /// Appends one conversation turn.
    ///
    /// # Errors
    ///
    /// Propagates backend and decoding failures.
    pub async fn append_message(
        &self,
        url: &str,
        role: Role,
        content: impl Into<String>,
    ) -> AssistantResult<()> {
        let mut record = self.load_or_default(url).await?;
        if record.conversations.url.is_none() {
            record.conversations.url = Some(normalize_url(url));
        }
        record.conversations.messages.push(ConversationMessage {
            role,
            content: content.into(),
            timestamp: now_millis(),
        });
        self.put(url, &record).await
    }

    /// # Errors
    ///
    /// Propagates backend and decoding failures.
    pub async fn clear_conversation(&self, url: &str) -> AssistantResult<()> {
        if let Some(mut record) = self.get(url).await? {
            record.conversations = Conversation {
                messages: Vec::new(),
                url: Some(normalize_url(url)),
            };
            self.put(url, &record).await?;
        }
        Ok(())
    }

    /// Drops the whole record for `url`.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn clear(&self, url: &str) -> AssistantResult<()> {
        self.store.remove(&Self::key_for(url)).await
    }

    /// The stored turns in the shape `answer_with_history` expects.
    ///
    /// # Errors
    ///
    /// Propagates backend and decoding failures.
    pub async fn conversation_history(&self, url: &str) -> AssistantResult<Vec<Message>> {
        Ok(self
            .get(url)
            .await?
            .map(|record| {
                record
                    .conversations
                    .messages
                    .into_iter()
                    .map(|m| Message {
                        role: m.role,
                        content: m.content,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    /// The conversation as `User: ...` / `Assistant: ...` paragraphs, ready
    /// to be summarized. `None` when there is nothing to summarize.
    ///
    /// # Errors
    ///
    /// Propagates backend and decoding failures.
    pub async fn conversation_transcript(&self, url: &str) -> AssistantResult<Option<String>> {
        let messages = self.conversation_history(url).await?;
        if messages.is_empty() {
            return Ok(None);
        }
        let transcript = messages
            .iter()
            .map(|m| {
                let speaker = match m.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                    Role::System => "System",
                };
                format!("{speaker}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(Some(transcript))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_query_and_fragment() {
        assert_eq!(normalize_url("https://a.com/x?y=1#z"), "https://a.com/x");
        assert_eq!(normalize_url("https://a.com/x"), "https://a.com/x");
        assert_eq!(normalize_url("https://a.com"), "https://a.com/");
        assert_eq!(
            normalize_url("http://user:pw@a.com:8080/p/q.pdf#page=2"),
            "http://a.com:8080/p/q.pdf"
        );
    }

    #[test]
    fn normalize_falls_back_for_unparsable_urls() {
        assert_eq!(normalize_url("not a url?x=1#y"), "not a url");
        assert_eq!(normalize_url("relative/path#frag"), "relative/path");
    }

    #[test]
    fn record_without_schema_version_loads_as_v1() {
        let record: HistoryRecord = serde_json::from_value(serde_json::json!({
            "summaries": [{ "summary": "s", "keyPoints": ["a"], "citations": [] }],
            "conversations": { "messages": [{ "role": "user", "content": "hi" }] }
        }))
        .unwrap();

        assert_eq!(record.schema_version, 1);
        assert_eq!(record.summaries[0].summary.key_points, vec!["a"]);
        assert_eq!(record.summaries[0].timestamp, 0);
        assert_eq!(record.conversations.messages[0].role, Role::User);
    }
}
