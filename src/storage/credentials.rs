use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

use super::{KeyValueStore, StorageChange};
use crate::core::config::Config;
use crate::errors::AssistantResult;

pub const API_KEY: &str = "api_key";
pub const BASE_URL: &str = "base_url";

/// Reads and writes the credential record. Only the broker side holds one.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

fn as_text(value: Option<Value>) -> String {
    value
        .as_ref()
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns the stored credential, or `None` when no API key is set.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn load(&self) -> AssistantResult<Option<Config>> {
        let api_key = as_text(self.store.get(API_KEY).await?);
        if api_key.is_empty() {
            return Ok(None);
        }
        let base_url = as_text(self.store.get(BASE_URL).await?);
        Ok(Some(Config::new(api_key, base_url)))
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn save(&self, config: &Config) -> AssistantResult<()> {
        self.store
            .set_many(vec![
                (API_KEY.to_string(), Value::String(config.api_key.clone())),
                (BASE_URL.to_string(), Value::String(config.base_url.clone())),
            ])
            .await?;
        debug!("Saved credentials");
        Ok(())
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn has_api_key(&self) -> AssistantResult<bool> {
        Ok(!as_text(self.store.get(API_KEY).await?).is_empty())
    }

    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn clear(&self) -> AssistantResult<()> {
        self.store.remove(API_KEY).await?;
        self.store.remove(BASE_URL).await?;
        debug!("Cleared credentials");
        Ok(())
    }

    #[must_use]
    pub fn subscribe(&self) -> CredentialWatch {
        CredentialWatch {
            changes: self.store.subscribe(),
        }
    }
}

/// Yields once per burst of changes to the credential keys.
#[derive(Debug)]
pub struct CredentialWatch {
    changes: broadcast::Receiver<StorageChange>,
}

impl CredentialWatch {
    /// Waits for the next credential change. Changes already queued behind
    /// it are folded into the same wake-up. Returns `false` once the store is
    /// gone.
    pub async fn changed(&mut self) -> bool {
        loop {
            match self.changes.recv().await {
                Ok(change) if change.key == API_KEY || change.key == BASE_URL => {
                    self.skip_queued();
                    return true;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    // Missed notifications may have touched the credential.
                    warn!(skipped, "Credential watch lagged");
                    self.skip_queued();
                    return true;
                }
                Err(RecvError::Closed) => return false,
            }
        }
    }

    fn skip_queued(&mut self) {
        loop {
            match self.changes.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn load_requires_api_key() {
        let kv = Arc::new(MemoryStore::new());
        let credentials = CredentialStore::new(kv.clone());
        assert_eq!(credentials.load().await.unwrap(), None);

        kv.set(BASE_URL, json!("https://example.com/v1")).await.unwrap();
        assert_eq!(credentials.load().await.unwrap(), None);
        assert!(!credentials.has_api_key().await.unwrap());
    }

    #[tokio::test]
    async fn save_load_clear() {
        let credentials = CredentialStore::new(Arc::new(MemoryStore::new()));
        credentials
            .save(&Config::new("sk-1", "https://open.bigmodel.cn/api/paas/v4"))
            .await
            .unwrap();

        let loaded = credentials.load().await.unwrap().unwrap();
        assert_eq!(loaded.api_key, "sk-1");
        assert_eq!(loaded.base_url, "https://open.bigmodel.cn/api/paas/v4");
        assert!(credentials.has_api_key().await.unwrap());

        credentials.clear().await.unwrap();
        assert_eq!(credentials.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn watch_ignores_unrelated_keys() {
        let kv = Arc::new(MemoryStore::new());
        let credentials = CredentialStore::new(kv.clone());
        let mut watch = credentials.subscribe();

        kv.set("history_https://a.com/x", json!({})).await.unwrap();
        kv.set(API_KEY, json!("sk-2")).await.unwrap();

        assert!(watch.changed().await);
    }

    #[tokio::test]
    async fn save_wakes_the_watch_once() {
        let kv = Arc::new(MemoryStore::new());
        let credentials = CredentialStore::new(kv.clone());
        let mut watch = credentials.subscribe();

        credentials
            .save(&Config::new("sk-3", "https://api.example.com/v1"))
            .await
            .unwrap();

        assert!(watch.changed().await);
        // Both keys are in place by the time the watch wakes
        assert_eq!(kv.get(API_KEY).await.unwrap(), Some(json!("sk-3")));
        assert_eq!(
            kv.get(BASE_URL).await.unwrap(),
            Some(json!("https://api.example.com/v1"))
        );
        let again =
            tokio::time::timeout(std::time::Duration::from_millis(50), watch.changed()).await;
        assert!(again.is_err(), "second wake-up for a single save");
    }
}
