//! Key/value persistence shared by the credential and history stores.
//!
//! Values are JSON documents keyed by string. Every `set` and `remove`
//! publishes a [`StorageChange`] so the broker can react to credential edits.

pub mod credentials;
pub mod history;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use crate::errors::{AssistantError, AssistantResult};

pub use credentials::{CredentialStore, CredentialWatch};
pub use history::{HistoryRecord, HistoryStore, normalize_url};

pub const CHANGE_BUFFER_CAPACITY: usize = 64;

/// A key that was written or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> AssistantResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> AssistantResult<()>;

    /// Writes every entry before publishing any change, so a subscriber
    /// never observes half of the batch.
    async fn set_many(&self, entries: Vec<(String, Value)>) -> AssistantResult<()>;

    async fn remove(&self, key: &str) -> AssistantResult<()>;

    /// Receives a [`StorageChange`] for every later write.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

fn publish(sender: &broadcast::Sender<StorageChange>, key: &str) {
    // No subscribers is fine.
    let _ = sender.send(StorageChange {
        key: key.to_string(),
    });
}

/// Ephemeral in-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _receiver) = broadcast::channel(CHANGE_BUFFER_CAPACITY);
        Self {
            values: RwLock::new(HashMap::new()),
            changes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> AssistantResult<Option<Value>> {
        Ok(self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: Value) -> AssistantResult<()> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        publish(&self.changes, key);
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> AssistantResult<()> {
        let keys: Vec<String> = entries.iter().map(|(key, _)| key.clone()).collect();
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(entries);
        for key in &keys {
            publish(&self.changes, key);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> AssistantResult<()> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        publish(&self.changes, key);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

/// Store persisted as a single JSON object on disk.
///
/// The document is loaded once on open and rewritten atomically (temp file,
/// then rename) on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
    changes: broadcast::Sender<StorageChange>,
}

impl JsonFileStore {
    /// Opens the store at `path`, starting empty when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the file exists but cannot be read or is not
    /// a JSON object.
    pub async fn open(path: impl Into<PathBuf>) -> AssistantResult<Self> {
        let path = path.into();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Map::new(),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(AssistantError::StorageError(format!(
                        "{} does not contain a JSON object",
                        path.display()
                    )));
                }
                Err(e) => {
                    return Err(AssistantError::StorageError(format!(
                        "Failed to parse {}: {e}",
                        path.display()
                    )));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                return Err(AssistantError::StorageError(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        info!(path = %path.display(), keys = values.len(), "Opened JSON store");
        let (changes, _receiver) = broadcast::channel(CHANGE_BUFFER_CAPACITY);
        Ok(Self {
            path,
            values: Mutex::new(values),
            changes,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, values: &Map<String, Value>) -> AssistantResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AssistantError::StorageError(format!(
                    "Failed to create {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let payload = serde_json::to_vec_pretty(values)?;
        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, payload).await.map_err(|e| {
            AssistantError::StorageError(format!("Failed to write {}: {e}", temp_path.display()))
        })?;
        tokio::fs::rename(&temp_path, &self.path).await.map_err(|e| {
            AssistantError::StorageError(format!(
                "Failed to rename temp file to {}: {e}",
                self.path.display()
            ))
        })?;

        debug!(path = %self.path.display(), "Persisted JSON store");
        Ok(())
    }
}

impl JsonFileStore {
    /// Applies `change` to a copy of the document and swaps it in only once
    /// the copy is on disk.
    async fn commit<F>(&self, keys: &[&str], change: F) -> AssistantResult<()>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let mut values = self.values.lock().await;
        let mut next = values.clone();
        change(&mut next);
        self.persist(&next).await?;
        *values = next;
        drop(values);
        for key in keys {
            publish(&self.changes, key);
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> AssistantResult<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> AssistantResult<()> {
        self.commit(&[key], |values| {
            values.insert(key.to_string(), value);
        })
        .await
    }

    async fn set_many(&self, entries: Vec<(String, Value)>) -> AssistantResult<()> {
        let keys: Vec<String> = entries.iter().map(|(key, _)| key.clone()).collect();
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.commit(&keys, |values| values.extend(entries)).await
    }

    async fn remove(&self, key: &str) -> AssistantResult<()> {
        self.commit(&[key], |values| {
            values.remove(key);
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}
