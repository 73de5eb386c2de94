use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tokio_util::sync::CancellationToken;

use crate::errors::{AssistantError, AssistantResult};
use crate::protocol::ContextId;

/// A request as seen by the broker: ids are only unique per context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub origin: ContextId,
    pub id: u64,
}

impl RequestKey {
    pub fn new(origin: ContextId, id: u64) -> Self {
        Self { origin, id }
    }
}

/// A successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub token: CancellationToken,
    /// Distinguishes this registration from later ones under the same key.
    pub seq: u64,
}

/// In-flight requests and their cancellation handles.
#[derive(Debug, Default)]
pub struct ActiveRequestRegistry {
    requests: HashMap<RequestKey, Registration>,
    next_seq: u64,
}

impl ActiveRequestRegistry {
    /// Registers `key` with a fresh cancellation token.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRequest` when `key` is already in flight.
    pub fn register(&mut self, key: RequestKey) -> AssistantResult<Registration> {
        match self.requests.entry(key) {
            Entry::Occupied(slot) => Err(AssistantError::DuplicateRequest(slot.key().id)),
            Entry::Vacant(slot) => {
                self.next_seq += 1;
                let registration = Registration {
                    token: CancellationToken::new(),
                    seq: self.next_seq,
                };
                slot.insert(registration.clone());
                Ok(registration)
            }
        }
    }

    /// Removes the entry only if it is still registration `seq`, so a late
    /// guard never evicts a newer registration under the same key.
    pub fn remove(&mut self, key: &RequestKey, seq: u64) -> bool {
        match self.requests.get(key) {
            Some(current) if current.seq == seq => {
                self.requests.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Cancels and forgets one request.
    pub fn cancel(&mut self, key: &RequestKey) -> bool {
        let Some(registration) = self.requests.remove(key) else {
            return false;
        };
        registration.token.cancel();
        true
    }

    /// Cancels every request from `origin`, or every request at all.
    pub fn cancel_all(&mut self, origin: Option<&ContextId>) -> usize {
        let keys: Vec<RequestKey> = self
            .requests
            .keys()
            .filter(|key| origin.is_none_or(|origin| key.origin == *origin))
            .cloned()
            .collect();
        for key in &keys {
            if let Some(registration) = self.requests.remove(key) {
                registration.token.cancel();
            }
        }
        keys.len()
    }

    #[must_use]
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.requests.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
