//! Key-value store with expiring entries.
//!
//! [`KvStore`] is the seam for an external cache; [`InMemoryKv`] is the
//! process-local implementation the server runs with.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use crate::error::AppError;
use crate::model::Ms;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
}

impl From<KvError> for AppError {
    fn from(err: KvError) -> Self {
        AppError::Upstream(err.to_string())
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Store `value`, replacing any previous entry. `None` never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Store `value` only if no live entry exists. Returns whether it was
    /// stored. Atomic with respect to concurrent callers.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError>;

    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;
}

/// Time source for expiry, in Unix milliseconds.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as Ms)
            .unwrap_or(0)
    })
}

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<Ms>,
}

impl Slot {
    fn live_at(&self, now: Ms) -> bool {
        self.expires_at.is_none_or(|t| now < t)
    }
}

pub struct InMemoryKv {
    entries: DashMap<String, Slot>,
    clock: Clock,
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn slot(&self, value: &str, ttl: Option<Duration>) -> Slot {
        Slot {
            value: value.to_string(),
            expires_at: ttl.map(|d| (self.clock)().saturating_add(d.as_millis() as Ms)),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = (self.clock)();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.live_at(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = (self.clock)();
        Ok(self
            .entries
            .get(key)
            .filter(|slot| slot.live_at(now))
            .map(|slot| slot.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let slot = self.slot(value, ttl);
        self.entries.insert(key.to_string(), slot);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let now = (self.clock)();
        let slot = self.slot(value, ttl);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().live_at(now) {
                    return Ok(false);
                }
                existing.insert(slot);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let now = (self.clock)();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, slot)| slot.live_at(now)))
    }
}
