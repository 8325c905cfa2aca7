//! Output cache trait and the in-memory implementation.

use crate::errors::CacheError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use regex::Regex;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

/// Key-value store for task outputs and generation markers.
#[async_trait]
pub trait OutputCache: Send + Sync {
    /// Reads a value. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Writes a value, replacing any previous one.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Writes a value only if the key is absent. Returns whether it wrote.
    ///
    /// Implementations must make the check and the write one atomic step.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    /// Deletes a key, returning whether it was present.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Lists live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;

    /// Returns whether a live value exists.
    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Deletes every key matching `pattern`. Returns how many were removed.
pub async fn purge_matching(cache: &dyn OutputCache, pattern: &Regex) -> Result<usize, CacheError> {
    let mut removed = 0;
    for key in cache.keys("").await? {
        if pattern.is_match(&key) && cache.delete(&key).await? {
            removed += 1;
        }
    }
    debug!(pattern = %pattern, removed, "Purged cache keys");
    Ok(removed)
}

/// A cached value with optional expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The stored value.
    pub value: Value,
    /// When the entry stops being readable.
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    /// Creates an entry that expires after `ttl`, or never.
    #[must_use]
    pub fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    /// Returns true once the TTL has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// [`OutputCache`] backed by a `DashMap`.
#[derive(Debug, Default)]
pub struct InMemoryOutputCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryOutputCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clears all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl OutputCache for InMemoryOutputCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value.clone()));
            }
            // Expired
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), CacheEntry::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(CacheEntry::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired()))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired() && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
