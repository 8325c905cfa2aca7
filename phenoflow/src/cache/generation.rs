//! Advisory generation locks.

use super::OutputCache;
use crate::errors::{AlreadyGeneratingError, CacheError, LockError};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default prefix of generation marker keys.
pub const DEFAULT_LOCK_PREFIX: &str = "genlock:";

const MARKER: &str = "generating";

/// What the cache currently knows about an output key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Neither a marker nor a value.
    Absent,
    /// A producer holds the marker.
    Generating,
    /// The value is present and no marker is held.
    Ready,
}

/// Best-effort mutual exclusion over producing the value at a cache key.
///
/// The marker lives at `{prefix}{key}` with a TTL, so a crashed producer
/// cannot block the key forever.
#[derive(Clone)]
pub struct GenerationLock {
    cache: Arc<dyn OutputCache>,
    prefix: String,
    ttl: Option<Duration>,
}

impl fmt::Debug for GenerationLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationLock")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl GenerationLock {
    /// Creates a lock over `cache` with the default prefix and no TTL.
    #[must_use]
    pub fn new(cache: Arc<dyn OutputCache>) -> Self {
        Self {
            cache,
            prefix: DEFAULT_LOCK_PREFIX.to_string(),
            ttl: None,
        }
    }

    /// Sets the marker key prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the marker TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// The marker key guarding `key`.
    #[must_use]
    pub fn marker_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Claims `key` for generation.
    ///
    /// Fails with [`LockError::AlreadyGenerating`] if another producer
    /// holds the marker.
    pub async fn try_acquire(&self, key: &str) -> Result<(), LockError> {
        let marker = self.marker_key(key);
        let acquired = self
            .cache
            .set_if_absent(&marker, Value::String(MARKER.to_string()), self.ttl)
            .await?;
        if !acquired {
            debug!(key, "Generation already in progress");
            return Err(AlreadyGeneratingError::new(key).into());
        }
        debug!(key, "Generation lock acquired");
        Ok(())
    }

    /// Releases the marker. On failure any partially written value at
    /// `key` is deleted too, so readers never see half an output.
    pub async fn release(&self, key: &str, success: bool) -> Result<(), CacheError> {
        self.cache.delete(&self.marker_key(key)).await?;
        if !success && self.cache.delete(key).await? {
            warn!(key, "Deleted partial output after failed generation");
        }
        debug!(key, success, "Generation lock released");
        Ok(())
    }

    /// Reports whether `key` is absent, being generated or ready.
    pub async fn state(&self, key: &str) -> Result<GenerationState, CacheError> {
        if self.cache.exists(&self.marker_key(key)).await? {
            return Ok(GenerationState::Generating);
        }
        if self.cache.exists(key).await? {
            return Ok(GenerationState::Ready);
        }
        Ok(GenerationState::Absent)
    }
}
