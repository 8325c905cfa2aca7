//! Shared handles passed to the executor, compiler and runner.

use crate::cache::OutputCache;
use crate::config::EngineConfig;
use crate::errors::ConfigError;
use crate::store::Database;
use crate::task::{LoggingNotifier, TaskNotifier, TaskRegistry};
use std::fmt;
use std::sync::Arc;

/// The engine's collaborators, cheap to clone.
#[derive(Clone)]
pub struct RuntimeContext {
    database: Arc<dyn Database>,
    cache: Arc<dyn OutputCache>,
    notifier: Arc<dyn TaskNotifier>,
    registry: Arc<TaskRegistry>,
    config: Arc<EngineConfig>,
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> RuntimeContextBuilder {
        RuntimeContextBuilder::default()
    }

    /// Assembles a context from all of its parts.
    #[must_use]
    pub fn from_parts(
        database: Arc<dyn Database>,
        cache: Arc<dyn OutputCache>,
        notifier: Arc<dyn TaskNotifier>,
        registry: Arc<TaskRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            database,
            cache,
            notifier,
            registry,
            config: Arc::new(config),
        }
    }

    /// The database.
    #[must_use]
    pub fn database(&self) -> &dyn Database {
        self.database.as_ref()
    }

    /// The output cache.
    #[must_use]
    pub fn cache(&self) -> &dyn OutputCache {
        self.cache.as_ref()
    }

    /// A shared handle to the output cache.
    #[must_use]
    pub fn cache_handle(&self) -> Arc<dyn OutputCache> {
        Arc::clone(&self.cache)
    }

    /// The completion notifier.
    #[must_use]
    pub fn notifier(&self) -> &dyn TaskNotifier {
        self.notifier.as_ref()
    }

    /// The task registry.
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns a copy using a different configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Arc::new(config);
        self
    }
}

/// Builder for [`RuntimeContext`].
#[derive(Default)]
pub struct RuntimeContextBuilder {
    database: Option<Arc<dyn Database>>,
    cache: Option<Arc<dyn OutputCache>>,
    notifier: Option<Arc<dyn TaskNotifier>>,
    registry: Option<Arc<TaskRegistry>>,
    config: Option<EngineConfig>,
}

impl RuntimeContextBuilder {
    /// Sets the database. Required.
    #[must_use]
    pub fn database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Sets the output cache. Required.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn OutputCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the notifier. Defaults to [`LoggingNotifier`].
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn TaskNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Sets the task registry. Defaults to an empty one.
    #[must_use]
    pub fn registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the configuration. Defaults to [`EngineConfig::default`].
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the context.
    pub fn build(self) -> Result<RuntimeContext, ConfigError> {
        Ok(RuntimeContext {
            database: self.database.ok_or(ConfigError::MissingComponent("database"))?,
            cache: self.cache.ok_or(ConfigError::MissingComponent("cache"))?,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LoggingNotifier)),
            registry: self.registry.unwrap_or_default(),
            config: Arc::new(self.config.unwrap_or_default()),
        })
    }
}
