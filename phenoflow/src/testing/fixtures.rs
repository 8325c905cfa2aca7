//! Ready-made runtimes over the in-memory collaborators.

use std::path::Path;
use std::sync::Arc;

use super::CollectingNotifier;
use crate::cache::InMemoryOutputCache;
use crate::config::EngineConfig;
use crate::runtime::RuntimeContext;
use crate::store::InMemoryDatabase;
use crate::task::TaskRegistry;

/// A runtime plus typed handles to its in-memory parts.
#[derive(Debug, Clone)]
pub struct TestRuntime {
    /// The runtime to hand to executors and runners.
    pub runtime: RuntimeContext,
    /// The database behind it.
    pub database: Arc<InMemoryDatabase>,
    /// The cache behind it.
    pub cache: Arc<InMemoryOutputCache>,
    /// The notifier behind it.
    pub notifier: Arc<CollectingNotifier>,
    /// The registry behind it.
    pub registry: Arc<TaskRegistry>,
}

impl TestRuntime {
    /// Builds a runtime over fresh in-memory parts.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let database = Arc::new(InMemoryDatabase::new());
        let cache = Arc::new(InMemoryOutputCache::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let registry = Arc::new(TaskRegistry::new());
        let runtime = RuntimeContext::from_parts(
            database.clone(),
            cache.clone(),
            notifier.clone(),
            registry.clone(),
            config,
        );
        Self {
            runtime,
            database,
            cache,
            notifier,
            registry,
        }
    }

    /// Replaces the rerun purge prefixes.
    pub fn set_rerun_purge_prefixes(&mut self, prefixes: Vec<String>) {
        let mut config = self.runtime.config().clone();
        config.cache.rerun_purge_prefixes = prefixes;
        self.runtime = self.runtime.clone().with_config(config);
    }
}

/// A runtime using [`EngineConfig::for_tests`].
#[must_use]
pub fn test_runtime() -> TestRuntime {
    TestRuntime::new(EngineConfig::for_tests())
}

/// Like [`test_runtime`], writing artifacts under `artifact_dir`.
#[must_use]
pub fn test_runtime_in(artifact_dir: &Path) -> TestRuntime {
    let mut config = EngineConfig::for_tests();
    config.pipelines.artifact_dir = artifact_dir.to_path_buf();
    TestRuntime::new(config)
}
