//! Compiles definitions into persisted artifacts.

use super::{PipelineDefinition, Scheduler};
use crate::core::{PipelineId, PipelineRecord};
use crate::errors::PhenoflowError;
use crate::runtime::RuntimeContext;
use crate::store::RecordStore;
use crate::utils::now_utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of committing a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// The pipeline's stable id.
    pub pipeline_id: PipelineId,
    /// Version after the commit.
    pub version: u64,
    /// Whether the content changed (and the version was bumped).
    pub changed: bool,
    /// Where the artifact lives.
    pub artifact_path: PathBuf,
    /// Hex SHA-256 of the artifact.
    pub content_hash: String,
}

/// A rendered artifact: its bytes and their content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    /// Pretty-printed JSON.
    pub bytes: Vec<u8>,
    /// Hex SHA-256 of `bytes`.
    pub content_hash: String,
}

/// Turns definitions into artifact files plus a registry row.
///
/// Committing unchanged content is a no-op apart from restoring a missing
/// artifact file.
#[derive(Clone)]
pub struct PipelineCompiler {
    runtime: RuntimeContext,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl std::fmt::Debug for PipelineCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCompiler")
            .field("artifact_dir", &self.runtime.config().pipelines.artifact_dir)
            .field("scheduler", &self.scheduler.is_some())
            .finish()
    }
}

impl PipelineCompiler {
    /// Creates a compiler without a scheduler.
    #[must_use]
    pub fn new(runtime: RuntimeContext) -> Self {
        Self {
            runtime,
            scheduler: None,
        }
    }

    /// Forwards pause and delete to `scheduler`.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Where the artifact of `name` is written.
    #[must_use]
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.runtime
            .config()
            .pipelines
            .artifact_dir
            .join(format!("{name}.json"))
    }

    /// Serialises a definition deterministically and hashes it.
    pub fn render(definition: &PipelineDefinition) -> Result<RenderedArtifact, PhenoflowError> {
        let bytes = serde_json::to_vec_pretty(definition)?;
        let content_hash = hex::encode(Sha256::digest(&bytes));
        Ok(RenderedArtifact {
            bytes,
            content_hash,
        })
    }

    /// Validates, writes and registers a definition.
    ///
    /// Sets `definition.id` and `definition.version` from the registry row.
    pub async fn commit(
        &self,
        definition: &mut PipelineDefinition,
    ) -> Result<CommitOutcome, PhenoflowError> {
        definition.validate()?;
        let rendered = Self::render(definition)?;
        let path = self.artifact_path(definition.name());

        let mut session = self.runtime.database().begin().await?;
        let existing = session.load_pipeline(definition.name()).await?;

        if let Some(record) = existing
            .as_ref()
            .filter(|r| !r.deleted && r.content_hash == rendered.content_hash)
        {
            if !tokio::fs::try_exists(&path).await? {
                warn!(pipeline = %record.name, path = %path.display(), "Restoring missing artifact");
                write_artifact(&path, &rendered.bytes).await?;
            }
            definition.id = Some(record.id);
            definition.version = record.version;
            debug!(pipeline = %record.name, version = record.version, "Definition unchanged");
            return Ok(CommitOutcome {
                pipeline_id: record.id,
                version: record.version,
                changed: false,
                artifact_path: path,
                content_hash: rendered.content_hash,
            });
        }

        write_artifact(&path, &rendered.bytes).await?;

        let now = now_utc();
        let artifact: serde_json::Value = serde_json::from_slice(&rendered.bytes)?;
        let record = match existing {
            Some(mut record) => {
                record.version += 1;
                record.content_hash.clone_from(&rendered.content_hash);
                record.artifact = artifact;
                record.artifact_path = path.display().to_string();
                record.deleted = false;
                record.updated_at = now;
                record
            }
            None => PipelineRecord {
                id: definition.id.unwrap_or_default(),
                name: definition.name().to_string(),
                version: 1,
                content_hash: rendered.content_hash.clone(),
                artifact_path: path.display().to_string(),
                artifact,
                paused: false,
                deleted: false,
                created_at: now,
                updated_at: now,
            },
        };
        session.save_pipeline(&record).await?;
        session.commit().await?;

        definition.id = Some(record.id);
        definition.version = record.version;
        info!(
            pipeline = %record.name,
            version = record.version,
            hash = %record.content_hash,
            "Committed pipeline definition"
        );
        Ok(CommitOutcome {
            pipeline_id: record.id,
            version: record.version,
            changed: true,
            artifact_path: path,
            content_hash: rendered.content_hash,
        })
    }

    /// Loads the last committed definition.
    pub async fn load(&self, name: &str) -> Result<Option<PipelineDefinition>, PhenoflowError> {
        let session = self.runtime.database().begin().await?;
        let Some(record) = session.load_pipeline(name).await? else {
            return Ok(None);
        };
        if record.deleted {
            return Ok(None);
        }

        let mut definition: PipelineDefinition = serde_json::from_value(record.artifact)?;
        definition.validate()?;
        definition.id = Some(record.id);
        definition.version = record.version;
        Ok(Some(definition))
    }

    /// Returns whether `name` has a live registry row and artifact file.
    pub async fn is_committed(&self, name: &str) -> Result<bool, PhenoflowError> {
        let session = self.runtime.database().begin().await?;
        let live = session
            .load_pipeline(name)
            .await?
            .is_some_and(|r| !r.deleted);
        Ok(live && tokio::fs::try_exists(self.artifact_path(name)).await?)
    }

    /// Removes the artifact and every task run of the pipeline, marks the
    /// row deleted and tells the scheduler. Returns false if unknown.
    pub async fn delete(&self, name: &str) -> Result<bool, PhenoflowError> {
        let mut session = self.runtime.database().begin().await?;
        let Some(mut record) = session.load_pipeline(name).await? else {
            return Ok(false);
        };

        match tokio::fs::remove_file(self.artifact_path(name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let runs = session.task_runs_for_pipeline(record.id).await?;
        for run in &runs {
            session.delete_task_run(run.id).await?;
        }
        record.deleted = true;
        record.updated_at = now_utc();
        session.save_pipeline(&record).await?;
        session.commit().await?;
        info!(pipeline = %name, task_runs = runs.len(), "Deleted pipeline");

        if let Some(scheduler) = &self.scheduler {
            scheduler.delete(name).await?;
        }
        Ok(true)
    }

    /// Marks the pipeline paused and tells the scheduler.
    pub async fn pause(&self, name: &str) -> Result<(), PhenoflowError> {
        let mut session = self.runtime.database().begin().await?;
        let mut record = session
            .load_pipeline(name)
            .await?
            .filter(|r| !r.deleted)
            .ok_or_else(|| PhenoflowError::PipelineNotFound(name.to_string()))?;
        record.paused = true;
        session.save_pipeline(&record).await?;
        session.commit().await?;
        info!(pipeline = %name, "Paused pipeline");

        if let Some(scheduler) = &self.scheduler {
            scheduler.pause(name).await?;
        }
        Ok(())
    }
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), PhenoflowError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TaskRunId, TaskRunRecord, TaskRunStatus};
    use crate::pipeline::scheduler::MockScheduler;
    use crate::pipeline::TaskSpec;
    use crate::store::PIPELINE_TABLE;
    use crate::testing::test_runtime_in;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn definition() -> PipelineDefinition {
        let mut d = PipelineDefinition::new("phenotypes_TEST").unwrap();
        d.add_task(TaskSpec::new("imports", "ImportMetadata").with_task_id("import"))
            .unwrap();
        d.add_task(
            TaskSpec::new("analysis", "Summarise")
                .with_task_id("summarise")
                .with_upstream("import")
                .with_static_arg("year", json!(2020)),
        )
        .unwrap();
        d
    }

    #[tokio::test]
    async fn test_first_commit_writes_artifact_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let compiler = PipelineCompiler::new(rt.runtime.clone());
        let mut d = definition();

        let outcome = compiler.commit(&mut d).await.unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.version, 1);
        assert_eq!(d.version, 1);
        assert_eq!(d.id, Some(outcome.pipeline_id));
        assert_eq!(outcome.artifact_path, dir.path().join("phenotypes_TEST.json"));

        let written = std::fs::read(&outcome.artifact_path).unwrap();
        assert_eq!(written, PipelineCompiler::render(&d).unwrap().bytes);
        assert_eq!(rt.database.committed_rows(PIPELINE_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_recommit_unchanged_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let compiler = PipelineCompiler::new(rt.runtime.clone());
        let mut d = definition();
        let first = compiler.commit(&mut d).await.unwrap();

        let mut again = definition();
        let second = compiler.commit(&mut again).await.unwrap();

        assert!(!second.changed);
        assert_eq!(second.version, first.version);
        assert_eq!(second.pipeline_id, first.pipeline_id);
        assert_eq!(second.content_hash, first.content_hash);
    }

    #[tokio::test]
    async fn test_changed_content_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let compiler = PipelineCompiler::new(rt.runtime.clone());
        let mut d = definition();
        let first = compiler.commit(&mut d).await.unwrap();

        d.add_task(TaskSpec::new("reports", "Publish").with_task_id("publish"))
            .unwrap();
        let second = compiler.commit(&mut d).await.unwrap();

        assert!(second.changed);
        assert_eq!(second.version, 2);
        assert_eq!(second.pipeline_id, first.pipeline_id);
        assert_ne!(second.content_hash, first.content_hash);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let compiler = PipelineCompiler::new(rt.runtime.clone());
        let mut d = definition();
        let first = compiler.commit(&mut d).await.unwrap();
        std::fs::remove_file(&first.artifact_path).unwrap();

        let second = compiler.commit(&mut d).await.unwrap();

        assert!(!second.changed);
        assert!(first.artifact_path.exists());
        assert!(compiler.is_committed(d.name()).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let compiler = PipelineCompiler::new(rt.runtime.clone());
        let mut d = definition();
        compiler.commit(&mut d).await.unwrap();

        let loaded = compiler.load(d.name()).await.unwrap().unwrap();
        assert_eq!(loaded, d);
        assert!(compiler.load("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_artifact_runs_and_notifies_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let mut scheduler = MockScheduler::new();
        scheduler
            .expect_delete()
            .withf(|name| name == "phenotypes_TEST")
            .times(1)
            .returning(|_| Ok(()));
        let compiler = PipelineCompiler::new(rt.runtime.clone()).with_scheduler(Arc::new(scheduler));
        let mut d = definition();
        let outcome = compiler.commit(&mut d).await.unwrap();

        let mut session = rt.runtime.database().begin().await.unwrap();
        let mut run = TaskRunRecord::new(TaskRunId::new(), "m", "C", TaskRunStatus::Success, now_utc());
        run.pipeline_id = Some(outcome.pipeline_id);
        session.save_task_run(&run).await.unwrap();
        session.commit().await.unwrap();

        assert!(compiler.delete(d.name()).await.unwrap());

        assert!(!outcome.artifact_path.exists());
        assert!(session.load_task_run(run.id).await.unwrap().is_none());
        assert!(compiler.load(d.name()).await.unwrap().is_none());
        assert!(!compiler.delete("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_after_delete_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let compiler = PipelineCompiler::new(rt.runtime.clone());
        let mut d = definition();
        compiler.commit(&mut d).await.unwrap();
        compiler.delete(d.name()).await.unwrap();

        let outcome = compiler.commit(&mut d).await.unwrap();
        assert!(outcome.changed);
        assert!(outcome.artifact_path.exists());
    }

    #[tokio::test]
    async fn test_pause_forwards_to_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let mut scheduler = MockScheduler::new();
        scheduler.expect_pause().times(1).returning(|_| Ok(()));
        let compiler = PipelineCompiler::new(rt.runtime.clone()).with_scheduler(Arc::new(scheduler));
        let mut d = definition();
        compiler.commit(&mut d).await.unwrap();

        compiler.pause(d.name()).await.unwrap();

        let err = compiler.pause("unknown").await.unwrap_err();
        assert!(matches!(err, PhenoflowError::PipelineNotFound(_)));
    }

    #[tokio::test]
    async fn test_invalid_definition_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let rt = test_runtime_in(dir.path());
        let compiler = PipelineCompiler::new(rt.runtime.clone());
        let mut d: PipelineDefinition = serde_json::from_value(json!({
            "name": "broken",
            "max_active_runs": 1,
            "concurrency": 0,
            "nodes": []
        }))
        .unwrap();

        assert!(matches!(compiler.commit(&mut d).await, Err(PhenoflowError::Definition(_))));
        assert!(!compiler.artifact_path("broken").exists());
    }

    #[tokio::test]
    async fn test_name_cannot_escape_artifact_dir() {
        let root = tempfile::tempdir().unwrap();
        let artifacts = root.path().join("artifacts");
        let rt = test_runtime_in(&artifacts);
        let compiler = PipelineCompiler::new(rt.runtime.clone());
        let mut d: PipelineDefinition = serde_json::from_value(json!({
            "name": "../escaped",
            "max_active_runs": 1,
            "concurrency": 1,
            "nodes": []
        }))
        .unwrap();

        assert!(matches!(compiler.commit(&mut d).await, Err(PhenoflowError::Definition(_))));
        assert!(!root.path().join("escaped.json").exists());
        assert!(!compiler.delete("../escaped").await.unwrap());
    }
}
