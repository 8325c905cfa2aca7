//! Per-execution context handed to a task.

use crate::cache::{GenerationLock, OutputCache};
use crate::core::{task_output_key, PipelineRunId, TaskArgs, TaskRunId};
use crate::errors::{CacheError, LockError, TaskError};
use crate::store::{RecordStore, UnitOfWork};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// What a task can see and touch while it runs.
///
/// Owns the execution's database session. Generation locks taken through
/// [`TaskContext::acquire_generation`] are tracked here so the executor can
/// release them whatever the task does.
pub struct TaskContext {
    task_run_id: TaskRunId,
    pipeline_run_id: Option<PipelineRunId>,
    upstream_task_run_id: Option<TaskRunId>,
    args: TaskArgs,
    session: Box<dyn UnitOfWork>,
    cache: Arc<dyn OutputCache>,
    locks: GenerationLock,
    held: Vec<String>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_run_id", &self.task_run_id)
            .field("pipeline_run_id", &self.pipeline_run_id)
            .field("upstream_task_run_id", &self.upstream_task_run_id)
            .field("held", &self.held)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    /// Creates a context around an open session.
    #[must_use]
    pub fn new(
        task_run_id: TaskRunId,
        args: TaskArgs,
        session: Box<dyn UnitOfWork>,
        cache: Arc<dyn OutputCache>,
        locks: GenerationLock,
    ) -> Self {
        Self {
            task_run_id,
            pipeline_run_id: None,
            upstream_task_run_id: None,
            args,
            session,
            cache,
            locks,
            held: Vec::new(),
        }
    }

    /// Sets the pipeline run.
    #[must_use]
    pub fn with_pipeline_run_id(mut self, id: Option<PipelineRunId>) -> Self {
        self.pipeline_run_id = id;
        self
    }

    /// Sets the upstream task run.
    #[must_use]
    pub fn with_upstream_task_run_id(mut self, id: Option<TaskRunId>) -> Self {
        self.upstream_task_run_id = id;
        self
    }

    /// The running task's record id.
    #[must_use]
    pub fn task_run_id(&self) -> TaskRunId {
        self.task_run_id
    }

    /// The pipeline run, if the task runs inside one.
    #[must_use]
    pub fn pipeline_run_id(&self) -> Option<&PipelineRunId> {
        self.pipeline_run_id.as_ref()
    }

    /// The upstream task run whose output this task consumes.
    #[must_use]
    pub fn upstream_task_run_id(&self) -> Option<TaskRunId> {
        self.upstream_task_run_id
    }

    /// All arguments.
    #[must_use]
    pub fn args(&self) -> &TaskArgs {
        &self.args
    }

    /// One argument.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// The transactional session. Writes here are rolled back on failure.
    pub fn session(&mut self) -> &mut dyn UnitOfWork {
        self.session.as_mut()
    }

    /// The output cache.
    #[must_use]
    pub fn cache(&self) -> &dyn OutputCache {
        self.cache.as_ref()
    }

    /// Reads the cached output of the upstream task run.
    ///
    /// Returns `None` unless the upstream record is committed as `SUCCESS`,
    /// so output cached ahead of a commit that later fails is never seen.
    pub async fn upstream_output(&self) -> Result<Option<Value>, TaskError> {
        let Some(id) = self.upstream_task_run_id else {
            return Ok(None);
        };
        let succeeded = self
            .session
            .load_task_run(id)
            .await?
            .is_some_and(|r| r.status.is_success());
        if !succeeded {
            return Ok(None);
        }
        Ok(self.cache.get(&task_output_key(id)).await?)
    }

    /// Claims the generation marker for `key`, remembering it for release.
    pub async fn acquire_generation(&mut self, key: &str) -> Result<(), LockError> {
        self.locks.try_acquire(key).await?;
        self.held.push(key.to_string());
        Ok(())
    }

    /// Releases a marker early. Markers still held when the task ends are
    /// released by the executor.
    pub async fn release_generation(&mut self, key: &str, success: bool) -> Result<(), CacheError> {
        self.held.retain(|k| k != key);
        self.locks.release(key, success).await
    }

    /// Keys whose generation markers this task still holds.
    #[must_use]
    pub fn held_generations(&self) -> &[String] {
        &self.held
    }

    pub(crate) async fn release_all_generations(&mut self, success: bool) {
        for key in std::mem::take(&mut self.held) {
            if let Err(e) = self.locks.release(&key, success).await {
                warn!(key = %key, error = %e, "Failed to release generation lock");
            }
        }
    }

    pub(crate) fn session_mut(&mut self) -> &mut Box<dyn UnitOfWork> {
        &mut self.session
    }
}
