//! The task-run state machine.

use super::{Task, TaskContext};
use crate::cache::GenerationLock;
use crate::core::{
    task_output_key, PipelineId, PipelineRunId, TaskArgs, TaskRunId, TaskRunRecord, TaskRunStatus,
};
use crate::errors::{PhenoflowError, TaskError, TaskFailure};
use crate::observability::task_run_span;
use crate::runtime::RuntimeContext;
use crate::store::{RecordStore, UnitOfWork};
use crate::utils::now_utc;
use serde_json::Value;
use tracing::{debug, error, info, warn, Instrument};

/// Everything needed to start (or restart) one task run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// Reuse this record id; a matching existing record makes this a rerun.
    pub task_run_id: Option<TaskRunId>,
    /// Owning pipeline.
    pub pipeline_id: Option<PipelineId>,
    /// Owning pipeline run.
    pub pipeline_run_id: Option<PipelineRunId>,
    /// Node id inside the pipeline.
    pub task_id: Option<String>,
    /// Registry module.
    pub module_name: String,
    /// Registry class.
    pub class_name: String,
    /// Arguments recorded on the task run.
    pub args: TaskArgs,
    /// Task run whose output this one consumes.
    pub upstream_task_run_id: Option<TaskRunId>,
    /// User to notify.
    pub username: Option<String>,
}

impl ExecutionRequest {
    /// Creates a request for a task class.
    #[must_use]
    pub fn new(module_name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    /// Sets the record id to use.
    #[must_use]
    pub fn with_task_run_id(mut self, id: TaskRunId) -> Self {
        self.task_run_id = Some(id);
        self
    }

    /// Sets the pipeline.
    #[must_use]
    pub fn with_pipeline_id(mut self, id: Option<PipelineId>) -> Self {
        self.pipeline_id = id;
        self
    }

    /// Sets the pipeline run.
    #[must_use]
    pub fn with_pipeline_run_id(mut self, id: PipelineRunId) -> Self {
        self.pipeline_run_id = Some(id);
        self
    }

    /// Sets the node id.
    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    /// Sets the upstream task run.
    #[must_use]
    pub fn with_upstream_task_run_id(mut self, id: Option<TaskRunId>) -> Self {
        self.upstream_task_run_id = id;
        self
    }

    /// Sets the user to notify.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    fn apply_to(&self, record: &mut TaskRunRecord) {
        record.pipeline_id = self.pipeline_id.or(record.pipeline_id);
        if self.pipeline_run_id.is_some() {
            record.pipeline_run_id.clone_from(&self.pipeline_run_id);
        }
        if self.task_id.is_some() {
            record.task_id.clone_from(&self.task_id);
        }
        record.module_name.clone_from(&self.module_name);
        record.class_name.clone_from(&self.class_name);
        record.args.clone_from(&self.args);
        record.upstream_task_run_id = self.upstream_task_run_id.or(record.upstream_task_run_id);
        if self.username.is_some() {
            record.username.clone_from(&self.username);
        }
    }
}

/// Outcome of one execution.
///
/// Task failures are reported here, not as an `Err`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRunReport {
    /// The record in its terminal state.
    pub record: TaskRunRecord,
    /// The output as read back from the cache; `None` on failure.
    pub output: Option<Value>,
}

impl TaskRunReport {
    /// Returns true when the task succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.record.status == TaskRunStatus::Success
    }

    /// The recorded failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&TaskFailure> {
        self.record.error.as_ref()
    }

    /// The output on success, the failure otherwise.
    pub fn into_result(self) -> Result<Value, TaskFailure> {
        match (self.record.error, self.output) {
            (Some(failure), _) => Err(failure),
            (None, output) => Ok(output.unwrap_or(Value::Null)),
        }
    }
}

/// Runs tasks through the record/commit/rollback lifecycle.
///
/// Returns `Err` only for infrastructure failures (store or cache) that
/// leave no trustworthy record behind.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    runtime: RuntimeContext,
}

impl TaskExecutor {
    /// Creates an executor over the given runtime.
    #[must_use]
    pub fn new(runtime: RuntimeContext) -> Self {
        Self { runtime }
    }

    /// The runtime this executor uses.
    #[must_use]
    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    /// Executes `task` under the lifecycle.
    pub async fn execute(
        &self,
        task: Box<dyn Task>,
        request: ExecutionRequest,
    ) -> Result<TaskRunReport, PhenoflowError> {
        let mut session = self.runtime.database().begin().await?;
        let record = self.start(session.as_mut(), &request).await?;
        let span = task_run_span(&record);
        self.run_started(task, record, session).instrument(span).await
    }

    /// Records a task that could not even be constructed as an `ERROR` run.
    pub async fn record_rejection(
        &self,
        request: ExecutionRequest,
        err: &TaskError,
    ) -> Result<TaskRunReport, PhenoflowError> {
        let mut session = self.runtime.database().begin().await?;
        let mut record = self.start(session.as_mut(), &request).await?;
        let failure = err.to_failure();
        warn!(
            task_run_id = %record.id,
            task = %record.qualified_name(),
            error = %err,
            "Task rejected its arguments"
        );
        record.fail(failure.clone(), now_utc());
        session.save_task_run(&record).await?;
        session.commit().await?;
        self.notify_failure(&record, &failure).await;
        Ok(TaskRunReport {
            record,
            output: None,
        })
    }

    /// Inserts or resets the record as `STARTED` and commits it.
    async fn start(
        &self,
        session: &mut dyn UnitOfWork,
        request: &ExecutionRequest,
    ) -> Result<TaskRunRecord, PhenoflowError> {
        let now = now_utc();
        let existing = match request.task_run_id {
            Some(id) => session.load_task_run(id).await?,
            None => None,
        };

        let record = match existing {
            Some(mut record) => {
                self.purge_previous_output(record.id).await?;
                request.apply_to(&mut record);
                record.restart(now);
                info!(task_run_id = %record.id, task = %record.qualified_name(), "Rerunning task");
                record
            }
            None => {
                let id = request.task_run_id.unwrap_or_default();
                let mut record = TaskRunRecord::new(
                    id,
                    request.module_name.clone(),
                    request.class_name.clone(),
                    TaskRunStatus::Started,
                    now,
                );
                request.apply_to(&mut record);
                debug!(task_run_id = %record.id, task = %record.qualified_name(), "Starting task");
                record
            }
        };

        session.save_task_run(&record).await?;
        session.commit().await?;
        Ok(record)
    }

    async fn purge_previous_output(&self, id: TaskRunId) -> Result<(), PhenoflowError> {
        let cache = self.runtime.cache();
        cache.delete(&task_output_key(id)).await?;
        for prefix in &self.runtime.config().cache.rerun_purge_prefixes {
            cache.delete(&format!("{prefix}{id}")).await?;
        }
        Ok(())
    }

    async fn run_started(
        &self,
        mut task: Box<dyn Task>,
        mut record: TaskRunRecord,
        session: Box<dyn UnitOfWork>,
    ) -> Result<TaskRunReport, PhenoflowError> {
        let cache_config = &self.runtime.config().cache;
        let locks = GenerationLock::new(self.runtime.cache_handle())
            .with_prefix(cache_config.generation_lock_prefix.clone())
            .with_ttl(cache_config.generation_lock_ttl());
        let mut ctx = TaskContext::new(
            record.id,
            record.args.clone(),
            session,
            self.runtime.cache_handle(),
            locks,
        )
        .with_pipeline_run_id(record.pipeline_run_id.clone())
        .with_upstream_task_run_id(record.upstream_task_run_id);

        let mut outcome = task.process(&mut ctx).await;
        if outcome.is_ok() && task.validates() {
            outcome = task.validate(&mut ctx).await;
        }

        match outcome {
            Ok(()) => self.complete(task, record, ctx).await,
            Err(err) => {
                self.fail(&mut record, &mut ctx, &err).await?;
                Ok(TaskRunReport {
                    record,
                    output: None,
                })
            }
        }
    }

    async fn complete(
        &self,
        mut task: Box<dyn Task>,
        mut record: TaskRunRecord,
        mut ctx: TaskContext,
    ) -> Result<TaskRunReport, PhenoflowError> {
        // The output is cached before the commit. Until the SUCCESS row is
        // committed, readers going through `TaskContext::upstream_output`
        // see nothing; direct cache readers must check the record first.
        let key = record.output_key();
        let ttl = self.runtime.config().cache.task_output_ttl();
        self.runtime.cache().set(&key, task.output(), ttl).await?;

        record.succeed(now_utc());
        ctx.session_mut().save_task_run(&record).await?;
        if let Err(e) = ctx.session_mut().commit().await {
            // Nothing of this attempt may stay visible.
            if let Err(cache_err) = self.runtime.cache().delete(&key).await {
                error!(
                    task_run_id = %record.id,
                    key = %key,
                    error = %cache_err,
                    "Stray output left in cache after commit failure"
                );
            }
            let err = TaskError::Unhandled(anyhow::Error::new(e).context("commit failed"));
            self.fail(&mut record, &mut ctx, &err).await?;
            return Ok(TaskRunReport {
                record,
                output: None,
            });
        }
        ctx.release_all_generations(true).await;

        info!(
            status = %record.status,
            run_time_seconds = record.run_time_seconds.unwrap_or_default(),
            "Task succeeded"
        );

        match task.post_commit_actions(&mut ctx).await {
            Ok(()) => {
                if let Err(e) = ctx.session_mut().commit().await {
                    warn!(error = %e, "Failed to commit post-commit writes");
                }
            }
            Err(e) => {
                warn!(error = %e, "Post-commit actions failed");
                if let Err(e) = ctx.session_mut().rollback().await {
                    warn!(error = %e, "Failed to roll back post-commit writes");
                }
            }
        }
        ctx.release_all_generations(true).await;

        let output = self.runtime.cache().get(&key).await?;
        if let Some(output) = &output {
            self.notify_success(&record, output).await;
        }
        Ok(TaskRunReport { record, output })
    }

    async fn fail(
        &self,
        record: &mut TaskRunRecord,
        ctx: &mut TaskContext,
        err: &TaskError,
    ) -> Result<(), PhenoflowError> {
        let rolled_back = ctx.session_mut().rollback().await;
        ctx.release_all_generations(false).await;
        rolled_back?;

        match err {
            TaskError::Validation(v) => {
                warn!(task = %record.qualified_name(), error = %v, "Task failed validation");
            }
            TaskError::Unhandled(e) => {
                error!(task = %record.qualified_name(), error = ?e, "Unhandled task error");
            }
        }

        let failure = err.to_failure();
        record.fail(failure.clone(), now_utc());
        ctx.session_mut().save_task_run(record).await?;
        ctx.session_mut().commit().await?;
        self.notify_failure(record, &failure).await;
        Ok(())
    }

    async fn notify_success(&self, record: &TaskRunRecord, output: &Value) {
        if let Err(e) = self.runtime.notifier().task_succeeded(record, output).await {
            warn!(task_run_id = %record.id, error = %e, "Success notification failed");
        }
    }

    async fn notify_failure(&self, record: &TaskRunRecord, failure: &TaskFailure) {
        if let Err(e) = self.runtime.notifier().task_failed(record, failure).await {
            warn!(task_run_id = %record.id, error = %e, "Failure notification failed");
        }
    }
}
