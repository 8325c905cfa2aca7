//! The persisted task-run record.

use super::{PipelineId, PipelineRunId, TaskArgs, TaskRunId, TaskRunStatus};
use crate::errors::TaskFailure;
use crate::utils::{elapsed_seconds, Timestamp};
use serde::{Deserialize, Serialize};

/// Prefix of every task output cache key.
pub const TASK_OUTPUT_PREFIX: &str = "TaskOutput::";

/// Returns the cache key a task run's output is stored under.
#[must_use]
pub fn task_output_key(id: TaskRunId) -> String {
    format!("{TASK_OUTPUT_PREFIX}{id}")
}

/// Persistent state of a single task execution.
///
/// The `id` is stable across reruns; a rerun mutates this record in place
/// rather than inserting a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    /// Stable identity.
    pub id: TaskRunId,
    /// The pipeline this run belongs to, if any.
    #[serde(default)]
    pub pipeline_id: Option<PipelineId>,
    /// The pipeline run this record was produced by, if any.
    #[serde(default)]
    pub pipeline_run_id: Option<PipelineRunId>,
    /// The node id inside the pipeline, if any.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Module the task class is registered under.
    pub module_name: String,
    /// Task class name.
    pub class_name: String,
    /// Arguments the task was constructed with.
    #[serde(default)]
    pub args: TaskArgs,
    /// The task run whose output this run consumes.
    #[serde(default)]
    pub upstream_task_run_id: Option<TaskRunId>,
    /// Current status.
    pub status: TaskRunStatus,
    /// User to notify on completion.
    #[serde(default)]
    pub username: Option<String>,
    /// When the current attempt began.
    pub datetime_started: Timestamp,
    /// When the current attempt reached a terminal state.
    #[serde(default)]
    pub datetime_finished: Option<Timestamp>,
    /// Wall time of the current attempt.
    #[serde(default)]
    pub run_time_seconds: Option<f64>,
    /// Cache key holding the output; set only on success.
    #[serde(default)]
    pub output_cache_key: Option<String>,
    /// Failure details; set only on error.
    #[serde(default)]
    pub error: Option<TaskFailure>,
}

impl TaskRunRecord {
    /// Creates a record in the given status, started now.
    #[must_use]
    pub fn new(
        id: TaskRunId,
        module_name: impl Into<String>,
        class_name: impl Into<String>,
        status: TaskRunStatus,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            pipeline_id: None,
            pipeline_run_id: None,
            task_id: None,
            module_name: module_name.into(),
            class_name: class_name.into(),
            args: TaskArgs::new(),
            upstream_task_run_id: None,
            status,
            username: None,
            datetime_started: now,
            datetime_finished: None,
            run_time_seconds: None,
            output_cache_key: None,
            error: None,
        }
    }

    /// `module.Class`, the registry key of this record's task.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module_name, self.class_name)
    }

    /// The cache key this record's output lives under once successful.
    #[must_use]
    pub fn output_key(&self) -> String {
        task_output_key(self.id)
    }

    /// Resets the record for a new attempt: `STARTED`, fresh start time,
    /// previous outcome cleared.
    pub fn restart(&mut self, now: Timestamp) {
        self.status = TaskRunStatus::Started;
        self.datetime_started = now;
        self.datetime_finished = None;
        self.run_time_seconds = None;
        self.output_cache_key = None;
        self.error = None;
    }

    /// Resets the record to `SCHEDULED` for a scheduler-driven rerun,
    /// previous outcome cleared.
    pub fn schedule(&mut self, now: Timestamp) {
        self.restart(now);
        self.status = TaskRunStatus::Scheduled;
    }

    /// Marks the record successful.
    pub fn succeed(&mut self, now: Timestamp) {
        self.finish(TaskRunStatus::Success, now);
        self.output_cache_key = Some(self.output_key());
        self.error = None;
    }

    /// Marks the record failed.
    pub fn fail(&mut self, failure: TaskFailure, now: Timestamp) {
        self.finish(TaskRunStatus::Error, now);
        self.output_cache_key = None;
        self.error = Some(failure);
    }

    fn finish(&mut self, status: TaskRunStatus, now: Timestamp) {
        self.status = status;
        self.datetime_finished = Some(now);
        self.run_time_seconds = Some(elapsed_seconds(self.datetime_started, now));
    }

    /// A `STARTED` record older than `max_age` is stale: the process that
    /// owned it is presumed dead.
    #[must_use]
    pub fn is_stale(&self, now: Timestamp, max_age: chrono::Duration) -> bool {
        self.status == TaskRunStatus::Started && now - self.datetime_started > max_age
    }
}
