//! The external scheduler seam.

use crate::core::{PipelineRunId, TaskArgs, TaskRunId};
use crate::errors::{PhenoflowError, SchedulerError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-node invocations keyed by task id, as sent with a trigger.
pub type TriggerConf = serde_json::Map<String, Value>;

/// A scheduler that can host compiled pipelines and fire their nodes.
///
/// The scheduler calls back into
/// [`PipelineRunner::handle_invocation`](super::PipelineRunner::handle_invocation)
/// when a node fires.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Whether the scheduler has picked up the pipeline's artifact.
    async fn is_registered(&self, pipeline: &str) -> Result<bool, SchedulerError>;

    /// Starts a run with per-node configuration.
    async fn trigger(
        &self,
        pipeline: &str,
        run_id: &PipelineRunId,
        conf: &TriggerConf,
    ) -> Result<(), SchedulerError>;

    /// Stops scheduling new runs.
    async fn pause(&self, pipeline: &str) -> Result<(), SchedulerError>;

    /// Forgets the pipeline.
    async fn delete(&self, pipeline: &str) -> Result<(), SchedulerError>;
}

/// What the scheduler hands back when a node fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerInvocation {
    /// The node that fired.
    #[serde(skip)]
    pub task_id: String,
    /// The record created at dispatch.
    pub task_run_id: TaskRunId,
    /// The run the node belongs to.
    pub pipeline_run_id: PipelineRunId,
    /// The upstream node's record, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_task_run_id: Option<TaskRunId>,
    /// User notified when the node finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Merged task arguments.
    #[serde(flatten)]
    pub args: TaskArgs,
}

impl SchedulerInvocation {
    /// Reads one node's entry of a [`TriggerConf`].
    pub fn from_conf(task_id: &str, entry: &Value) -> Result<Self, PhenoflowError> {
        let mut invocation: Self =
            serde_json::from_value(entry.clone()).map_err(|e| PhenoflowError::InvalidRunConfig {
                task_id: task_id.to_string(),
                reason: e.to_string(),
            })?;
        invocation.task_id = task_id.to_string();
        Ok(invocation)
    }

    /// The invocation as a conf entry.
    pub fn to_conf(&self) -> Result<Value, PhenoflowError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Arguments for the task factory, identifiers included.
    #[must_use]
    pub fn task_args(&self) -> TaskArgs {
        let mut args = self.args.clone();
        args.insert("task_run_id".to_string(), Value::String(self.task_run_id.to_string()));
        args.insert(
            "pipeline_run_id".to_string(),
            Value::String(self.pipeline_run_id.to_string()),
        );
        if let Some(upstream) = self.upstream_task_run_id {
            args.insert("upstream_task_run_id".to_string(), Value::String(upstream.to_string()));
        }
        args
    }
}
