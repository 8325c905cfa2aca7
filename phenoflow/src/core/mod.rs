//! Core domain model types for phenoflow.
//!
//! This module contains the persisted shapes shared by the executor,
//! compiler and runner:
//! - Task-run status
//! - Typed identifiers
//! - Task-run and pipeline records

mod ids;
mod pipeline_record;
mod record;
mod status;

pub use ids::{PipelineId, PipelineRunId, TaskRunId};
pub use pipeline_record::PipelineRecord;
pub use record::{task_output_key, TaskRunRecord, TASK_OUTPUT_PREFIX};
pub use status::TaskRunStatus;

/// Keyword arguments handed to a task: a JSON object with stable key order.
pub type TaskArgs = serde_json::Map<String, serde_json::Value>;
