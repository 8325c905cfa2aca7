//! Spans carrying the identifiers every log line inside a run should have.

use crate::core::{PipelineRunId, TaskRunRecord};
use tracing::{info_span, Span};

/// Span for one task execution.
#[must_use]
pub fn task_run_span(record: &TaskRunRecord) -> Span {
    info_span!(
        "task_run",
        task_run_id = %record.id,
        task = %record.qualified_name(),
        task_id = record.task_id.as_deref().unwrap_or(""),
        pipeline_run_id = record.pipeline_run_id.as_ref().map_or("", PipelineRunId::as_str),
    )
}

/// Span for one pipeline run.
#[must_use]
pub fn pipeline_run_span(pipeline: &str, run_id: &PipelineRunId) -> Span {
    info_span!("pipeline_run", pipeline, run_id = run_id.as_str())
}
