//! Pipeline definition, compilation and execution.
//!
//! This module provides:
//! - Pipeline definitions and node specifications
//! - The dependency graph and its deterministic ordering
//! - The compiler that persists definitions as artifacts
//! - The runner, in process or through an external scheduler

mod compiler;
mod dag;
mod run_config;
mod runner;
mod scheduler;
mod spec;

#[cfg(test)]
mod integration_tests;

pub use compiler::{CommitOutcome, PipelineCompiler, RenderedArtifact};
pub use dag::DependencyGraph;
pub use run_config::{merge_args, parse_run_config, NodeOverride, RunConfig};
pub use runner::{DispatchReceipt, NodeOutcome, PipelineRunResult, PipelineRunner, SkipReason};
pub use scheduler::{Scheduler, SchedulerInvocation, TriggerConf};
pub use spec::{clean_task_id, DependencyEdge, PipelineDefinition, TaskSpec, FACTORY_TAG};
