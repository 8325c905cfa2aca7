//! Testing utilities for phenoflow pipelines.
//!
//! This module provides:
//! - Scripted tasks (succeeding, failing, failing validation, generating)
//! - A collecting notifier and a recording scheduler
//! - Runtimes wired to the in-memory database and cache

mod fixtures;
mod mocks;

pub use fixtures::{test_runtime, test_runtime_in, TestRuntime};
pub use mocks::{
    CollectingNotifier, FailingTask, GeneratingTask, Journal, RecordingScheduler, RecordingTask,
    TriggeredRun, ValidationFailingTask,
};
