//! Tasks and their execution.
//!
//! A [`Task`] is one unit of domain work. The [`TaskExecutor`] wraps every
//! task in the same lifecycle: persist a `STARTED` record, run, validate,
//! then either commit and cache the output or roll back and record the
//! failure.

mod context;
mod executor;
mod notifier;
mod registry;

pub use context::TaskContext;
pub use executor::{ExecutionRequest, TaskExecutor, TaskRunReport};
pub use notifier::{LoggingNotifier, NoOpNotifier, TaskNotifier};
pub use registry::{TaskFactory, TaskRegistry, RESERVED_ARGS};

use crate::errors::TaskError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;

/// Trait for units of domain work.
///
/// Every database write a task makes must go through
/// [`TaskContext::session`] so the executor can roll it back.
#[async_trait]
pub trait Task: Send + Sync + Debug {
    /// Performs the work.
    async fn process(&mut self, ctx: &mut TaskContext) -> Result<(), TaskError>;

    /// Whether [`Task::validate`] runs after a successful `process`.
    fn validates(&self) -> bool {
        true
    }

    /// Checks the results of `process`. A failure rolls the task back.
    async fn validate(&mut self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
        Ok(())
    }

    /// The JSON-serialisable result cached on success.
    fn output(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    /// Runs after the successful commit, e.g. to enqueue follow-on work.
    ///
    /// Writes made here are committed separately; an error is logged and
    /// does not change the task's status.
    async fn post_commit_actions(&mut self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
        Ok(())
    }
}
