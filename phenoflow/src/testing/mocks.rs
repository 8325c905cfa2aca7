//! Scripted tasks and collaborators for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{PipelineRunId, TaskRunId, TaskRunRecord};
use crate::errors::{NotifyError, SchedulerError, TaskError, TaskFailure};
use crate::pipeline::{Scheduler, TriggerConf};
use crate::task::{Task, TaskContext, TaskNotifier};

type RowWrite = (String, String, Value);

async fn apply_writes(ctx: &mut TaskContext, writes: &[RowWrite]) -> Result<(), TaskError> {
    for (table, key, value) in writes {
        ctx.session().put_row(table, key, value.clone()).await?;
    }
    Ok(())
}

/// Shared, ordered log of task events (`start:<name>`, `end:<name>`).
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    /// All events so far.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Index of the first occurrence of `event`.
    #[must_use]
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    /// Returns true if `event` was logged.
    #[must_use]
    pub fn contains(&self, event: &str) -> bool {
        self.position(event).is_some()
    }
}

/// A task that succeeds, optionally writing rows and logging to a journal.
///
/// Its output is `{"task": <name>}`.
#[derive(Debug)]
pub struct RecordingTask {
    name: String,
    writes: Vec<RowWrite>,
    journal: Option<Journal>,
    delay: Option<Duration>,
}

impl RecordingTask {
    /// Creates a recording task.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            writes: Vec::new(),
            journal: None,
            delay: None,
        }
    }

    /// Writes a row during `process`.
    #[must_use]
    pub fn with_write(mut self, table: &str, key: &str, value: Value) -> Self {
        self.writes.push((table.to_string(), key.to_string(), value));
        self
    }

    /// Logs start and end events to `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Sleeps for `delay` inside `process`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Task for RecordingTask {
    async fn process(&mut self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        if let Some(journal) = &self.journal {
            journal.push(format!("start:{}", self.name));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        apply_writes(ctx, &self.writes).await?;
        if let Some(journal) = &self.journal {
            journal.push(format!("end:{}", self.name));
        }
        Ok(())
    }

    fn output(&self) -> Value {
        json!({ "task": self.name })
    }
}

/// A task whose `process` raises an unhandled error after its writes.
#[derive(Debug)]
pub struct FailingTask {
    message: String,
    writes: Vec<RowWrite>,
}

impl FailingTask {
    /// Creates a failing task.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            writes: Vec::new(),
        }
    }

    /// Writes a row before failing.
    #[must_use]
    pub fn with_write(mut self, table: &str, key: &str, value: Value) -> Self {
        self.writes.push((table.to_string(), key.to_string(), value));
        self
    }
}

#[async_trait]
impl Task for FailingTask {
    async fn process(&mut self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        apply_writes(ctx, &self.writes).await?;
        Err(TaskError::unhandled(self.message.clone()))
    }
}

/// A task whose `process` succeeds and whose `validate` fails.
#[derive(Debug)]
pub struct ValidationFailingTask {
    message: String,
    writes: Vec<RowWrite>,
    validates: bool,
}

impl ValidationFailingTask {
    /// Creates the task.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            writes: Vec::new(),
            validates: true,
        }
    }

    /// Writes a row during `process`.
    #[must_use]
    pub fn with_write(mut self, table: &str, key: &str, value: Value) -> Self {
        self.writes.push((table.to_string(), key.to_string(), value));
        self
    }

    /// Opts out of validation, so the task succeeds.
    #[must_use]
    pub fn without_validation(mut self) -> Self {
        self.validates = false;
        self
    }
}

#[async_trait]
impl Task for ValidationFailingTask {
    async fn process(&mut self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        apply_writes(ctx, &self.writes).await
    }

    fn validates(&self) -> bool {
        self.validates
    }

    async fn validate(&mut self, _ctx: &mut TaskContext) -> Result<(), TaskError> {
        Err(TaskError::validation(self.message.clone()))
    }
}

/// A task that builds a derived cache value under a generation lock.
#[derive(Debug)]
pub struct GeneratingTask {
    key: String,
    fail: bool,
}

impl GeneratingTask {
    /// Creates a task generating `key`.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fail: false,
        }
    }

    /// Fails after writing the value.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl Task for GeneratingTask {
    async fn process(&mut self, ctx: &mut TaskContext) -> Result<(), TaskError> {
        ctx.acquire_generation(&self.key).await?;
        ctx.cache()
            .set(&self.key, json!({ "generated": self.key }), None)
            .await?;
        if self.fail {
            return Err(TaskError::unhandled(format!("generation of {} failed", self.key)));
        }
        Ok(())
    }
}

/// Notifier that remembers which records it was told about.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    successes: Mutex<Vec<TaskRunId>>,
    failures: Mutex<Vec<TaskRunId>>,
}

impl CollectingNotifier {
    /// Creates an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records notified as successful.
    #[must_use]
    pub fn successes(&self) -> Vec<TaskRunId> {
        self.successes.lock().clone()
    }

    /// Records notified as failed.
    #[must_use]
    pub fn failures(&self) -> Vec<TaskRunId> {
        self.failures.lock().clone()
    }
}

#[async_trait]
impl TaskNotifier for CollectingNotifier {
    async fn task_succeeded(&self, record: &TaskRunRecord, _output: &Value) -> Result<(), NotifyError> {
        self.successes.lock().push(record.id);
        Ok(())
    }

    async fn task_failed(&self, record: &TaskRunRecord, _failure: &TaskFailure) -> Result<(), NotifyError> {
        self.failures.lock().push(record.id);
        Ok(())
    }
}

/// One recorded trigger.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredRun {
    /// Pipeline name.
    pub pipeline: String,
    /// Run id.
    pub run_id: PipelineRunId,
    /// The conf sent.
    pub conf: TriggerConf,
}

/// In-memory scheduler that records what it is asked to do.
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    unregistered_polls: AtomicUsize,
    polls: AtomicUsize,
    reject_triggers: AtomicBool,
    triggers: Mutex<Vec<TriggeredRun>>,
    paused: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
}

impl RecordingScheduler {
    /// A scheduler that reports every pipeline as registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports "not registered" for the first `polls` checks.
    #[must_use]
    pub fn registered_after(polls: usize) -> Self {
        Self {
            unregistered_polls: AtomicUsize::new(polls),
            ..Self::default()
        }
    }

    /// Makes every trigger fail.
    pub fn reject_triggers(&self) {
        self.reject_triggers.store(true, Ordering::SeqCst);
    }

    /// Number of registration checks so far.
    #[must_use]
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Accepted triggers.
    #[must_use]
    pub fn triggers(&self) -> Vec<TriggeredRun> {
        self.triggers.lock().clone()
    }

    /// Paused pipelines.
    #[must_use]
    pub fn paused(&self) -> Vec<String> {
        self.paused.lock().clone()
    }

    /// Deleted pipelines.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn is_registered(&self, _pipeline: &str) -> Result<bool, SchedulerError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .unregistered_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(!pending)
    }

    async fn trigger(
        &self,
        pipeline: &str,
        run_id: &PipelineRunId,
        conf: &TriggerConf,
    ) -> Result<(), SchedulerError> {
        if self.reject_triggers.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rejected {
                pipeline: pipeline.to_string(),
                reason: "triggers disabled".to_string(),
            });
        }
        self.triggers.lock().push(TriggeredRun {
            pipeline: pipeline.to_string(),
            run_id: run_id.clone(),
            conf: conf.clone(),
        });
        Ok(())
    }

    async fn pause(&self, pipeline: &str) -> Result<(), SchedulerError> {
        self.paused.lock().push(pipeline.to_string());
        Ok(())
    }

    async fn delete(&self, pipeline: &str) -> Result<(), SchedulerError> {
        self.deleted.lock().push(pipeline.to_string());
        Ok(())
    }
}
