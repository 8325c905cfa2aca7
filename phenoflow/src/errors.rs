//! Error types for the phenoflow engine.
//!
//! Two families live here. Task errors (`TaskError`) are raised by task
//! authors and are turned into data by the executor: they end up in an
//! `ERROR` task-run record, never in a returned `Err`. Everything else
//! (definition, store, cache, scheduler, config) is infrastructure and
//! folds into [`PhenoflowError`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for phenoflow operations.
#[derive(Debug, Error)]
pub enum PhenoflowError {
    /// A pipeline definition is malformed.
    #[error("{0}")]
    Definition(#[from] DefinitionError),

    /// The database unit of work failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The output cache failed.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// The external scheduler failed or rejected a request.
    #[error("{0}")]
    Scheduler(#[from] SchedulerError),

    /// Engine configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A generation lock is already held.
    #[error("{0}")]
    AlreadyGenerating(#[from] AlreadyGeneratingError),

    /// A run config references a task id the pipeline does not contain.
    #[error("Pipeline '{pipeline}' has no task '{task_id}'")]
    UnknownTaskId {
        /// The pipeline name.
        pipeline: String,
        /// The offending task id.
        task_id: String,
    },

    /// No committed pipeline has this name.
    #[error("Pipeline '{0}' not found")]
    PipelineNotFound(String),

    /// No task is registered under the given module and class.
    #[error("No task registered as '{0}'")]
    TaskNotRegistered(String),

    /// The scheduler never reported the pipeline as registered.
    #[error("Pipeline '{pipeline}' not registered with the scheduler after {attempts} attempts")]
    NotRegistered {
        /// The pipeline name.
        pipeline: String,
        /// How many times registration was polled.
        attempts: u32,
    },

    /// A run config entry could not be interpreted.
    #[error("Invalid run config for task '{task_id}': {reason}")]
    InvalidRunConfig {
        /// The task id the entry belongs to.
        task_id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A node's worker panicked or was cancelled before reporting.
    #[error("Task '{task_id}' aborted: {reason}")]
    NodeAborted {
        /// The node.
        task_id: String,
        /// Join error text.
        reason: String,
    },

    /// A run stopped scheduling after a node failed outside the task
    /// lifecycle; nodes already in flight were awaited first.
    #[error("Pipeline '{pipeline}' stopped at task '{task_id}': {source}")]
    RunAborted {
        /// The pipeline name.
        pipeline: String,
        /// The node whose failure stopped the run.
        task_id: String,
        /// Nodes that reached a terminal outcome, in completion order.
        finished: Vec<String>,
        /// What went wrong.
        source: Box<PhenoflowError>,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PhenoflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<LockError> for PhenoflowError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyGenerating(e) => Self::AlreadyGenerating(e),
            LockError::Cache(e) => Self::Cache(e),
        }
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONTRACT-PF-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while building or validating a pipeline definition.
#[derive(Debug, Clone, Error)]
pub enum DefinitionError {
    /// A task id is used twice.
    #[error("{0}")]
    DuplicateTaskId(#[from] DuplicateTaskIdError),

    /// An upstream reference points at a node that does not exist.
    #[error("{0}")]
    DanglingDependency(#[from] DanglingDependencyError),

    /// The dependency graph contains a cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A task id is not usable as an identifier.
    #[error("{0}")]
    InvalidTaskId(#[from] InvalidTaskIdError),

    /// A pipeline-level setting is out of range.
    #[error("Invalid pipeline setting '{field}': {message}")]
    InvalidSetting {
        /// The setting name.
        field: String,
        /// Why it was rejected.
        message: String,
    },
}

impl DefinitionError {
    /// Creates an invalid setting error.
    #[must_use]
    pub fn invalid_setting(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns the contract diagnostics, when the variant carries them.
    #[must_use]
    pub fn error_info(&self) -> Option<&ContractErrorInfo> {
        match self {
            Self::DuplicateTaskId(e) => Some(&e.error_info),
            Self::DanglingDependency(e) => Some(&e.error_info),
            Self::CycleDetected(e) => Some(&e.error_info),
            Self::InvalidTaskId(e) => Some(&e.error_info),
            Self::InvalidSetting { .. } => None,
        }
    }
}

/// Error raised when a task id already exists in the definition.
#[derive(Debug, Clone, Error)]
#[error("Duplicate task id '{task_id}' in pipeline '{pipeline}'")]
pub struct DuplicateTaskIdError {
    /// The pipeline name.
    pub pipeline: String,
    /// The duplicated id.
    pub task_id: String,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl DuplicateTaskIdError {
    /// Creates a new duplicate task id error.
    #[must_use]
    pub fn new(pipeline: impl Into<String>, task_id: impl Into<String>) -> Self {
        let pipeline = pipeline.into();
        let task_id = task_id.into();
        let info = ContractErrorInfo::new(
            "CONTRACT-PF-DUPLICATE",
            format!("Task id '{task_id}' is already defined"),
        )
        .with_fix_hint("Pass an explicit, unique task_id for each node.")
        .with_context_entry("pipeline", pipeline.clone());

        Self {
            pipeline,
            task_id,
            error_info: info,
        }
    }
}

/// Error raised when a dependency names a task that is not in the definition.
#[derive(Debug, Clone, Error)]
#[error("Dependency '{upstream_task_id}' -> '{task_id}' references unknown task '{missing_task_id}'")]
pub struct DanglingDependencyError {
    /// The dependent (downstream) side of the edge.
    pub task_id: String,
    /// The upstream side of the edge.
    pub upstream_task_id: String,
    /// Whichever of the two does not exist.
    pub missing_task_id: String,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl DanglingDependencyError {
    /// Creates an error for an edge whose upstream does not exist.
    #[must_use]
    pub fn new(task_id: impl Into<String>, upstream_task_id: impl Into<String>) -> Self {
        let upstream_task_id = upstream_task_id.into();
        Self::build(task_id.into(), upstream_task_id.clone(), upstream_task_id)
    }

    /// Creates an error for an edge whose downstream does not exist.
    #[must_use]
    pub fn missing_downstream(task_id: impl Into<String>, upstream_task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self::build(task_id.clone(), upstream_task_id.into(), task_id)
    }

    fn build(task_id: String, upstream_task_id: String, missing_task_id: String) -> Self {
        let info = ContractErrorInfo::new(
            "CONTRACT-PF-DANGLING",
            format!("Task '{missing_task_id}' in dependency '{upstream_task_id}' -> '{task_id}' does not exist"),
        )
        .with_fix_hint("Add both tasks before declaring a dependency between them.")
        .with_context_entry("missing", missing_task_id.clone());

        Self {
            task_id,
            upstream_task_id,
            missing_task_id,
            error_info: info,
        }
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of tasks forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "CONTRACT-PF-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when a task id cannot be used.
#[derive(Debug, Clone, Error)]
#[error("Invalid task id '{task_id}': {reason}")]
pub struct InvalidTaskIdError {
    /// The rejected id.
    pub task_id: String,
    /// Why it was rejected.
    pub reason: String,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl InvalidTaskIdError {
    /// Creates a new invalid task id error.
    #[must_use]
    pub fn new(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let reason = reason.into();
        let info = ContractErrorInfo::new("CONTRACT-PF-TASK-ID", reason.clone())
            .with_fix_hint("Task ids must not be empty and must not start with a digit.");

        Self {
            task_id,
            reason,
            error_info: info,
        }
    }
}

/// A failure reported by a task's `validate` step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationFailure {
    /// Human-readable description.
    pub message: String,
}

impl ValidationFailure {
    /// Creates a new validation failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors a task may raise from `process`, `validate` or its constructor.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task ran but its results failed validation.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    /// Anything else the task author did not handle.
    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

impl TaskError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(ValidationFailure::new(message))
    }

    /// Creates an unhandled error from a message.
    #[must_use]
    pub fn unhandled(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Unhandled(anyhow::Error::msg(message))
    }

    /// Returns the failure kind.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) => FailureKind::Validation,
            Self::Unhandled(_) => FailureKind::Unhandled,
        }
    }

    /// Converts into the serialisable failure stored on a record.
    #[must_use]
    pub fn to_failure(&self) -> TaskFailure {
        match self {
            Self::Validation(v) => TaskFailure::new(FailureKind::Validation, v.message.clone()),
            Self::Unhandled(e) => TaskFailure::new(FailureKind::Unhandled, e.to_string())
                .with_detail(format!("{e:#}")),
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        Self::Unhandled(anyhow::Error::new(err))
    }
}

impl From<CacheError> for TaskError {
    fn from(err: CacheError) -> Self {
        Self::Unhandled(anyhow::Error::new(err))
    }
}

impl From<LockError> for TaskError {
    fn from(err: LockError) -> Self {
        Self::Unhandled(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unhandled(anyhow::Error::new(err))
    }
}

/// The category of a recorded task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Output failed validation.
    Validation,
    /// Unhandled error during processing.
    Unhandled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Unhandled => write!(f, "unhandled"),
        }
    }
}

/// A task failure as persisted on its task-run record.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} failure: {message}")]
pub struct TaskFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Top-level message.
    pub message: String,
    /// Full error chain for unhandled failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TaskFailure {
    /// Creates a new failure.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Attaches the full error chain.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Errors from a database unit of work.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A stored row could not be decoded or encoded.
    #[error("Store serialization error in '{table}': {message}")]
    Serialization {
        /// The table involved.
        table: String,
        /// Decoder message.
        message: String,
    },

    /// The commit was rejected.
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// The backend is unavailable.
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a serialization error for a table.
    #[must_use]
    pub fn serialization(table: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Serialization {
            table: table.into(),
            message: err.to_string(),
        }
    }
}

/// Errors from the output cache.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// A cached value could not be encoded or decoded.
    #[error("Cache serialization error for '{key}': {message}")]
    Serialization {
        /// The key involved.
        key: String,
        /// Decoder message.
        message: String,
    },

    /// The backend is unavailable.
    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Error returned when a generation lock is already held.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Output '{key}' is already being generated")]
pub struct AlreadyGeneratingError {
    /// The guarded output key.
    pub key: String,
}

impl AlreadyGeneratingError {
    /// Creates a new already-generating error.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Errors from acquiring a generation lock.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// Another producer holds the marker.
    #[error("{0}")]
    AlreadyGenerating(#[from] AlreadyGeneratingError),

    /// The cache failed underneath the lock.
    #[error("{0}")]
    Cache(#[from] CacheError),
}

/// Errors from the external scheduler.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// No scheduler was configured on this runner.
    #[error("No scheduler configured")]
    NotConfigured,

    /// The scheduler could not be reached.
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),

    /// The scheduler refused the request.
    #[error("Scheduler rejected request for '{pipeline}': {reason}")]
    Rejected {
        /// The pipeline name.
        pipeline: String,
        /// Rejection reason.
        reason: String,
    },
}

/// Error returned by a notifier. Never fails a task.
#[derive(Debug, Clone, Error)]
#[error("Notification failed: {0}")]
pub struct NotifyError(pub String);

/// Errors loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        /// The path that was read.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for the schema.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// An override or field holds an unusable value.
    #[error("Invalid config value for '{key}': {value}")]
    InvalidValue {
        /// The dotted key.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// A required runtime collaborator was not supplied.
    #[error("Missing runtime component: {0}")]
    MissingComponent(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("task", "load");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.summary, "Test error");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("task"), Some(&"load".to_string()));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert_eq!(err.error_info.code, "CONTRACT-PF-CYCLE");
    }

    #[test]
    fn test_definition_error_exposes_contract_info() {
        let err: DefinitionError = DuplicateTaskIdError::new("etl", "load").into();
        assert_eq!(err.error_info().map(|i| i.code.as_str()), Some("CONTRACT-PF-DUPLICATE"));

        let err: DefinitionError = DanglingDependencyError::new("load", "extract").into();
        assert_eq!(err.error_info().map(|i| i.code.as_str()), Some("CONTRACT-PF-DANGLING"));

        let err = DefinitionError::invalid_setting("concurrency", "must be at least 1");
        assert!(err.error_info().is_none());
    }

    #[test]
    fn test_task_error_to_failure() {
        let failure = TaskError::validation("row count is zero").to_failure();
        assert_eq!(failure.kind, FailureKind::Validation);
        assert_eq!(failure.message, "row count is zero");
        assert!(failure.detail.is_none());

        let err = TaskError::Unhandled(
            anyhow::anyhow!("socket closed").context("fetching upstream table"),
        );
        let failure = err.to_failure();
        assert_eq!(failure.kind, FailureKind::Unhandled);
        assert_eq!(failure.message, "fetching upstream table");
        assert!(failure.detail.unwrap().contains("socket closed"));
    }

    #[test]
    fn test_infrastructure_errors_become_unhandled_task_errors() {
        let err: TaskError = StoreError::Backend("down".to_string()).into();
        assert_eq!(err.kind(), FailureKind::Unhandled);

        let err: TaskError = LockError::from(AlreadyGeneratingError::new("k")).into();
        assert!(err.to_string().contains("already being generated"));
    }
}
