//! # Phenoflow
//!
//! Task-run execution and pipeline orchestration.
//!
//! Phenoflow runs units of domain work with transactional guarantees and
//! wires them into dependency graphs:
//!
//! - **Task lifecycle**: every execution is recorded, validated, and either
//!   committed with its cached output or rolled back completely
//! - **Pipeline definitions**: named DAGs of task specs with cycle and
//!   dangling-reference checks at construction time
//! - **Compilation**: definitions persist as content-hashed, versioned artifacts
//! - **Running**: in process with bounded parallelism, or through an external
//!   scheduler that calls back per node
//! - **Generation locks**: at most one producer per derived cache value
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use phenoflow::prelude::*;
//!
//! let mut definition = PipelineDefinition::new("phenotypes")?;
//! definition.add_task(TaskSpec::new("imports", "ImportMetadata").with_task_id("import"))?;
//! definition.add_task(
//!     TaskSpec::new("analysis", "Summarise")
//!         .with_task_id("summarise")
//!         .with_upstream("import"),
//! )?;
//!
//! let runner = PipelineRunner::new(runtime);
//! let result = runner.run(&definition, &RunConfig::new(), None).await?;
//! assert!(result.is_success());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cache;
pub mod config;
pub mod core;
pub mod errors;
pub mod health;
pub mod observability;
pub mod pipeline;
pub mod runtime;
pub mod store;
pub mod task;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{GenerationLock, GenerationState, InMemoryOutputCache, OutputCache};
    pub use crate::config::{EngineConfig, Environment};
    pub use crate::core::{
        PipelineId, PipelineRunId, TaskArgs, TaskRunId, TaskRunRecord, TaskRunStatus,
    };
    pub use crate::errors::{
        ContractErrorInfo, CycleDetectedError, DanglingDependencyError, DefinitionError,
        DuplicateTaskIdError, PhenoflowError, TaskError, TaskFailure,
    };
    pub use crate::pipeline::{
        NodeOutcome, PipelineCompiler, PipelineDefinition, PipelineRunResult, PipelineRunner,
        RunConfig, Scheduler, SchedulerInvocation, TaskSpec,
    };
    pub use crate::runtime::RuntimeContext;
    pub use crate::store::{Database, InMemoryDatabase, RecordStore, UnitOfWork};
    pub use crate::task::{
        ExecutionRequest, Task, TaskContext, TaskExecutor, TaskNotifier, TaskRegistry,
        TaskRunReport,
    };
    pub use crate::utils::{iso_timestamp, now_utc, Timestamp};
}
