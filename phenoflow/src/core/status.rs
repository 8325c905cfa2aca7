//! Task-run status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a task run.
///
/// `Scheduled` only appears on the scheduler dispatch path. `Success` and
/// `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRunStatus {
    /// Created by dispatch, waiting for the scheduler to fire it.
    Scheduled,
    /// Processing has begun.
    Started,
    /// Processing and validation passed; output is cached.
    Success,
    /// Processing or validation failed.
    Error,
}

impl TaskRunStatus {
    /// Returns true for `Success` and `Error`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Returns true for `Success`.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl Default for TaskRunStatus {
    fn default() -> Self {
        Self::Started
    }
}

impl fmt::Display for TaskRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "SCHEDULED"),
            Self::Started => write!(f, "STARTED"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}
