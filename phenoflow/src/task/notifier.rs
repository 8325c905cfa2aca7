//! Completion notifications.

use crate::core::TaskRunRecord;
use crate::errors::{NotifyError, TaskFailure};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

/// Receives task completion events.
///
/// Notification is best-effort: the executor logs a returned error and
/// carries on.
#[async_trait]
pub trait TaskNotifier: Send + Sync {
    /// Called after a task committed successfully.
    async fn task_succeeded(&self, record: &TaskRunRecord, output: &Value) -> Result<(), NotifyError>;

    /// Called after a task failed and was rolled back.
    async fn task_failed(&self, record: &TaskRunRecord, failure: &TaskFailure) -> Result<(), NotifyError>;
}

/// A notifier that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl TaskNotifier for NoOpNotifier {
    async fn task_succeeded(&self, _record: &TaskRunRecord, _output: &Value) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn task_failed(&self, _record: &TaskRunRecord, _failure: &TaskFailure) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// A notifier that logs completions for records that name a user.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl TaskNotifier for LoggingNotifier {
    async fn task_succeeded(&self, record: &TaskRunRecord, _output: &Value) -> Result<(), NotifyError> {
        if let Some(user) = &record.username {
            info!(
                task_run_id = %record.id,
                task = %record.qualified_name(),
                user = %user,
                "Task completed"
            );
        }
        Ok(())
    }

    async fn task_failed(&self, record: &TaskRunRecord, failure: &TaskFailure) -> Result<(), NotifyError> {
        if let Some(user) = &record.username {
            warn!(
                task_run_id = %record.id,
                task = %record.qualified_name(),
                user = %user,
                error = %failure,
                "Task failed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TaskRunId, TaskRunStatus};
    use crate::errors::FailureKind;
    use crate::utils::now_utc;
    use serde_json::json;

    fn record(username: Option<&str>) -> TaskRunRecord {
        let mut record = TaskRunRecord::new(TaskRunId::new(), "m", "C", TaskRunStatus::Success, now_utc());
        record.username = username.map(str::to_string);
        record
    }

    #[test]
    fn test_builtin_notifiers_never_fail() {
        let failure = TaskFailure::new(FailureKind::Unhandled, "boom");
        for rec in [record(None), record(Some("curator"))] {
            tokio_test::block_on(async {
                assert!(LoggingNotifier.task_succeeded(&rec, &json!({})).await.is_ok());
                assert!(LoggingNotifier.task_failed(&rec, &failure).await.is_ok());
                assert!(NoOpNotifier.task_failed(&rec, &failure).await.is_ok());
            });
        }
    }
}
