//! Detection of task runs abandoned by a dead worker.
//!
//! A worker killed by a scheduler timeout leaves its record in `STARTED`.
//! Nothing retries such runs; they are reported so an operator (or a
//! follow-up pipeline run) can deal with them.

use crate::core::TaskRunRecord;
use crate::errors::StoreError;
use crate::store::{Database, RecordStore};
use crate::utils::Timestamp;
use tracing::warn;

/// Returns `STARTED` records older than `max_age`, oldest first.
pub async fn find_stale_runs(
    database: &dyn Database,
    max_age: chrono::Duration,
    now: Timestamp,
) -> Result<Vec<TaskRunRecord>, StoreError> {
    let session = database.begin().await?;
    let mut stale: Vec<TaskRunRecord> = session
        .task_runs()
        .await?
        .into_iter()
        .filter(|r| r.is_stale(now, max_age))
        .collect();
    stale.sort_by_key(|r| r.datetime_started);

    for record in &stale {
        warn!(
            task_run_id = %record.id,
            task = %record.qualified_name(),
            started = %record.datetime_started,
            "Stale task run"
        );
    }
    Ok(stale)
}
