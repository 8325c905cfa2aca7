//! Database and unit-of-work traits.

use crate::core::{PipelineId, PipelineRecord, PipelineRunId, TaskRunId, TaskRunRecord};
use crate::errors::StoreError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Table holding [`TaskRunRecord`] rows keyed by task-run id.
pub const TASK_RUN_TABLE: &str = "task_run";

/// Table holding [`PipelineRecord`] rows keyed by pipeline name.
pub const PIPELINE_TABLE: &str = "pipeline";

/// Source of transactional sessions.
#[async_trait]
pub trait Database: Send + Sync {
    /// Opens a new session.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;
}

/// A transactional session over keyed JSON rows.
///
/// Reads see this session's own staged writes. The session stays usable
/// after `commit` and `rollback`.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Reads a row.
    async fn get_row(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Inserts or replaces a row.
    async fn put_row(&mut self, table: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Deletes a row, returning whether it existed.
    async fn delete_row(&mut self, table: &str, key: &str) -> Result<bool, StoreError>;

    /// Returns every row of a table, ordered by key.
    async fn scan(&self, table: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// Makes every staged write visible atomically.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discards every staged write.
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

fn decode<T: DeserializeOwned>(table: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::serialization(table, e))
}

fn encode<T: Serialize>(table: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::serialization(table, e))
}

/// Typed access to the engine's own tables.
#[async_trait]
pub trait RecordStore: UnitOfWork {
    /// Loads a task-run record.
    async fn load_task_run(&self, id: TaskRunId) -> Result<Option<TaskRunRecord>, StoreError> {
        match self.get_row(TASK_RUN_TABLE, &id.to_string()).await? {
            Some(row) => decode(TASK_RUN_TABLE, row).map(Some),
            None => Ok(None),
        }
    }

    /// Inserts or replaces a task-run record.
    async fn save_task_run(&mut self, record: &TaskRunRecord) -> Result<(), StoreError> {
        let row = encode(TASK_RUN_TABLE, record)?;
        self.put_row(TASK_RUN_TABLE, &record.id.to_string(), row).await
    }

    /// Deletes a task-run record.
    async fn delete_task_run(&mut self, id: TaskRunId) -> Result<bool, StoreError> {
        self.delete_row(TASK_RUN_TABLE, &id.to_string()).await
    }

    /// Returns every task-run record.
    async fn task_runs(&self) -> Result<Vec<TaskRunRecord>, StoreError> {
        self.scan(TASK_RUN_TABLE)
            .await?
            .into_iter()
            .map(|(_, row)| decode(TASK_RUN_TABLE, row))
            .collect()
    }

    /// Returns the records produced by one pipeline run.
    async fn task_runs_for_run(
        &self,
        run_id: &PipelineRunId,
    ) -> Result<Vec<TaskRunRecord>, StoreError> {
        let all = self.task_runs().await?;
        Ok(all
            .into_iter()
            .filter(|r| r.pipeline_run_id.as_ref() == Some(run_id))
            .collect())
    }

    /// Returns the records belonging to one pipeline.
    async fn task_runs_for_pipeline(
        &self,
        pipeline_id: PipelineId,
    ) -> Result<Vec<TaskRunRecord>, StoreError> {
        let all = self.task_runs().await?;
        Ok(all
            .into_iter()
            .filter(|r| r.pipeline_id == Some(pipeline_id))
            .collect())
    }

    /// Loads a pipeline row by name.
    async fn load_pipeline(&self, name: &str) -> Result<Option<PipelineRecord>, StoreError> {
        match self.get_row(PIPELINE_TABLE, name).await? {
            Some(row) => decode(PIPELINE_TABLE, row).map(Some),
            None => Ok(None),
        }
    }

    /// Inserts or replaces a pipeline row.
    async fn save_pipeline(&mut self, record: &PipelineRecord) -> Result<(), StoreError> {
        let row = encode(PIPELINE_TABLE, record)?;
        self.put_row(PIPELINE_TABLE, &record.name, row).await
    }
}

#[async_trait]
impl<T: UnitOfWork + ?Sized> RecordStore for T {}
