//! The persisted pipeline row written by the compiler.

use super::PipelineId;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};

/// Registry row for a committed pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// Stable identity, assigned on first commit.
    pub id: PipelineId,
    /// Unique pipeline name.
    pub name: String,
    /// Bumped whenever the artifact content changes.
    pub version: u64,
    /// Hex SHA-256 of the serialised artifact.
    pub content_hash: String,
    /// Where the artifact was written.
    pub artifact_path: String,
    /// The serialised artifact itself.
    pub artifact: serde_json::Value,
    /// Paused pipelines are not triggered by the scheduler.
    #[serde(default)]
    pub paused: bool,
    /// Set by `delete`; a deleted row is recreated on the next commit.
    #[serde(default)]
    pub deleted: bool,
    /// First commit time.
    pub created_at: Timestamp,
    /// Last content change.
    pub updated_at: Timestamp,
}
