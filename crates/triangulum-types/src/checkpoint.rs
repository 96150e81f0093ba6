//! Checkpoints: per-entity, per-stage progress records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RunId;

/// Storage-assigned checkpoint id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub i64);

/// Pipeline stages a single entity progresses through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// A file was discovered and its content hash recorded.
    FileLoaded,
    /// At least one POI was extracted.
    EntitiesExtracted,
    /// Relationships were enumerated (count may be zero).
    RelationshipsBuilt,
    /// Nodes/relationships were written to the graph store.
    Neo4jStored,
    /// The run's benchmark thresholds were evaluated.
    PipelineComplete,
}

impl Stage {
    /// All stages, in pipeline order.
    pub const ORDER: &'static [Stage] = &[
        Stage::FileLoaded,
        Stage::EntitiesExtracted,
        Stage::RelationshipsBuilt,
        Stage::Neo4jStored,
        Stage::PipelineComplete,
    ];
}

/// Outcome of a single checkpoint attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Created, validator has not yet run.
    Pending,
    /// Validator passed.
    Completed,
    /// Validator failed.
    Failed,
}

/// Result of running a stage-specific validator against a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the checkpoint's stage requirements were satisfied.
    pub valid: bool,
    /// Human-readable validation failures, empty when `valid` is true.
    pub errors: Vec<String>,
}

impl ValidationResult {
    /// A passing validation result with no errors.
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// A failing validation result with the given error messages.
    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// A record of an entity completing (or failing) a pipeline stage.
///
/// A checkpoint at stage `S` for entity `E` is created at most once per
/// attempt; later attempts create new checkpoint rows, so history is
/// preserved rather than overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Storage-assigned id.
    pub id: CheckpointId,
    /// Owning run.
    pub run: RunId,
    /// Pipeline stage this checkpoint records.
    pub stage: Stage,
    /// Opaque entity reference: a file path, `"file:poi-id"`, a run id, etc.
    pub entity_id: String,
    /// Current status.
    pub status: CheckpointStatus,
    /// Stage-specific metadata (e.g. entity/node counts).
    pub metadata: serde_json::Value,
    /// Result of the stage validator, once run.
    pub validation_result: Option<ValidationResult>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}
