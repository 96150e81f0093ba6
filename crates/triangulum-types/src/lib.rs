#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **triangulum-types** – Shared primitive data structures for the triangulum
//! coordination core.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, storage, or queuing —
//! those concerns live in `triangulum-store-core`/`triangulum-queue`.

use serde::{Deserialize, Serialize};

pub mod checkpoint;
pub mod evidence;
pub mod outbox;
pub mod poi;
pub mod queue;
pub mod relationship;
pub mod run;

pub use checkpoint::{Checkpoint, CheckpointId, CheckpointStatus, Stage, ValidationResult};
pub use evidence::{EvidenceContent, RelationshipEvidence, RelationshipHash};
pub use outbox::{EventType, OutboxEvent, OutboxEventId, OutboxEventStatus};
pub use poi::{FileRecord, FileStatus, Poi, PoiId, PoiKind};
pub use queue::{QueueJob, QUEUE_NAMES};
pub use relationship::{Relationship, RelationshipId, RelationshipStatus, RelationshipType};
pub use run::{Run, RunId, RunStatus};

/// Errors raised while constructing or validating a domain value.
///
/// These are invariant violations from §3 of the coordination core's
/// specification (e.g. a relationship whose source equals its target),
/// not I/O or storage failures — those are reported by the crates that
/// own persistence.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TypesError {
    /// A relationship's source and target POI were identical.
    #[error("relationship source and target POI must differ (got {0:?} twice)")]
    SelfRelationship(PoiId),
    /// A relationship type string did not match the closed vocabulary of §6.
    #[error("unknown relationship type: {0}")]
    UnknownRelationshipType(String),
    /// A confidence value fell outside the closed interval [0, 1].
    #[error("confidence must be within [0, 1], got {0}")]
    ConfidenceOutOfRange(f64),
    /// A string field exceeded its maximum allowed length.
    #[error("{field} too long: {actual} > {max}")]
    TooLong {
        /// Field name.
        field: &'static str,
        /// Observed length.
        actual: usize,
        /// Maximum permitted length.
        max: usize,
    },
    /// A required string field was empty or all-whitespace.
    #[error("{0} cannot be empty")]
    Empty(&'static str),
}

/// Maximum length for a POI name.
pub const MAX_NAME_LEN: usize = 512;
/// Maximum length for a file path.
pub const MAX_PATH_LEN: usize = 4096;
/// Maximum length for a run identifier.
pub const MAX_RUN_ID_LEN: usize = 256;

pub(crate) fn check_non_empty(field: &'static str, value: &str) -> Result<(), TypesError> {
    if value.trim().is_empty() {
        return Err(TypesError::Empty(field));
    }
    Ok(())
}

pub(crate) fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), TypesError> {
    if value.len() > max {
        return Err(TypesError::TooLong {
            field,
            actual: value.len(),
            max,
        });
    }
    Ok(())
}

/// A coarse classification of what produced an outbox event or evidence
/// payload, reported back on checkpoints and run summaries for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Produced by the per-file analysis worker.
    FileAnalysis,
    /// Produced by the per-relationship resolution worker.
    RelationshipResolution,
    /// Produced by the cross-file global analysis worker.
    GlobalAnalysis,
    /// Produced by a triangulation analyzer role.
    Triangulation,
}
