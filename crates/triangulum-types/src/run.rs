//! Run identity and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{check_len, check_non_empty, TypesError, MAX_RUN_ID_LEN};

/// Opaque, unique identifier for a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Validate a run identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, TypesError> {
        let id = id.into();
        check_non_empty("run id", &id)?;
        check_len("run id", &id, MAX_RUN_ID_LEN)?;
        Ok(Self(id))
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is in progress.
    Active,
    /// All checkpoints reached a terminal state and the run concluded.
    Finalized,
    /// The run was aborted by the orchestrator's fatal-error watchdog.
    Failed,
}

/// A pipeline run: the unit every POI, relationship, evidence item, event,
/// and checkpoint is scoped to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: RunStatus,
}

impl Run {
    /// Start a new, active run.
    pub fn start(id: RunId, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at,
            status: RunStatus::Active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_run_id() {
        assert_eq!(RunId::new(""), Err(TypesError::Empty("run id")));
        assert_eq!(RunId::new("   "), Err(TypesError::Empty("run id")));
    }

    #[test]
    fn rejects_oversized_run_id() {
        let long = "x".repeat(MAX_RUN_ID_LEN + 1);
        assert!(matches!(
            RunId::new(long),
            Err(TypesError::TooLong { field: "run id", .. })
        ));
    }

    #[test]
    fn accepts_valid_run_id() {
        assert!(RunId::new("run-2026-08-01-001").is_ok());
    }

    #[test]
    fn new_run_starts_active() {
        let run = Run::start(RunId::new("r1").unwrap(), Utc::now());
        assert_eq!(run.status, RunStatus::Active);
    }
}
