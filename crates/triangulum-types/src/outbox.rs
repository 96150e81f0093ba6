//! Outbox events: the durable record co-committed with a domain write and
//! later published to queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RunId;

/// Monotonic (within a run) identifier for an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxEventId(pub i64);

/// The closed set of outbox event types (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// A file's LLM analysis produced POIs.
    FileAnalysisFinding,
    /// A relationship-resolution analysis produced a candidate relationship.
    RelationshipAnalysisFinding,
    /// The privileged cross-file analyzer produced a validated relationship.
    GlobalRelationshipAnalysisFinding,
    /// A directory-level aggregation summary.
    DirectorySummary,
    /// A terminally-failed job, retained for forensic inspection.
    FailedJob,
}

impl EventType {
    /// Wire string, matching §6 exactly.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FileAnalysisFinding => "file-analysis-finding",
            EventType::RelationshipAnalysisFinding => "relationship-analysis-finding",
            EventType::GlobalRelationshipAnalysisFinding => "global-relationship-analysis-finding",
            EventType::DirectorySummary => "directory-summary",
            EventType::FailedJob => "failed-job",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal/non-terminal lifecycle of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxEventStatus {
    /// Not yet claimed by any publisher.
    Pending,
    /// Claimed by a publisher and not yet resolved. `claim_batch` is the
    /// only transition into this state; `mark_published` and the
    /// `mark_failed` retry path are the only transitions out of it, so two
    /// concurrent claimers can never both see the same row as `pending`.
    InFlight,
    /// Terminal success: a typed handler processed the event.
    Published,
    /// Terminal failure: retries were exhausted.
    Failed,
}

/// A durable event, inserted in the same local transaction as the domain
/// write that produced it (§4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Monotonic id within the run.
    pub id: OutboxEventId,
    /// Owning run.
    pub run: RunId,
    /// Event type.
    pub event_type: EventType,
    /// Opaque payload, shaped per event type.
    pub payload: serde_json::Value,
    /// Lifecycle status.
    pub status: OutboxEventStatus,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Number of publish attempts so far.
    pub retry_count: u32,
}
