#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **triangulum-store-core** – storage trait abstractions for the triangulum
//! coordination core.
//!
//! This crate defines the persistence contracts the rest of the workspace
//! programs against: runs, files, points of interest, relationships,
//! relationship evidence, the transactional outbox, and checkpoints. It
//! provides no concrete backend — `triangulum-store-sqlite` is the reference
//! implementation — so that the coordination logic in
//! `triangulum-publisher`/`triangulum-reconcile`/`triangulum-checkpoint` can
//! be exercised against an in-memory fake in tests without pulling in sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use triangulum_types::{
    Checkpoint, CheckpointId, EventType, FileRecord, FileStatus, Origin, OutboxEvent,
    OutboxEventId, OutboxEventStatus, Poi, PoiId, Relationship, RelationshipEvidence,
    RelationshipHash, RelationshipId, RelationshipStatus, Run, RunId, RunStatus, Stage,
    ValidationResult,
};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by a storage backend implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No row matched the given identifier.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity looked up, e.g. `"run"`.
        entity: &'static str,
        /// String form of the identifier that was not found.
        id: String,
    },
    /// A uniqueness or foreign-key constraint was violated.
    #[error("constraint violation: {0}")]
    Conflict(String),
    /// The backend's underlying driver returned an error.
    #[error("backend error: {0}")]
    Backend(String),
    /// A payload could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

//─────────────────────────────
//  Schema migrations
//─────────────────────────────

/// A single forward-only schema migration, identified by a monotonically
/// increasing version. Backends are expected to track applied versions in
/// a `schema_migrations` table and apply any migration whose version is
/// greater than the highest recorded one, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    /// Monotonic version number, starting at 1.
    pub version: i64,
    /// Short human-readable name, for logging.
    pub name: &'static str,
    /// Raw DDL executed to apply this migration.
    pub sql: &'static str,
}

//─────────────────────────────
//  Runs
//─────────────────────────────

/// Persistence for run lifecycle records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run in the `active` state.
    async fn create_run(&self, run: &Run) -> anyhow::Result<()>;

    /// Transition a run to a terminal status.
    async fn finalize_run(&self, id: &RunId, status: RunStatus) -> anyhow::Result<()>;

    /// Fetch a run by id.
    async fn get_run(&self, id: &RunId) -> anyhow::Result<Option<Run>>;
}

//─────────────────────────────
//  Files
//─────────────────────────────

/// Persistence for discovered source files.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Insert a file record, or update its content hash and reset its
    /// status to `pending` if the path was already known with a different
    /// hash (the file changed since it was last seen).
    async fn upsert_file(&self, file: &FileRecord) -> anyhow::Result<()>;

    /// Update a file's processing status.
    async fn mark_file_status(
        &self,
        run: &RunId,
        path: &str,
        status: FileStatus,
    ) -> anyhow::Result<()>;

    /// Fetch a single file record.
    async fn get_file(&self, run: &RunId, path: &str) -> anyhow::Result<Option<FileRecord>>;

    /// List every file record known for a run.
    async fn list_files_for_run(&self, run: &RunId) -> anyhow::Result<Vec<FileRecord>>;
}

//─────────────────────────────
//  Points of interest
//─────────────────────────────

/// Persistence for points of interest extracted from source files.
#[async_trait]
pub trait PoiStore: Send + Sync {
    /// Insert a POI, assigning it a fresh id. Returns the assigned id.
    async fn insert_poi(&self, poi: &Poi) -> anyhow::Result<PoiId>;

    /// Fetch a single POI by id.
    async fn get_poi(&self, run: &RunId, id: PoiId) -> anyhow::Result<Option<Poi>>;

    /// Resolve a POI by its stable semantic id, used to turn cross-file
    /// references produced before numeric ids existed into real POI ids.
    async fn find_by_semantic_id(
        &self,
        run: &RunId,
        semantic_id: &str,
    ) -> anyhow::Result<Option<Poi>>;

    /// List every POI extracted so far for a run.
    async fn list_pois_for_run(&self, run: &RunId) -> anyhow::Result<Vec<Poi>>;
}

//─────────────────────────────
//  Relationships
//─────────────────────────────

/// Persistence for materialized relationships between POIs.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Insert a relationship, assigning it a fresh id.
    async fn insert_relationship(&self, rel: &Relationship) -> anyhow::Result<RelationshipId>;

    /// Update a relationship's validation status.
    async fn update_status(
        &self,
        run: &RunId,
        id: RelationshipId,
        status: RelationshipStatus,
    ) -> anyhow::Result<()>;

    /// Fetch a single relationship by id.
    async fn get_relationship(
        &self,
        run: &RunId,
        id: RelationshipId,
    ) -> anyhow::Result<Option<Relationship>>;

    /// List every relationship materialized so far for a run.
    async fn list_relationships_for_run(&self, run: &RunId) -> anyhow::Result<Vec<Relationship>>;
}

//─────────────────────────────
//  Relationship evidence
//─────────────────────────────

/// Persistence for independent evidence votes aggregated by relationship
/// hash ahead of materialization.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Record one vote of evidence. Never deduplicated; every call inserts
    /// a new row even if the hash has been seen before.
    async fn insert_evidence(&self, evidence: &RelationshipEvidence) -> anyhow::Result<i64>;

    /// All evidence recorded so far for a given hash.
    async fn evidence_for_hash(
        &self,
        run: &RunId,
        hash: RelationshipHash,
    ) -> anyhow::Result<Vec<RelationshipEvidence>>;

    /// Number of evidence rows recorded so far for a given hash, without
    /// materializing the rows themselves.
    async fn count_evidence_for_hash(
        &self,
        run: &RunId,
        hash: RelationshipHash,
    ) -> anyhow::Result<u64>;

    /// Attach a materialized relationship id to every evidence row sharing
    /// a hash, once the relationship has been created.
    async fn link_evidence_to_relationship(
        &self,
        run: &RunId,
        hash: RelationshipHash,
        relationship: RelationshipId,
    ) -> anyhow::Result<()>;
}

//─────────────────────────────
//  Transactional outbox
//─────────────────────────────

/// Persistence for the transactional outbox.
///
/// `append` is meant to be called from inside the same local transaction
/// that performs the domain write the event describes (a POI insert, a
/// relationship insert, …); backends that can't express cross-call
/// transactions should still expose the narrowest possible window between
/// the two writes.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append a pending event, assigning it a fresh id.
    async fn append(
        &self,
        run: &RunId,
        event_type: EventType,
        payload: Value,
        origin: Origin,
    ) -> anyhow::Result<OutboxEventId>;

    /// Claim up to `limit` pending events for a run, oldest first, and mark
    /// them as no longer eligible for a concurrent claim. Implementations
    /// must make claiming atomic across concurrent publishers.
    async fn claim_batch(&self, run: &RunId, limit: u32) -> anyhow::Result<Vec<OutboxEvent>>;

    /// Mark a claimed event as durably published.
    async fn mark_published(&self, run: &RunId, id: OutboxEventId) -> anyhow::Result<()>;

    /// Mark a claimed event as failed, recording a retry. Callers decide
    /// whether the event returns to `pending` or becomes terminally
    /// `failed` based on the returned retry count.
    async fn mark_failed(&self, run: &RunId, id: OutboxEventId) -> anyhow::Result<u32>;

    /// Transition an event to terminal `failed`, once the caller has
    /// decided (typically via `mark_failed`'s returned retry count
    /// exceeding its retry budget) that no further attempt will be made.
    async fn mark_terminally_failed(&self, run: &RunId, id: OutboxEventId) -> anyhow::Result<()>;

    /// Count of events not yet resolved for a run: `pending` (never claimed)
    /// plus `in_flight` (claimed, still being handled). Callers polling for
    /// drain — the run orchestrator's cross-file wait among them — want
    /// "nothing left to do", not "nothing claimed yet"; a batch a publisher
    /// is mid-handling is exactly the case that must not read as drained.
    async fn count_pending(&self, run: &RunId) -> anyhow::Result<u64>;

    /// Lifecycle status of a single event, without fetching its payload.
    async fn status_of(
        &self,
        run: &RunId,
        id: OutboxEventId,
    ) -> anyhow::Result<Option<OutboxEventStatus>>;
}

//─────────────────────────────
//  Checkpoints
//─────────────────────────────

/// Persistence for per-entity, per-stage checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create a new checkpoint row, assigning it a fresh id.
    async fn create_checkpoint(
        &self,
        run: &RunId,
        stage: Stage,
        entity_id: &str,
        metadata: Value,
    ) -> anyhow::Result<CheckpointId>;

    /// Attach a validation result and mark the checkpoint completed or
    /// failed accordingly.
    async fn update_checkpoint(
        &self,
        run: &RunId,
        id: CheckpointId,
        result: ValidationResult,
    ) -> anyhow::Result<()>;

    /// Most recent checkpoint recorded for an entity at a given stage, if
    /// any attempt has been made.
    async fn latest_for_entity(
        &self,
        run: &RunId,
        stage: Stage,
        entity_id: &str,
    ) -> anyhow::Result<Option<Checkpoint>>;

    /// Every checkpoint recorded for a run, across all stages and entities,
    /// in creation order.
    async fn list_for_run(&self, run: &RunId) -> anyhow::Result<Vec<Checkpoint>>;
}

//─────────────────────────────
//  Aggregate store
//─────────────────────────────

/// Convenience supertrait implemented automatically by any backend that
/// implements all seven individual store traits. Coordination crates take
/// `Arc<dyn Store>` rather than naming each trait separately.
pub trait Store:
    RunStore
    + FileStore
    + PoiStore
    + RelationshipStore
    + EvidenceStore
    + OutboxStore
    + CheckpointStore
{
}

impl<T> Store for T where
    T: RunStore
        + FileStore
        + PoiStore
        + RelationshipStore
        + EvidenceStore
        + OutboxStore
        + CheckpointStore
{
}

/// Wall-clock helper shared by backends that stamp rows themselves rather
/// than relying on the database's `CURRENT_TIMESTAMP`.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
