//! Wire shapes for outbox event payloads (§4.5, §6).
//!
//! `OutboxEvent::payload` is opaque JSON as far as the event log is
//! concerned; these types are the contract the analyzer workers that
//! *produce* events and the Publisher that *consumes* them agree on.

use serde::{Deserialize, Serialize};
use triangulum_types::{PoiKind, RelationshipType};

/// Payload of a `file-analysis-finding` event: the POIs one worker
/// extracted from a single file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnalysisFindingPayload {
    /// File the POIs were extracted from.
    pub file_path: String,
    /// Extracted entities.
    pub pois: Vec<PoiFinding>,
}

/// One entity found by the per-file analysis worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoiFinding {
    /// Entity kind.
    pub kind: PoiKind,
    /// Entity name.
    pub name: String,
    /// 1-based inclusive start line.
    pub start_line: u32,
    /// 1-based inclusive end line.
    pub end_line: u32,
    /// Whether the entity is exported, if the worker could tell.
    pub is_exported: Option<bool>,
    /// Stable cross-file id; derived from `file_path`/`kind`/`name` when absent.
    pub semantic_id: Option<String>,
    /// Opaque LLM payload for this entity.
    pub llm_payload: Option<serde_json::Value>,
}

/// Payload of a `relationship-analysis-finding` event: candidate
/// relationships one relationship-resolution worker found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipAnalysisFindingPayload {
    /// File the worker was scoped to, for intra-file candidates.
    pub file_path: Option<String>,
    /// Candidate relationships this worker invocation found.
    pub candidates: Vec<RelationshipCandidate>,
}

/// A single candidate relationship, referencing POIs by semantic id since
/// numeric ids may not yet be known to the producing worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    /// Semantic id of the source POI.
    pub source_semantic_id: String,
    /// Semantic id of the target POI.
    pub target_semantic_id: String,
    /// Relationship type, drawn from the closed vocabulary.
    pub rel_type: RelationshipType,
    /// Opaque evidence payload backing this vote (LLM rationale, scorer signals, …).
    pub evidence_payload: serde_json::Value,
}

/// Payload of a `global-relationship-analysis-finding` event: relationships
/// the privileged cross-file analyzer already validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRelationshipAnalysisFindingPayload {
    /// Already-validated cross-file relationships.
    pub relationships: Vec<GlobalRelationshipFinding>,
}

/// A single cross-file relationship, bypassing per-hash evidence counting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRelationshipFinding {
    /// Semantic id of the source POI.
    pub source_semantic_id: String,
    /// Semantic id of the target POI.
    pub target_semantic_id: String,
    /// Relationship type, drawn from the closed vocabulary.
    pub rel_type: RelationshipType,
    /// Confidence already assigned by the privileged analyzer.
    pub confidence: f64,
    /// Optional human-readable rationale.
    pub reason: Option<String>,
}

/// Payload the Publisher pushes onto the `analysis-findings-queue` for the
/// Evidence & Reconciliation validation worker to pick up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationBatch {
    /// Relationship hash every evidence entry in `evidence` votes for.
    pub hash: String,
    /// Run this batch belongs to.
    pub run: String,
    /// One opaque payload per independent vote seen in this claim cycle.
    pub evidence: Vec<serde_json::Value>,
    /// Votes required before reconciliation fires, per the Publisher's
    /// counter-backed default (§4.6, resolved in DESIGN.md).
    pub expected: u32,
}

/// Payload of a `relationship-resolution` job: one POI ready for the
/// relationship-resolution worker to consider as a source or target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipResolutionJob {
    /// Run the POI belongs to.
    pub run: String,
    /// Numeric POI id, now assigned.
    pub poi_id: i64,
    /// Stable semantic id, for cross-file reference.
    pub semantic_id: Option<String>,
    /// File the POI was extracted from.
    pub file_path: String,
}

/// Payload of a `global-relationship-analysis` job: one analyzed directory
/// ready for the privileged cross-file analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRelationshipAnalysisJob {
    /// Run the directory belongs to.
    pub run: String,
    /// Directory path (file paths' common parent).
    pub directory: String,
}
