//! Relationship evidence and the content hash used to aggregate it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RelationshipId, RelationshipType, RunId};

/// Content hash over normalized `(source semantic id, target semantic id,
/// relationship type)`, used to aggregate independent evidence for the same
/// candidate relationship before numeric POI ids are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationshipHash(pub [u8; 32]);

impl RelationshipHash {
    /// Compute the hash from normalized semantic ids and a relationship type.
    ///
    /// Normalization lower-cases and trims both ids so that evidence
    /// produced by independent analyzers with incidental whitespace or
    /// casing differences still aggregates onto the same hash.
    pub fn compute(source_semantic_id: &str, target_semantic_id: &str, rel_type: RelationshipType) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source_semantic_id.trim().to_lowercase().as_bytes());
        hasher.update(b"\0");
        hasher.update(target_semantic_id.trim().to_lowercase().as_bytes());
        hasher.update(b"\0");
        hasher.update(rel_type.as_str().as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Hex representation, used as a storage/map key.
    pub fn to_hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl std::fmt::Display for RelationshipHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// The typed shape stored in [`RelationshipEvidence::payload`]: the
/// semantic ids and relationship type the hash was computed from, plus
/// whatever signal the producing worker attached. Reconciliation has no
/// other way to recover the semantic ids a hash was built from, since
/// `RelationshipHash` is one-way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceContent {
    /// Semantic id of the candidate source POI.
    pub source_semantic_id: String,
    /// Semantic id of the candidate target POI.
    pub target_semantic_id: String,
    /// Relationship type the vote is for.
    pub rel_type: RelationshipType,
    /// Opaque analyzer signal backing this vote (LLM rationale, syntactic
    /// cues, cross-evidence agreement data, …), scored by the Confidence
    /// Scorer.
    pub detail: serde_json::Value,
}

/// One independent vote of evidence for a candidate relationship.
///
/// Many evidence rows may share a hash; each is an independent analysis
/// result and is never deduplicated away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEvidence {
    /// Storage-assigned id.
    pub id: i64,
    /// Owning run.
    pub run: RunId,
    /// Content hash this evidence votes for.
    pub relationship_hash: RelationshipHash,
    /// Opaque analyzer output (LLM response fragment, scorer signals, etc).
    pub payload: serde_json::Value,
    /// The materialized relationship this evidence resolved to, once known.
    pub relationship_id: Option<RelationshipId>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_same_inputs() {
        let a = RelationshipHash::compute("auth_func_authenticate", "user_import_authenticate", RelationshipType::Imports);
        let b = RelationshipHash::compute("auth_func_authenticate", "user_import_authenticate", RelationshipType::Imports);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_normalizes_case_and_whitespace() {
        let a = RelationshipHash::compute("Foo", "Bar", RelationshipType::Calls);
        let b = RelationshipHash::compute(" foo ", " bar ", RelationshipType::Calls);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_differs_by_type() {
        let a = RelationshipHash::compute("foo", "bar", RelationshipType::Calls);
        let b = RelationshipHash::compute("foo", "bar", RelationshipType::Uses);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_differs_by_direction() {
        let a = RelationshipHash::compute("foo", "bar", RelationshipType::Calls);
        let b = RelationshipHash::compute("bar", "foo", RelationshipType::Calls);
        assert_ne!(a, b);
    }
}
