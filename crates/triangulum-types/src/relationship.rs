//! Relationships between POIs and their closed type vocabulary.

use serde::{Deserialize, Serialize};

use crate::{PoiId, RunId, TypesError};

/// Locally-unique (within a run) numeric identifier for a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationshipId(pub i64);

/// The closed set of relationship types the core will accept. Anything
/// outside this vocabulary is rejected at ingress (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum RelationshipType {
    /// One entity calls another.
    Calls,
    /// One entity implements an interface/trait.
    Implements,
    /// One entity uses another.
    Uses,
    /// One entity depends on another.
    DependsOn,
    /// One entity inherits from another.
    Inherits,
    /// One entity contains another.
    Contains,
    /// One entity defines another.
    Defines,
    /// One entity references another.
    References,
    /// One entity extends another.
    Extends,
    /// One entity belongs to another.
    BelongsTo,
    /// Generic, low-specificity relation.
    RelatedTo,
    /// One entity is part of another.
    PartOf,
    /// Inverse of `Uses`.
    UsedBy,
    /// One entity instantiates another.
    Instantiates,
    /// Generic relation (distinct from `RelatedTo`; see §6 vocabulary).
    Related,
    /// One entity imports another.
    Imports,
    /// One entity uses a configuration entity.
    UsesConfig,
}

impl RelationshipType {
    /// All relationship types in the closed vocabulary, in §6's listed order.
    pub const ALL: &'static [RelationshipType] = &[
        RelationshipType::Calls,
        RelationshipType::Implements,
        RelationshipType::Uses,
        RelationshipType::DependsOn,
        RelationshipType::Inherits,
        RelationshipType::Contains,
        RelationshipType::Defines,
        RelationshipType::References,
        RelationshipType::Extends,
        RelationshipType::BelongsTo,
        RelationshipType::RelatedTo,
        RelationshipType::PartOf,
        RelationshipType::UsedBy,
        RelationshipType::Instantiates,
        RelationshipType::Related,
        RelationshipType::Imports,
        RelationshipType::UsesConfig,
    ];

    /// The canonical wire/string form, matching §6 exactly.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::Calls => "CALLS",
            RelationshipType::Implements => "IMPLEMENTS",
            RelationshipType::Uses => "USES",
            RelationshipType::DependsOn => "DEPENDS_ON",
            RelationshipType::Inherits => "INHERITS",
            RelationshipType::Contains => "CONTAINS",
            RelationshipType::Defines => "DEFINES",
            RelationshipType::References => "REFERENCES",
            RelationshipType::Extends => "EXTENDS",
            RelationshipType::BelongsTo => "BELONGS_TO",
            RelationshipType::RelatedTo => "RELATED_TO",
            RelationshipType::PartOf => "PART_OF",
            RelationshipType::UsedBy => "USED_BY",
            RelationshipType::Instantiates => "INSTANTIATES",
            RelationshipType::Related => "RELATED",
            RelationshipType::Imports => "IMPORTS",
            RelationshipType::UsesConfig => "USES_CONFIG",
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RelationshipType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelationshipType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TypesError::UnknownRelationshipType(s.to_string()))
    }
}

impl Serialize for RelationshipType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// Validation status of a materialized relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipStatus {
    /// Evidence is still accumulating.
    Pending,
    /// Accepted by the confidence scorer directly (score >= 0.85).
    Validated,
    /// Accepted after triangulation reached consensus.
    TriangulatedValidated,
    /// Produced by the privileged cross-file analyzer, bypassing per-hash counting.
    CrossFileValidated,
    /// Rejected (not currently produced by the scorer, reserved for future use).
    Rejected,
    /// Triangulation could not converge; requires human review.
    Escalated,
}

/// A directed relationship between two POIs within the same run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Locally-unique id, assigned on insert.
    pub id: RelationshipId,
    /// Owning run.
    pub run: RunId,
    /// Source POI.
    pub source: PoiId,
    /// Target POI.
    pub target: PoiId,
    /// Relationship type, drawn from the closed vocabulary.
    pub rel_type: RelationshipType,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Validation status.
    pub status: RelationshipStatus,
    /// File path for intra-file relationships; `None` for cross-file ones.
    pub file_path: Option<String>,
    /// Whether this relationship spans files.
    pub cross_file: bool,
    /// Optional human-readable reason (e.g. for escalation).
    pub reason: Option<String>,
}

impl Relationship {
    /// Construct a pending relationship, enforcing `source != target` and a
    /// confidence within `[0, 1]`.
    pub fn new(
        run: RunId,
        source: PoiId,
        target: PoiId,
        rel_type: RelationshipType,
        confidence: f64,
        file_path: Option<String>,
    ) -> Result<Self, TypesError> {
        if source == target {
            return Err(TypesError::SelfRelationship(source));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(TypesError::ConfidenceOutOfRange(confidence));
        }
        let cross_file = file_path.is_none();
        Ok(Self {
            id: RelationshipId(0),
            run,
            source,
            target,
            rel_type,
            confidence,
            status: RelationshipStatus::Pending,
            file_path,
            cross_file,
            reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn round_trips_every_type_through_its_wire_string() {
        for ty in RelationshipType::ALL {
            let parsed = RelationshipType::from_str(ty.as_str()).unwrap();
            assert_eq!(parsed, *ty);
        }
    }

    #[test]
    fn rejects_unknown_type() {
        assert_eq!(
            RelationshipType::from_str("FRIENDS_WITH"),
            Err(TypesError::UnknownRelationshipType("FRIENDS_WITH".into()))
        );
    }

    #[test]
    fn rejects_self_relationship() {
        let run = RunId::new("r1").unwrap();
        let err = Relationship::new(run, PoiId(1), PoiId(1), RelationshipType::Calls, 0.9, None)
            .unwrap_err();
        assert_eq!(err, TypesError::SelfRelationship(PoiId(1)));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let run = RunId::new("r1").unwrap();
        let err = Relationship::new(run, PoiId(1), PoiId(2), RelationshipType::Calls, 1.5, None)
            .unwrap_err();
        assert_eq!(err, TypesError::ConfidenceOutOfRange(1.5));
    }

    #[test]
    fn cross_file_flag_follows_file_path_presence() {
        let run = RunId::new("r1").unwrap();
        let intra =
            Relationship::new(run.clone(), PoiId(1), PoiId(2), RelationshipType::Calls, 0.9, Some("a.js".into()))
                .unwrap();
        assert!(!intra.cross_file);

        let cross =
            Relationship::new(run, PoiId(1), PoiId(2), RelationshipType::Imports, 0.9, None).unwrap();
        assert!(cross.cross_file);
    }
}
