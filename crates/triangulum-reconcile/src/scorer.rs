//! Confidence Scorer: combines syntactic, semantic, and contextual signals
//! from a relationship's accumulated evidence into a single `[0, 1]` score
//! and classifies it against the accept/triangulate/escalate thresholds.

use triangulum_types::EvidenceContent;

/// Score at or above this accepts the relationship directly (`validated`).
pub const ACCEPT_THRESHOLD: f64 = 0.85;
/// Score below this escalates for human review (`escalated`); scores in
/// between enter triangulation.
pub const ESCALATE_THRESHOLD: f64 = 0.45;

/// Weight given to each signal; must sum to 1.0.
#[derive(Debug, Clone, Copy)]
pub struct ScorerWeights {
    /// Weight of the syntactic (AST-ish cue) signal.
    pub syntactic: f64,
    /// Weight of the semantic (LLM-reported confidence) signal.
    pub semantic: f64,
    /// Weight of the contextual (cross-evidence agreement) signal.
    pub contextual: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self { syntactic: 0.3, semantic: 0.4, contextual: 0.3 }
    }
}

/// The scorer's classification of a computed score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreOutcome {
    /// Accept directly; write `validated`.
    Accept,
    /// Ambiguous; dispatch to triangulation.
    Triangulate,
    /// Too little signal; write `escalated` without triangulating.
    Escalate,
}

/// A scored candidate relationship with its component signals retained for
/// audit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBreakdown {
    /// Fraction of evidence carrying a syntactic cue.
    pub syntactic: f64,
    /// Average LLM-reported confidence across evidence, defaulting to 0.5
    /// when no evidence row reports one.
    pub semantic: f64,
    /// Agreement signal: grows with the number of independent votes.
    pub contextual: f64,
    /// Weighted combination of the three signals, in `[0, 1]`.
    pub score: f64,
    /// Classification against the accept/triangulate/escalate thresholds.
    pub outcome: ScoreOutcome,
}

/// Computes [`ScoreBreakdown`]s from accumulated evidence.
pub struct ConfidenceScorer {
    weights: ScorerWeights,
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new(ScorerWeights::default())
    }
}

impl ConfidenceScorer {
    /// Build a scorer with the given signal weights.
    pub fn new(weights: ScorerWeights) -> Self {
        Self { weights }
    }

    /// Score a relationship candidate from every evidence row recorded for
    /// its hash.
    pub fn score(&self, evidence: &[EvidenceContent]) -> ScoreBreakdown {
        let syntactic = syntactic_signal(evidence);
        let semantic = semantic_signal(evidence);
        let contextual = contextual_signal(evidence);
        let score = (syntactic * self.weights.syntactic
            + semantic * self.weights.semantic
            + contextual * self.weights.contextual)
            .clamp(0.0, 1.0);
        let outcome = if score >= ACCEPT_THRESHOLD {
            ScoreOutcome::Accept
        } else if score >= ESCALATE_THRESHOLD {
            ScoreOutcome::Triangulate
        } else {
            ScoreOutcome::Escalate
        };
        ScoreBreakdown { syntactic, semantic, contextual, score, outcome }
    }
}

fn syntactic_signal(evidence: &[EvidenceContent]) -> f64 {
    if evidence.is_empty() {
        return 0.0;
    }
    let hits = evidence
        .iter()
        .filter(|e| e.detail.get("syntactic_cue").and_then(|v| v.as_bool()).unwrap_or(false))
        .count();
    hits as f64 / evidence.len() as f64
}

fn semantic_signal(evidence: &[EvidenceContent]) -> f64 {
    let reported: Vec<f64> = evidence
        .iter()
        .filter_map(|e| e.detail.get("llm_confidence").and_then(|v| v.as_f64()))
        .collect();
    if reported.is_empty() {
        return 0.5;
    }
    (reported.iter().sum::<f64>() / reported.len() as f64).clamp(0.0, 1.0)
}

fn contextual_signal(evidence: &[EvidenceContent]) -> f64 {
    if evidence.len() <= 1 {
        return 0.5;
    }
    (evidence.len() as f64 / (evidence.len() as f64 + 2.0)).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use triangulum_types::RelationshipType;

    fn evidence(syntactic: bool, llm_confidence: Option<f64>) -> EvidenceContent {
        let mut detail = serde_json::json!({"syntactic_cue": syntactic});
        if let Some(conf) = llm_confidence {
            detail["llm_confidence"] = serde_json::json!(conf);
        }
        EvidenceContent {
            source_semantic_id: "a".into(),
            target_semantic_id: "b".into(),
            rel_type: RelationshipType::Calls,
            detail,
        }
    }

    #[test]
    fn strong_agreeing_evidence_accepts() {
        let scorer = ConfidenceScorer::default();
        let evidence = vec![
            evidence(true, Some(0.99)),
            evidence(true, Some(0.98)),
            evidence(true, Some(0.97)),
            evidence(true, Some(0.99)),
        ];
        let breakdown = scorer.score(&evidence);
        assert_eq!(breakdown.outcome, ScoreOutcome::Accept);
    }

    #[test]
    fn single_weak_vote_escalates() {
        let scorer = ConfidenceScorer::default();
        let evidence = vec![evidence(false, Some(0.1))];
        let breakdown = scorer.score(&evidence);
        assert_eq!(breakdown.outcome, ScoreOutcome::Escalate);
    }

    #[test]
    fn mixed_signal_triangulates() {
        let scorer = ConfidenceScorer::default();
        let evidence = vec![evidence(true, Some(0.6)), evidence(false, Some(0.5))];
        let breakdown = scorer.score(&evidence);
        assert_eq!(breakdown.outcome, ScoreOutcome::Triangulate);
    }

    #[test]
    fn empty_evidence_never_accepts() {
        let scorer = ConfidenceScorer::default();
        let breakdown = scorer.score(&[]);
        assert_ne!(breakdown.outcome, ScoreOutcome::Accept);
    }
}
