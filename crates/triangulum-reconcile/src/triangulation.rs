//! Triangulation orchestrator: when the Confidence Scorer judges a
//! relationship ambiguous, independent analyzer roles score it in parallel
//! from isolated contexts and their verdicts are combined into a single
//! outcome.
//!
//! Role dispatch follows `toka_agent_runtime`'s task-executor shape: one
//! handler invocation per role, wrapped in a timeout, with retries left to
//! the caller rather than built into the role itself (a role that times out
//! is simply absent from the round, not retried).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use triangulum_llm::LlmClient;
use triangulum_types::EvidenceContent;

use crate::scorer::ESCALATE_THRESHOLD;

/// Conflict is declared when max − min role confidence exceeds this.
pub const CONFLICT_THRESHOLD: f64 = 0.4;
/// Default per-role timeout; a role that exceeds it is dropped from the
/// round rather than blocking the others.
pub const DEFAULT_ROLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Minimum number of completed roles required to reach any outcome other
/// than escalation.
pub const MIN_AGREEING_ROLES: usize = 2;

/// Isolated, deep-copied view of a candidate relationship handed to each
/// analyzer role. Roles never see each other's state directly; the only
/// channel between them is `peer_summary`, populated for the one allowed
/// peer-review round.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzerContext {
    /// Semantic id of the candidate source POI.
    pub source_semantic_id: String,
    /// Semantic id of the candidate target POI.
    pub target_semantic_id: String,
    /// Relationship type under consideration.
    pub rel_type: String,
    /// Every evidence row accumulated for this relationship's hash.
    pub evidence: Vec<EvidenceContent>,
    /// Source excerpts supporting the candidate, if available.
    pub file_excerpts: Vec<String>,
    /// Summary of peer roles' first-round reasoning, present only during
    /// the peer-review round.
    pub peer_summary: Option<String>,
}

/// One analyzer role's verdict for a round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoleScore {
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// One independent analyzer perspective on a candidate relationship.
#[async_trait]
pub trait AnalyzerRole: Send + Sync {
    /// Stable role name, used as the reliability-tracking key.
    fn name(&self) -> &'static str;

    /// Score `ctx` from this role's perspective.
    async fn score(&self, ctx: &AnalyzerContext) -> anyhow::Result<RoleScore>;
}

#[derive(Debug, Deserialize)]
struct RoleResponse {
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

/// An analyzer role whose verdict is produced by prompting an LLM client
/// with a role-specific lens. Every default role shares this dispatch shape
/// and differs only in `lens`.
pub struct LlmAnalyzerRole {
    name: &'static str,
    lens: &'static str,
    llm: Arc<dyn LlmClient>,
}

impl LlmAnalyzerRole {
    /// Build a role named `name`, framing its prompt through `lens`.
    pub fn new(name: &'static str, lens: &'static str, llm: Arc<dyn LlmClient>) -> Self {
        Self { name, lens, llm }
    }
}

#[async_trait]
impl AnalyzerRole for LlmAnalyzerRole {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn score(&self, ctx: &AnalyzerContext) -> anyhow::Result<RoleScore> {
        let mut prompt = format!(
            "Judge this candidate relationship through a {lens} lens.\n\
             source: {source}\ntarget: {target}\ntype: {rel_type}\n\
             evidence: {evidence}\n\
             Respond with JSON: {{\"confidence\": <0..1>, \"reasoning\": \"...\"}}",
            lens = self.lens,
            source = ctx.source_semantic_id,
            target = ctx.target_semantic_id,
            rel_type = ctx.rel_type,
            evidence = serde_json::to_string(&ctx.evidence)?,
        );
        if let Some(summary) = &ctx.peer_summary {
            prompt.push_str(&format!("\npeer reasoning so far: {summary}\nRevise your score if warranted."));
        }
        let response = self.llm.query(&prompt).await?;
        let parsed: RoleResponse = triangulum_llm::codec::parse_json_response(&response)?;
        Ok(RoleScore { confidence: parsed.confidence.clamp(0.0, 1.0) })
    }
}

/// Names and lens framings of the six default analyzer roles, in §4.7's
/// listed order.
pub const DEFAULT_ROLE_LENSES: &[(&str, &str)] = &[
    ("syntactic", "syntactic (AST/grammar-level)"),
    ("semantic", "semantic (meaning and intent)"),
    ("contextual", "contextual (surrounding code)"),
    ("architectural", "architectural (module and layering boundaries)"),
    ("security", "security (trust and data-flow)"),
    ("performance", "performance (resource and call cost)"),
];

/// Build the six default analyzer roles, sharing one LLM client.
pub fn default_roles(llm: Arc<dyn LlmClient>) -> Vec<Arc<dyn AnalyzerRole>> {
    DEFAULT_ROLE_LENSES
        .iter()
        .map(|(name, lens)| Arc::new(LlmAnalyzerRole::new(name, lens, llm.clone())) as Arc<dyn AnalyzerRole>)
        .collect()
}

/// Rolling per-role success rate, used to weight consensus. A role's weight
/// is its historical agreement rate with the final outcome; roles with no
/// history yet default to a neutral 0.5.
#[derive(Default)]
pub struct RoleReliability {
    samples: DashMap<&'static str, (AtomicU32, AtomicU32)>,
}

impl RoleReliability {
    /// Build a tracker with no history.
    pub fn new() -> Self {
        Self::default()
    }

    /// This role's current weight.
    pub fn weight_of(&self, role: &'static str) -> f64 {
        match self.samples.get(role) {
            Some(entry) => {
                let (agree, total) = (&entry.0, &entry.1);
                let total = total.load(Ordering::Relaxed);
                if total == 0 {
                    0.5
                } else {
                    agree.load(Ordering::Relaxed) as f64 / total as f64
                }
            }
            None => 0.5,
        }
    }

    /// Record whether `role`'s verdict agreed with the session's final
    /// outcome.
    pub fn record(&self, role: &'static str, agreed: bool) {
        let entry = self.samples.entry(role).or_insert_with(|| (AtomicU32::new(0), AtomicU32::new(0)));
        entry.1.fetch_add(1, Ordering::Relaxed);
        if agreed {
            entry.0.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Final disposition of a triangulation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriangulationOutcome {
    /// Consensus confidence cleared the bar; write `triangulated-validated`.
    Validated,
    /// Too few roles completed, or consensus confidence stayed too low;
    /// write `escalated`.
    Escalated,
}

/// The combined result of a triangulation session, persisted for audit.
#[derive(Debug, Clone)]
pub struct TriangulationResult {
    /// Final disposition.
    pub outcome: TriangulationOutcome,
    /// Reliability-weighted consensus confidence.
    pub confidence: f64,
    /// Per-role confidence from the round that was kept (post peer-review
    /// if one ran).
    pub role_scores: Vec<(&'static str, f64)>,
    /// Whether the first round's variance exceeded [`CONFLICT_THRESHOLD`].
    pub conflict: bool,
}

/// Spawns analyzer roles in parallel, applies the variance check and one
/// peer-review round, and combines verdicts into a [`TriangulationResult`].
pub struct TriangulationOrchestrator {
    roles: Vec<Arc<dyn AnalyzerRole>>,
    reliability: RoleReliability,
    role_timeout: Duration,
    conflict_threshold: f64,
}

impl TriangulationOrchestrator {
    /// Build an orchestrator over `roles`, using the §4.7 defaults.
    pub fn new(roles: Vec<Arc<dyn AnalyzerRole>>) -> Self {
        Self {
            roles,
            reliability: RoleReliability::new(),
            role_timeout: DEFAULT_ROLE_TIMEOUT,
            conflict_threshold: CONFLICT_THRESHOLD,
        }
    }

    /// Override the per-role timeout.
    pub fn with_role_timeout(mut self, timeout: Duration) -> Self {
        self.role_timeout = timeout;
        self
    }

    /// Current reliability weight for `role`, for callers that want to
    /// report it alongside results.
    pub fn reliability_of(&self, role: &'static str) -> f64 {
        self.reliability.weight_of(role)
    }

    /// Run a full triangulation session for `ctx`.
    pub async fn triangulate(&self, ctx: &AnalyzerContext) -> TriangulationResult {
        let first_round = self.run_round(ctx, None).await;

        if first_round.len() < MIN_AGREEING_ROLES {
            warn!(completed = first_round.len(), "too few analyzer roles completed; escalating");
            return TriangulationResult {
                outcome: TriangulationOutcome::Escalated,
                confidence: 0.0,
                role_scores: first_round,
                conflict: true,
            };
        }

        let confidences: Vec<f64> = first_round.iter().map(|(_, c)| *c).collect();
        let max = confidences.iter().cloned().fold(f64::MIN, f64::max);
        let min = confidences.iter().cloned().fold(f64::MAX, f64::min);
        let conflict = (max - min) > self.conflict_threshold;

        let final_round = if conflict {
            let summary = peer_summary(&first_round);
            let mut peer_ctx = ctx.clone();
            peer_ctx.peer_summary = Some(summary);
            let second_round = self.run_round(&peer_ctx, Some(&peer_ctx)).await;
            if second_round.len() >= MIN_AGREEING_ROLES {
                second_round
            } else {
                first_round
            }
        } else {
            first_round
        };

        let final_confidences: Vec<f64> = final_round.iter().map(|(_, c)| *c).collect();
        let final_max = final_confidences.iter().cloned().fold(f64::MIN, f64::max);
        let final_min = final_confidences.iter().cloned().fold(f64::MAX, f64::min);
        let unresolved_conflict = (final_max - final_min) > self.conflict_threshold;

        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (name, confidence) in &final_round {
            let w = self.reliability.weight_of(name);
            weighted_sum += confidence * w;
            weight_total += w;
        }
        let confidence = if weight_total > 0.0 { weighted_sum / weight_total } else { 0.0 };

        // A peer-review round that never converges stays a conflict: roles
        // that still split on either side of the threshold haven't reached
        // consensus just because their weighted mean clears the bar.
        let outcome = if unresolved_conflict {
            TriangulationOutcome::Escalated
        } else if confidence >= ESCALATE_THRESHOLD {
            TriangulationOutcome::Validated
        } else {
            TriangulationOutcome::Escalated
        };

        for (name, role_confidence) in &final_round {
            let agreed = (*role_confidence >= ESCALATE_THRESHOLD) == (outcome == TriangulationOutcome::Validated);
            self.reliability.record(name, agreed);
        }

        TriangulationResult { outcome, confidence, role_scores: final_round, conflict }
    }

    async fn run_round(&self, ctx: &AnalyzerContext, _peer_ctx: Option<&AnalyzerContext>) -> Vec<(&'static str, f64)> {
        let mut handles = Vec::with_capacity(self.roles.len());
        for role in &self.roles {
            let role = Arc::clone(role);
            let ctx = ctx.clone();
            let timeout = self.role_timeout;
            handles.push(tokio::spawn(async move {
                match tokio::time::timeout(timeout, role.score(&ctx)).await {
                    Ok(Ok(score)) => Some((role.name(), score.confidence)),
                    Ok(Err(err)) => {
                        warn!(role = role.name(), error = %err, "analyzer role failed");
                        None
                    }
                    Err(_) => {
                        warn!(role = role.name(), "analyzer role timed out");
                        None
                    }
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(Some(result)) = handle.await {
                results.push(result);
            }
        }
        results
    }
}

fn peer_summary(round: &[(&'static str, f64)]) -> String {
    round
        .iter()
        .map(|(name, confidence)| format!("{name}={confidence:.2}"))
        .collect::<Vec<_>>()
        .join(", ")
}
