#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **triangulum-reconcile** – Evidence aggregation, confidence scoring, and
//! triangulation (§4.6, §4.7).
//!
//! The Publisher enqueues one [`ValidationBatch`]-shaped job per relationship
//! hash onto `analysis-findings-queue` every time it claims evidence rows for
//! that hash. [`Reconciler`] consumes those jobs, keeps a running count of
//! evidence seen per `(run, hash)`, and once the count reaches the batch's
//! declared `expected` votes, scores the accumulated evidence and either
//! accepts it directly, dispatches it to [`triangulation`], or escalates it.

pub mod scorer;
pub mod triangulation;

use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{info, warn};

use triangulum_queue::{ConsumerConfig, QueueBus};
use triangulum_store_core::Store;
use triangulum_types::{EvidenceContent, Relationship, RelationshipStatus, RelationshipType, RunId};

use scorer::{ConfidenceScorer, ScoreOutcome};
use triangulation::{AnalyzerContext, TriangulationOrchestrator, TriangulationOutcome};

const ANALYSIS_FINDINGS_QUEUE: &str = "analysis-findings-queue";

/// How evidence-completeness is decided for a relationship hash (§4.6, §9).
///
/// The Publisher always stamps a batch's `expected` count from its own
/// config default, so counter-backed reconciliation is always available;
/// `Degraded` exists for a queue backend that cannot guarantee the Publisher
/// saw every evidence row (e.g. claims lost to a crash between `append` and
/// delivery) and instead reconciles on a quiet-period timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationMode {
    /// Fire reconciliation once the running counter reaches `expected`.
    CounterBacked,
    /// Fire reconciliation after no new evidence has arrived for a hash
    /// within a configured quiet period, regardless of the counter.
    Degraded {
        /// Quiet period, in milliseconds, before a stalled hash reconciles
        /// with whatever evidence it has accumulated.
        quiet_period_ms: u64,
    },
}

impl Default for ReconciliationMode {
    fn default() -> Self {
        ReconciliationMode::CounterBacked
    }
}

/// A single hash's running evidence count against its declared target.
#[derive(Debug, Clone, Copy, Default)]
struct HashProgress {
    current: u32,
    expected: u32,
}

/// Tracks evidence counts per `(run, hash)` so the Reconciler knows when a
/// candidate relationship has accumulated enough votes to score.
#[derive(Default)]
pub struct EvidenceTracker {
    progress: DashMap<(String, String), HashProgress>,
}

impl EvidenceTracker {
    /// Build an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `new_votes` more evidence rows seen for `hash`, with `expected`
    /// as the batch's declared target. Returns `true` once the running count
    /// reaches `expected` for the first time; later calls for an already-complete
    /// hash return `false` so reconciliation only fires once per hash.
    fn record(&self, run: &str, hash: &str, new_votes: u32, expected: u32) -> bool {
        let key = (run.to_string(), hash.to_string());
        let mut entry = self.progress.entry(key).or_insert_with(HashProgress::default);
        let was_complete = entry.expected > 0 && entry.current >= entry.expected;
        entry.current += new_votes;
        entry.expected = entry.expected.max(expected);
        !was_complete && entry.current >= entry.expected
    }

    /// Drop tracked progress for a hash once it has reconciled, so a replayed
    /// batch (e.g. after a consumer restart) does not double-count.
    fn clear(&self, run: &str, hash: &str) {
        self.progress.remove(&(run.to_string(), hash.to_string()));
    }
}

#[derive(Debug, Deserialize)]
struct ValidationBatchJob {
    hash: String,
    run: String,
    evidence: Vec<serde_json::Value>,
    expected: u32,
}

/// Ties evidence tracking, confidence scoring, and triangulation together
/// into a single `analysis-findings-queue` consumer.
pub struct Reconciler {
    store: Arc<dyn Store>,
    queue: Arc<QueueBus>,
    tracker: EvidenceTracker,
    scorer: ConfidenceScorer,
    triangulation: TriangulationOrchestrator,
    mode: ReconciliationMode,
    pool: Option<Arc<triangulum_worker_pool::PoolManager>>,
}

/// Worker class this reconciler's consumer runs under when registered with a
/// [`triangulum_worker_pool::PoolManager`] — reconciliation is the "checking
/// evidence against other evidence" step named `validation` in §4.3.
pub const VALIDATION_CLASS: &str = "validation";

impl Reconciler {
    /// Build a reconciler with the default [`ConfidenceScorer`] weights and
    /// counter-backed reconciliation.
    pub fn new(store: Arc<dyn Store>, queue: Arc<QueueBus>, triangulation: TriangulationOrchestrator) -> Self {
        Self {
            store,
            queue,
            tracker: EvidenceTracker::new(),
            scorer: ConfidenceScorer::default(),
            triangulation,
            mode: ReconciliationMode::default(),
            pool: None,
        }
    }

    /// Override the reconciliation mode.
    pub fn with_mode(mut self, mode: ReconciliationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Gate this reconciler's consumer through a [`triangulum_worker_pool::PoolManager`]'s
    /// `validation` class: concurrency limits, circuit breaking, and rate
    /// limiting all apply to every job before it reaches [`Reconciler::handle_job`].
    pub fn with_pool(mut self, pool: Arc<triangulum_worker_pool::PoolManager>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Register this reconciler as the consumer of `analysis-findings-queue`
    /// until `shutdown` is cancelled.
    pub fn spawn_consumer(
        self: Arc<Self>,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        match &self.pool {
            Some(pool) => {
                let reconciler = Arc::clone(&self);
                let worker = triangulum_worker_pool::ManagedWorker::new(
                    Arc::clone(pool),
                    VALIDATION_CLASS,
                    std::time::Duration::from_secs(60),
                    move |job| {
                        let reconciler = Arc::clone(&reconciler);
                        async move { reconciler.handle_job(job).await }
                    },
                );
                let handler = worker.as_consumer_handler();
                self.queue.register_consumer(ANALYSIS_FINDINGS_QUEUE, ConsumerConfig::default(), shutdown, handler)
            }
            None => {
                let reconciler = Arc::clone(&self);
                self.queue.register_consumer(
                    ANALYSIS_FINDINGS_QUEUE,
                    ConsumerConfig::default(),
                    shutdown,
                    move |job| {
                        let reconciler = Arc::clone(&reconciler);
                        async move { reconciler.handle_job(job).await }
                    },
                )
            }
        }
    }

    async fn handle_job(&self, job: triangulum_types::QueueJob) -> anyhow::Result<()> {
        let batch: ValidationBatchJob = serde_json::from_value(job.payload)?;
        self.handle_batch(batch).await
    }

    async fn handle_batch(&self, batch: ValidationBatchJob) -> anyhow::Result<()> {
        let votes = batch.evidence.len() as u32;
        let ready = match self.mode {
            ReconciliationMode::CounterBacked => {
                self.tracker.record(&batch.run, &batch.hash, votes, batch.expected)
            }
            ReconciliationMode::Degraded { .. } => {
                // Degraded mode reconciles every batch it sees rather than
                // waiting on a counter; the Publisher's periodic flush
                // already approximates the quiet period.
                true
            }
        };

        if !ready {
            return Ok(());
        }

        let run = RunId::new(batch.run.as_str())
            .map_err(|err| anyhow::anyhow!("invalid run id {}: {err}", batch.run))?;
        let evidence: Vec<EvidenceContent> = batch
            .evidence
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();

        if evidence.is_empty() {
            warn!(hash = %batch.hash, "validation batch had no decodable evidence; skipping");
            return Ok(());
        }

        self.reconcile(&run, &batch.hash, evidence).await?;
        self.tracker.clear(&batch.run, &batch.hash);
        Ok(())
    }

    async fn reconcile(&self, run: &RunId, hash: &str, evidence: Vec<EvidenceContent>) -> anyhow::Result<()> {
        let breakdown = self.scorer.score(&evidence);
        let first = &evidence[0];

        match breakdown.outcome {
            ScoreOutcome::Accept => {
                self.materialize(run, &evidence, RelationshipStatus::Validated, breakdown.score, None)
                    .await?;
            }
            ScoreOutcome::Escalate => {
                self.materialize(
                    run,
                    &evidence,
                    RelationshipStatus::Escalated,
                    breakdown.score,
                    Some("confidence score below escalation threshold".to_string()),
                )
                .await?;
            }
            ScoreOutcome::Triangulate => {
                let ctx = AnalyzerContext {
                    source_semantic_id: first.source_semantic_id.clone(),
                    target_semantic_id: first.target_semantic_id.clone(),
                    rel_type: first.rel_type.as_str().to_string(),
                    evidence: evidence.clone(),
                    file_excerpts: Vec::new(),
                    peer_summary: None,
                };
                let result = self.triangulation.triangulate(&ctx).await;
                let (status, reason) = match result.outcome {
                    TriangulationOutcome::Validated => (RelationshipStatus::TriangulatedValidated, None),
                    TriangulationOutcome::Escalated => {
                        (RelationshipStatus::Escalated, Some("triangulation did not reach consensus".to_string()))
                    }
                };
                self.materialize(run, &evidence, status, result.confidence, reason).await?;
            }
        }

        info!(hash, outcome = ?breakdown.outcome, "reconciled relationship hash");
        Ok(())
    }

    async fn materialize(
        &self,
        run: &RunId,
        evidence: &[EvidenceContent],
        status: RelationshipStatus,
        confidence: f64,
        reason: Option<String>,
    ) -> anyhow::Result<()> {
        let first = &evidence[0];
        let rel_type: RelationshipType = first.rel_type;

        let source = self.resolve_poi(run, &first.source_semantic_id).await?;
        let target = self.resolve_poi(run, &first.target_semantic_id).await?;
        let (Some(source), Some(target)) = (source, target) else {
            warn!(
                source = %first.source_semantic_id,
                target = %first.target_semantic_id,
                "could not resolve both POIs for reconciled relationship; dropping"
            );
            return Ok(());
        };

        let mut relationship = Relationship::new(run.clone(), source.id, target.id, rel_type, confidence, None)?;
        relationship.status = status;
        relationship.reason = reason;

        let rel_id = self.store.insert_relationship(&relationship).await?;
        let hash = triangulum_types::RelationshipHash::compute(
            &first.source_semantic_id,
            &first.target_semantic_id,
            rel_type,
        );
        self.store.link_evidence_to_relationship(run, hash, rel_id).await?;
        Ok(())
    }

    /// Resolve a semantic id to a POI: exact match first, then a
    /// `(name, run)` fallback over every POI extracted so far for the run
    /// (§4.6 — semantic ids are occasionally derived differently by
    /// independent workers).
    async fn resolve_poi(&self, run: &RunId, semantic_id: &str) -> anyhow::Result<Option<triangulum_types::Poi>> {
        if let Some(poi) = self.store.find_by_semantic_id(run, semantic_id).await? {
            return Ok(Some(poi));
        }

        let pois = self.store.list_pois_for_run(run).await?;
        Ok(pois.into_iter().find(|p| p.name == semantic_id))
    }
}
