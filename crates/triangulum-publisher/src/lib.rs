#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **triangulum-publisher** – the Outbox Publisher (§4.5): a single
//! process-wide loop that claims batches of pending outbox events, applies a
//! typed handler per event type, and fans follow-on work onto the queue bus.
//!
//! Loop shape is grounded in `toka_orchestration::OrchestrationEngine`'s
//! phase loop: an `Arc<Self>` spawned onto its own task, driven by a
//! `tokio::time::interval`, with a `flush` entry point tests and shutdown
//! call directly instead of waiting on the timer.

pub mod payloads;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use triangulum_queue::{AddOptions, QueueBus};
use triangulum_store_core::Store;
use triangulum_types::{
    EventType, EvidenceContent, FileStatus, OutboxEvent, OutboxEventId, Poi, PoiId, Relationship,
    RelationshipEvidence, RelationshipHash, RelationshipStatus, RunId,
};

use payloads::{
    FileAnalysisFindingPayload, GlobalRelationshipAnalysisFindingPayload,
    GlobalRelationshipAnalysisJob, RelationshipAnalysisFindingPayload, RelationshipResolutionJob,
    ValidationBatch,
};

const FILE_ANALYSIS_QUEUE: &str = "file-analysis-queue";
const RELATIONSHIP_RESOLUTION_QUEUE: &str = "relationship-resolution-queue";
const GLOBAL_RELATIONSHIP_ANALYSIS_QUEUE: &str = "global-relationship-analysis-queue";
const ANALYSIS_FINDINGS_QUEUE: &str = "analysis-findings-queue";

/// Tuning knobs for the publisher loop.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PublisherConfig {
    /// Events claimed per cycle.
    pub batch_size: u32,
    /// Time between automatic flush cycles in [`Publisher::spawn_loop`].
    pub flush_interval: Duration,
    /// Publish attempts before an event is marked terminally failed.
    pub max_retries: u32,
    /// Votes required before a relationship hash is reconciled, absent a
    /// more specific count (§4.6's counter-backed default).
    pub default_expected_evidence: u32,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval: Duration::from_millis(200),
            max_retries: 5,
            default_expected_evidence: 2,
        }
    }
}

/// Running counters, exposed for health probes and tests.
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    published: AtomicU64,
    terminally_failed: AtomicU64,
}

impl PublisherMetrics {
    /// Events successfully published since start.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events that exhausted their retry budget.
    pub fn terminally_failed(&self) -> u64 {
        self.terminally_failed.load(Ordering::Relaxed)
    }
}

/// The Outbox Publisher: claims events, applies typed handlers, fans work
/// onto the queue bus, and triggers the cross-file analysis pass once a
/// run's files are all analyzed.
pub struct Publisher {
    store: Arc<dyn Store>,
    queue: Arc<QueueBus>,
    config: PublisherConfig,
    cross_file_triggered: DashMap<RunId, ()>,
    tracked_runs: DashMap<RunId, ()>,
    metrics: PublisherMetrics,
}

impl Publisher {
    /// Build a publisher over `store`/`queue`, publishing nothing until a
    /// run is tracked via [`Publisher::track_run`].
    pub fn new(store: Arc<dyn Store>, queue: Arc<QueueBus>, config: PublisherConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            config,
            cross_file_triggered: DashMap::new(),
            tracked_runs: DashMap::new(),
            metrics: PublisherMetrics::default(),
        })
    }

    /// Current counters.
    pub fn metrics(&self) -> &PublisherMetrics {
        &self.metrics
    }

    /// Start publishing events produced under `run`.
    pub fn track_run(&self, run: RunId) {
        self.tracked_runs.insert(run, ());
    }

    /// Stop publishing events for `run` (e.g. once it finalizes).
    pub fn untrack_run(&self, run: &RunId) {
        self.tracked_runs.remove(run);
        self.cross_file_triggered.remove(run);
    }

    /// Spawn the background loop: on every tick, flush every tracked run.
    /// Returns the join handle so callers can await clean shutdown.
    pub fn spawn_loop(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.flush_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let runs: Vec<RunId> = this.tracked_runs.iter().map(|e| e.key().clone()).collect();
                        for run in runs {
                            if let Err(err) = this.flush(&run).await {
                                warn!(run = %run, error = %err, "publisher flush cycle failed");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Claim and process one batch of pending events for `run`. Returns the
    /// number of events claimed (published or terminally failed).
    #[instrument(skip(self), fields(run = %run))]
    pub async fn flush(&self, run: &RunId) -> anyhow::Result<u32> {
        let events = self.store.claim_batch(run, self.config.batch_size).await?;
        if events.is_empty() {
            return Ok(0);
        }
        let count = events.len() as u32;

        let mut by_type: BTreeMap<&'static str, Vec<OutboxEvent>> = BTreeMap::new();
        for event in events {
            by_type.entry(event.event_type.as_str()).or_default().push(event);
        }

        for (_, group) in by_type {
            for event in group {
                self.handle_event(run, &event).await;
            }
        }

        self.maybe_trigger_cross_file(run).await?;
        Ok(count)
    }

    async fn handle_event(&self, run: &RunId, event: &OutboxEvent) {
        let result = match event.event_type {
            EventType::FileAnalysisFinding => self.handle_file_analysis_finding(run, event).await,
            EventType::RelationshipAnalysisFinding => {
                self.handle_relationship_analysis_finding(run, event).await
            }
            EventType::GlobalRelationshipAnalysisFinding => {
                self.handle_global_relationship_analysis_finding(run, event).await
            }
            EventType::DirectorySummary | EventType::FailedJob => {
                // No domain write associated with these; acknowledging them
                // is enough to retire them from the outbox.
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                if let Err(err) = self.store.mark_published(run, event.id).await {
                    warn!(event = event.id.0, error = %err, "failed to mark event published");
                    return;
                }
                self.metrics.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => self.fail_event(run, event.id, &err).await,
        }
    }

    async fn fail_event(&self, run: &RunId, id: OutboxEventId, err: &anyhow::Error) {
        let retries = match self.store.mark_failed(run, id).await {
            Ok(retries) => retries,
            Err(mark_err) => {
                warn!(event = id.0, error = %mark_err, "failed to record outbox retry");
                return;
            }
        };
        warn!(event = id.0, %err, retries, "outbox event handler failed");
        if retries >= self.config.max_retries {
            if let Err(mark_err) = self.store.mark_terminally_failed(run, id).await {
                warn!(event = id.0, error = %mark_err, "failed to mark event terminally failed");
                return;
            }
            self.metrics.terminally_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn handle_file_analysis_finding(&self, run: &RunId, event: &OutboxEvent) -> anyhow::Result<()> {
        let finding: FileAnalysisFindingPayload = serde_json::from_value(event.payload.clone())?;
        let mut jobs = Vec::with_capacity(finding.pois.len());

        for poi_finding in &finding.pois {
            let semantic_id = poi_finding.semantic_id.clone().unwrap_or_else(|| {
                Poi::derive_semantic_id(&finding.file_path, poi_finding.kind, &poi_finding.name)
            });
            let poi = Poi {
                id: PoiId(0),
                run: run.clone(),
                file_path: finding.file_path.clone(),
                kind: poi_finding.kind,
                name: poi_finding.name.clone(),
                start_line: poi_finding.start_line,
                end_line: poi_finding.end_line,
                is_exported: poi_finding.is_exported,
                semantic_id: Some(semantic_id.clone()),
                llm_payload: poi_finding.llm_payload.clone(),
            };
            poi.validate()?;
            let id = self.store.insert_poi(&poi).await?;
            jobs.push((
                serde_json::to_value(RelationshipResolutionJob {
                    run: run.to_string(),
                    poi_id: id.0,
                    semantic_id: Some(semantic_id),
                    file_path: finding.file_path.clone(),
                })?,
                AddOptions::default(),
            ));
        }

        self.store.mark_file_status(run, &finding.file_path, FileStatus::Analyzed).await?;

        if !jobs.is_empty() {
            self.queue.add_bulk(RELATIONSHIP_RESOLUTION_QUEUE, jobs).await;
        }
        debug!(file = %finding.file_path, pois = finding.pois.len(), "published file-analysis-finding");
        Ok(())
    }

    async fn handle_relationship_analysis_finding(&self, run: &RunId, event: &OutboxEvent) -> anyhow::Result<()> {
        let finding: RelationshipAnalysisFindingPayload = serde_json::from_value(event.payload.clone())?;

        let mut by_hash: std::collections::HashMap<RelationshipHash, Vec<serde_json::Value>> =
            std::collections::HashMap::new();
        for candidate in &finding.candidates {
            let hash = RelationshipHash::compute(
                &candidate.source_semantic_id,
                &candidate.target_semantic_id,
                candidate.rel_type,
            );
            let content = EvidenceContent {
                source_semantic_id: candidate.source_semantic_id.clone(),
                target_semantic_id: candidate.target_semantic_id.clone(),
                rel_type: candidate.rel_type,
                detail: candidate.evidence_payload.clone(),
            };
            let content_value = serde_json::to_value(&content)?;
            let evidence = RelationshipEvidence {
                id: 0,
                run: run.clone(),
                relationship_hash: hash,
                payload: content_value.clone(),
                relationship_id: None,
                created_at: triangulum_store_core::now(),
            };
            self.store.insert_evidence(&evidence).await?;
            by_hash.entry(hash).or_default().push(content_value);
        }

        let mut validation_jobs = Vec::with_capacity(by_hash.len());
        for (hash, evidence) in by_hash {
            let batch = ValidationBatch {
                hash: hash.to_hex(),
                run: run.to_string(),
                evidence,
                expected: self.config.default_expected_evidence,
            };
            validation_jobs.push((serde_json::to_value(batch)?, AddOptions::default()));
        }
        if !validation_jobs.is_empty() {
            self.queue.add_bulk(ANALYSIS_FINDINGS_QUEUE, validation_jobs).await;
        }
        debug!(candidates = finding.candidates.len(), "published relationship-analysis-finding");
        Ok(())
    }

    async fn handle_global_relationship_analysis_finding(&self, run: &RunId, event: &OutboxEvent) -> anyhow::Result<()> {
        let finding: GlobalRelationshipAnalysisFindingPayload = serde_json::from_value(event.payload.clone())?;

        for candidate in &finding.relationships {
            let source = self.store.find_by_semantic_id(run, &candidate.source_semantic_id).await?;
            let target = self.store.find_by_semantic_id(run, &candidate.target_semantic_id).await?;
            let (Some(source), Some(target)) = (source, target) else {
                warn!(
                    source = %candidate.source_semantic_id,
                    target = %candidate.target_semantic_id,
                    "global relationship finding referenced an unresolved semantic id"
                );
                continue;
            };

            let mut relationship =
                Relationship::new(run.clone(), source.id, target.id, candidate.rel_type, candidate.confidence, None)?;
            relationship.status = RelationshipStatus::CrossFileValidated;
            relationship.reason = candidate.reason.clone();
            self.store.insert_relationship(&relationship).await?;
        }
        debug!(relationships = finding.relationships.len(), "published global-relationship-analysis-finding");
        Ok(())
    }

    /// After publishing, check whether every file in `run` is analyzed and,
    /// if so and not already done, enqueue one cross-file analysis job per
    /// directory (idempotent via `cross_file_triggered`).
    async fn maybe_trigger_cross_file(&self, run: &RunId) -> anyhow::Result<()> {
        if self.cross_file_triggered.contains_key(run) {
            return Ok(());
        }
        let files = self.store.list_files_for_run(run).await?;
        if files.is_empty() || !files.iter().all(|f| f.status == FileStatus::Analyzed) {
            return Ok(());
        }

        let mut directories: Vec<String> = files
            .iter()
            .map(|f| directory_of(&f.path))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        directories.sort();

        let mut jobs = Vec::with_capacity(directories.len());
        for directory in directories {
            let payload = GlobalRelationshipAnalysisJob { run: run.to_string(), directory };
            jobs.push((serde_json::to_value(payload)?, AddOptions::default()));
        }

        if !jobs.is_empty() {
            self.queue.add_bulk(GLOBAL_RELATIONSHIP_ANALYSIS_QUEUE, jobs).await;
        }
        self.cross_file_triggered.insert(run.clone(), ());
        debug!(run = %run, "cross-file analysis triggered");
        Ok(())
    }
}

fn directory_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use triangulum_store_core::{
        EvidenceStore, FileStore, OutboxStore, PoiStore, RelationshipStore, StoreError,
    };
    use triangulum_types::{
        Checkpoint, CheckpointId, FileRecord, Origin, OutboxEventStatus, PoiKind, Relationship,
        RelationshipId, RelationshipType, Run, RunStatus, Stage, ValidationResult,
    };

    #[derive(Default)]
    struct MemoryStore {
        runs: Mutex<Vec<Run>>,
        files: Mutex<Vec<FileRecord>>,
        pois: Mutex<Vec<Poi>>,
        relationships: Mutex<Vec<Relationship>>,
        evidence: Mutex<Vec<RelationshipEvidence>>,
        events: Mutex<Vec<OutboxEvent>>,
        checkpoints: Mutex<Vec<Checkpoint>>,
        next_event_id: AtomicU64,
        next_poi_id: AtomicU64,
        next_rel_id: AtomicU64,
    }

    #[async_trait]
    impl triangulum_store_core::RunStore for MemoryStore {
        async fn create_run(&self, run: &Run) -> anyhow::Result<()> {
            self.runs.lock().unwrap().push(run.clone());
            Ok(())
        }
        async fn finalize_run(&self, id: &RunId, status: RunStatus) -> anyhow::Result<()> {
            let mut runs = self.runs.lock().unwrap();
            let run = runs.iter_mut().find(|r| &r.id == id).ok_or_else(|| StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            })?;
            run.status = status;
            Ok(())
        }
        async fn get_run(&self, id: &RunId) -> anyhow::Result<Option<Run>> {
            Ok(self.runs.lock().unwrap().iter().find(|r| &r.id == id).cloned())
        }
    }

    #[async_trait]
    impl triangulum_store_core::FileStore for MemoryStore {
        async fn upsert_file(&self, file: &FileRecord) -> anyhow::Result<()> {
            let mut files = self.files.lock().unwrap();
            if let Some(existing) = files.iter_mut().find(|f| f.run == file.run && f.path == file.path) {
                *existing = file.clone();
            } else {
                files.push(file.clone());
            }
            Ok(())
        }
        async fn mark_file_status(&self, run: &RunId, path: &str, status: FileStatus) -> anyhow::Result<()> {
            let mut files = self.files.lock().unwrap();
            let file = files
                .iter_mut()
                .find(|f| &f.run == run && f.path == path)
                .ok_or_else(|| StoreError::NotFound { entity: "file", id: path.to_string() })?;
            file.status = status;
            Ok(())
        }
        async fn get_file(&self, run: &RunId, path: &str) -> anyhow::Result<Option<FileRecord>> {
            Ok(self.files.lock().unwrap().iter().find(|f| &f.run == run && f.path == path).cloned())
        }
        async fn list_files_for_run(&self, run: &RunId) -> anyhow::Result<Vec<FileRecord>> {
            Ok(self.files.lock().unwrap().iter().filter(|f| &f.run == run).cloned().collect())
        }
    }

    #[async_trait]
    impl triangulum_store_core::PoiStore for MemoryStore {
        async fn insert_poi(&self, poi: &Poi) -> anyhow::Result<PoiId> {
            let id = PoiId(self.next_poi_id.fetch_add(1, Ordering::Relaxed) as i64 + 1);
            let mut stored = poi.clone();
            stored.id = id;
            self.pois.lock().unwrap().push(stored);
            Ok(id)
        }
        async fn get_poi(&self, run: &RunId, id: PoiId) -> anyhow::Result<Option<Poi>> {
            Ok(self.pois.lock().unwrap().iter().find(|p| &p.run == run && p.id == id).cloned())
        }
        async fn find_by_semantic_id(&self, run: &RunId, semantic_id: &str) -> anyhow::Result<Option<Poi>> {
            Ok(self
                .pois
                .lock()
                .unwrap()
                .iter()
                .find(|p| &p.run == run && p.semantic_id.as_deref() == Some(semantic_id))
                .cloned())
        }
        async fn list_pois_for_run(&self, run: &RunId) -> anyhow::Result<Vec<Poi>> {
            Ok(self.pois.lock().unwrap().iter().filter(|p| &p.run == run).cloned().collect())
        }
    }

    #[async_trait]
    impl triangulum_store_core::RelationshipStore for MemoryStore {
        async fn insert_relationship(&self, rel: &Relationship) -> anyhow::Result<RelationshipId> {
            let id = RelationshipId(self.next_rel_id.fetch_add(1, Ordering::Relaxed) as i64 + 1);
            let mut stored = rel.clone();
            stored.id = id;
            self.relationships.lock().unwrap().push(stored);
            Ok(id)
        }
        async fn update_status(&self, run: &RunId, id: RelationshipId, status: RelationshipStatus) -> anyhow::Result<()> {
            let mut rels = self.relationships.lock().unwrap();
            let rel = rels
                .iter_mut()
                .find(|r| &r.run == run && r.id == id)
                .ok_or_else(|| StoreError::NotFound { entity: "relationship", id: id.0.to_string() })?;
            rel.status = status;
            Ok(())
        }
        async fn get_relationship(&self, run: &RunId, id: RelationshipId) -> anyhow::Result<Option<Relationship>> {
            Ok(self.relationships.lock().unwrap().iter().find(|r| &r.run == run && r.id == id).cloned())
        }
        async fn list_relationships_for_run(&self, run: &RunId) -> anyhow::Result<Vec<Relationship>> {
            Ok(self.relationships.lock().unwrap().iter().filter(|r| &r.run == run).cloned().collect())
        }
    }

    #[async_trait]
    impl triangulum_store_core::EvidenceStore for MemoryStore {
        async fn insert_evidence(&self, evidence: &RelationshipEvidence) -> anyhow::Result<i64> {
            let mut stored = evidence.clone();
            stored.id = self.evidence.lock().unwrap().len() as i64 + 1;
            self.evidence.lock().unwrap().push(stored.clone());
            Ok(stored.id)
        }
        async fn evidence_for_hash(&self, run: &RunId, hash: RelationshipHash) -> anyhow::Result<Vec<RelationshipEvidence>> {
            Ok(self
                .evidence
                .lock()
                .unwrap()
                .iter()
                .filter(|e| &e.run == run && e.relationship_hash == hash)
                .cloned()
                .collect())
        }
        async fn count_evidence_for_hash(&self, run: &RunId, hash: RelationshipHash) -> anyhow::Result<u64> {
            Ok(self.evidence_for_hash(run, hash).await?.len() as u64)
        }
        async fn link_evidence_to_relationship(&self, run: &RunId, hash: RelationshipHash, relationship: RelationshipId) -> anyhow::Result<()> {
            for e in self.evidence.lock().unwrap().iter_mut() {
                if &e.run == run && e.relationship_hash == hash {
                    e.relationship_id = Some(relationship);
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl triangulum_store_core::OutboxStore for MemoryStore {
        async fn append(&self, run: &RunId, event_type: EventType, payload: serde_json::Value, _origin: Origin) -> anyhow::Result<OutboxEventId> {
            let id = OutboxEventId(self.next_event_id.fetch_add(1, Ordering::Relaxed) as i64 + 1);
            self.events.lock().unwrap().push(OutboxEvent {
                id,
                run: run.clone(),
                event_type,
                payload,
                status: OutboxEventStatus::Pending,
                created_at: Utc::now(),
                retry_count: 0,
            });
            Ok(id)
        }
        async fn claim_batch(&self, run: &RunId, limit: u32) -> anyhow::Result<Vec<OutboxEvent>> {
            let mut events = self.events.lock().unwrap();
            let mut claimed = Vec::new();
            for event in events.iter_mut() {
                if claimed.len() >= limit as usize {
                    break;
                }
                if &event.run == run && event.status == OutboxEventStatus::Pending {
                    event.status = OutboxEventStatus::InFlight;
                    claimed.push(event.clone());
                }
            }
            Ok(claimed)
        }
        async fn mark_published(&self, run: &RunId, id: OutboxEventId) -> anyhow::Result<()> {
            let mut events = self.events.lock().unwrap();
            let event = events
                .iter_mut()
                .find(|e| &e.run == run && e.id == id)
                .ok_or_else(|| StoreError::NotFound { entity: "outbox event", id: id.0.to_string() })?;
            event.status = OutboxEventStatus::Published;
            Ok(())
        }
        async fn mark_failed(&self, run: &RunId, id: OutboxEventId) -> anyhow::Result<u32> {
            let mut events = self.events.lock().unwrap();
            let event = events
                .iter_mut()
                .find(|e| &e.run == run && e.id == id)
                .ok_or_else(|| StoreError::NotFound { entity: "outbox event", id: id.0.to_string() })?;
            event.retry_count += 1;
            event.status = OutboxEventStatus::Pending;
            Ok(event.retry_count)
        }
        async fn mark_terminally_failed(&self, run: &RunId, id: OutboxEventId) -> anyhow::Result<()> {
            let mut events = self.events.lock().unwrap();
            let event = events
                .iter_mut()
                .find(|e| &e.run == run && e.id == id)
                .ok_or_else(|| StoreError::NotFound { entity: "outbox event", id: id.0.to_string() })?;
            event.status = OutboxEventStatus::Failed;
            Ok(())
        }
        async fn count_pending(&self, run: &RunId) -> anyhow::Result<u64> {
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| {
                    &e.run == run
                        && matches!(e.status, OutboxEventStatus::Pending | OutboxEventStatus::InFlight)
                })
                .count() as u64)
        }
        async fn status_of(&self, run: &RunId, id: OutboxEventId) -> anyhow::Result<Option<OutboxEventStatus>> {
            Ok(self.events.lock().unwrap().iter().find(|e| &e.run == run && e.id == id).map(|e| e.status))
        }
    }

    #[async_trait]
    impl triangulum_store_core::CheckpointStore for MemoryStore {
        async fn create_checkpoint(&self, run: &RunId, stage: Stage, entity_id: &str, metadata: serde_json::Value) -> anyhow::Result<CheckpointId> {
            let id = CheckpointId(self.checkpoints.lock().unwrap().len() as i64 + 1);
            self.checkpoints.lock().unwrap().push(Checkpoint {
                id,
                run: run.clone(),
                stage,
                entity_id: entity_id.to_string(),
                status: triangulum_types::CheckpointStatus::Pending,
                metadata,
                validation_result: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            });
            Ok(id)
        }
        async fn update_checkpoint(&self, run: &RunId, id: CheckpointId, result: ValidationResult) -> anyhow::Result<()> {
            let mut checkpoints = self.checkpoints.lock().unwrap();
            let checkpoint = checkpoints
                .iter_mut()
                .find(|c| &c.run == run && c.id == id)
                .ok_or_else(|| StoreError::NotFound { entity: "checkpoint", id: id.0.to_string() })?;
            checkpoint.status = if result.valid {
                triangulum_types::CheckpointStatus::Completed
            } else {
                triangulum_types::CheckpointStatus::Failed
            };
            checkpoint.validation_result = Some(result);
            checkpoint.updated_at = Utc::now();
            Ok(())
        }
        async fn latest_for_entity(&self, run: &RunId, stage: Stage, entity_id: &str) -> anyhow::Result<Option<Checkpoint>> {
            Ok(self
                .checkpoints
                .lock()
                .unwrap()
                .iter()
                .filter(|c| &c.run == run && c.stage == stage && c.entity_id == entity_id)
                .max_by_key(|c| c.created_at)
                .cloned())
        }
        async fn list_for_run(&self, run: &RunId) -> anyhow::Result<Vec<Checkpoint>> {
            Ok(self.checkpoints.lock().unwrap().iter().filter(|c| &c.run == run).cloned().collect())
        }
    }

    fn publisher() -> (Arc<Publisher>, Arc<MemoryStore>, Arc<QueueBus>, RunId) {
        let store = Arc::new(MemoryStore::default());
        let queue = Arc::new(QueueBus::new());
        let run = RunId::new("run-1").unwrap();
        let publisher = Publisher::new(store.clone(), queue.clone(), PublisherConfig::default());
        publisher.track_run(run.clone());
        (publisher, store, queue, run)
    }

    #[tokio::test]
    async fn file_analysis_finding_inserts_pois_and_enqueues_resolution_jobs() {
        let (publisher, store, queue, run) = publisher();
        store.upsert_file(&FileRecord {
            run: run.clone(),
            path: "src/auth.js".into(),
            content_hash: "abc".into(),
            status: FileStatus::Processing,
        }).await.unwrap();

        let payload = FileAnalysisFindingPayload {
            file_path: "src/auth.js".into(),
            pois: vec![payloads::PoiFinding {
                kind: PoiKind::Function,
                name: "authenticate".into(),
                start_line: 1,
                end_line: 10,
                is_exported: Some(true),
                semantic_id: None,
                llm_payload: None,
            }],
        };
        store.append(&run, EventType::FileAnalysisFinding, serde_json::to_value(payload).unwrap(), Origin::FileAnalysis).await.unwrap();

        let processed = publisher.flush(&run).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(publisher.metrics().published(), 1);

        let pois = store.list_pois_for_run(&run).await.unwrap();
        assert_eq!(pois.len(), 1);
        assert_eq!(pois[0].semantic_id.as_deref(), Some("src/auth.js_function_authenticate"));

        let jobs = queue.get_waiting(RELATIONSHIP_RESOLUTION_QUEUE).await;
        assert_eq!(jobs.len(), 1);

        let file = store.get_file(&run, "src/auth.js").await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Analyzed);
    }

    #[tokio::test]
    async fn relationship_analysis_finding_bulk_inserts_evidence_and_batches_by_hash() {
        let (publisher, store, queue, run) = publisher();
        let payload = RelationshipAnalysisFindingPayload {
            file_path: Some("src/auth.js".into()),
            candidates: vec![
                payloads::RelationshipCandidate {
                    source_semantic_id: "src/auth.js_function_authenticate".into(),
                    target_semantic_id: "src/user.js_import_authenticate".into(),
                    rel_type: RelationshipType::Imports,
                    evidence_payload: serde_json::json!({"note": "vote-1"}),
                },
                payloads::RelationshipCandidate {
                    source_semantic_id: "src/auth.js_function_authenticate".into(),
                    target_semantic_id: "src/user.js_import_authenticate".into(),
                    rel_type: RelationshipType::Imports,
                    evidence_payload: serde_json::json!({"note": "vote-2"}),
                },
            ],
        };
        store.append(&run, EventType::RelationshipAnalysisFinding, serde_json::to_value(payload).unwrap(), Origin::RelationshipResolution).await.unwrap();

        publisher.flush(&run).await.unwrap();

        let hash = RelationshipHash::compute(
            "src/auth.js_function_authenticate",
            "src/user.js_import_authenticate",
            RelationshipType::Imports,
        );
        assert_eq!(store.count_evidence_for_hash(&run, hash).await.unwrap(), 2);

        let jobs = queue.get_waiting(ANALYSIS_FINDINGS_QUEUE).await;
        assert_eq!(jobs.len(), 1);
        let batch: ValidationBatch = serde_json::from_value(jobs[0].payload.clone()).unwrap();
        assert_eq!(batch.evidence.len(), 2);
        assert_eq!(batch.hash, hash.to_hex());
        let content: EvidenceContent = serde_json::from_value(batch.evidence[0].clone()).unwrap();
        assert_eq!(content.source_semantic_id, "src/auth.js_function_authenticate");
        assert_eq!(content.rel_type, RelationshipType::Imports);
    }

    #[tokio::test]
    async fn global_relationship_finding_resolves_semantic_ids_and_inserts_cross_file_validated() {
        let (publisher, store, _queue, run) = publisher();
        let source = store.insert_poi(&Poi {
            id: PoiId(0), run: run.clone(), file_path: "a.js".into(), kind: PoiKind::Module,
            name: "a".into(), start_line: 1, end_line: 1, is_exported: None,
            semantic_id: Some("a_module_a".into()), llm_payload: None,
        }).await.unwrap();
        let target = store.insert_poi(&Poi {
            id: PoiId(0), run: run.clone(), file_path: "b.js".into(), kind: PoiKind::Module,
            name: "b".into(), start_line: 1, end_line: 1, is_exported: None,
            semantic_id: Some("b_module_b".into()), llm_payload: None,
        }).await.unwrap();
        let _ = (source, target);

        let payload = GlobalRelationshipAnalysisFindingPayload {
            relationships: vec![payloads::GlobalRelationshipFinding {
                source_semantic_id: "a_module_a".into(),
                target_semantic_id: "b_module_b".into(),
                rel_type: RelationshipType::DependsOn,
                confidence: 0.95,
                reason: Some("cross-file aggregate".into()),
            }],
        };
        store.append(&run, EventType::GlobalRelationshipAnalysisFinding, serde_json::to_value(payload).unwrap(), Origin::GlobalAnalysis).await.unwrap();

        publisher.flush(&run).await.unwrap();

        let rels = store.list_relationships_for_run(&run).await.unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0].status, RelationshipStatus::CrossFileValidated);
    }

    #[tokio::test]
    async fn global_relationship_finding_skips_unresolved_semantic_ids_without_erroring() {
        let (publisher, store, _queue, run) = publisher();
        let payload = GlobalRelationshipAnalysisFindingPayload {
            relationships: vec![payloads::GlobalRelationshipFinding {
                source_semantic_id: "ghost_a".into(),
                target_semantic_id: "ghost_b".into(),
                rel_type: RelationshipType::Calls,
                confidence: 0.5,
                reason: None,
            }],
        };
        store.append(&run, EventType::GlobalRelationshipAnalysisFinding, serde_json::to_value(payload).unwrap(), Origin::GlobalAnalysis).await.unwrap();

        let processed = publisher.flush(&run).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(publisher.metrics().published(), 1);
        assert!(store.list_relationships_for_run(&run).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cross_file_trigger_fires_once_all_files_are_analyzed() {
        let (publisher, store, queue, run) = publisher();
        for path in ["src/a.js", "src/b.js"] {
            store.upsert_file(&FileRecord {
                run: run.clone(),
                path: path.into(),
                content_hash: "x".into(),
                status: FileStatus::Analyzed,
            }).await.unwrap();
        }

        publisher.flush(&run).await.unwrap();
        let jobs = queue.get_waiting(GLOBAL_RELATIONSHIP_ANALYSIS_QUEUE).await;
        assert_eq!(jobs.len(), 1);

        // A second flush must not re-trigger (idempotent per-run flag).
        publisher.flush(&run).await.unwrap();
        let jobs = queue.get_waiting(GLOBAL_RELATIONSHIP_ANALYSIS_QUEUE).await;
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn handler_errors_are_retried_then_terminally_failed() {
        let (publisher, store, _queue, run) = publisher();
        // Malformed payload: missing required fields fails deserialization every time.
        store.append(&run, EventType::FileAnalysisFinding, serde_json::json!({"not": "valid"}), Origin::FileAnalysis).await.unwrap();

        let id = OutboxEventId(1);
        for _ in 0..publisher.config.max_retries {
            publisher.flush(&run).await.unwrap();
        }
        assert_eq!(store.status_of(&run, id).await.unwrap(), Some(OutboxEventStatus::Failed));
        assert_eq!(publisher.metrics().terminally_failed(), 1);
    }

    #[tokio::test]
    async fn untracking_a_run_clears_its_cross_file_flag() {
        let (publisher, _store, _queue, run) = publisher();
        publisher.cross_file_triggered.insert(run.clone(), ());
        publisher.untrack_run(&run);
        assert!(!publisher.cross_file_triggered.contains_key(&run));
    }
}
