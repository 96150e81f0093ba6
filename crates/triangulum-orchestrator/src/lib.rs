#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **triangulum-orchestrator** – the Run Orchestrator (§4.10): owns a run's
//! lifecycle end to end, tying every other crate in the workspace into one
//! coherent pipeline execution.
//!
//! [`RunOrchestrator`]/[`RunSession`] are modeled directly on the teacher's
//! `toka_orchestration::{OrchestrationEngine, OrchestrationSession}`: an
//! `Arc<Self>`-based engine spawned onto its own task, a completion channel
//! consumed by the session handle, and a phase enum advanced one step at a
//! time. The phases replace the teacher's agent-spawn phases 1:1 in shape
//! (`Discovering → Analyzing → CrossFile → Materializing → Finalizing →
//! Completed/Failed`) but not in meaning — there is no agent spawning here,
//! only a data pipeline's stages.
//!
//! File discovery, the per-file/per-relationship LLM workers, and the
//! directory-level cross-file analyzer are external collaborators (§1):
//! this crate drives them through the queue bus and outbox, it does not
//! implement them. CLI/env/metrics wiring is likewise out of scope — this
//! crate is a library, no binary is added.

pub mod config;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use triangulum_bus_core::{EventBus, InMemoryBus, PipelineEvent};
use triangulum_checkpoint::CheckpointManager;
use triangulum_graph::{GraphStore, MaterializationSummary, Materializer};
use triangulum_llm::LlmClient;
use triangulum_publisher::{Publisher, PublisherConfig};
use triangulum_queue::{AddOptions, QueueBus};
use triangulum_reconcile::triangulation::{default_roles, TriangulationOrchestrator};
use triangulum_reconcile::Reconciler;
use triangulum_store_core::Store;
use triangulum_types::{FileRecord, FileStatus, Run, RunId, RunStatus, Stage};

pub use config::PipelineConfig;

const FILE_ANALYSIS_QUEUE: &str = "file-analysis-queue";
const GLOBAL_RELATIONSHIP_ANALYSIS_QUEUE: &str = "global-relationship-analysis-queue";

/// A file handed to the orchestrator at the start of a run. Walking the
/// filesystem and computing the content hash happen upstream of this crate.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredFile {
    /// Path, unique within the run.
    pub path: String,
    /// Content hash, used for checkpoint validation and change detection.
    pub content_hash: String,
}

/// A run's lifecycle phase (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPhase {
    /// Discovered files are being registered and enqueued.
    Discovering,
    /// Waiting for every file to reach `analyzed` and its relationships to
    /// be built.
    Analyzing,
    /// Waiting for the cross-file (global relationship) pass to drain.
    CrossFile,
    /// Writing validated relationships to the graph store.
    Materializing,
    /// Recording the final checkpoint and transitioning the run.
    Finalizing,
    /// The run reached a terminal, successful state.
    Completed,
    /// The run was aborted; partial state is left untouched for inspection.
    Failed,
}

/// A single JSON summary emitted on exit (§7): counts per status,
/// checkpoints with their validation results, and the first failure.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// The run this summary describes.
    pub run: String,
    /// Final lifecycle status.
    pub status: RunStatus,
    /// Phase the run reached before stopping.
    pub final_phase: RunPhase,
    /// Total files discovered.
    pub files_total: usize,
    /// Files that reached `analyzed`.
    pub files_analyzed: usize,
    /// Per-stage checkpoint counts and success rates.
    pub checkpoints: triangulum_checkpoint::RunSummary,
    /// Graph materialization counts, if materialization ran.
    pub materialization: Option<MaterializationSummary>,
    /// First fatal error encountered, if the run failed.
    pub error: Option<String>,
}

/// Owns every sub-component a run needs and drives it through its phases.
pub struct RunOrchestrator {
    store: Arc<dyn Store>,
    queue: Arc<QueueBus>,
    publisher: Arc<Publisher>,
    reconciler: Arc<Reconciler>,
    checkpoints: Arc<CheckpointManager>,
    materializer: Arc<Materializer>,
    config: PipelineConfig,
    phase: RwLock<RunPhase>,
    materialization: RwLock<Option<MaterializationSummary>>,
    bus: Arc<dyn EventBus>,
}

impl RunOrchestrator {
    /// Build an orchestrator wiring the publisher, reconciler, checkpoint
    /// manager, and graph materializer over a shared store and queue bus.
    /// `llm` backs the six default triangulation roles (§4.7); `graph` is
    /// the external collaborator the materializer writes to (§4.9).
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<QueueBus>,
        graph: Arc<dyn GraphStore>,
        llm: Arc<dyn LlmClient>,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::default());
        let publisher = Publisher::new(store.clone(), queue.clone(), config.publisher.clone());
        let triangulation = TriangulationOrchestrator::new(default_roles(llm));
        let pool = triangulum_worker_pool::PoolManager::new(triangulum_worker_pool::PoolConfig::default());
        pool.set_bus(bus.clone());
        let reconciler = Arc::new(
            Reconciler::new(store.clone(), queue.clone(), triangulation).with_pool(pool),
        );
        let checkpoints = Arc::new(
            CheckpointManager::new(store.clone())
                .with_benchmark(config.benchmark)
                .with_bus(bus.clone()),
        );
        let materializer =
            Arc::new(Materializer::new(store.clone(), graph).with_batch_size(config.graph_batch_size));

        Arc::new(Self {
            store,
            queue,
            publisher,
            reconciler,
            checkpoints,
            materializer,
            config,
            phase: RwLock::new(RunPhase::Discovering),
            materialization: RwLock::new(None),
            bus,
        })
    }

    /// Override the default publisher config the orchestrator built its
    /// publisher with. Only meaningful before [`RunOrchestrator::start_run`]
    /// is first called — exposed for tests that want a tighter batch size.
    pub fn with_publisher_config(self: Arc<Self>, _config: PublisherConfig) -> Arc<Self> {
        // The publisher is already constructed by `new`; re-exposing this
        // knob would require rebuilding it, which would orphan any run
        // already tracked. Configure it through `PipelineConfig` instead.
        self
    }

    /// Current phase of the most recently started run.
    pub async fn phase(&self) -> RunPhase {
        *self.phase.read().await
    }

    async fn set_phase(&self, run: &RunId, phase: RunPhase) {
        *self.phase.write().await = phase;
        info!(?phase, "run phase transition");
        let _ = self.bus.publish(&PipelineEvent::RunPhaseChanged {
            run: run.clone(),
            phase: format!("{phase:?}").to_lowercase(),
        });
    }

    /// Subscribe to this orchestrator's `RunPhaseChanged`/`RunFinished`/
    /// `CheckpointUpdated` events. Useful for a CLI progress bar or metrics
    /// sink that wants to observe a run without being wired into its drive
    /// loop.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.bus.subscribe()
    }

    /// Start a run over `files`, returning a handle to await completion on.
    pub fn start_run(self: Arc<Self>, run: RunId, files: Vec<DiscoveredFile>) -> RunSession {
        let (tx, rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let engine = self.clone();
        let run_id = run.clone();
        let shutdown_for_task = shutdown.clone();

        tokio::spawn(async move {
            let summary = engine.run_to_completion(run_id, files, shutdown_for_task).await;
            let _ = tx.send(summary).await;
        });

        RunSession { run, engine: self, completion_rx: rx, shutdown }
    }

    async fn run_to_completion(
        self: Arc<Self>,
        run: RunId,
        files: Vec<DiscoveredFile>,
        shutdown: CancellationToken,
    ) -> RunSummary {
        self.publisher.track_run(run.clone());
        let publisher_handle = self.publisher.spawn_loop(shutdown.clone());
        let reconciler_handle = self.reconciler.clone().spawn_consumer(shutdown.clone());

        let outcome = self.drive(&run, &files).await;

        shutdown.cancel();
        let _ = publisher_handle.await;
        let _ = reconciler_handle.await;
        self.publisher.untrack_run(&run);

        let (status, final_phase, error) = match &outcome {
            Ok(()) => (RunStatus::Finalized, RunPhase::Completed, None),
            Err(err) => (RunStatus::Failed, RunPhase::Failed, Some(err.to_string())),
        };
        if let Err(err) = self.store.finalize_run(&run, status).await {
            warn!(run = %run, error = %err, "failed to record run finalization");
        }
        self.set_phase(&run, final_phase).await;
        let _ = self.bus.publish(&PipelineEvent::RunFinished {
            run: run.clone(),
            succeeded: matches!(status, RunStatus::Finalized),
        });

        self.build_summary(&run, &files, status, final_phase, error).await
    }

    async fn drive(&self, run: &RunId, files: &[DiscoveredFile]) -> Result<()> {
        self.store.create_run(&Run::start(run.clone(), Utc::now())).await?;

        self.set_phase(run, RunPhase::Discovering).await;
        self.discover(run, files).await?;

        self.set_phase(run, RunPhase::Analyzing).await;
        self.wait_for_analysis(run, files).await?;

        self.set_phase(run, RunPhase::CrossFile).await;
        if !files.is_empty() {
            self.wait_for_cross_file(run).await?;
        }

        self.set_phase(run, RunPhase::Materializing).await;
        let materialized = self.materializer.materialize_run(run).await?;
        info!(
            run = %run,
            nodes = materialized.nodes_written,
            edges = materialized.edges_written,
            "materialized run"
        );
        *self.materialization.write().await = Some(materialized.clone());

        self.set_phase(run, RunPhase::Finalizing).await;
        self.checkpoints
            .record(
                run,
                Stage::PipelineComplete,
                run.to_string().as_str(),
                serde_json::json!({
                    "node_count": materialized.nodes_written,
                    "relationship_count": materialized.edges_written,
                }),
            )
            .await?;

        Ok(())
    }

    async fn discover(&self, run: &RunId, files: &[DiscoveredFile]) -> Result<()> {
        for file in files {
            self.store
                .upsert_file(&FileRecord {
                    run: run.clone(),
                    path: file.path.clone(),
                    content_hash: file.content_hash.clone(),
                    status: FileStatus::Pending,
                })
                .await?;

            self.checkpoints
                .record(
                    run,
                    Stage::FileLoaded,
                    &file.path,
                    serde_json::json!({ "content_hash": file.content_hash }),
                )
                .await?;

            self.queue
                .add(
                    FILE_ANALYSIS_QUEUE,
                    serde_json::json!({
                        "run": run.to_string(),
                        "file_path": file.path,
                        "content_hash": file.content_hash,
                    }),
                    AddOptions::default(),
                )
                .await;
        }
        Ok(())
    }

    /// Poll until every file reaches a terminal analysis status, recording
    /// `entities-extracted`/`relationships-built` checkpoints as files finish.
    /// Aborts if no file's status changes for `stage_watchdog`.
    async fn wait_for_analysis(&self, run: &RunId, files: &[DiscoveredFile]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let mut recorded: BTreeSet<(Stage, String)> = BTreeSet::new();
        let mut last_progress = Instant::now();
        let mut last_done_count = 0usize;

        loop {
            let records = self.store.list_files_for_run(run).await?;
            let done = records
                .iter()
                .filter(|f| matches!(f.status, FileStatus::Analyzed | FileStatus::Failed))
                .count();

            for record in &records {
                if record.status != FileStatus::Analyzed {
                    continue;
                }
                if recorded.insert((Stage::EntitiesExtracted, record.path.clone())) {
                    let pois = self.store.list_pois_for_run(run).await?;
                    let entity_count = pois.iter().filter(|p| p.file_path == record.path).count();
                    self.checkpoints
                        .record(
                            run,
                            Stage::EntitiesExtracted,
                            &record.path,
                            serde_json::json!({ "entity_count": entity_count }),
                        )
                        .await?;
                }
                if recorded.insert((Stage::RelationshipsBuilt, record.path.clone())) {
                    let relationships = self.store.list_relationships_for_run(run).await?;
                    let relationship_count =
                        relationships.iter().filter(|r| r.file_path.as_deref() == Some(record.path.as_str())).count();
                    self.checkpoints
                        .record(
                            run,
                            Stage::RelationshipsBuilt,
                            &record.path,
                            serde_json::json!({ "relationship_count": relationship_count }),
                        )
                        .await?;
                }
            }

            if done > last_done_count {
                last_done_count = done;
                last_progress = Instant::now();
            }
            if done == records.len() {
                return Ok(());
            }
            if last_progress.elapsed() > self.config.stage_watchdog {
                bail!("analyzing stage stalled: {}/{} files analyzed after {:?}", done, records.len(), last_progress.elapsed());
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Poll until the global-relationship-analysis queue has drained and
    /// the outbox has no pending events, meaning the cross-file pass (the
    /// publisher's own trigger, §4.5) has fully played through.
    async fn wait_for_cross_file(&self, run: &RunId) -> Result<()> {
        let mut last_progress = Instant::now();
        let mut last_pending = u64::MAX;

        loop {
            let waiting = self.queue.get_waiting(GLOBAL_RELATIONSHIP_ANALYSIS_QUEUE).await;
            let active = self.queue.get_active(GLOBAL_RELATIONSHIP_ANALYSIS_QUEUE).await;
            let pending_events = self.store.count_pending(run).await?;

            if waiting.is_empty() && active.is_empty() && pending_events == 0 {
                return Ok(());
            }

            if pending_events < last_pending {
                last_pending = pending_events;
                last_progress = Instant::now();
            }
            if last_progress.elapsed() > self.config.stage_watchdog {
                bail!("cross-file stage stalled: {pending_events} outbox events still pending after {:?}", last_progress.elapsed());
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn build_summary(
        &self,
        run: &RunId,
        files: &[DiscoveredFile],
        status: RunStatus,
        final_phase: RunPhase,
        error: Option<String>,
    ) -> RunSummary {
        let records = self.store.list_files_for_run(run).await.unwrap_or_default();
        let files_analyzed = records.iter().filter(|f| f.status == FileStatus::Analyzed).count();
        let checkpoints = self.checkpoints.get_run_summary(run).await.unwrap_or_else(|err| {
            warn!(run = %run, error = %err, "failed to build checkpoint summary");
            triangulum_checkpoint::RunSummary { stages: std::collections::BTreeMap::new() }
        });

        RunSummary {
            run: run.to_string(),
            status,
            final_phase,
            files_total: files.len(),
            files_analyzed,
            checkpoints,
            materialization: self.materialization.read().await.clone(),
            error,
        }
    }
}

/// Handle to an in-flight or completed run.
pub struct RunSession {
    run: RunId,
    engine: Arc<RunOrchestrator>,
    completion_rx: mpsc::Receiver<RunSummary>,
    shutdown: CancellationToken,
}

impl RunSession {
    /// The run this session tracks.
    pub fn run(&self) -> &RunId {
        &self.run
    }

    /// Current phase, read live from the owning orchestrator.
    pub async fn phase(&self) -> RunPhase {
        self.engine.phase().await
    }

    /// Request early cancellation. The orchestrator still finalizes the run
    /// (as `failed`) and emits a summary; it does not discard state.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the run to reach a terminal phase and return its summary.
    pub async fn wait_for_completion(mut self) -> Result<RunSummary> {
        self.completion_rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("run session terminated without a summary"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use triangulum_checkpoint::BenchmarkConfig;
    use triangulum_graph::MemoryGraph;
    use triangulum_llm::ScriptedLlmClient;
    use triangulum_store_core::StoreError;
    use triangulum_types::{
        EventType, Origin, OutboxEvent, OutboxEventId, OutboxEventStatus, PoiId, PoiKind,
        Relationship, RelationshipEvidence, RelationshipHash, RelationshipId, RelationshipStatus,
        RelationshipType,
    };

    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        runs: Mutex<Vec<Run>>,
        files: Mutex<Vec<FileRecord>>,
        pois: Mutex<Vec<triangulum_types::Poi>>,
        relationships: Mutex<Vec<Relationship>>,
        evidence: Mutex<Vec<RelationshipEvidence>>,
        events: Mutex<Vec<OutboxEvent>>,
        checkpoints: Mutex<Vec<triangulum_types::Checkpoint>>,
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
        async fn insert_poi(&self, poi: &triangulum_types::Poi) -> anyhow::Result<PoiId> {
            let id = PoiId(self.next_poi_id.fetch_add(1, Ordering::Relaxed) as i64 + 1);
            let mut stored = poi.clone();
            stored.id = id;
            self.pois.lock().unwrap().push(stored);
            Ok(id)
        }
        async fn get_poi(&self, run: &RunId, id: PoiId) -> anyhow::Result<Option<triangulum_types::Poi>> {
            Ok(self.pois.lock().unwrap().iter().find(|p| &p.run == run && p.id == id).cloned())
        }
        async fn find_by_semantic_id(&self, run: &RunId, semantic_id: &str) -> anyhow::Result<Option<triangulum_types::Poi>> {
            Ok(self
                .pois
                .lock()
                .unwrap()
                .iter()
                .find(|p| &p.run == run && p.semantic_id.as_deref() == Some(semantic_id))
                .cloned())
        }
        async fn list_pois_for_run(&self, run: &RunId) -> anyhow::Result<Vec<triangulum_types::Poi>> {
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
        async fn create_checkpoint(&self, run: &RunId, stage: Stage, entity_id: &str, metadata: serde_json::Value) -> anyhow::Result<triangulum_types::CheckpointId> {
            let id = triangulum_types::CheckpointId(self.checkpoints.lock().unwrap().len() as i64 + 1);
            self.checkpoints.lock().unwrap().push(triangulum_types::Checkpoint {
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
        async fn update_checkpoint(&self, run: &RunId, id: triangulum_types::CheckpointId, result: triangulum_types::ValidationResult) -> anyhow::Result<()> {
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
        async fn latest_for_entity(&self, run: &RunId, stage: Stage, entity_id: &str) -> anyhow::Result<Option<triangulum_types::Checkpoint>> {
            Ok(self
                .checkpoints
                .lock()
                .unwrap()
                .iter()
                .filter(|c| &c.run == run && c.stage == stage && c.entity_id == entity_id)
                .max_by_key(|c| c.created_at)
                .cloned())
        }
        async fn list_for_run(&self, run: &RunId) -> anyhow::Result<Vec<triangulum_types::Checkpoint>> {
            Ok(self.checkpoints.lock().unwrap().iter().filter(|c| &c.run == run).cloned().collect())
        }
    }

    fn orchestrator(config: PipelineConfig) -> (Arc<RunOrchestrator>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let queue = Arc::new(QueueBus::new());
        let graph: Arc<dyn GraphStore> = Arc::new(MemoryGraph::new());
        let llm = Arc::new(ScriptedLlmClient::new(Vec::new()));
        let engine = RunOrchestrator::new(store.clone() as Arc<dyn Store>, queue, graph, llm, config);
        (engine, store)
    }

    /// Simulates the external file-analysis worker completing a file: a POI
    /// plus one relationship to itself's neighbour, marked analyzed.
    async fn simulate_analysis(store: &MemoryStore, run: &RunId, path: &str, neighbour_poi: Option<PoiId>) -> PoiId {
        use triangulum_store_core::PoiStore;
        use triangulum_store_core::RelationshipStore;
        use triangulum_store_core::FileStore;

        let poi = triangulum_types::Poi {
            id: PoiId(0),
            run: run.clone(),
            file_path: path.to_string(),
            kind: PoiKind::Function,
            name: "handler".into(),
            start_line: 1,
            end_line: 5,
            is_exported: Some(true),
            semantic_id: Some(format!("{path}_function_handler")),
            llm_payload: None,
        };
        let id = store.insert_poi(&poi).await.unwrap();

        if let Some(target) = neighbour_poi {
            let rel = Relationship::new(run.clone(), id, target, RelationshipType::Calls, 0.9, Some(path.to_string())).unwrap();
            let mut rel = rel;
            rel.status = RelationshipStatus::Validated;
            store.insert_relationship(&rel).await.unwrap();
        }

        store.mark_file_status(run, path, FileStatus::Analyzed).await.unwrap();
        id
    }

    #[tokio::test]
    async fn zero_files_completes_with_no_errors_and_empty_summary() {
        let (engine, _store) = orchestrator(PipelineConfig {
            poll_interval: Duration::from_millis(5),
            stage_watchdog: Duration::from_secs(2),
            ..PipelineConfig::default()
        });
        let run = RunId::new("run-empty").unwrap();

        let session = engine.start_run(run.clone(), Vec::new());
        let summary = session.wait_for_completion().await.unwrap();

        assert_eq!(summary.status, RunStatus::Finalized);
        assert_eq!(summary.final_phase, RunPhase::Completed);
        assert_eq!(summary.files_total, 0);
        assert_eq!(summary.files_analyzed, 0);
        assert!(summary.error.is_none());
        assert_eq!(summary.materialization.unwrap().nodes_written, 0);
    }

    #[tokio::test]
    async fn happy_path_run_materializes_validated_relationships() {
        let (engine, store) = orchestrator(PipelineConfig {
            poll_interval: Duration::from_millis(5),
            stage_watchdog: Duration::from_secs(2),
            ..PipelineConfig::default()
        });
        let run = RunId::new("run-happy").unwrap();
        let files = vec![
            DiscoveredFile { path: "src/a.js".into(), content_hash: "h1".into() },
            DiscoveredFile { path: "src/b.js".into(), content_hash: "h2".into() },
        ];

        let session = engine.start_run(run.clone(), files);

        // Give the discovery phase a moment to register the files, then act
        // as the external analysis workers would: mark both files analyzed
        // with one validated relationship between them.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let poi_b = simulate_analysis(&store, &run, "src/b.js", None).await;
        simulate_analysis(&store, &run, "src/a.js", Some(poi_b)).await;

        let summary = session.wait_for_completion().await.unwrap();

        assert_eq!(summary.status, RunStatus::Finalized);
        assert_eq!(summary.final_phase, RunPhase::Completed);
        assert_eq!(summary.files_total, 2);
        assert_eq!(summary.files_analyzed, 2);
        let materialization = summary.materialization.unwrap();
        assert_eq!(materialization.nodes_written, 2);
        assert_eq!(materialization.edges_written, 1);
    }

    #[tokio::test]
    async fn benchmark_not_met_still_finalizes_the_run() {
        let (engine, store) = orchestrator(PipelineConfig {
            poll_interval: Duration::from_millis(5),
            stage_watchdog: Duration::from_secs(2),
            benchmark: BenchmarkConfig { min_nodes: 1_000, min_relationships: 1_000 },
            ..PipelineConfig::default()
        });
        let run = RunId::new("run-under-benchmark").unwrap();
        let files = vec![DiscoveredFile { path: "src/lonely.js".into(), content_hash: "h1".into() }];

        let session = engine.start_run(run.clone(), files);
        tokio::time::sleep(Duration::from_millis(20)).await;
        simulate_analysis(&store, &run, "src/lonely.js", None).await;

        let summary = session.wait_for_completion().await.unwrap();

        // Missing the benchmark is not a fatal error (§8 scenario 6): the run
        // still finalizes and all intermediate state (the checkpoint history,
        // the materialized node) is preserved for inspection.
        assert_eq!(summary.status, RunStatus::Finalized);
        assert_eq!(summary.final_phase, RunPhase::Completed);
        let pipeline_complete = summary
            .checkpoints
            .stages
            .get(&Stage::PipelineComplete)
            .expect("pipeline-complete stage recorded");
        assert_eq!(pipeline_complete.failed, 1);
    }

    #[tokio::test]
    async fn stalled_analysis_trips_the_watchdog_and_fails_the_run() {
        let (engine, _store) = orchestrator(PipelineConfig {
            poll_interval: Duration::from_millis(5),
            stage_watchdog: Duration::from_millis(30),
            ..PipelineConfig::default()
        });
        let run = RunId::new("run-stalled").unwrap();
        let files = vec![DiscoveredFile { path: "src/stuck.js".into(), content_hash: "h1".into() }];

        let session = engine.start_run(run.clone(), files);
        let summary = session.wait_for_completion().await.unwrap();

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.final_phase, RunPhase::Failed);
        assert!(summary.error.unwrap().contains("stalled"));
    }
}
