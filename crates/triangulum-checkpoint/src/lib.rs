#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **triangulum-checkpoint** – per-entity, per-stage progress tracking,
//! stage-specific validation, run summaries, and rollback (§4.8).
//!
//! Grounded in the teacher's `toka_orchestration::monitor::ProgressMonitor`:
//! the same shape (one progress record per tracked entity, a metrics
//! summary derived on demand) generalized from per-agent progress to
//! per-`(stage, entity)` checkpoints backed by [`triangulum_store_core::CheckpointStore`]
//! instead of an in-memory `DashMap`, since checkpoint history must survive
//! a process restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use triangulum_bus_core::{EventBus, PipelineEvent};
use triangulum_store_core::Store;
use triangulum_types::{Checkpoint, CheckpointId, CheckpointStatus, RunId, Stage, ValidationResult};

/// Minimum node/relationship counts a run must clear at `pipeline-complete`
/// for its final checkpoint to validate (§4.8's "configurable benchmark").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Minimum materialized node count.
    pub min_nodes: u64,
    /// Minimum materialized relationship count.
    pub min_relationships: u64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self { min_nodes: 1, min_relationships: 0 }
    }
}

/// Result of rolling a run back to an earlier checkpoint.
#[derive(Debug, Clone)]
pub struct RollbackResult {
    /// Checkpoints created after the rollback target, invalidated by this call.
    pub invalidated_ids: Vec<CheckpointId>,
    /// Stage processing should resume from.
    pub next_stage: Stage,
}

/// Per-stage counts and success rate, keyed on the most recent checkpoint
/// attempt per entity.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    /// Distinct entities with a checkpoint recorded at this stage.
    pub total: usize,
    /// Entities whose latest attempt completed successfully.
    pub completed: usize,
    /// Entities whose latest attempt failed.
    pub failed: usize,
    /// `completed / total`, or `1.0` when no entity has reached this stage yet.
    pub success_rate: f64,
}

/// Per-stage breakdown for a run, returned by [`CheckpointManager::get_run_summary`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Summary per stage, in pipeline order.
    pub stages: BTreeMap<Stage, StageSummary>,
}

/// Tracks, validates, and can roll back per-entity stage progress for a run.
pub struct CheckpointManager {
    store: Arc<dyn Store>,
    benchmark: BenchmarkConfig,
    bus: Option<Arc<dyn EventBus>>,
}

impl CheckpointManager {
    /// Build a manager backed by `store`, using the default benchmark.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, benchmark: BenchmarkConfig::default(), bus: None }
    }

    /// Override the `pipeline-complete` benchmark.
    pub fn with_benchmark(mut self, benchmark: BenchmarkConfig) -> Self {
        self.benchmark = benchmark;
        self
    }

    /// Publish a [`PipelineEvent::CheckpointUpdated`] on `bus` every time a
    /// checkpoint's validation result is recorded.
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Create a new, pending checkpoint row.
    pub async fn create_checkpoint(
        &self,
        run: &RunId,
        stage: Stage,
        entity_id: &str,
        metadata: Value,
    ) -> anyhow::Result<CheckpointId> {
        self.store.create_checkpoint(run, stage, entity_id, metadata).await
    }

    /// Run the stage-specific validator against a checkpoint's metadata.
    pub fn validate_checkpoint(&self, checkpoint: &Checkpoint) -> ValidationResult {
        match checkpoint.stage {
            Stage::FileLoaded => validate_file_loaded(&checkpoint.metadata),
            Stage::EntitiesExtracted => validate_entities_extracted(&checkpoint.metadata),
            Stage::RelationshipsBuilt => validate_relationships_built(&checkpoint.metadata),
            Stage::Neo4jStored => validate_neo4j_stored(&checkpoint.metadata),
            Stage::PipelineComplete => validate_pipeline_complete(&checkpoint.metadata, &self.benchmark),
        }
    }

    /// Attach a validation result to a checkpoint, transitioning its status.
    pub async fn update_checkpoint(
        &self,
        run: &RunId,
        id: CheckpointId,
        result: ValidationResult,
    ) -> anyhow::Result<()> {
        self.store.update_checkpoint(run, id, result).await
    }

    /// Create a checkpoint, validate it immediately, and persist the result
    /// in one call — the common path for a worker reporting stage completion.
    pub async fn record(
        &self,
        run: &RunId,
        stage: Stage,
        entity_id: &str,
        metadata: Value,
    ) -> anyhow::Result<(CheckpointId, ValidationResult)> {
        let id = self.create_checkpoint(run, stage, entity_id, metadata.clone()).await?;
        let checkpoint = Checkpoint {
            id,
            run: run.clone(),
            stage,
            entity_id: entity_id.to_string(),
            status: CheckpointStatus::Pending,
            metadata,
            validation_result: None,
            created_at: triangulum_store_core::now(),
            updated_at: triangulum_store_core::now(),
        };
        let result = self.validate_checkpoint(&checkpoint);
        self.update_checkpoint(run, id, result.clone()).await?;
        if !result.valid {
            warn!(?stage, entity_id, errors = ?result.errors, "checkpoint failed validation");
        }
        if let Some(bus) = &self.bus {
            let _ = bus.publish(&PipelineEvent::CheckpointUpdated {
                run: run.clone(),
                checkpoint: id,
                stage,
                valid: result.valid,
            });
        }
        Ok((id, result))
    }

    /// Per-stage counts and success rates across every entity checkpointed
    /// so far for `run`.
    pub async fn get_run_summary(&self, run: &RunId) -> anyhow::Result<RunSummary> {
        let checkpoints = self.store.list_for_run(run).await?;
        let mut latest: BTreeMap<(Stage, String), Checkpoint> = BTreeMap::new();
        for checkpoint in checkpoints {
            let key = (checkpoint.stage, checkpoint.entity_id.clone());
            match latest.get(&key) {
                Some(current) if current.updated_at >= checkpoint.updated_at => {}
                _ => {
                    latest.insert(key, checkpoint);
                }
            }
        }

        let mut stages: BTreeMap<Stage, StageSummary> = BTreeMap::new();
        for stage in Stage::ORDER {
            let entities: Vec<&Checkpoint> =
                latest.iter().filter(|((s, _), _)| s == stage).map(|(_, c)| c).collect();
            let total = entities.len();
            let completed = entities.iter().filter(|c| c.status == CheckpointStatus::Completed).count();
            let failed = entities.iter().filter(|c| c.status == CheckpointStatus::Failed).count();
            let success_rate = if total == 0 { 1.0 } else { completed as f64 / total as f64 };
            stages.insert(*stage, StageSummary { total, completed, failed, success_rate });
        }

        Ok(RunSummary { stages })
    }

    /// Invalidate every checkpoint recorded after `id` and report the stage
    /// processing should resume from.
    pub async fn rollback_to_checkpoint(&self, run: &RunId, id: CheckpointId) -> anyhow::Result<RollbackResult> {
        let checkpoints = self.store.list_for_run(run).await?;
        let anchor = checkpoints
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow::anyhow!("checkpoint {id:?} not found for run {run}"))?
            .clone();

        let mut invalidated_ids = Vec::new();
        for checkpoint in &checkpoints {
            if checkpoint.id.0 > anchor.id.0 {
                self.store
                    .update_checkpoint(
                        run,
                        checkpoint.id,
                        ValidationResult::failed(vec!["invalidated by rollback".to_string()]),
                    )
                    .await?;
                invalidated_ids.push(checkpoint.id);
            }
        }

        info!(run = %run, to = ?id, invalidated = invalidated_ids.len(), "rolled back run to checkpoint");
        Ok(RollbackResult { invalidated_ids, next_stage: anchor.stage })
    }
}

fn validate_file_loaded(metadata: &Value) -> ValidationResult {
    match metadata.get("content_hash").and_then(Value::as_str) {
        Some(hash) if !hash.trim().is_empty() => ValidationResult::ok(),
        _ => ValidationResult::failed(vec!["file-loaded checkpoint missing content_hash".to_string()]),
    }
}

fn validate_entities_extracted(metadata: &Value) -> ValidationResult {
    match metadata.get("entity_count").and_then(Value::as_u64) {
        Some(count) if count > 0 => ValidationResult::ok(),
        Some(_) => ValidationResult::failed(vec!["entities-extracted checkpoint recorded zero entities".to_string()]),
        None => ValidationResult::failed(vec!["entities-extracted checkpoint missing entity_count".to_string()]),
    }
}

fn validate_relationships_built(metadata: &Value) -> ValidationResult {
    match metadata.get("relationship_count").and_then(Value::as_u64) {
        Some(_) => ValidationResult::ok(),
        None => ValidationResult::failed(vec!["relationships-built checkpoint missing relationship_count".to_string()]),
    }
}

fn validate_neo4j_stored(metadata: &Value) -> ValidationResult {
    let node_count = metadata.get("node_count").and_then(Value::as_u64);
    let relationship_count = metadata.get("relationship_count").and_then(Value::as_u64);
    match (node_count, relationship_count) {
        (Some(_), Some(_)) => ValidationResult::ok(),
        _ => ValidationResult::failed(vec!["neo4j-stored checkpoint missing node_count/relationship_count".to_string()]),
    }
}

fn validate_pipeline_complete(metadata: &Value, benchmark: &BenchmarkConfig) -> ValidationResult {
    let node_count = metadata.get("node_count").and_then(Value::as_u64).unwrap_or(0);
    let relationship_count = metadata.get("relationship_count").and_then(Value::as_u64).unwrap_or(0);
    let mut errors = Vec::new();
    if node_count < benchmark.min_nodes {
        errors.push(format!("node_count {node_count} below benchmark minimum {}", benchmark.min_nodes));
    }
    if relationship_count < benchmark.min_relationships {
        errors.push(format!(
            "relationship_count {relationship_count} below benchmark minimum {}",
            benchmark.min_relationships
        ));
    }
    if errors.is_empty() {
        ValidationResult::ok()
    } else {
        ValidationResult::failed(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;
    use triangulum_store_core::{
        EvidenceStore, FileStore, OutboxStore, PoiStore, RelationshipStore, RunStore,
    };
    use triangulum_types::{
        EventType, FileRecord, FileStatus, Origin, OutboxEvent, OutboxEventId, OutboxEventStatus, Poi, PoiId,
        Relationship, RelationshipEvidence, RelationshipHash, RelationshipId, Run, RunStatus,
    };

    #[derive(Default)]
    struct MemoryStore {
        checkpoints: Mutex<Vec<Checkpoint>>,
        next_id: AtomicI64,
    }

    #[async_trait]
    impl RunStore for MemoryStore {
        async fn create_run(&self, _run: &Run) -> anyhow::Result<()> {
            Ok(())
        }
        async fn finalize_run(&self, _id: &RunId, _status: RunStatus) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_run(&self, _id: &RunId) -> anyhow::Result<Option<Run>> {
            Ok(None)
        }
    }

    #[async_trait]
    impl FileStore for MemoryStore {
        async fn upsert_file(&self, _file: &FileRecord) -> anyhow::Result<()> {
            Ok(())
        }
        async fn mark_file_status(&self, _run: &RunId, _path: &str, _status: FileStatus) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_file(&self, _run: &RunId, _path: &str) -> anyhow::Result<Option<FileRecord>> {
            Ok(None)
        }
        async fn list_files_for_run(&self, _run: &RunId) -> anyhow::Result<Vec<FileRecord>> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl PoiStore for MemoryStore {
        async fn insert_poi(&self, _poi: &Poi) -> anyhow::Result<PoiId> {
            Ok(PoiId(1))
        }
        async fn get_poi(&self, _run: &RunId, _id: PoiId) -> anyhow::Result<Option<Poi>> {
            Ok(None)
        }
        async fn find_by_semantic_id(&self, _run: &RunId, _semantic_id: &str) -> anyhow::Result<Option<Poi>> {
            Ok(None)
        }
        async fn list_pois_for_run(&self, _run: &RunId) -> anyhow::Result<Vec<Poi>> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl RelationshipStore for MemoryStore {
        async fn insert_relationship(&self, _rel: &Relationship) -> anyhow::Result<RelationshipId> {
            Ok(RelationshipId(1))
        }
        async fn update_status(
            &self,
            _run: &RunId,
            _id: RelationshipId,
            _status: triangulum_types::RelationshipStatus,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_relationship(&self, _run: &RunId, _id: RelationshipId) -> anyhow::Result<Option<Relationship>> {
            Ok(None)
        }
        async fn list_relationships_for_run(&self, _run: &RunId) -> anyhow::Result<Vec<Relationship>> {
            Ok(vec![])
        }
    }

    #[async_trait]
    impl EvidenceStore for MemoryStore {
        async fn insert_evidence(&self, _evidence: &RelationshipEvidence) -> anyhow::Result<i64> {
            Ok(1)
        }
        async fn evidence_for_hash(&self, _run: &RunId, _hash: RelationshipHash) -> anyhow::Result<Vec<RelationshipEvidence>> {
            Ok(vec![])
        }
        async fn count_evidence_for_hash(&self, _run: &RunId, _hash: RelationshipHash) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn link_evidence_to_relationship(
            &self,
            _run: &RunId,
            _hash: RelationshipHash,
            _relationship: RelationshipId,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl OutboxStore for MemoryStore {
        async fn append(&self, _run: &RunId, _event_type: EventType, _payload: Value, _origin: Origin) -> anyhow::Result<OutboxEventId> {
            Ok(OutboxEventId(1))
        }
        async fn claim_batch(&self, _run: &RunId, _limit: u32) -> anyhow::Result<Vec<OutboxEvent>> {
            Ok(vec![])
        }
        async fn mark_published(&self, _run: &RunId, _id: OutboxEventId) -> anyhow::Result<()> {
            Ok(())
        }
        async fn mark_failed(&self, _run: &RunId, _id: OutboxEventId) -> anyhow::Result<u32> {
            Ok(0)
        }
        async fn mark_terminally_failed(&self, _run: &RunId, _id: OutboxEventId) -> anyhow::Result<()> {
            Ok(())
        }
        async fn count_pending(&self, _run: &RunId) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn status_of(&self, _run: &RunId, _id: OutboxEventId) -> anyhow::Result<Option<OutboxEventStatus>> {
            Ok(None)
        }
    }

    #[async_trait]
    impl triangulum_store_core::CheckpointStore for MemoryStore {
        async fn create_checkpoint(
            &self,
            run: &RunId,
            stage: Stage,
            entity_id: &str,
            metadata: Value,
        ) -> anyhow::Result<CheckpointId> {
            let id = CheckpointId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
            let now = triangulum_store_core::now();
            self.checkpoints.lock().unwrap().push(Checkpoint {
                id,
                run: run.clone(),
                stage,
                entity_id: entity_id.to_string(),
                status: CheckpointStatus::Pending,
                metadata,
                validation_result: None,
                created_at: now,
                updated_at: now,
            });
            Ok(id)
        }

        async fn update_checkpoint(&self, _run: &RunId, id: CheckpointId, result: ValidationResult) -> anyhow::Result<()> {
            let mut checkpoints = self.checkpoints.lock().unwrap();
            let checkpoint = checkpoints
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| anyhow::anyhow!("checkpoint not found"))?;
            checkpoint.status = if result.valid { CheckpointStatus::Completed } else { CheckpointStatus::Failed };
            checkpoint.validation_result = Some(result);
            checkpoint.updated_at = triangulum_store_core::now();
            Ok(())
        }

        async fn latest_for_entity(&self, _run: &RunId, stage: Stage, entity_id: &str) -> anyhow::Result<Option<Checkpoint>> {
            Ok(self
                .checkpoints
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.stage == stage && c.entity_id == entity_id)
                .max_by_key(|c| c.created_at)
                .cloned())
        }

        async fn list_for_run(&self, _run: &RunId) -> anyhow::Result<Vec<Checkpoint>> {
            Ok(self.checkpoints.lock().unwrap().clone())
        }
    }

    fn run() -> RunId {
        RunId::new("run-1").unwrap()
    }

    #[tokio::test]
    async fn entities_extracted_with_zero_count_fails_validation() {
        let manager = CheckpointManager::new(Arc::new(MemoryStore::default()));
        let (_, result) = manager
            .record(&run(), Stage::EntitiesExtracted, "a.js", serde_json::json!({"entity_count": 0}))
            .await
            .unwrap();
        assert!(!result.valid);
    }

    #[tokio::test]
    async fn entities_extracted_with_positive_count_passes() {
        let manager = CheckpointManager::new(Arc::new(MemoryStore::default()));
        let (_, result) = manager
            .record(&run(), Stage::EntitiesExtracted, "a.js", serde_json::json!({"entity_count": 3}))
            .await
            .unwrap();
        assert!(result.valid);
    }

    #[tokio::test]
    async fn pipeline_complete_respects_benchmark() {
        let manager = CheckpointManager::new(Arc::new(MemoryStore::default()))
            .with_benchmark(BenchmarkConfig { min_nodes: 10, min_relationships: 5 });
        let (_, result) = manager
            .record(&run(), Stage::PipelineComplete, "run-1", serde_json::json!({"node_count": 4, "relationship_count": 1}))
            .await
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 2);
    }

    #[tokio::test]
    async fn run_summary_counts_latest_attempt_per_entity() {
        let manager = CheckpointManager::new(Arc::new(MemoryStore::default()));
        manager
            .record(&run(), Stage::FileLoaded, "a.js", serde_json::json!({"content_hash": "abc"}))
            .await
            .unwrap();
        manager
            .record(&run(), Stage::FileLoaded, "b.js", serde_json::json!({}))
            .await
            .unwrap();

        let summary = manager.get_run_summary(&run()).await.unwrap();
        let file_loaded = &summary.stages[&Stage::FileLoaded];
        assert_eq!(file_loaded.total, 2);
        assert_eq!(file_loaded.completed, 1);
        assert_eq!(file_loaded.failed, 1);
    }

    #[tokio::test]
    async fn rollback_invalidates_later_checkpoints_and_reports_next_stage() {
        let manager = CheckpointManager::new(Arc::new(MemoryStore::default()));
        let (first_id, _) = manager
            .record(&run(), Stage::FileLoaded, "a.js", serde_json::json!({"content_hash": "abc"}))
            .await
            .unwrap();
        manager
            .record(&run(), Stage::EntitiesExtracted, "a.js", serde_json::json!({"entity_count": 2}))
            .await
            .unwrap();

        let rollback = manager.rollback_to_checkpoint(&run(), first_id).await.unwrap();
        assert_eq!(rollback.invalidated_ids.len(), 1);
        assert_eq!(rollback.next_stage, Stage::FileLoaded);
    }
}
