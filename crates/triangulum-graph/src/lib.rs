#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **triangulum-graph** – batched, idempotent materialization of validated
//! relationships into an external graph store (§4.9).
//!
//! [`GraphStore`] is a reference-implementation trait, not a driver: the
//! core never speaks Cypher directly. Each [`Materializer::materialize_run`]
//! call reads every validated relationship for a run, resolves its POIs into
//! node keys, collapses repeated edges between the same pair down to one,
//! and pushes nodes/edges to the store in `batch_size`-sized groups — one
//! store call per batch, mirroring `triangulum-store-sqlite`'s
//! single-transaction-per-batch commit shape.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use triangulum_store_core::Store;
use triangulum_types::{Poi, Relationship, RelationshipStatus, RelationshipType, RunId};

/// Default number of nodes/edges materialized per store transaction.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// A graph node, keyed the same way on every run so repeated materialization
/// is idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Stable key: the POI's semantic id, or `<file>:<name>` when absent.
    pub key: String,
    /// Entity kind, carried as a node label/property.
    pub kind: String,
    /// Entity name.
    pub name: String,
    /// File the entity was extracted from.
    pub file_path: String,
}

/// A single directed edge, one per `(source, target)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Source node key.
    pub source_key: String,
    /// Target node key.
    pub target_key: String,
    /// Relationship type, written as an edge property.
    pub rel_type: RelationshipType,
    /// Confidence, written as an edge property.
    pub confidence: f64,
}

/// External graph store interface the core depends on. A production
/// deployment backs this with a Neo4j (or similar) driver; [`MemoryGraph`]
/// is the in-process reference used by tests.
#[async_trait::async_trait]
pub trait GraphStore: Send + Sync {
    /// Idempotently upsert a batch of nodes, keyed by [`GraphNode::key`].
    async fn upsert_nodes(&self, nodes: &[GraphNode]) -> anyhow::Result<()>;

    /// Idempotently upsert a batch of edges, keyed by `(source_key, target_key)`
    /// with match-set overwrite semantics: a repeated pair replaces the
    /// previous edge's properties rather than adding a second edge.
    async fn upsert_edges(&self, edges: &[GraphEdge]) -> anyhow::Result<()>;
}

/// In-memory [`GraphStore`] for tests, keeping the same idempotency contract
/// a real driver must honor.
#[derive(Default)]
pub struct MemoryGraph {
    nodes: std::sync::Mutex<BTreeMap<String, GraphNode>>,
    edges: std::sync::Mutex<BTreeMap<(String, String), GraphEdge>>,
}

impl MemoryGraph {
    /// Build an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every node currently stored.
    pub fn nodes(&self) -> Vec<GraphNode> {
        self.nodes.lock().unwrap().values().cloned().collect()
    }

    /// Snapshot of every edge currently stored.
    pub fn edges(&self) -> Vec<GraphEdge> {
        self.edges.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl GraphStore for MemoryGraph {
    async fn upsert_nodes(&self, nodes: &[GraphNode]) -> anyhow::Result<()> {
        let mut store = self.nodes.lock().unwrap();
        for node in nodes {
            store.insert(node.key.clone(), node.clone());
        }
        Ok(())
    }

    async fn upsert_edges(&self, edges: &[GraphEdge]) -> anyhow::Result<()> {
        let mut store = self.edges.lock().unwrap();
        for edge in edges {
            store.insert((edge.source_key.clone(), edge.target_key.clone()), edge.clone());
        }
        Ok(())
    }
}

/// Statuses eligible for materialization (§4.9: "relationships in *validated*
/// statuses").
fn is_validated(status: RelationshipStatus) -> bool {
    matches!(
        status,
        RelationshipStatus::Validated | RelationshipStatus::TriangulatedValidated | RelationshipStatus::CrossFileValidated
    )
}

/// Summary of one [`Materializer::materialize_run`] call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaterializationSummary {
    /// Distinct nodes written.
    pub nodes_written: usize,
    /// Distinct edges written, after collapsing repeated pairs.
    pub edges_written: usize,
    /// Relationships skipped because a POI could not be resolved.
    pub unresolved_poi_warnings: u64,
}

/// Reads validated relationships for a run and upserts them into a
/// [`GraphStore`] in idempotent batches.
pub struct Materializer {
    store: Arc<dyn Store>,
    graph: Arc<dyn GraphStore>,
    batch_size: usize,
    unresolved_poi_warnings: AtomicU64,
}

impl Materializer {
    /// Build a materializer with the default batch size.
    pub fn new(store: Arc<dyn Store>, graph: Arc<dyn GraphStore>) -> Self {
        Self { store, graph, batch_size: DEFAULT_BATCH_SIZE, unresolved_poi_warnings: AtomicU64::new(0) }
    }

    /// Override the per-transaction batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Total relationships skipped so far for want of a resolvable POI.
    pub fn unresolved_poi_warnings(&self) -> u64 {
        self.unresolved_poi_warnings.load(Ordering::Relaxed)
    }

    /// Materialize every validated relationship recorded so far for `run`.
    pub async fn materialize_run(&self, run: &RunId) -> anyhow::Result<MaterializationSummary> {
        let relationships = self.store.list_relationships_for_run(run).await?;
        let validated: Vec<Relationship> = relationships.into_iter().filter(|r| is_validated(r.status)).collect();

        let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();
        let mut edges: BTreeMap<(String, String), GraphEdge> = BTreeMap::new();

        for rel in &validated {
            let (Some(source), Some(target)) =
                (self.store.get_poi(run, rel.source).await?, self.store.get_poi(run, rel.target).await?)
            else {
                warn!(relationship = ?rel.id, "skipping relationship with an unresolvable POI");
                self.unresolved_poi_warnings.fetch_add(1, Ordering::Relaxed);
                continue;
            };

            let source_key = node_key(&source);
            let target_key = node_key(&target);
            nodes.insert(source_key.clone(), to_graph_node(&source, &source_key));
            nodes.insert(target_key.clone(), to_graph_node(&target, &target_key));

            // Later (higher-id) relationships for the same pair overwrite
            // earlier ones: "single edge per pair, repeated runs overwrite
            // properties via match-set".
            edges.insert(
                (source_key.clone(), target_key.clone()),
                GraphEdge { source_key, target_key, rel_type: rel.rel_type, confidence: rel.confidence },
            );
        }

        let nodes: Vec<GraphNode> = nodes.into_values().collect();
        let edges: Vec<GraphEdge> = edges.into_values().collect();

        for batch in nodes.chunks(self.batch_size) {
            self.graph.upsert_nodes(batch).await?;
        }
        for batch in edges.chunks(self.batch_size) {
            self.graph.upsert_edges(batch).await?;
        }

        Ok(MaterializationSummary {
            nodes_written: nodes.len(),
            edges_written: edges.len(),
            unresolved_poi_warnings: self.unresolved_poi_warnings(),
        })
    }
}

fn node_key(poi: &Poi) -> String {
    poi.semantic_id.clone().unwrap_or_else(|| format!("{}:{}", poi.file_path, poi.name))
}

fn to_graph_node(poi: &Poi, key: &str) -> GraphNode {
    GraphNode {
        key: key.to_string(),
        kind: poi.kind.as_str().to_string(),
        name: poi.name.clone(),
        file_path: poi.file_path.clone(),
    }
}
