//! **triangulum-bus-core** – in-process notification bus for pipeline events.
//!
//! Every other crate in the workspace talks to storage and queues directly;
//! none of that traffic needs a bus. What does need one is the set of
//! cross-cutting occurrences that several independent observers (a CLI
//! progress bar, a metrics sink, the run orchestrator itself) want to react
//! to without being wired into the component that raised them: checkpoint
//! transitions, circuit breaker state changes, pool scaling decisions, and
//! run phase changes.
//!
//! This crate provides that bus: a typed event enum, a minimal pub/sub
//! trait, and an in-memory broadcast implementation. It has no persistence
//! or I/O concerns; events not observed before a subscriber is dropped are
//! simply gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use triangulum_types::{CheckpointId, RunId, Stage};

//─────────────────────────────
//  Core pipeline events
//─────────────────────────────

/// Typed event emitted after a component completes a state transition worth
/// broadcasting. Each variant corresponds to an occurrence named in the
/// coordination core's design, not to a single crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub enum PipelineEvent {
    /// A run moved from one orchestration phase to another.
    RunPhaseChanged {
        /// The run that transitioned.
        run: RunId,
        /// Name of the phase entered, e.g. `"analyzing"`.
        phase: String,
    },
    /// A checkpoint was created or updated for an entity.
    CheckpointUpdated {
        /// The run the checkpoint belongs to.
        run: RunId,
        /// Storage-assigned checkpoint id.
        checkpoint: CheckpointId,
        /// Pipeline stage the checkpoint records.
        stage: Stage,
        /// Whether the stage's validator passed.
        valid: bool,
    },
    /// A worker class's circuit breaker changed state.
    CircuitBreakerChanged {
        /// The worker class (queue name) the breaker guards.
        class: String,
        /// New breaker state: `"closed"`, `"open"`, or `"half_open"`.
        state: String,
    },
    /// The worker pool scaler adjusted a class's concurrency limit.
    PoolScaled {
        /// The worker class whose limit changed.
        class: String,
        /// Previous concurrency limit.
        from: usize,
        /// New concurrency limit.
        to: usize,
    },
    /// A run reached a terminal state.
    RunFinished {
        /// The run that finished.
        run: RunId,
        /// Whether the run completed successfully.
        succeeded: bool,
    },
}

//─────────────────────────────
//  Event bus trait
//─────────────────────────────

/// Core event bus abstraction for publishing and subscribing to pipeline
/// events.
///
/// Implementations must be thread-safe and support multiple subscribers.
/// Publishing should never block on slow subscribers; a bus is free to drop
/// events to maintain responsiveness.
pub trait EventBus: Send + Sync {
    /// Publish an event to all current subscribers.
    fn publish(&self, event: &PipelineEvent) -> Result<()>;

    /// Subscribe to the live event stream. Only events published after this
    /// call returns are delivered to the returned receiver.
    fn subscribe(&self) -> broadcast::Receiver<PipelineEvent>;
}

//─────────────────────────────
//  In-memory bus implementation
//─────────────────────────────

/// Broadcast-only event bus backed by a Tokio channel.
///
/// Unlike a pure relay, this bus keeps running counters of what it has sent:
/// `published_count` and `no_subscriber_count`. A CLI progress bar dropping
/// off between runs is normal and not worth logging per event, but a metrics
/// sink wiring into [`EventBus::subscribe`] wants to know overall whether
/// events are actually reaching anyone, which the counters answer without
/// requiring a persistence layer.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    tx: Arc<broadcast::Sender<PipelineEvent>>,
    published: Arc<AtomicU64>,
    no_subscriber: Arc<AtomicU64>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryBus {
    /// Create a bus with the given ring buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx: Arc::new(tx),
            published: Arc::new(AtomicU64::new(0)),
            no_subscriber: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events handed to the channel, whether or not anyone received them.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events published while no subscriber was attached. Not itself an
    /// error — most runs start the bus before anyone subscribes — but a
    /// sustained climb here means the intended observer never attached.
    pub fn no_subscriber_count(&self) -> u64 {
        self.no_subscriber.load(Ordering::Relaxed)
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, event: &PipelineEvent) -> Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(event.clone()).is_err() {
            self.no_subscriber.fetch_add(1, Ordering::Relaxed);
            debug!(?event, "pipeline event published with no subscribers attached");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Event could not be published.
    #[error("failed to publish event: {0}")]
    PublishFailed(String),
    /// Subscription failed.
    #[error("failed to create subscription: {0}")]
    SubscriptionFailed(String),
}
