#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **triangulum-queue** – in-process reference implementation of the Queue
//! Bus the coordination core treats as an external collaborator.
//!
//! The core's contract (§4.2) names five operations plus at-least-once
//! delivery: `add`, `add-bulk`, `get-waiting`, `get-active`, `get-failed`,
//! and a consumer registration with retries, backoff, stall detection, and
//! dead-lettering to a `failed-jobs` queue. A production deployment points
//! the core at a real broker; this crate lets the whole pipeline run and be
//! tested without one.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use triangulum_types::QueueJob;

//─────────────────────────────
//  Identifiers and errors
//─────────────────────────────

/// Opaque handle for a single delivery, unique within the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

/// Errors returned by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The named queue has not been created (no job has ever targeted it).
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
}

//─────────────────────────────
//  Scheduling options
//─────────────────────────────

/// Options accepted by [`QueueBus::add`], mirroring `QueueJob`'s builder
/// fields.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Delay, in milliseconds, before the job becomes eligible for delivery.
    pub delay_ms: u64,
    /// Scheduling priority; higher values are dequeued first.
    pub priority: i32,
}

#[derive(Debug, Clone)]
struct Waiting {
    id: JobId,
    job: QueueJob,
    ready_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Active {
    id: JobId,
    job: QueueJob,
    started_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    waiting: Vec<Waiting>,
    active: Vec<Active>,
    failed: Vec<QueueJob>,
}

impl QueueState {
    /// Pop the highest-priority ready job, breaking ties by enqueue order.
    fn take_ready(&mut self) -> Option<Waiting> {
        let now = Utc::now();
        let idx = self
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, w)| w.ready_at <= now)
            .max_by(|(_, a), (_, b)| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then(b.job.enqueued_at.cmp(&a.job.enqueued_at))
            })
            .map(|(idx, _)| idx)?;
        Some(self.waiting.remove(idx))
    }
}

//─────────────────────────────
//  Consumer configuration
//─────────────────────────────

/// Policy applied by [`QueueBus::register_consumer`] to a single queue.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of delivery attempts before a job is dead-lettered.
    pub retry_attempts: u32,
    /// Base backoff; the delay before attempt `n` is `base_backoff * n`.
    pub base_backoff: Duration,
    /// A job still `active` longer than this is considered stalled and
    /// returned to `waiting` with its attempt count unchanged.
    pub stall_timeout: Duration,
    /// How often the consumer loop polls an empty queue.
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            base_backoff: Duration::from_millis(500),
            stall_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(50),
        }
    }
}

//─────────────────────────────
//  The bus
//─────────────────────────────

/// Named FIFO queues with delay, priority, retry, and dead-lettering.
///
/// Each named queue is its own `Mutex<QueueState>`; operations on different
/// queues never contend. `Arc<QueueBus>` is the expected ownership shape so
/// consumer loops can run alongside producers.
pub struct QueueBus {
    queues: DashMap<String, Mutex<QueueState>>,
    next_id: AtomicU64,
}

impl Default for QueueBus {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueBus {
    /// Construct an empty bus. Queues are created lazily on first use.
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn queue(&self, name: &str) -> dashmap::mapref::one::RefMut<'_, String, Mutex<QueueState>> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(QueueState::default()))
    }

    fn alloc_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Enqueue a single job.
    pub async fn add(&self, queue: &str, payload: serde_json::Value, opts: AddOptions) -> JobId {
        let id = self.alloc_id();
        let job = QueueJob::new(queue, payload)
            .with_delay_ms(opts.delay_ms)
            .with_priority(opts.priority);
        let ready_at = job.enqueued_at + chrono::Duration::milliseconds(opts.delay_ms as i64);

        self.queue(queue)
            .lock()
            .await
            .waiting
            .push(Waiting { id, job, ready_at });
        id
    }

    /// Enqueue many jobs against the same queue in one call.
    pub async fn add_bulk(
        &self,
        queue: &str,
        payloads: Vec<(serde_json::Value, AddOptions)>,
    ) -> Vec<JobId> {
        let mut ids = Vec::with_capacity(payloads.len());
        for (payload, opts) in payloads {
            ids.push(self.add(queue, payload, opts).await);
        }
        ids
    }

    /// Jobs waiting to be claimed, FIFO/priority order not guaranteed in the
    /// returned snapshot (only at dequeue time).
    pub async fn get_waiting(&self, queue: &str) -> Vec<QueueJob> {
        self.queue(queue)
            .lock()
            .await
            .waiting
            .iter()
            .map(|w| w.job.clone())
            .collect()
    }

    /// Jobs currently claimed by a consumer.
    pub async fn get_active(&self, queue: &str) -> Vec<QueueJob> {
        self.queue(queue)
            .lock()
            .await
            .active
            .iter()
            .map(|a| a.job.clone())
            .collect()
    }

    /// Jobs that exhausted their retries on this queue.
    pub async fn get_failed(&self, queue: &str) -> Vec<QueueJob> {
        self.queue(queue).lock().await.failed.clone()
    }

    /// Return stalled active jobs (active longer than `stall_timeout`) to
    /// `waiting` with their attempt count unchanged. Consumer loops call
    /// this on every poll tick; exposed publicly so tests and operators can
    /// trigger it directly.
    pub async fn reap_stalled(&self, queue: &str, stall_timeout: Duration) {
        let now = Utc::now();
        let queue_ref = self.queue(queue);
        let mut state = queue_ref.lock().await;
        let mut still_active = Vec::with_capacity(state.active.len());
        let drained: Vec<_> = state.active.drain(..).collect();
        for active in drained {
            let elapsed = now.signed_duration_since(active.started_at);
            if elapsed.num_milliseconds() as u128 > stall_timeout.as_millis() {
                tracing::warn!(queue, job_id = active.id.0, "reaping stalled job");
                state.waiting.push(Waiting {
                    id: active.id,
                    ready_at: now,
                    job: active.job,
                });
            } else {
                still_active.push(active);
            }
        }
        state.active = still_active;
    }

    /// Run a handler against every delivery from `queue` until `shutdown` is
    /// cancelled. Failures are retried with linear backoff up to
    /// `config.retry_attempts`, then dead-lettered onto `failed-jobs`
    /// carrying the original payload plus a `_failure_reason` field.
    pub fn register_consumer<F, Fut>(
        self: &Arc<Self>,
        queue: &str,
        config: ConsumerConfig,
        shutdown: CancellationToken,
        handler: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(QueueJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let bus = Arc::clone(self);
        let queue = queue.to_string();
        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                bus.reap_stalled(&queue, config.stall_timeout).await;

                let delivery = {
                    let queue_ref = bus.queue(&queue);
                    let mut state = queue_ref.lock().await;
                    state.take_ready()
                };

                let Some(waiting) = delivery else {
                    tokio::select! {
                        _ = tokio::time::sleep(config.poll_interval) => {}
                        _ = shutdown.cancelled() => return,
                    }
                    continue;
                };

                {
                    let queue_ref = bus.queue(&queue);
                    let mut state = queue_ref.lock().await;
                    state.active.push(Active {
                        id: waiting.id,
                        job: waiting.job.clone(),
                        started_at: Utc::now(),
                    });
                }

                let result = handler(waiting.job.clone()).await;

                let queue_ref = bus.queue(&queue);
                let mut state = queue_ref.lock().await;
                state.active.retain(|a| a.id != waiting.id);

                match result {
                    Ok(()) => {}
                    Err(err) => {
                        let attempt = waiting.job.attempt + 1;
                        if attempt < config.retry_attempts {
                            let delay = config.base_backoff * attempt;
                            let mut retried = waiting.job.clone();
                            retried.attempt = attempt;
                            state.waiting.push(Waiting {
                                id: waiting.id,
                                ready_at: Utc::now()
                                    + chrono::Duration::milliseconds(delay.as_millis() as i64),
                                job: retried,
                            });
                        } else {
                            tracing::warn!(
                                queue = %queue,
                                job_id = waiting.id.0,
                                %err,
                                "dead-lettering job after exhausting retries"
                            );
                            let mut payload = waiting.job.payload.clone();
                            if let serde_json::Value::Object(ref mut map) = payload {
                                map.insert(
                                    "_failure_reason".to_string(),
                                    serde_json::Value::String(err.to_string()),
                                );
                                map.insert(
                                    "_failed_queue".to_string(),
                                    serde_json::Value::String(queue.clone()),
                                );
                            }
                            let mut dead = waiting.job.clone();
                            dead.queue = triangulum_types::QUEUE_NAMES
                                .last()
                                .expect("failed-jobs is the last queue name")
                                .to_string();
                            dead.payload = payload;
                            state.failed.push(waiting.job.clone());
                            drop(state);
                            bus.queue(&dead.queue)
                                .lock()
                                .await
                                .waiting
                                .push(Waiting {
                                    id: bus.alloc_id(),
                                    ready_at: Utc::now(),
                                    job: dead,
                                });
                        }
                    }
                }
            }
        })
    }
}

/// Every queue name the coordination core is known to enqueue onto,
/// re-exported for consumers that want to pre-register all of them.
pub fn known_queue_names() -> &'static [&'static str] {
    triangulum_types::QUEUE_NAMES
}
