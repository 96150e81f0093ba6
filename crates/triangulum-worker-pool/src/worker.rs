//! Managed Worker Runtime (§4.4): wraps a user handler for a queue so every
//! delivered job goes through slot acquisition, a timeout, and per-class
//! metrics before the queue bus's own retry/dead-letter logic takes over.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;
use triangulum_types::QueueJob;

use crate::PoolManager;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

const ROLLING_SAMPLE_CAPACITY: usize = 100;

/// Per-class counters and rolling processing-time samples, as named in §4.4:
/// "total/completed/failed jobs, active count, rolling average processing
/// time, last 100 processing samples for scaler and health probe."
#[derive(Default)]
pub struct WorkerMetrics {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
    samples: Mutex<VecDeque<Duration>>,
}

impl WorkerMetrics {
    fn record_start(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    fn record_finish(&self, success: bool, elapsed: Duration) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut samples = self.samples.lock().expect("metrics mutex poisoned");
        samples.push_back(elapsed);
        if samples.len() > ROLLING_SAMPLE_CAPACITY {
            samples.pop_front();
        }
    }

    /// Point-in-time snapshot suitable for health probes and the scaler.
    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        let samples = self.samples.lock().expect("metrics mutex poisoned");
        let average = if samples.is_empty() {
            Duration::ZERO
        } else {
            samples.iter().sum::<Duration>() / samples.len() as u32
        };
        WorkerMetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            average_processing_time: average,
            last_samples: samples.iter().copied().collect(),
        }
    }
}

/// A snapshot of [`WorkerMetrics`] at a point in time.
#[derive(Debug, Clone)]
pub struct WorkerMetricsSnapshot {
    /// Jobs delivered to the handler so far.
    pub total: u64,
    /// Jobs the handler completed successfully.
    pub completed: u64,
    /// Jobs that errored or timed out.
    pub failed: u64,
    /// Jobs currently executing.
    pub active: u64,
    /// Rolling average over `last_samples`.
    pub average_processing_time: Duration,
    /// Up to the last 100 processing-time samples, oldest first.
    pub last_samples: Vec<Duration>,
}

/// Wraps a user-provided async handler with pool-managed slot acquisition,
/// a per-class timeout, and metrics. Produces a plain `Fn(QueueJob) -> ...`
/// suitable for [`triangulum_queue::QueueBus::register_consumer`]; the bus's
/// own retry-with-backoff and dead-lettering handle the rest of §4.4.
pub struct ManagedWorker {
    pool: Arc<PoolManager>,
    class: String,
    timeout: Duration,
    metrics: Arc<WorkerMetrics>,
    handler: Arc<dyn Fn(QueueJob) -> BoxFuture<anyhow::Result<()>> + Send + Sync>,
}

impl ManagedWorker {
    /// Build a managed worker for `class`, wrapping `handler`.
    pub fn new<F, Fut>(pool: Arc<PoolManager>, class: impl Into<String>, timeout: Duration, handler: F) -> Arc<Self>
    where
        F: Fn(QueueJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(Self {
            pool,
            class: class.into(),
            timeout,
            metrics: Arc::new(WorkerMetrics::default()),
            handler: Arc::new(move |job| Box::pin(handler(job))),
        })
    }

    /// This worker's class name.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Current metrics snapshot for this worker.
    pub fn metrics(&self) -> WorkerMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run one job through slot acquisition, the handler, and metrics
    /// recording. Returns `Err` on handler failure, timeout, or a refused
    /// slot (open breaker or cancellation) so the caller's queue consumer
    /// can apply its own retry/backoff/dead-letter policy.
    pub async fn handle(&self, job: QueueJob, cancel: &CancellationToken) -> anyhow::Result<()> {
        let token = self.pool.request_slot(&self.class, cancel).await?;
        self.metrics.record_start();
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, (self.handler)(job)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(())) => {
                self.pool.release_slot(token, true, elapsed);
                self.metrics.record_finish(true, elapsed);
                Ok(())
            }
            Ok(Err(err)) => {
                self.pool.release_slot(token, false, elapsed);
                self.metrics.record_finish(false, elapsed);
                Err(err)
            }
            Err(_timed_out) => {
                self.pool.release_slot(token, false, elapsed);
                self.metrics.record_finish(false, elapsed);
                warn!(class = %self.class, timeout = ?self.timeout, "managed worker job timed out");
                Err(anyhow::anyhow!("job on class {} timed out after {:?}", self.class, self.timeout))
            }
        }
    }

    /// Adapt this worker into the `Fn(QueueJob) -> Future<Output = anyhow::Result<()>>`
    /// shape `QueueBus::register_consumer` expects, using a fresh (never
    /// cancelled) token per call — pass a cancellation-aware caller through
    /// [`ManagedWorker::handle`] directly when per-run cancellation matters.
    pub fn as_consumer_handler(self: &Arc<Self>) -> impl Fn(QueueJob) -> BoxFuture<anyhow::Result<()>> + Send + Sync + Clone {
        let this = Arc::clone(self);
        move |job| {
            let this = Arc::clone(&this);
            Box::pin(async move { this.handle(job, &CancellationToken::new()).await })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::sync::atomic::AtomicUsize;
    use triangulum_types::QueueJob;

    fn pool() -> Arc<PoolManager> {
        let mut config = PoolConfig::default();
        for class in config.classes.values_mut() {
            class.min_concurrency = 1;
            class.max_concurrency = 2;
            class.initial_concurrency = 2;
        }
        PoolManager::new(config)
    }

    #[tokio::test]
    async fn successful_job_updates_completed_metrics() {
        let worker = ManagedWorker::new(pool(), "file-analysis", Duration::from_secs(1), |_job| async { Ok(()) });
        let job = QueueJob::new("file-analysis", serde_json::json!({}));
        worker.handle(job, &CancellationToken::new()).await.unwrap();

        let snapshot = worker.metrics();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.active, 0);
    }

    #[tokio::test]
    async fn failing_job_updates_failed_metrics_and_propagates_error() {
        let worker = ManagedWorker::new(pool(), "file-analysis", Duration::from_secs(1), |_job| async {
            Err(anyhow::anyhow!("boom"))
        });
        let job = QueueJob::new("file-analysis", serde_json::json!({}));
        let result = worker.handle(job, &CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(worker.metrics().failed, 1);
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let worker = ManagedWorker::new(pool(), "file-analysis", Duration::from_millis(10), |_job| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let job = QueueJob::new("file-analysis", serde_json::json!({}));
        let result = worker.handle(job, &CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(worker.metrics().failed, 1);
    }

    #[tokio::test]
    async fn metrics_retain_only_last_100_samples() {
        let worker = ManagedWorker::new(pool(), "file-analysis", Duration::from_secs(1), |_job| async { Ok(()) });
        for _ in 0..150 {
            let job = QueueJob::new("file-analysis", serde_json::json!({}));
            worker.handle(job, &CancellationToken::new()).await.unwrap();
        }
        let snapshot = worker.metrics();
        assert_eq!(snapshot.total, 150);
        assert_eq!(snapshot.last_samples.len(), 100);
    }

    #[tokio::test]
    async fn consumer_handler_adapter_drives_registered_jobs() {
        let processed = Arc::new(AtomicUsize::new(0));
        let processed_clone = Arc::clone(&processed);
        let worker = ManagedWorker::new(pool(), "file-analysis", Duration::from_secs(1), move |_job| {
            let processed = Arc::clone(&processed_clone);
            async move {
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let handler = worker.as_consumer_handler();
        handler(QueueJob::new("file-analysis", serde_json::json!({}))).await.unwrap();
        assert_eq!(processed.load(Ordering::SeqCst), 1);
    }
}
