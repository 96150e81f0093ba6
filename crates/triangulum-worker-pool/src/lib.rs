#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **triangulum-worker-pool** — the Worker Pool Manager (§4.3) and Managed
//! Worker Runtime (§4.4) of the triangulum coordination core.
//!
//! The [`PoolManager`] is a process-wide singleton enforcing a global
//! in-flight cap, per-class concurrency limits, circuit breakers, optional
//! rate limits, and a sustained-load scaler. [`worker::ManagedWorker`] wraps
//! a user handler so it can be registered against a
//! [`triangulum_queue::QueueBus`] consumer while honoring all of the above.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use triangulum_bus_core::{EventBus, PipelineEvent};

pub mod circuit_breaker;
pub mod config;
pub mod rate_limiter;
pub mod scaler;
pub mod worker;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use config::{ClassConfig, PoolConfig};
pub use rate_limiter::{RateLimitConfig, TokenBucketLimiter};
pub use scaler::{LoadProbe, LoadSample, ScaleDecision, Scaler, ScalerConfig, SyntheticLoadProbe};
pub use worker::{ManagedWorker, WorkerMetrics, WorkerMetricsSnapshot};

/// Errors the pool manager's public contract can surface.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The class's circuit breaker is open; the caller should nack and
    /// requeue with backoff per §4.4.
    #[error("circuit open for class {0}")]
    CircuitOpen(String),
    /// The caller's cancellation token fired while waiting for a slot.
    #[error("slot request for class {0} cancelled")]
    Cancelled(String),
    /// A job exceeded its per-class timeout.
    #[error("job on class {0} timed out after {1:?}")]
    Timeout(String, Duration),
    /// The wrapped handler returned an error.
    #[error("job on class {0} failed: {1}")]
    JobFailed(String, #[source] anyhow::Error),
}

/// Proof of a reserved slot. Must be handed back via
/// [`PoolManager::release_slot`] exactly once.
#[derive(Debug)]
pub struct SlotToken {
    class: String,
    acquired_at: Instant,
}

impl SlotToken {
    /// The class this slot was acquired for.
    pub fn class(&self) -> &str {
        &self.class
    }
}

struct ClassState {
    limit: AtomicUsize,
    min: usize,
    max: usize,
    inflight: AtomicUsize,
    breaker: CircuitBreaker,
    limiter: Option<TokenBucketLimiter>,
    scaler: std::sync::Mutex<Scaler>,
}

impl ClassState {
    fn new(config: &ClassConfig) -> Self {
        Self {
            limit: AtomicUsize::new(config.initial_concurrency.clamp(config.min_concurrency, config.max_concurrency)),
            min: config.min_concurrency,
            max: config.max_concurrency,
            inflight: AtomicUsize::new(0),
            breaker: CircuitBreaker::new(config.breaker),
            limiter: config.rate_limit.map(TokenBucketLimiter::new),
            scaler: std::sync::Mutex::new(Scaler::new(config.scaler)),
        }
    }

    fn try_reserve(&self, global_inflight: &AtomicUsize, global_cap: usize) -> bool {
        let class_limit = self.limit.load(Ordering::SeqCst);
        loop {
            let class_current = self.inflight.load(Ordering::SeqCst);
            if class_current >= class_limit {
                return false;
            }
            let global_current = global_inflight.load(Ordering::SeqCst);
            if global_current >= global_cap {
                return false;
            }
            if global_inflight
                .compare_exchange(global_current, global_current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            self.inflight.fetch_add(1, Ordering::SeqCst);
            return true;
        }
    }
}

/// A process-wide singleton enforcing the worker pool's concurrency, circuit
/// breaker, rate limit and scaling contract (§4.3).
pub struct PoolManager {
    global_cap: usize,
    global_inflight: AtomicUsize,
    classes: DashMap<String, Arc<ClassState>>,
    configs: HashMap<String, ClassConfig>,
    notify: Notify,
    bus: std::sync::Mutex<Option<Arc<dyn EventBus>>>,
}

impl PoolManager {
    /// Build a pool manager from a [`PoolConfig`], pre-creating state for
    /// every configured class.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let classes = DashMap::new();
        for (name, class_config) in &config.classes {
            classes.insert(name.clone(), Arc::new(ClassState::new(class_config)));
        }
        Arc::new(Self {
            global_cap: config.global_cap,
            global_inflight: AtomicUsize::new(0),
            classes,
            configs: config.classes,
            notify: Notify::new(),
            bus: std::sync::Mutex::new(None),
        })
    }

    /// Attach an event bus so breaker transitions and scaler decisions
    /// publish as `CircuitBreakerChanged`/`PoolScaled` (§4.1, §6). Safe to
    /// call after construction since the pool is always shared behind an
    /// `Arc` — there is no builder-before-`Arc::new` step to hook into.
    pub fn set_bus(&self, bus: Arc<dyn EventBus>) {
        *self.bus.lock().expect("pool bus mutex poisoned") = Some(bus);
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(bus) = self.bus.lock().expect("pool bus mutex poisoned").as_ref() {
            let _ = bus.publish(&event);
        }
    }

    fn note_breaker_transition(&self, class: &str, before: BreakerState, after: BreakerState) {
        if before != after {
            self.publish(PipelineEvent::CircuitBreakerChanged {
                class: class.to_string(),
                state: after.as_str().to_string(),
            });
        }
    }

    fn class_state(&self, class: &str) -> Arc<ClassState> {
        if let Some(state) = self.classes.get(class) {
            return Arc::clone(state.value());
        }
        let config = self.configs.get(class).cloned().unwrap_or_default();
        let state = Arc::new(ClassState::new(&config));
        self.classes.entry(class.to_string()).or_insert(state).value().clone()
    }

    /// Current concurrency limit in effect for a class.
    pub fn current_limit(&self, class: &str) -> usize {
        self.class_state(class).limit.load(Ordering::SeqCst)
    }

    /// Current breaker state for a class.
    pub fn breaker_state(&self, class: &str) -> BreakerState {
        self.class_state(class).breaker.state()
    }

    /// Blocks until a slot is available, the circuit is not open, and rate
    /// budget is available. Fails fast if the circuit is open, or if
    /// `cancel` fires while waiting.
    pub async fn request_slot(&self, class: &str, cancel: &CancellationToken) -> Result<SlotToken, PoolError> {
        let state = self.class_state(class);
        loop {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled(class.to_string()));
            }
            let breaker_before = state.breaker.state();
            let admitted = state.breaker.try_admit();
            self.note_breaker_transition(class, breaker_before, state.breaker.state());
            if !admitted {
                return Err(PoolError::CircuitOpen(class.to_string()));
            }
            if let Some(limiter) = &state.limiter {
                if !limiter.try_acquire() {
                    let wait = limiter.time_until_available();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => continue,
                        _ = cancel.cancelled() => return Err(PoolError::Cancelled(class.to_string())),
                    }
                }
            }
            if state.try_reserve(&self.global_inflight, self.global_cap) {
                return Ok(SlotToken {
                    class: class.to_string(),
                    acquired_at: Instant::now(),
                });
            }
            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = cancel.cancelled() => return Err(PoolError::Cancelled(class.to_string())),
                _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
            }
        }
    }

    /// Release a previously acquired slot, recording the outcome for the
    /// circuit breaker and the sustained-load scaler.
    pub fn release_slot(&self, token: SlotToken, success: bool, _elapsed: Duration) {
        let state = self.class_state(&token.class);
        state.inflight.fetch_sub(1, Ordering::SeqCst);
        self.global_inflight.fetch_sub(1, Ordering::SeqCst);
        let breaker_before = state.breaker.state();
        if success {
            state.breaker.record_success();
        } else {
            state.breaker.record_failure();
        }
        self.note_breaker_transition(&token.class, breaker_before, state.breaker.state());
        self.notify.notify_waiters();
    }

    /// Feed a fresh system-load observation into a class's scaler and apply
    /// any resulting decision to its concurrency limit.
    pub fn observe_load(&self, class: &str, sample: LoadSample) -> ScaleDecision {
        let state = self.class_state(class);
        let mut scaler = state.scaler.lock().expect("scaler mutex poisoned");
        scaler.record_sample(sample);
        let current = state.limit.load(Ordering::SeqCst);
        let decision = scaler.decide(current, state.min, state.max);
        match decision {
            ScaleDecision::ScaleUp(target) | ScaleDecision::ScaleDown(target) => {
                state.limit.store(target, Ordering::SeqCst);
                debug!(class, target, "worker pool class concurrency rescaled");
                self.publish(PipelineEvent::PoolScaled { class: class.to_string(), from: current, to: target });
                self.notify.notify_waiters();
            }
            ScaleDecision::NoChange => {}
        }
        decision
    }

    /// Spawn a background task that periodically samples `probe` and applies
    /// the scaler decision to every configured class, until `cancel` fires.
    pub fn spawn_scaler_loop(
        self: &Arc<Self>,
        probe: Arc<dyn LoadProbe>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let classes: Vec<String> = this.configs.keys().cloned().collect();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = probe.sample();
                        for class in &classes {
                            this.observe_load(class, sample);
                        }
                    }
                }
            }
        })
    }

    /// Convenience wrapper combining `request_slot`/`release_slot` with a
    /// timeout around `f`. Does not itself retry; retry is the queue
    /// consumer's responsibility (§4.4).
    pub async fn execute_with_management<F, Fut, T>(
        &self,
        class: &str,
        cancel: &CancellationToken,
        timeout: Duration,
        f: F,
    ) -> Result<T, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let token = self.request_slot(class, cancel).await?;
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, f()).await;
        let elapsed = started.elapsed();
        match outcome {
            Ok(Ok(value)) => {
                self.release_slot(token, true, elapsed);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.release_slot(token, false, elapsed);
                warn!(class, error = %err, "managed job failed");
                Err(PoolError::JobFailed(class.to_string(), err))
            }
            Err(_elapsed) => {
                self.release_slot(token, false, elapsed);
                Err(PoolError::Timeout(class.to_string(), timeout))
            }
        }
    }
}
