//! Per-class circuit breaker: closed / open / half-open, as contracted in §4.3.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker tuning: how many consecutive failures trip it, and how long it
/// stays open before admitting a half-open trial job.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to trip from closed to open.
    pub failure_threshold: u32,
    /// Time the breaker stays open before moving to half-open.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state, published on the bus as `CircuitBreakerChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation: all requests admitted.
    Closed,
    /// Tripped: all requests fail fast until `reset_timeout` elapses.
    Open,
    /// One trial request is admitted; its outcome decides closed vs. open.
    HalfOpen,
}

impl BreakerState {
    /// Wire name used in `PipelineEvent::CircuitBreakerChanged`.
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_trial_in_flight: bool,
}

/// A single class's circuit breaker. Internally serialized: state transitions
/// happen under a mutex, matching the "serialized per class" resource policy.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Build a breaker starting in the closed state.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_trial_in_flight: false,
            }),
        }
    }

    /// Current state, resolving an expired open timeout into half-open first.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Whether a new request may be admitted right now. Admitting a half-open
    /// trial consumes the single trial slot until its outcome is recorded.
    pub fn try_admit(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if inner.half_open_trial_in_flight {
                    false
                } else {
                    inner.half_open_trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful outcome: closes the breaker from half-open, or
    /// resets the consecutive-failure counter while closed.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.consecutive_failures = 0;
        inner.half_open_trial_in_flight = false;
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
    }

    /// Record a failed outcome: trips the breaker open from half-open, or
    /// from closed once `failure_threshold` consecutive failures accrue.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        inner.half_open_trial_in_flight = false;
        match inner.state {
            BreakerState::HalfOpen => self.trip(&mut inner),
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_trial_in_flight = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            reset_timeout,
        })
    }

    #[test]
    fn closed_admits_until_threshold_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        assert!(cb.try_admit());
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.try_admit());
    }

    #[test]
    fn success_resets_consecutive_failure_count() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn open_moves_to_half_open_after_reset_timeout_and_admits_one_trial() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.try_admit());
        assert!(!cb.try_admit(), "only one trial job admitted while half-open");
    }

    #[test]
    fn half_open_success_closes_and_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(10));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
