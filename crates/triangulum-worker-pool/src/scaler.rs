//! Sustained-load scaler: the stability contract from §4.3.
//!
//! The scaler itself is a pure decision function over a rolling window of
//! `(cpu, memory)` samples; the pool manager is responsible for feeding it
//! samples and applying its decisions to a class's concurrency limit.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tuning knobs for one class's scaler.
#[derive(Debug, Clone, Copy)]
pub struct ScalerConfig {
    /// Minimum time between scaling decisions for this class.
    pub cooldown: Duration,
    /// Length of the sustained-load window considered for each decision.
    pub window: Duration,
    /// Minimum samples required in-window before a scale-up is considered.
    pub min_samples_up: usize,
    /// Minimum samples required in-window before a scale-down is considered.
    pub min_samples_down: usize,
    /// CPU utilization above which sustained load justifies a scale-up.
    pub cpu_threshold: f64,
    /// Memory utilization below which a scale-up is still considered safe.
    pub memory_threshold: f64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            window: Duration::from_secs(120),
            min_samples_up: 3,
            min_samples_down: 5,
            cpu_threshold: 0.75,
            memory_threshold: 0.80,
        }
    }
}

/// One CPU/memory utilization observation.
#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    /// CPU utilization in `[0, 1]`.
    pub cpu: f64,
    /// Memory utilization in `[0, 1]`.
    pub memory: f64,
}

/// Outcome of a scaling decision for a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// No change: cooldown active, insufficient samples, or load within band.
    NoChange,
    /// Increase concurrency by one, to the given target.
    ScaleUp(usize),
    /// Decrease concurrency by one, to the given target.
    ScaleDown(usize),
}

struct TimedSample {
    sample: LoadSample,
    at: Instant,
}

/// Rolling-window scaler for a single worker class.
pub struct Scaler {
    config: ScalerConfig,
    samples: VecDeque<TimedSample>,
    last_decision_at: Option<Instant>,
}

impl Scaler {
    /// Build a scaler with the given tuning.
    pub fn new(config: ScalerConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
            last_decision_at: None,
        }
    }

    /// Record a fresh utilization sample, evicting anything older than the window.
    pub fn record_sample(&mut self, sample: LoadSample) {
        let now = Instant::now();
        self.samples.push_back(TimedSample { sample, at: now });
        self.evict_expired(now);
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(front) = self.samples.front() {
            if now.duration_since(front.at) > self.config.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn averages(&self) -> (f64, f64, usize) {
        let count = self.samples.len();
        if count == 0 {
            return (0.0, 0.0, 0);
        }
        let (cpu_sum, mem_sum) = self
            .samples
            .iter()
            .fold((0.0, 0.0), |(c, m), s| (c + s.sample.cpu, m + s.sample.memory));
        (cpu_sum / count as f64, mem_sum / count as f64, count)
    }

    /// Decide whether class `current` concurrency (bounded by `[min, max]`)
    /// should change, honoring cooldown, sample-count floors, the scale
    /// thresholds and the oscillation guard (non-overlapping bands).
    pub fn decide(&mut self, current: usize, min: usize, max: usize) -> ScaleDecision {
        let now = Instant::now();
        if let Some(last) = self.last_decision_at {
            if now.duration_since(last) < self.config.cooldown {
                return ScaleDecision::NoChange;
            }
        }

        self.evict_expired(now);
        let (cpu_avg, mem_avg, count) = self.averages();

        let decision = if count >= self.config.min_samples_up
            && cpu_avg > self.config.cpu_threshold
            && mem_avg < self.config.memory_threshold
            && current < max
        {
            ScaleDecision::ScaleUp(current + 1)
        } else if count >= self.config.min_samples_down
            && cpu_avg < self.config.cpu_threshold * 0.5
            && mem_avg < self.config.memory_threshold * 0.6
            && current > min
        {
            ScaleDecision::ScaleDown(current - 1)
        } else {
            ScaleDecision::NoChange
        };

        if decision != ScaleDecision::NoChange {
            self.last_decision_at = Some(now);
        }
        decision
    }
}

/// Source of CPU/memory utilization samples. Production deployments would
/// read real OS counters; tests and the bundled default drive it synthetically.
pub trait LoadProbe: Send + Sync {
    /// Produce the current system-wide utilization reading.
    fn sample(&self) -> LoadSample;
}

/// Deterministic-ish load probe for environments with no real metrics source
/// wired up yet. Mirrors the workload simulators the performance-monitoring
/// stack uses for its own test fixtures.
pub struct SyntheticLoadProbe {
    base_cpu: f64,
    base_memory: f64,
    jitter: f64,
}

impl SyntheticLoadProbe {
    /// Build a probe that oscillates around `base_cpu`/`base_memory` by up to `jitter`.
    pub fn new(base_cpu: f64, base_memory: f64, jitter: f64) -> Self {
        Self {
            base_cpu,
            base_memory,
            jitter,
        }
    }
}

impl LoadProbe for SyntheticLoadProbe {
    fn sample(&self) -> LoadSample {
        let cpu_noise = (fastrand::f64() - 0.5) * 2.0 * self.jitter;
        let mem_noise = (fastrand::f64() - 0.5) * 2.0 * self.jitter;
        LoadSample {
            cpu: (self.base_cpu + cpu_noise).clamp(0.0, 1.0),
            memory: (self.base_memory + mem_noise).clamp(0.0, 1.0),
        }
    }
}
