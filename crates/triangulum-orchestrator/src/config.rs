//! Run orchestrator configuration.
//!
//! Environment/file loading is out of scope here (§1 frames it as an
//! external collaborator) — [`PipelineConfig`] is a plain, `serde`-loadable
//! struct a caller populates however it likes (env, file, hardcoded) and
//! hands to [`crate::RunOrchestrator::new`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use triangulum_checkpoint::BenchmarkConfig;
use triangulum_publisher::PublisherConfig;

/// How often [`crate::RunOrchestrator`] polls file/checkpoint progress while
/// waiting on a stage.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Global watchdog: abort the run if a stage makes no progress for this long.
pub const DEFAULT_STAGE_WATCHDOG: Duration = Duration::from_secs(600);

/// Aggregates every sub-component's configuration into one top-level knob
/// set, matching §6's configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Outbox publisher tuning (§4.5).
    pub publisher: PublisherConfig,
    /// Graph materialization benchmark (§4.8/§4.9's "benchmark-not-met").
    pub benchmark: BenchmarkConfig,
    /// Interval between progress polls while waiting on a stage.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// Abort the run if a stage sees no progress for this long.
    #[serde(with = "duration_millis")]
    pub stage_watchdog: Duration,
    /// Graph-materialization batch size (§4.9).
    pub graph_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            publisher: PublisherConfig::default(),
            benchmark: BenchmarkConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stage_watchdog: DEFAULT_STAGE_WATCHDOG,
            graph_batch_size: triangulum_graph::DEFAULT_BATCH_SIZE,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = PipelineConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        let parsed: PipelineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.poll_interval, config.poll_interval);
        assert_eq!(parsed.graph_batch_size, config.graph_batch_size);
    }
}
