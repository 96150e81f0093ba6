//! Queue job records and the fixed set of named queues (§6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Names of the durable FIFO queues the core depends on. Kept as a fixed
/// array (rather than an enum) because the Queue Bus treats queue names as
/// opaque strings — only the core's own producers/consumers care which of
/// these they use.
pub const QUEUE_NAMES: &[&str] = &[
    "file-analysis-queue",
    "directory-aggregation-queue",
    "directory-resolution-queue",
    "relationship-resolution-queue",
    "global-relationship-analysis-queue",
    "analysis-findings-queue",
    "reconciliation-queue",
    "failed-jobs",
];

/// A logical record inside the Queue Bus. Lifecycle (waiting/active/failed,
/// attempt accounting) is owned entirely by `triangulum-queue`; this type is
/// the shape handed across that boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    /// Destination queue name.
    pub queue: String,
    /// Opaque job payload.
    pub payload: serde_json::Value,
    /// Number of delivery attempts made so far.
    pub attempt: u32,
    /// Delay, in milliseconds, before the job becomes eligible for delivery.
    pub delay_ms: u64,
    /// Scheduling priority; higher values are dequeued first.
    pub priority: i32,
    /// When the job was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl QueueJob {
    /// Create a job with no delay and default priority.
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue: queue.into(),
            payload,
            attempt: 0,
            delay_ms: 0,
            priority: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Set a delay before the job is eligible for delivery.
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Set a scheduling priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_are_the_fixed_set() {
        assert_eq!(QUEUE_NAMES.len(), 8);
        assert!(QUEUE_NAMES.contains(&"failed-jobs"));
    }

    #[test]
    fn new_job_has_zero_attempts() {
        let job = QueueJob::new("file-analysis-queue", serde_json::json!({"path": "a.js"}));
        assert_eq!(job.attempt, 0);
        assert_eq!(job.delay_ms, 0);
    }
}
