//! Per-class token-bucket rate limiter: "at most R requests per W-ms window".

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// `requests` tokens refilled every `per` milliseconds, shared across a class.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Bucket capacity and refill quota per window.
    pub requests: u32,
    /// Window length the quota refills over.
    pub per: Duration,
}

impl RateLimitConfig {
    fn refill_rate_per_sec(&self) -> f64 {
        self.requests as f64 / self.per.as_secs_f64()
    }
}

struct TokenBucketState {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucketState {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            tokens: config.requests as f64,
            capacity: config.requests as f64,
            refill_rate: config.refill_rate_per_sec(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, amount: f64) -> bool {
        self.refill();
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    fn time_until_available(&self, amount: f64) -> Duration {
        let deficit = amount - self.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(deficit / self.refill_rate)
    }
}

/// A class's rate limiter. `None` at the call site means rate limiting is
/// disabled for that class, per §4.3 ("optional; disabled when unset").
pub struct TokenBucketLimiter {
    state: Mutex<TokenBucketState>,
}

impl TokenBucketLimiter {
    /// Build a limiter starting with a full bucket.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            state: Mutex::new(TokenBucketState::new(config)),
        }
    }

    /// Try to consume one request's worth of budget without blocking.
    pub fn try_acquire(&self) -> bool {
        self.state
            .lock()
            .expect("rate limiter mutex poisoned")
            .try_consume(1.0)
    }

    /// How long the caller should wait before a single request would be
    /// admitted, given current bucket state.
    pub fn time_until_available(&self) -> Duration {
        let mut state = self.state.lock().expect("rate limiter mutex poisoned");
        state.refill();
        state.time_until_available(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_burst_up_to_capacity_then_blocks() {
        let limiter = TokenBucketLimiter::new(RateLimitConfig {
            requests: 3,
            per: Duration::from_secs(1),
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn refills_over_time() {
        let limiter = TokenBucketLimiter::new(RateLimitConfig {
            requests: 1,
            per: Duration::from_millis(20),
        });
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn time_until_available_is_zero_with_tokens_in_bucket() {
        let limiter = TokenBucketLimiter::new(RateLimitConfig {
            requests: 5,
            per: Duration::from_secs(1),
        });
        assert_eq!(limiter.time_until_available(), Duration::ZERO);
    }
}
