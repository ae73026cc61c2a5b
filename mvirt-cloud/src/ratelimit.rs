//! Token-bucket rate limiter for disk operations.

use std::sync::Mutex;

use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// Process-wide token bucket.
///
/// Tokens refill continuously at `qps` per second up to `burst`. Callers only
/// ever probe with [`TokenBucket::try_accept`]; nothing blocks on the bucket.
/// A bucket of zero never accepts.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(qps: f32, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps: f64::from(qps.max(0.0)),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.qps, config.bucket)
    }

    pub fn qps(&self) -> f64 {
        self.qps
    }

    /// Take a token if one is available.
    pub fn try_accept(&self) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.last = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
