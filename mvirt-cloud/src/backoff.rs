//! Retry policies for control-plane calls.

use std::time::Duration;

pub use ::backoff::Error as BackoffError;
pub use ::backoff::backoff::Backoff;
pub use ::backoff::future::{retry, retry_notify};
use ::backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const PREEMPTION_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
const PREEMPTION_MULTIPLIER: f64 = 3.0;
const PREEMPTION_RETRIES: u32 = 5;

/// Ceiling for a single delay. Policies are bounded by attempts, not time.
const MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// An exponential backoff that gives up after a fixed number of retries.
#[derive(Debug, Clone)]
pub struct BoundedBackoff {
    inner: ExponentialBackoff,
    retries: u32,
    remaining: u32,
}

impl BoundedBackoff {
    pub fn new(inner: ExponentialBackoff, retries: u32) -> Self {
        Self {
            inner,
            retries,
            remaining: retries,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(exponential(Duration::ZERO, 1.0, 0.0), 0)
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }
}

impl Backoff for BoundedBackoff {
    fn reset(&mut self) {
        self.inner.reset();
        self.remaining = self.retries;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.inner.next_backoff()
    }
}

/// Exponential policy without an elapsed-time limit.
///
/// `randomization` spreads each delay over `[d * (1 - r), d * (1 + r)]`.
pub fn exponential(initial: Duration, multiplier: f64, randomization: f64) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_multiplier(multiplier)
        .with_randomization_factor(randomization.clamp(0.0, 1.0))
        .with_max_interval(MAX_INTERVAL)
        .with_max_elapsed_time(None)
        .build()
}

/// Policy for re-issuing a preempted VM update: 1s, 3s, 9s, 27s, 81s.
pub fn preemption_policy() -> BoundedBackoff {
    BoundedBackoff::new(
        exponential(PREEMPTION_INITIAL_INTERVAL, PREEMPTION_MULTIPLIER, 0.0),
        PREEMPTION_RETRIES,
    )
}
