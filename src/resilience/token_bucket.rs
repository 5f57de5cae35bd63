//! Token bucket rate limiter.
//!
//! Tokens refill continuously at `refill_rate` per second up to `capacity`.
//! Refill is applied lazily on every access, so an idle bucket costs nothing.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        TokenBucket {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Currently available tokens, after refill.
    pub fn tokens(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        state.tokens
    }

    /// Take `n` tokens if that many are available. Leaves the bucket untouched
    /// (apart from refill) on failure.
    pub fn consume(&self, n: f64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Suspend until `n` tokens are available, then take them.
    ///
    /// Returns `false` without waiting when `n` exceeds the capacity, since
    /// such a request could never be satisfied.
    pub async fn wait_for_token(&self, n: f64) -> bool {
        if n > self.capacity {
            return false;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                self.refill(&mut state);
                if state.tokens >= n {
                    state.tokens -= n;
                    return true;
                }
                self.time_until(n - state.tokens)
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn time_until(&self, deficit: f64) -> Duration {
        if self.refill_rate <= 0.0 {
            // Never refills; poll slowly rather than spin.
            return Duration::from_secs(1);
        }
        Duration::from_secs_f64(deficit / self.refill_rate).max(Duration::from_millis(1))
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}
