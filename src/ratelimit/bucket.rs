//! Token bucket implementation.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Capacity and refill speed of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Maximum number of tokens the bucket can hold
    pub burst: NonZeroU32,
    /// Time needed to regenerate a single token
    pub replenish_interval: Duration,
}

impl Quota {
    /// Create a quota from a burst size and a per-token replenish interval.
    ///
    /// A zero interval is bumped to one millisecond.
    pub fn new(burst: NonZeroU32, replenish_interval: Duration) -> Self {
        Self {
            burst,
            replenish_interval: replenish_interval.max(Duration::from_millis(1)),
        }
    }

    /// `limit` requests of burst, one token regained per `window`.
    pub fn per_window(limit: NonZeroU32, window: Duration) -> Self {
        Self::new(limit, window)
    }
}

/// Outcome of a single admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether a token was taken
    pub admitted: bool,
    /// Tokens left after the attempt
    pub remaining: f64,
}

impl Decision {
    /// Remaining tokens rounded to the nearest whole token.
    pub fn remaining_display(&self) -> u64 {
        self.remaining.max(0.0).round() as u64
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket that refills continuously.
///
/// Refill and take happen under one lock, so concurrent callers for the same
/// bucket observe a serial evaluation and never share the last token.
#[derive(Debug)]
pub struct TokenBucket {
    quota: Quota,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(quota: Quota, now: Instant) -> Self {
        Self {
            quota,
            state: Mutex::new(BucketState {
                tokens: quota.burst.get() as f64,
                last_refill: now,
            }),
        }
    }

    /// Try to take one token.
    pub fn try_acquire(&self, now: Instant) -> Decision {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Decision {
                admitted: true,
                remaining: state.tokens,
            }
        } else {
            Decision {
                admitted: false,
                remaining: state.tokens,
            }
        }
    }

    /// Current fractional token count.
    pub fn tokens(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // Readings older than the last refill are ignored rather than
        // moving the bucket backwards.
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let gained = elapsed.as_secs_f64() / self.quota.replenish_interval.as_secs_f64();
        let burst = self.quota.burst.get() as f64;
        state.tokens = (state.tokens + gained).min(burst);
        state.last_refill = now;
    }
}
