//! Token bucket admission primitive.
//!
//! The bucket holds at most one token. A token is granted every
//! `1s / events_per_second`; callers pass the current instant explicitly so
//! the bucket stays deterministic under test.

use std::time::{Duration, Instant};

use crate::error::ThrottleError;

/// Highest admission rate a bucket can be configured with.
pub const MAX_EVENTS_PER_SECOND: u32 = 1000;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
    replenish_interval: Duration,
}

impl TokenBucket {
    /// Create a bucket admitting `events_per_second`, starting with one token.
    pub fn new(events_per_second: u32, now: Instant) -> Result<Self, ThrottleError> {
        if events_per_second == 0 || events_per_second > MAX_EVENTS_PER_SECOND {
            return Err(ThrottleError::InvalidRate {
                value: events_per_second,
                max: MAX_EVENTS_PER_SECOND,
            });
        }
        Ok(Self {
            tokens: 1,
            last_refill: now,
            replenish_interval: Duration::from_secs(1) / events_per_second,
        })
    }

    /// Take a token if one is available at `now`.
    pub fn is_allowed(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_refill) >= self.replenish_interval {
            self.tokens = 1;
            self.last_refill = now;
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// How long until the next refill, measured from `now`.
    pub fn time_until_refill(&self, now: Instant) -> Duration {
        self.replenish_interval
            .saturating_sub(now.saturating_duration_since(self.last_refill))
    }
}
