//! Token-bucket admission per group.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tally_core::{Event, MAX_EVENTS_PER_SECOND, TokenBucket};

use crate::action::{AggregateAction, AggregateActionInput, AggregateActionResponse};
use crate::error::AggregateError;

/// Retry delay used when the bucket reports an already elapsed interval.
const MIN_RETRY: Duration = Duration::from_millis(1);

/// What to do with events arriving while the bucket is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimiterMode {
    /// Hold the event until a token is available.
    #[default]
    Block,
    /// Discard the event.
    Drop,
}

impl FromStr for RateLimiterMode {
    type Err = AggregateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop" => Ok(Self::Drop),
            other => Err(AggregateError::Configuration(format!(
                "unknown rate limiter mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RateLimiterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::Drop => f.write_str("drop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimiterConfig {
    pub events_per_second: u32,
    #[serde(default)]
    pub when_exceeds: RateLimiterMode,
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.events_per_second == 0 || self.events_per_second > MAX_EVENTS_PER_SECOND {
            return Err(format!(
                "rate_limiter events_per_second must be in (0, {MAX_EVENTS_PER_SECOND}], got {}",
                self.events_per_second
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RateLimiterAction {
    bucket: TokenBucket,
    mode: RateLimiterMode,
}

impl RateLimiterAction {
    pub fn new(config: &RateLimiterConfig) -> Result<Self, AggregateError> {
        Ok(Self {
            bucket: TokenBucket::new(config.events_per_second, Instant::now())?,
            mode: config.when_exceeds,
        })
    }

    /// Admission decision at an explicit instant.
    pub fn admit_at(&mut self, event: Event, now: Instant) -> AggregateActionResponse {
        if self.bucket.is_allowed(now) {
            return AggregateActionResponse::Forward(event);
        }
        match self.mode {
            RateLimiterMode::Drop => AggregateActionResponse::Drop,
            RateLimiterMode::Block => AggregateActionResponse::Retry {
                event,
                after: self.bucket.time_until_refill(now).max(MIN_RETRY),
            },
        }
    }
}

impl AggregateAction for RateLimiterAction {
    fn name(&self) -> &'static str {
        "rate_limiter"
    }

    fn handle_event(
        &mut self,
        event: Event,
        _input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionResponse, AggregateError> {
        Ok(self.admit_at(event, Instant::now()))
    }
}
