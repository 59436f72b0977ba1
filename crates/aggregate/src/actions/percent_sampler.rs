//! Admit a fixed share of each group's events.
//!
//! Admission is proportional rather than random: after `n` events exactly
//! `floor(n * percent / 100)` have been admitted.

use serde::Deserialize;
use tally_core::Event;

use crate::action::{AggregateAction, AggregateActionInput, AggregateActionResponse};
use crate::error::AggregateError;

/// Resolution of the admission ratio, in parts per million.
const PARTS_PER_MILLION: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PercentSamplerConfig {
    /// Share of events to admit, strictly between 0 and 100.
    pub percent: f64,
}

impl PercentSamplerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.percent.is_finite() && self.percent > 0.0 && self.percent < 100.0) {
            return Err(format!(
                "percent_sampler percent must be in (0, 100), got {}",
                self.percent
            ));
        }
        let ppm = self.parts_per_million();
        if ppm == 0 || ppm >= PARTS_PER_MILLION {
            return Err(format!(
                "percent_sampler percent {} is finer than one part per million",
                self.percent
            ));
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn parts_per_million(&self) -> u64 {
        (self.percent * 10_000.0).round() as u64
    }
}

#[derive(Debug)]
pub struct PercentSamplerAction {
    ppm: u64,
    seen: u64,
    admitted: u64,
}

impl PercentSamplerAction {
    pub fn new(config: &PercentSamplerConfig) -> Self {
        Self {
            ppm: config.parts_per_million(),
            seen: 0,
            admitted: 0,
        }
    }
}

impl AggregateAction for PercentSamplerAction {
    fn name(&self) -> &'static str {
        "percent_sampler"
    }

    fn handle_event(
        &mut self,
        event: Event,
        _input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionResponse, AggregateError> {
        self.seen += 1;
        let target = self.seen.saturating_mul(self.ppm) / PARTS_PER_MILLION;
        if target > self.admitted {
            self.admitted += 1;
            Ok(AggregateActionResponse::Forward(event))
        } else {
            Ok(AggregateActionResponse::Drop)
        }
    }
}
