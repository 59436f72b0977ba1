//! Buffer a group's events and decide after a wait period whether to keep
//! them.
//!
//! A group moves from collecting to decided once the wait period has elapsed
//! since its first event (or a forced conclusion arrives). The decision keeps
//! the whole batch when the error condition matched any event, and otherwise
//! keeps it with probability `percent / 100`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Deserialize;
use tally_core::{Event, ExpressionEvaluator};
use tracing::{debug, warn};

use crate::action::{
    AggregateAction, AggregateActionInput, AggregateActionOutput, AggregateActionResponse,
};
use crate::error::AggregateError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TailSamplerConfig {
    /// Chance, in percent, of keeping a batch with no error observed.
    pub percent: f64,
    /// How long after a group's first event the decision is made.
    pub wait_period_ms: u64,
    /// Condition marking an event as an error.
    #[serde(default, alias = "error_condition")]
    pub condition: Option<String>,
}

impl TailSamplerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.percent.is_finite() && (0.0..=100.0).contains(&self.percent)) {
            return Err(format!(
                "tail_sampler percent must be in [0, 100], got {}",
                self.percent
            ));
        }
        if self.wait_period_ms == 0 {
            return Err("tail_sampler wait_period_ms must be greater than 0".into());
        }
        if let Some(condition) = &self.condition
            && condition.trim().is_empty()
        {
            return Err("tail_sampler condition must not be blank".into());
        }
        Ok(())
    }

    pub fn wait_period(&self) -> Duration {
        Duration::from_millis(self.wait_period_ms)
    }
}

pub struct TailSamplerAction {
    percent: f64,
    wait_period: Duration,
    condition: Option<(String, Arc<dyn ExpressionEvaluator>)>,
    first_event_at: Option<Instant>,
    buffer: Vec<Event>,
    error_observed: bool,
    decided: bool,
}

impl std::fmt::Debug for TailSamplerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailSamplerAction")
            .field("percent", &self.percent)
            .field("wait_period", &self.wait_period)
            .field("buffered", &self.buffer.len())
            .field("error_observed", &self.error_observed)
            .field("decided", &self.decided)
            .finish_non_exhaustive()
    }
}

impl TailSamplerAction {
    /// The evaluator is required when the config carries a condition.
    pub fn new(
        config: &TailSamplerConfig,
        evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    ) -> Result<Self, AggregateError> {
        let condition = match (&config.condition, evaluator) {
            (Some(condition), Some(evaluator)) => Some((condition.clone(), evaluator)),
            (Some(_), None) => {
                return Err(AggregateError::Configuration(
                    "tail_sampler condition requires an expression evaluator".into(),
                ));
            }
            (None, _) => None,
        };
        Ok(Self {
            percent: config.percent,
            wait_period: config.wait_period(),
            condition,
            first_event_at: None,
            buffer: Vec::new(),
            error_observed: false,
            decided: false,
        })
    }

    /// Record an event observed at `now`.
    pub fn observe_at(&mut self, event: Event, now: Instant) {
        self.first_event_at.get_or_insert(now);
        if !self.error_observed
            && let Some((condition, evaluator)) = &self.condition
        {
            match evaluator.evaluate_conditional(condition, &event) {
                Ok(matched) => self.error_observed = matched,
                Err(e) => {
                    warn!(error = %e, "tail sampler condition failed, treating as not matched");
                }
            }
        }
        self.buffer.push(event);
    }

    /// Conclude at an explicit instant.
    pub fn conclude_at(&mut self, now: Instant, forced: bool) -> AggregateActionOutput {
        if self.decided {
            return AggregateActionOutput::empty();
        }
        let Some(first_event_at) = self.first_event_at else {
            return AggregateActionOutput::empty();
        };
        let elapsed = now.saturating_duration_since(first_event_at);
        if !forced && elapsed < self.wait_period {
            return AggregateActionOutput::deferred(self.wait_period - elapsed);
        }

        self.decided = true;
        let events = std::mem::take(&mut self.buffer);
        let keep = self.error_observed || self.sampled();
        debug!(
            buffered = events.len(),
            error_observed = self.error_observed,
            keep,
            "tail sampling decision"
        );
        if keep {
            AggregateActionOutput::with_events(events)
        } else {
            AggregateActionOutput::empty()
        }
    }

    fn sampled(&self) -> bool {
        if self.percent >= 100.0 {
            return true;
        }
        if self.percent <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_range(0.0..100.0) < self.percent
    }
}

impl AggregateAction for TailSamplerAction {
    fn name(&self) -> &'static str {
        "tail_sampler"
    }

    fn handle_event(
        &mut self,
        event: Event,
        _input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionResponse, AggregateError> {
        self.observe_at(event, Instant::now());
        Ok(AggregateActionResponse::Absorb)
    }

    fn conclude_group(
        &mut self,
        input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionOutput, AggregateError> {
        Ok(self.conclude_at(Instant::now(), input.is_forced()))
    }

    fn conclude_after(&self) -> Option<Duration> {
        Some(self.wait_period)
    }
}
