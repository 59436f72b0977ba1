//! Processor and action configuration.
//!
//! Every type deserializes from TOML/JSON with serde defaults and exposes a
//! `validate` method returning a human-readable reason on failure. The
//! factory turns a failed check into [`AggregateError::Configuration`].
//!
//! [`AggregateError::Configuration`]: crate::AggregateError::Configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_core::MAX_EVENTS_PER_SECOND;

use crate::actions::append::AppendConfig;
use crate::actions::count::CountConfig;
use crate::actions::histogram::HistogramConfig;
use crate::actions::percent_sampler::PercentSamplerConfig;
use crate::actions::rate_limiter::RateLimiterConfig;
use crate::actions::tail_sampler::TailSamplerConfig;
use crate::error::AggregateError;

/// Shape of the record emitted by Count and Histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// OTel metric-shaped record.
    #[default]
    OtelMetrics,
    /// The accumulated group state as a flat map.
    Raw,
}

impl FromStr for OutputFormat {
    type Err = AggregateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "otel_metrics" => Ok(Self::OtelMetrics),
            "raw" => Ok(Self::Raw),
            other => Err(AggregateError::Configuration(format!(
                "unknown output format '{other}'"
            ))),
        }
    }
}

/// The action selected for every group of a processor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    Append(AppendConfig),
    PutAll,
    RemoveDuplicates,
    Count(CountConfig),
    Histogram(HistogramConfig),
    PercentSampler(PercentSamplerConfig),
    RateLimiter(RateLimiterConfig),
    TailSampler(TailSamplerConfig),
}

impl ActionConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Append(_) => "append",
            Self::PutAll => "put_all",
            Self::RemoveDuplicates => "remove_duplicates",
            Self::Count(_) => "count",
            Self::Histogram(_) => "histogram",
            Self::PercentSampler(_) => "percent_sampler",
            Self::RateLimiter(_) => "rate_limiter",
            Self::TailSampler(_) => "tail_sampler",
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Append(_) | Self::PutAll | Self::RemoveDuplicates => Ok(()),
            Self::Count(config) => config.validate(),
            Self::Histogram(config) => config.validate(),
            Self::PercentSampler(config) => config.validate(),
            Self::RateLimiter(config) => config.validate(),
            Self::TailSampler(config) => config.validate(),
        }
    }

    /// Whether groups of this action hold buffered output that a shutdown
    /// flush must emit.
    pub fn buffers_events(&self) -> bool {
        matches!(
            self,
            Self::Append(_)
                | Self::PutAll
                | Self::Count(_)
                | Self::Histogram(_)
                | Self::TailSampler(_)
        )
    }
}

/// What happens to in-flight groups when the processor stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Force-conclude every group and emit its output.
    #[default]
    Flush,
    /// Drop every group without concluding it.
    Discard,
}

impl fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flush => f.write_str("flush"),
            Self::Discard => f.write_str("discard"),
        }
    }
}

/// Configuration for an [`AggregateProcessor`](crate::AggregateProcessor).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AggregateProcessorConfig {
    /// Event keys whose values define a group.
    pub identification_keys: Vec<String>,

    /// How long a group accumulates before it is concluded.
    #[serde(default = "default_group_duration_ms")]
    pub group_duration_ms: u64,

    /// Conclude a group early once it has seen no event for this long.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,

    /// The action every group runs.
    pub action: ActionConfig,

    /// Only events matching this condition are aggregated.
    #[serde(default)]
    pub aggregate_when: Option<String>,

    /// Also forward the original events downstream.
    #[serde(default)]
    pub output_unaggregated_events: bool,

    /// Tag added to every event produced by group conclusion.
    #[serde(default)]
    pub aggregated_events_tag: Option<String>,

    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,

    /// Budget for per-event failure warnings.
    #[serde(default = "default_diagnostic_logs_per_second")]
    pub diagnostic_logs_per_second: u32,
}

fn default_group_duration_ms() -> u64 {
    180_000
}

fn default_diagnostic_logs_per_second() -> u32 {
    10
}

impl AggregateProcessorConfig {
    /// A configuration with default timing for the given keys and action.
    pub fn new(identification_keys: Vec<String>, action: ActionConfig) -> Self {
        Self {
            identification_keys,
            group_duration_ms: default_group_duration_ms(),
            idle_timeout_ms: None,
            action,
            aggregate_when: None,
            output_unaggregated_events: false,
            aggregated_events_tag: None,
            shutdown_policy: ShutdownPolicy::default(),
            diagnostic_logs_per_second: default_diagnostic_logs_per_second(),
        }
    }

    pub fn group_duration(&self) -> Duration {
        Duration::from_millis(self.group_duration_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.identification_keys.is_empty() {
            return Err("identification_keys must not be empty".into());
        }
        if self.identification_keys.iter().any(|k| k.trim().is_empty()) {
            return Err("identification_keys must not contain blank keys".into());
        }
        if self.group_duration_ms == 0 {
            return Err("group_duration_ms must be greater than 0".into());
        }
        if self.idle_timeout_ms == Some(0) {
            return Err("idle_timeout_ms must be greater than 0".into());
        }
        if self.diagnostic_logs_per_second == 0
            || self.diagnostic_logs_per_second > MAX_EVENTS_PER_SECOND
        {
            return Err(format!(
                "diagnostic_logs_per_second must be in (0, {MAX_EVENTS_PER_SECOND}]"
            ));
        }
        if let Some(tag) = &self.aggregated_events_tag
            && tag.is_empty()
        {
            return Err("aggregated_events_tag must not be empty".into());
        }
        self.action.validate()
    }
}
