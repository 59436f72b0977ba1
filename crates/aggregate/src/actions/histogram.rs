//! Bucket a numeric field into explicit bounds.
//!
//! `B` bounds define `B + 1` buckets: `(-inf, b0)`, `[b0, b1)`, ...,
//! `[b(B-1), +inf)`. A value equal to a bound falls into the bucket that
//! starts at that bound.

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use tally_core::{EVENT_TYPE_EVENT, Event, format_timestamp};

use crate::action::{
    AggregateAction, AggregateActionInput, AggregateActionOutput, AggregateActionResponse,
};
use crate::config::OutputFormat;
use crate::error::AggregateError;
use crate::metric::{
    AGGREGATION_TEMPORALITY_DELTA, Bucket, Exemplar, HistogramMetric, TimeWindow, event_time,
};

pub const DEFAULT_GENERATED_KEY_PREFIX: &str = "aggr._";
pub const DEFAULT_HISTOGRAM_METRIC_NAME: &str = "histogram";

/// Open bucket ends are reported as the largest finite `f32`.
#[allow(clippy::cast_lossless)]
const OPEN_BOUND: f64 = f32::MAX as f64;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistogramConfig {
    /// Event field holding the observed value.
    pub key: String,
    #[serde(default)]
    pub units: String,
    /// Ascending bucket bounds. Integer and float literals are both accepted.
    pub buckets: Vec<f64>,
    #[serde(default)]
    pub record_minmax: bool,
    #[serde(default = "default_generated_key_prefix")]
    pub generated_key_prefix: String,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "default_metric_name")]
    pub metric_name: String,
}

fn default_generated_key_prefix() -> String {
    DEFAULT_GENERATED_KEY_PREFIX.into()
}

fn default_metric_name() -> String {
    DEFAULT_HISTOGRAM_METRIC_NAME.into()
}

impl HistogramConfig {
    pub fn new(key: impl Into<String>, buckets: Vec<f64>) -> Self {
        Self {
            key: key.into(),
            units: String::new(),
            buckets,
            record_minmax: false,
            generated_key_prefix: default_generated_key_prefix(),
            output_format: OutputFormat::default(),
            metric_name: default_metric_name(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.key.is_empty() {
            return Err("histogram key must not be empty".into());
        }
        if self.buckets.is_empty() {
            return Err("histogram buckets must not be empty".into());
        }
        if self.buckets.iter().any(|b| !b.is_finite()) {
            return Err("histogram buckets must be finite numbers".into());
        }
        if self.buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err("histogram buckets must be strictly ascending".into());
        }
        if self.metric_name.is_empty() {
            return Err("histogram metric_name must not be empty".into());
        }
        Ok(())
    }

    fn generated(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.generated_key_prefix)
    }
}

#[derive(Debug)]
pub struct HistogramAction {
    config: HistogramConfig,
    start_time_key: String,
    end_time_key: String,
    bucket_counts: Vec<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    window: TimeWindow,
    first_exemplar: Option<Exemplar>,
    latest_exemplar: Option<Exemplar>,
}

impl HistogramAction {
    pub fn new(config: HistogramConfig) -> Self {
        let bucket_counts = vec![0; config.buckets.len() + 1];
        Self {
            start_time_key: config.generated("start_time"),
            end_time_key: config.generated("end_time"),
            config,
            bucket_counts,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            window: TimeWindow::default(),
            first_exemplar: None,
            latest_exemplar: None,
        }
    }

    /// Index of the bucket holding `value`, in `0..=B`.
    pub fn bucket_index(bounds: &[f64], value: f64) -> usize {
        bounds.partition_point(|bound| *bound <= value)
    }

    fn exemplars(&self) -> Vec<Exemplar> {
        self.first_exemplar
            .iter()
            .chain(self.latest_exemplar.iter())
            .cloned()
            .collect()
    }

    fn buckets(&self) -> Vec<Bucket> {
        let bounds = &self.config.buckets;
        self.bucket_counts
            .iter()
            .enumerate()
            .map(|(i, count)| Bucket {
                min: if i == 0 { -OPEN_BOUND } else { bounds[i - 1] },
                max: bounds.get(i).copied().unwrap_or(OPEN_BOUND),
                count: *count,
            })
            .collect()
    }

    fn min_max(&self) -> (Option<f64>, Option<f64>) {
        if self.config.record_minmax && self.count > 0 {
            (Some(self.min), Some(self.max))
        } else {
            (None, None)
        }
    }
}

impl AggregateAction for HistogramAction {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn handle_event(
        &mut self,
        event: Event,
        input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionResponse, AggregateError> {
        let Some(raw) = event.get(&self.config.key) else {
            return Ok(AggregateActionResponse::Absorb);
        };
        let value = raw.as_f64().ok_or_else(|| AggregateError::InvalidField {
            key: self.config.key.clone(),
            reason: format!("expected a number, got {raw}"),
        })?;

        let index = Self::bucket_index(&self.config.buckets, value);
        self.bucket_counts[index] += 1;
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let now = Utc::now();
        let start = event_time(&event, &self.start_time_key);
        let end = event_time(&event, &self.end_time_key);
        self.window.observe(start, end, now);

        if self.count == 1 {
            let (state, identification_keys) = input.state_and_keys();
            state.put_all(identification_keys);
        }

        let exemplar = Exemplar::capture(
            &event,
            value,
            end.or(start).unwrap_or(now),
            &[self.start_time_key.as_str(), self.end_time_key.as_str()],
        );
        if self.first_exemplar.is_none() {
            self.first_exemplar = Some(exemplar);
        } else {
            self.latest_exemplar = Some(exemplar);
        }
        Ok(AggregateActionResponse::Absorb)
    }

    fn conclude_group(
        &mut self,
        input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionOutput, AggregateError> {
        if self.count == 0 {
            return Ok(AggregateActionOutput::empty());
        }
        let config = &self.config;
        let now = Utc::now();
        let start = self.window.start_or(now);
        let end = self.window.end_or(now);
        let duration_ms = (end - start).num_milliseconds();
        let (min, max) = self.min_max();

        let event = match config.output_format {
            OutputFormat::Raw => {
                let mut map = input.group_state().snapshot();
                map.insert(config.generated("count"), self.count.into());
                map.insert(config.generated("sum"), self.sum.into());
                if let (Some(min), Some(max)) = (min, max) {
                    map.insert(config.generated("min"), min.into());
                    map.insert(config.generated("max"), max.into());
                }
                map.insert(self.start_time_key.clone(), format_timestamp(&start).into());
                map.insert(config.generated("duration"), duration_ms.into());
                map.insert(config.generated("buckets"), config.buckets.clone().into());
                map.insert(
                    config.generated("bucket_counts"),
                    self.bucket_counts.clone().into(),
                );
                Event::new(EVENT_TYPE_EVENT, map)
            }
            OutputFormat::OtelMetrics => {
                let mut attributes = Map::new();
                attributes.insert(
                    format!("{}_key", config.metric_name),
                    Value::from(config.key.clone()),
                );
                attributes.extend(input.identification_keys().clone());
                attributes.insert(config.generated("duration"), duration_ms.into());

                HistogramMetric {
                    name: config.metric_name.clone(),
                    description: format!("Histogram of {} in the events", config.key),
                    unit: config.units.clone(),
                    kind: "HISTOGRAM",
                    start_time: format_timestamp(&start),
                    time: format_timestamp(&end),
                    count: self.count,
                    sum: self.sum,
                    min,
                    max,
                    bucket_counts: self.bucket_counts.len(),
                    explicit_bounds_count: config.buckets.len(),
                    bucket_counts_list: self.bucket_counts.clone(),
                    explicit_bounds: config.buckets.clone(),
                    buckets: self.buckets(),
                    aggregation_temporality: AGGREGATION_TEMPORALITY_DELTA,
                    attributes,
                    exemplars: self.exemplars(),
                }
                .into_event()?
            }
        };
        Ok(AggregateActionOutput::single(event))
    }
}
