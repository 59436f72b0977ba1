//! OTel-shaped metric records emitted by Count and Histogram.
//!
//! Field names are a compatibility contract with downstream OTel encoders and
//! are produced through `serde(rename_all = "camelCase")`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tally_core::{EVENT_TYPE_METRIC, Event, format_timestamp, parse_timestamp};
use tracing::debug;

use crate::error::AggregateError;

pub const AGGREGATION_TEMPORALITY_DELTA: &str = "AGGREGATION_TEMPORALITY_DELTA";

const SPAN_ID_KEY: &str = "spanId";
const TRACE_ID_KEY: &str = "traceId";

/// A representative raw event attached to a metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exemplar {
    pub time: String,
    pub value: f64,
    pub attributes: Map<String, Value>,
    pub span_id: Option<String>,
    pub trace_id: Option<String>,
}

impl Exemplar {
    /// Capture `event` without the listed time fields.
    pub fn capture(event: &Event, value: f64, time: DateTime<Utc>, excluded: &[&str]) -> Self {
        let mut attributes = event.to_map().clone();
        for key in excluded {
            attributes.shift_remove(*key);
        }
        let text = |key: &str| event.get(key).and_then(Value::as_str).map(str::to_owned);
        Self {
            time: format_timestamp(&time),
            value,
            attributes,
            span_id: text(SPAN_ID_KEY),
            trace_id: text(TRACE_ID_KEY),
        }
    }
}

/// A monotonic delta sum, as emitted by Count.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SumMetric {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: &'static str,
    pub start_time: String,
    pub time: String,
    pub value: f64,
    pub is_monotonic: bool,
    pub aggregation_temporality: &'static str,
    pub attributes: Map<String, Value>,
    pub exemplars: Vec<Exemplar>,
}

/// One `[min, max)` histogram bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

/// An explicit-bounds histogram, as emitted by Histogram.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramMetric {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: &'static str,
    pub start_time: String,
    pub time: String,
    pub count: u64,
    pub sum: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    pub bucket_counts: usize,
    pub explicit_bounds_count: usize,
    pub bucket_counts_list: Vec<u64>,
    pub explicit_bounds: Vec<f64>,
    pub buckets: Vec<Bucket>,
    pub aggregation_temporality: &'static str,
    pub attributes: Map<String, Value>,
    pub exemplars: Vec<Exemplar>,
}

impl SumMetric {
    pub fn into_event(self) -> Result<Event, AggregateError> {
        metric_event(&self)
    }
}

impl HistogramMetric {
    pub fn into_event(self) -> Result<Event, AggregateError> {
        metric_event(&self)
    }
}

fn metric_event<T: Serialize>(record: &T) -> Result<Event, AggregateError> {
    Ok(Event::from_value(EVENT_TYPE_METRIC, serde_json::to_value(record)?)?)
}

/// Read a time field from an event. Unparseable values are treated as
/// absent.
pub(crate) fn event_time(event: &Event, key: &str) -> Option<DateTime<Utc>> {
    let value = event.get(key)?;
    let parsed = parse_timestamp(value);
    if parsed.is_none() {
        debug!(key, %value, "ignoring unparseable time field");
    }
    parsed
}

/// Start/end bookkeeping shared by the metric-emitting actions.
#[derive(Debug, Clone, Default)]
pub(crate) struct TimeWindow {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// Fold one event's times into the window. A missing start on the first
    /// event falls back to `now`.
    pub(crate) fn observe(
        &mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        match (self.start, start) {
            (None, observed) => self.start = Some(observed.unwrap_or(now)),
            (Some(current), Some(observed)) if observed < current => self.start = Some(observed),
            _ => {}
        }
        if let Some(observed) = end
            && self.end.is_none_or(|current| observed > current)
        {
            self.end = Some(observed);
        }
    }

    pub(crate) fn start_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.start.unwrap_or(now)
    }

    pub(crate) fn end_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.end.unwrap_or(now)
    }
}
