//! Count events per group.

use std::collections::HashSet;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tally_core::{EVENT_TYPE_EVENT, Event, format_timestamp};

use crate::action::{
    AggregateAction, AggregateActionInput, AggregateActionOutput, AggregateActionResponse,
};
use crate::config::OutputFormat;
use crate::error::AggregateError;
use crate::metric::{AGGREGATION_TEMPORALITY_DELTA, Exemplar, SumMetric, TimeWindow, event_time};

pub const DEFAULT_COUNT_KEY: &str = "aggr._count";
pub const DEFAULT_START_TIME_KEY: &str = "aggr._start_time";
pub const DEFAULT_END_TIME_KEY: &str = "aggr._end_time";
pub const DEFAULT_COUNT_METRIC_NAME: &str = "count";

const DESCRIPTION: &str = "Number of events";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CountConfig {
    /// Group state key holding the running count.
    pub count_key: String,
    /// Event field read as an event's start time, and the output key for the
    /// group's start time.
    pub start_time_key: String,
    /// Event field read as an event's end time.
    pub end_time_key: String,
    pub output_format: OutputFormat,
    pub metric_name: String,
    /// When set, only events with an unseen combination of these values
    /// are counted.
    pub unique_keys: Vec<String>,
}

impl Default for CountConfig {
    fn default() -> Self {
        Self {
            count_key: DEFAULT_COUNT_KEY.into(),
            start_time_key: DEFAULT_START_TIME_KEY.into(),
            end_time_key: DEFAULT_END_TIME_KEY.into(),
            output_format: OutputFormat::default(),
            metric_name: DEFAULT_COUNT_METRIC_NAME.into(),
            unique_keys: Vec::new(),
        }
    }
}

impl CountConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("count_key", &self.count_key),
            ("start_time_key", &self.start_time_key),
            ("end_time_key", &self.end_time_key),
            ("metric_name", &self.metric_name),
        ] {
            if value.is_empty() {
                return Err(format!("count {field} must not be empty"));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CountAction {
    config: CountConfig,
    count: u64,
    window: TimeWindow,
    exemplar: Option<Exemplar>,
    unique_seen: HashSet<String>,
}

impl CountAction {
    pub fn new(config: CountConfig) -> Self {
        Self {
            config,
            count: 0,
            window: TimeWindow::default(),
            exemplar: None,
            unique_seen: HashSet::new(),
        }
    }

    /// Returns false when the event repeats an already counted combination
    /// of unique key values.
    fn first_of_combination(&mut self, event: &Event) -> bool {
        if self.config.unique_keys.is_empty() {
            return true;
        }
        let values: Vec<Value> = self
            .config
            .unique_keys
            .iter()
            .map(|key| event.get(key).cloned().unwrap_or(Value::Null))
            .collect();
        self.unique_seen.insert(Value::Array(values).to_string())
    }
}

impl AggregateAction for CountAction {
    fn name(&self) -> &'static str {
        "count"
    }

    fn handle_event(
        &mut self,
        event: Event,
        input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionResponse, AggregateError> {
        if !self.first_of_combination(&event) {
            return Ok(AggregateActionResponse::Absorb);
        }

        let now = Utc::now();
        let start = event_time(&event, &self.config.start_time_key);
        let end = event_time(&event, &self.config.end_time_key);
        self.window.observe(start, end, now);
        self.count += 1;

        let (state, identification_keys) = input.state_and_keys();
        if self.count == 1 {
            state.put_all(identification_keys);
        }
        state.insert(self.config.count_key.clone(), self.count);
        state.insert(
            self.config.start_time_key.clone(),
            format_timestamp(&self.window.start_or(now)),
        );

        let exemplar_time = end.or(start).unwrap_or(now);
        self.exemplar = Some(Exemplar::capture(
            &event,
            1.0,
            exemplar_time,
            &[
                self.config.start_time_key.as_str(),
                self.config.end_time_key.as_str(),
            ],
        ));
        Ok(AggregateActionResponse::Absorb)
    }

    #[allow(clippy::cast_precision_loss)]
    fn conclude_group(
        &mut self,
        input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionOutput, AggregateError> {
        if self.count == 0 {
            return Ok(AggregateActionOutput::empty());
        }
        let event = match self.config.output_format {
            OutputFormat::Raw => Event::new(EVENT_TYPE_EVENT, input.group_state().snapshot()),
            OutputFormat::OtelMetrics => {
                let now = Utc::now();
                SumMetric {
                    name: self.config.metric_name.clone(),
                    description: DESCRIPTION.into(),
                    unit: "1".into(),
                    kind: "SUM",
                    start_time: format_timestamp(&self.window.start_or(now)),
                    time: format_timestamp(&self.window.end_or(now)),
                    value: self.count as f64,
                    is_monotonic: true,
                    aggregation_temporality: AGGREGATION_TEMPORALITY_DELTA,
                    attributes: input.identification_keys().clone(),
                    exemplars: self.exemplar.iter().cloned().collect(),
                }
                .into_event()?
            }
        };
        Ok(AggregateActionOutput::single(event))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone};
    use serde_json::json;
    use tally_core::{GroupKey, GroupState, parse_timestamp};

    use super::*;
    use crate::actions::test_support::fields;

    fn feed(action: &mut CountAction, state: &mut GroupState, key: &GroupKey, value: Value) {
        let mut input = AggregateActionInput::new(state, key);
        let event = Event::from_value("log", value).unwrap();
        let response = action.handle_event(event, &mut input).unwrap();
        assert!(matches!(response, AggregateActionResponse::Absorb));
    }

    fn conclude(action: &mut CountAction, state: &mut GroupState, key: &GroupKey) -> Event {
        let mut input = AggregateActionInput::new(state, key);
        let mut events = action.conclude_group(&mut input).unwrap().into_events();
        assert_eq!(events.len(), 1);
        events.remove(0)
    }

    #[test]
    fn raw_output_holds_keys_count_and_start() {
        let key = GroupKey::with_fields("g", fields(json!({"service": "api"})));
        let mut state = GroupState::new();
        let mut action = CountAction::new(CountConfig {
            output_format: OutputFormat::Raw,
            ..CountConfig::default()
        });
        for i in 0..7 {
            feed(&mut action, &mut state, &key, json!({"service": "api", "i": i}));
        }
        let event = conclude(&mut action, &mut state, &key);
        assert_eq!(event.event_type(), EVENT_TYPE_EVENT);
        assert_eq!(event.get("service"), Some(&json!("api")));
        assert_eq!(event.get(DEFAULT_COUNT_KEY), Some(&json!(7)));
        let start = event.get(DEFAULT_START_TIME_KEY).unwrap();
        assert!(parse_timestamp(start).is_some());
        assert!(event.get("i").is_none());
    }

    #[test]
    fn otel_output_with_exemplar_of_last_event() {
        let key = GroupKey::with_fields("g", fields(json!({"service": "api"})));
        let mut state = GroupState::new();
        let mut action = CountAction::new(CountConfig::default());
        let n = 25;
        for i in 0..n {
            feed(&mut action, &mut state, &key, json!({"service": "api", "payload": i}));
        }
        let event = conclude(&mut action, &mut state, &key);
        assert_eq!(event.event_type(), tally_core::EVENT_TYPE_METRIC);
        assert_eq!(event.get("name"), Some(&json!("count")));
        assert_eq!(event.get("description"), Some(&json!("Number of events")));
        assert_eq!(event.get("unit"), Some(&json!("1")));
        assert_eq!(event.get("isMonotonic"), Some(&json!(true)));
        assert_eq!(
            event.get("aggregationTemporality"),
            Some(&json!("AGGREGATION_TEMPORALITY_DELTA"))
        );
        assert_eq!(event.get("value"), Some(&json!(f64::from(n))));
        assert_eq!(event.get("attributes"), Some(&json!({"service": "api"})));

        let exemplars = event.get("exemplars").and_then(Value::as_array).unwrap();
        assert_eq!(exemplars.len(), 1);
        assert_eq!(
            exemplars[0].get("attributes"),
            Some(&json!({"service": "api", "payload": n - 1}))
        );
        assert_eq!(exemplars[0].get("value"), Some(&json!(1.0)));
    }

    #[test]
    fn explicit_times_drive_window() {
        let key = GroupKey::new("g");
        let mut state = GroupState::new();
        let mut action = CountAction::new(CountConfig {
            start_time_key: "start".into(),
            end_time_key: "end".into(),
            ..CountConfig::default()
        });
        feed(
            &mut action,
            &mut state,
            &key,
            json!({"start": "2024-01-01T00:00:10Z", "end": "2024-01-01T00:00:20Z"}),
        );
        feed(
            &mut action,
            &mut state,
            &key,
            json!({"start": "2024-01-01T00:00:05Z", "end": "2024-01-01T00:00:15Z"}),
        );
        let event = conclude(&mut action, &mut state, &key);
        assert_eq!(event.get("startTime"), Some(&json!("2024-01-01T00:00:05Z")));
        assert_eq!(event.get("time"), Some(&json!("2024-01-01T00:00:20Z")));

        let exemplar = &event.get("exemplars").and_then(Value::as_array).unwrap()[0];
        assert_eq!(exemplar.get("time"), Some(&json!("2024-01-01T00:00:15Z")));
        assert_eq!(exemplar.get("attributes"), Some(&json!({})));
    }

    #[test]
    fn unparseable_start_falls_back_to_wall_clock() {
        let key = GroupKey::new("g");
        let mut state = GroupState::new();
        let mut action = CountAction::new(CountConfig {
            start_time_key: "start".into(),
            output_format: OutputFormat::Raw,
            ..CountConfig::default()
        });
        let before: DateTime<Utc> = Utc::now() - chrono::Duration::seconds(1);
        feed(&mut action, &mut state, &key, json!({"start": "garbage"}));
        let event = conclude(&mut action, &mut state, &key);
        let start = parse_timestamp(event.get("start").unwrap()).unwrap();
        assert!(start >= before);
        assert!(start > Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn unique_keys_count_distinct_combinations() {
        let key = GroupKey::new("g");
        let mut state = GroupState::new();
        let mut action = CountAction::new(CountConfig {
            unique_keys: vec!["user".into(), "page".into()],
            output_format: OutputFormat::Raw,
            ..CountConfig::default()
        });
        for (user, page) in [("a", 1), ("a", 1), ("a", 2), ("b", 1), ("b", 1)] {
            feed(&mut action, &mut state, &key, json!({"user": user, "page": page}));
        }
        let event = conclude(&mut action, &mut state, &key);
        assert_eq!(event.get(DEFAULT_COUNT_KEY), Some(&json!(3)));
    }

    #[test]
    fn validate_rejects_empty_keys() {
        let config = CountConfig {
            count_key: String::new(),
            ..CountConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(CountConfig::default().validate().is_ok());
    }
}
