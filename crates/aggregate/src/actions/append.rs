//! Merge events into a single map, collecting differing values into lists.

use serde::Deserialize;
use serde_json::Value;
use tally_core::{EVENT_TYPE_EVENT, Event};

use crate::action::{
    AggregateAction, AggregateActionInput, AggregateActionOutput, AggregateActionResponse,
};
use crate::error::AggregateError;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppendConfig {
    /// Keys merged after the first event. Empty means every key.
    pub keys_to_append: Vec<String>,
}

impl AppendConfig {
    fn should_append(&self, key: &str) -> bool {
        self.keys_to_append.is_empty() || self.keys_to_append.iter().any(|k| k == key)
    }
}

#[derive(Debug)]
pub struct AppendAction {
    config: AppendConfig,
}

impl AppendAction {
    pub fn new(config: AppendConfig) -> Self {
        Self { config }
    }
}

impl AggregateAction for AppendAction {
    fn name(&self) -> &'static str {
        "append"
    }

    fn handle_event(
        &mut self,
        event: Event,
        input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionResponse, AggregateError> {
        let state = input.group_state_mut();
        if state.is_empty() {
            // The first event seeds the group with all of its fields.
            state.put_all(event.to_map());
            return Ok(AggregateActionResponse::Absorb);
        }

        for (key, value) in event.into_map() {
            if !self.config.should_append(&key) {
                continue;
            }
            match state.get_mut(&key) {
                None => {
                    state.insert(key, value);
                }
                Some(Value::Array(items)) => match value {
                    Value::Array(more) => items.extend(more),
                    single => items.push(single),
                },
                Some(existing) => {
                    if *existing != value {
                        let previous = existing.take();
                        *existing = Value::Array(vec![previous, value]);
                    }
                }
            }
        }
        Ok(AggregateActionResponse::Absorb)
    }

    fn conclude_group(
        &mut self,
        input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionOutput, AggregateError> {
        let map = input.group_state().snapshot();
        Ok(AggregateActionOutput::single(Event::new(EVENT_TYPE_EVENT, map)))
    }
}
