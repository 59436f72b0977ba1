//! Merge events into a single map, later values overwriting earlier ones.

use tally_core::{EVENT_TYPE_EVENT, Event};

use crate::action::{
    AggregateAction, AggregateActionInput, AggregateActionOutput, AggregateActionResponse,
};
use crate::error::AggregateError;

#[derive(Debug, Default)]
pub struct PutAllAction;

impl PutAllAction {
    pub fn new() -> Self {
        Self
    }
}

impl AggregateAction for PutAllAction {
    fn name(&self) -> &'static str {
        "put_all"
    }

    fn handle_event(
        &mut self,
        event: Event,
        input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionResponse, AggregateError> {
        input.group_state_mut().put_all(event.to_map());
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
