//! Forward the first event of each group and suppress the rest.

use tally_core::Event;

use crate::action::{AggregateAction, AggregateActionInput, AggregateActionResponse};
use crate::error::AggregateError;

const SEEN_KEY: &str = "seen";

#[derive(Debug, Default)]
pub struct RemoveDuplicatesAction;

impl RemoveDuplicatesAction {
    pub fn new() -> Self {
        Self
    }
}

impl AggregateAction for RemoveDuplicatesAction {
    fn name(&self) -> &'static str {
        "remove_duplicates"
    }

    fn handle_event(
        &mut self,
        event: Event,
        input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionResponse, AggregateError> {
        let state = input.group_state_mut();
        if state.contains_key(SEEN_KEY) {
            return Ok(AggregateActionResponse::Absorb);
        }
        state.insert(SEEN_KEY, true);
        Ok(AggregateActionResponse::Forward(event))
    }
}
