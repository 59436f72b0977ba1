//! The aggregate action contract.
//!
//! An action is bound to exactly one group. The engine calls
//! [`AggregateAction::handle_event`] for every event routed to that group and
//! [`AggregateAction::conclude_group`] when the group's deadline passes, is
//! flushed explicitly, or the processor shuts down. Both calls happen while
//! the engine holds the group's lock, so an action owns its private state and
//! the group's [`GroupState`] exclusively for the duration of the call.

use std::time::Duration;

use serde_json::{Map, Value};
use tally_core::{Event, GroupKey, GroupState};

use crate::error::AggregateError;

/// The view an action receives during a call.
#[derive(Debug)]
pub struct AggregateActionInput<'a> {
    state: &'a mut GroupState,
    key: &'a GroupKey,
    forced: bool,
}

impl<'a> AggregateActionInput<'a> {
    pub fn new(state: &'a mut GroupState, key: &'a GroupKey) -> Self {
        Self {
            state,
            key,
            forced: false,
        }
    }

    /// Mark the conclusion as forced (shutdown flush). Actions that defer
    /// their decision must decide immediately.
    #[must_use]
    pub fn with_forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }

    pub fn group_state(&self) -> &GroupState {
        &*self.state
    }

    pub fn group_state_mut(&mut self) -> &mut GroupState {
        &mut *self.state
    }

    /// Mutable state together with the group's identification keys.
    pub fn state_and_keys(&mut self) -> (&mut GroupState, &Map<String, Value>) {
        (&mut *self.state, self.key.fields())
    }

    pub fn group_key(&self) -> &GroupKey {
        self.key
    }

    /// The identification key values that define this group.
    pub fn identification_keys(&self) -> &Map<String, Value> {
        self.key.fields()
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }
}

/// What an action decided for one incoming event.
#[derive(Debug)]
pub enum AggregateActionResponse {
    /// Emit this event downstream now.
    Forward(Event),
    /// The event was folded into group state; nothing to emit now.
    Absorb,
    /// The event was refused and must not be emitted.
    Drop,
    /// The event cannot be admitted yet. The engine releases the group lock,
    /// waits `after`, and hands the event back to the action.
    Retry { event: Event, after: Duration },
}

/// Events synthesized when a group concludes.
#[derive(Debug, Default)]
pub struct AggregateActionOutput {
    events: Vec<Event>,
    retry_after: Option<Duration>,
}

impl AggregateActionOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(event: Event) -> Self {
        Self::with_events(vec![event])
    }

    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events,
            retry_after: None,
        }
    }

    /// The decision is not final yet; conclusion should be retried after
    /// `after`. Group state must be kept.
    pub fn deferred(after: Duration) -> Self {
        Self {
            events: Vec::new(),
            retry_after: Some(after),
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_deferred(&self) -> bool {
        self.retry_after.is_some()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// One aggregation strategy, instantiated per group.
pub trait AggregateAction: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn handle_event(
        &mut self,
        event: Event,
        input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionResponse, AggregateError>;

    /// Finalize the group. Actions without buffered output keep the default.
    fn conclude_group(
        &mut self,
        _input: &mut AggregateActionInput<'_>,
    ) -> Result<AggregateActionOutput, AggregateError> {
        Ok(AggregateActionOutput::empty())
    }

    /// A conclusion delay the action manages itself, overriding the
    /// processor's group duration.
    fn conclude_after(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_output_is_empty() {
        let output = AggregateActionOutput::deferred(Duration::from_secs(1));
        assert!(output.is_deferred());
        assert!(output.is_empty());
        assert_eq!(output.retry_after(), Some(Duration::from_secs(1)));
        assert!(!AggregateActionOutput::empty().is_deferred());
    }

    #[test]
    fn input_exposes_state_and_identity() {
        let mut fields = Map::new();
        fields.insert("service".into(), Value::from("api"));
        let key = GroupKey::with_fields("k", fields);
        let mut state = GroupState::new();
        let mut input = AggregateActionInput::new(&mut state, &key).with_forced(true);
        input.group_state_mut().insert("n", 1);
        assert!(input.is_forced());
        assert_eq!(input.identification_keys().len(), 1);
        assert_eq!(input.group_key().id(), "k");
        assert_eq!(state.get("n"), Some(&Value::from(1)));
    }
}
