//! One live aggregation group: its state, its action and its deadlines.

use std::time::{Duration, Instant};

use tally_core::{Event, GroupKey, GroupState};

use crate::action::{
    AggregateAction, AggregateActionInput, AggregateActionOutput, AggregateActionResponse,
};
use crate::error::AggregateError;

pub struct AggregateGroup {
    id: u64,
    key: GroupKey,
    state: GroupState,
    action: Box<dyn AggregateAction>,
    created_at: Instant,
    last_activity: Instant,
    conclude_at: Instant,
    event_count: u64,
    deferred: bool,
    retired: bool,
}

impl std::fmt::Debug for AggregateGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateGroup")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("action", &self.action.name())
            .field("event_count", &self.event_count)
            .field("retired", &self.retired)
            .finish_non_exhaustive()
    }
}

impl AggregateGroup {
    /// A new group concluding after `group_duration`, unless the action
    /// manages its own delay.
    pub fn new(
        id: u64,
        key: GroupKey,
        action: Box<dyn AggregateAction>,
        now: Instant,
        group_duration: Duration,
    ) -> Self {
        let delay = action.conclude_after().unwrap_or(group_duration);
        Self {
            id,
            key,
            state: GroupState::new(),
            action,
            created_at: now,
            last_activity: now,
            conclude_at: now + delay,
            event_count: 0,
            deferred: false,
            retired: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    pub fn action_name(&self) -> &'static str {
        self.action.name()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn handle_event(
        &mut self,
        event: Event,
        now: Instant,
    ) -> Result<AggregateActionResponse, AggregateError> {
        let mut input = AggregateActionInput::new(&mut self.state, &self.key);
        let response = self.action.handle_event(event, &mut input);
        // A retried event is offered again and counted then.
        if !matches!(response, Ok(AggregateActionResponse::Retry { .. })) {
            self.last_activity = now;
            self.event_count += 1;
        }
        response
    }

    pub fn conclude(&mut self, forced: bool) -> Result<AggregateActionOutput, AggregateError> {
        let mut input = AggregateActionInput::new(&mut self.state, &self.key).with_forced(forced);
        self.action.conclude_group(&mut input)
    }

    /// When the group becomes due: its conclusion deadline, or the idle
    /// deadline if that comes first. Once the action has deferred, only the
    /// deadline it asked for counts.
    pub fn due_at(&self, idle_timeout: Option<Duration>) -> Instant {
        match idle_timeout {
            Some(idle) if !self.deferred => self.conclude_at.min(self.last_activity + idle),
            _ => self.conclude_at,
        }
    }

    /// Move the conclusion deadline to `now + after`.
    pub fn defer(&mut self, now: Instant, after: Duration) {
        self.conclude_at = now + after;
        self.deferred = true;
    }

    /// Mark the group as concluded. A retired group is no longer in the
    /// store and must not receive events.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::actions::{PutAllAction, TailSamplerAction, TailSamplerConfig};

    #[test]
    fn due_at_prefers_earliest_deadline() {
        let now = Instant::now();
        let mut group = AggregateGroup::new(
            1,
            GroupKey::new("g"),
            Box::new(PutAllAction::new()),
            now,
            Duration::from_secs(60),
        );
        assert_eq!(group.due_at(None), now + Duration::from_secs(60));
        assert_eq!(
            group.due_at(Some(Duration::from_secs(5))),
            now + Duration::from_secs(5)
        );

        let later = now + Duration::from_secs(3);
        group
            .handle_event(Event::new("log", Map::new()), later)
            .unwrap();
        assert_eq!(
            group.due_at(Some(Duration::from_secs(5))),
            later + Duration::from_secs(5)
        );
        assert_eq!(group.event_count(), 1);
        assert_eq!(group.action_name(), "put_all");
    }

    #[test]
    fn retried_events_are_not_counted() {
        let now = Instant::now();
        let config = crate::actions::RateLimiterConfig {
            events_per_second: 1,
            when_exceeds: crate::actions::RateLimiterMode::Block,
        };
        let action = crate::actions::RateLimiterAction::new(&config).unwrap();
        let mut group = AggregateGroup::new(
            3,
            GroupKey::new("g"),
            Box::new(action),
            now,
            Duration::from_secs(60),
        );
        let first = group.handle_event(Event::new("log", Map::new()), now).unwrap();
        assert!(matches!(first, AggregateActionResponse::Forward(_)));

        let later = now + Duration::from_millis(5);
        let second = group.handle_event(Event::new("log", Map::new()), later).unwrap();
        assert!(matches!(second, AggregateActionResponse::Retry { .. }));
        assert_eq!(group.event_count(), 1);
        assert_eq!(
            group.due_at(Some(Duration::from_secs(5))),
            now + Duration::from_secs(5)
        );
    }

    #[test]
    fn action_delay_overrides_group_duration() {
        let now = Instant::now();
        let config = TailSamplerConfig {
            percent: 100.0,
            wait_period_ms: 250,
            condition: None,
        };
        let action = TailSamplerAction::new(&config, None).unwrap();
        let mut group = AggregateGroup::new(
            2,
            GroupKey::new("g"),
            Box::new(action),
            now,
            Duration::from_secs(60),
        );
        assert_eq!(group.due_at(None), now + Duration::from_millis(250));

        group.defer(now, Duration::from_secs(2));
        assert_eq!(group.due_at(None), now + Duration::from_secs(2));
        assert_eq!(
            group.due_at(Some(Duration::from_millis(10))),
            now + Duration::from_secs(2)
        );
        assert!(!group.is_retired());
        group.retire();
        assert!(group.is_retired());
    }
}
