//! Routes events to their groups and concludes groups when they fall due.
//!
//! Each group is processed under its own lock. Two events for the same group
//! are serialized; events for different groups run in parallel. A group is
//! retired and removed from the store while its lock is held, so an event
//! that raced with the conclusion observes the retired flag and retries
//! against a fresh group.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tally_core::{Event, GroupKey};
use tracing::{debug, error, instrument, trace};

use crate::action::AggregateActionResponse;
use crate::error::AggregateError;
use crate::factory::ActionFactory;
use crate::group::AggregateGroup;
use crate::group_manager::{GroupManager, SharedGroup};
use crate::metrics::AggregateMetrics;

/// What happened to one event handed to the engine.
#[derive(Debug)]
pub enum EventOutcome {
    /// The action passed the event on and it should be emitted now.
    Forwarded(Event),
    /// The event was folded into group state.
    Absorbed,
    /// The action refused the event.
    Dropped,
}

pub struct AggregateEngine {
    factory: ActionFactory,
    groups: GroupManager,
    group_duration: Duration,
    idle_timeout: Option<Duration>,
    metrics: Arc<AggregateMetrics>,
}

impl std::fmt::Debug for AggregateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateEngine")
            .field("action", &self.factory.action_name())
            .field("group_duration", &self.group_duration)
            .field("idle_timeout", &self.idle_timeout)
            .field("groups", &self.groups.active_group_count())
            .finish_non_exhaustive()
    }
}

impl AggregateEngine {
    pub fn new(factory: ActionFactory, group_duration: Duration) -> Self {
        Self {
            factory,
            groups: GroupManager::new(),
            group_duration,
            idle_timeout: None,
            metrics: Arc::new(AggregateMetrics::default()),
        }
    }

    /// Conclude groups early once they have been idle this long.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Report into a shared metrics registry.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<AggregateMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<AggregateMetrics> {
        &self.metrics
    }

    /// Number of live groups.
    pub fn group_count(&self) -> usize {
        self.groups.active_group_count()
    }

    /// The earliest pending conclusion deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.groups.next_deadline()
    }

    /// Hand one event to the group identified by `key`, creating the group
    /// on first use.
    ///
    /// A rate limiter in blocking mode answers with a retry; the engine then
    /// sleeps on the calling thread with the group lock released and offers
    /// the event again, so this call may block.
    pub fn process_event(
        &self,
        key: &GroupKey,
        event: Event,
    ) -> Result<EventOutcome, AggregateError> {
        let mut event = event;
        loop {
            let now = Instant::now();
            let (group, created) = self.groups.get_or_create(key, |id| {
                let action = self.factory.create()?;
                Ok(AggregateGroup::new(
                    id,
                    key.clone(),
                    action,
                    now,
                    self.group_duration,
                ))
            })?;

            let mut guard = group.lock();
            if guard.is_retired() {
                trace!(group = %key, "group concluded concurrently, retrying");
                continue;
            }
            if created {
                self.metrics.increment_groups_created();
                self.groups
                    .schedule(key.clone(), guard.id(), guard.due_at(self.idle_timeout));
                debug!(group = %key, action = guard.action_name(), "group created");
            }

            let response = match guard.handle_event(event, now) {
                Ok(response) => response,
                Err(e) => {
                    self.metrics.increment_handle_events_failed();
                    return Err(e);
                }
            };
            match response {
                AggregateActionResponse::Forward(forwarded) => {
                    self.metrics.increment_handle_events_out();
                    return Ok(EventOutcome::Forwarded(forwarded));
                }
                AggregateActionResponse::Absorb => {
                    self.metrics.increment_handle_events_absorbed();
                    return Ok(EventOutcome::Absorbed);
                }
                AggregateActionResponse::Drop => {
                    self.metrics.increment_handle_events_dropped();
                    return Ok(EventOutcome::Dropped);
                }
                AggregateActionResponse::Retry {
                    event: retried,
                    after,
                } => {
                    drop(guard);
                    drop(group);
                    trace!(group = %key, ?after, "event deferred by action");
                    std::thread::sleep(after);
                    event = retried;
                }
            }
        }
    }

    /// Conclude one group now, regardless of its deadline.
    ///
    /// An action that is not ready to decide keeps its group alive and the
    /// call returns no events.
    #[instrument(skip(self, key), fields(group = %key))]
    pub fn conclude_group(&self, key: &GroupKey) -> Result<Vec<Event>, AggregateError> {
        let Some(group) = self.groups.get_group(key) else {
            return Ok(Vec::new());
        };
        let mut guard = group.lock();
        if guard.is_retired() {
            return Ok(Vec::new());
        }
        self.conclude_locked(&group, &mut guard, false, Instant::now())
    }

    /// Conclude every group whose deadline is at or before `now`.
    ///
    /// Failures are logged and counted; the failing group is discarded.
    pub fn conclude_due_groups(&self, now: Instant) -> Vec<Event> {
        let mut events = Vec::new();
        for (key, group_id) in self.groups.pop_due(now) {
            let Some(group) = self.groups.get_group(&key) else {
                continue;
            };
            let mut guard = group.lock();
            if guard.is_retired() || guard.id() != group_id {
                continue;
            }
            let due_at = guard.due_at(self.idle_timeout);
            if due_at > now {
                self.groups.schedule(key, group_id, due_at);
                continue;
            }
            match self.conclude_locked(&group, &mut guard, false, now) {
                Ok(concluded) => events.extend(concluded),
                Err(e) => error!(group = %key, error = %e, "failed to conclude group"),
            }
        }
        events
    }

    /// Conclude every live group. With `forced`, actions that would defer
    /// must decide now.
    pub fn conclude_all(&self, forced: bool) -> Vec<Event> {
        let now = Instant::now();
        let mut events = Vec::new();
        for (key, group) in self.groups.snapshot() {
            let mut guard = group.lock();
            if guard.is_retired() {
                continue;
            }
            match self.conclude_locked(&group, &mut guard, forced, now) {
                Ok(concluded) => events.extend(concluded),
                Err(e) => error!(group = %key, error = %e, "failed to conclude group"),
            }
        }
        events
    }

    /// Drop every live group without concluding it. Returns how many were
    /// dropped.
    pub fn discard_all(&self) -> usize {
        let mut discarded = 0;
        for (key, group) in self.groups.snapshot() {
            let mut guard = group.lock();
            if guard.is_retired() {
                continue;
            }
            guard.retire();
            if self.groups.remove_group(&key, &group) {
                discarded += 1;
            }
        }
        self.metrics.add_groups_discarded(discarded as u64);
        discarded
    }

    fn conclude_locked(
        &self,
        group: &SharedGroup,
        guard: &mut AggregateGroup,
        forced: bool,
        now: Instant,
    ) -> Result<Vec<Event>, AggregateError> {
        let output = match guard.conclude(forced) {
            Ok(output) => output,
            Err(e) => {
                guard.retire();
                self.groups.remove_group(guard.key(), group);
                self.metrics.increment_conclude_group_failures();
                return Err(e);
            }
        };

        if !forced && let Some(after) = output.retry_after() {
            // The action measured `after` from its own clock read, which is
            // later than `now`.
            guard.defer(Instant::now(), after);
            self.groups
                .schedule(guard.key().clone(), guard.id(), guard.due_at(self.idle_timeout));
            self.metrics.increment_groups_deferred();
            trace!(group = %guard.key(), ?after, "group conclusion deferred");
            return Ok(Vec::new());
        }

        guard.retire();
        self.groups.remove_group(guard.key(), group);
        self.metrics.increment_groups_concluded();

        let events = output.into_events();
        if events.is_empty() {
            self.metrics.increment_conclude_group_events_dropped();
        } else {
            self.metrics.add_conclude_group_events_out(events.len() as u64);
        }
        debug!(
            group = %guard.key(),
            action = guard.action_name(),
            events_in = guard.event_count(),
            events_out = events.len(),
            age_ms = u64::try_from(now.saturating_duration_since(guard.created_at()).as_millis())
                .unwrap_or(u64::MAX),
            "group concluded"
        );
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::actions::{
        CountConfig, RateLimiterConfig, RateLimiterMode, TailSamplerConfig,
    };
    use crate::config::{ActionConfig, OutputFormat};

    fn engine(action: ActionConfig, group_duration: Duration) -> AggregateEngine {
        AggregateEngine::new(ActionFactory::new(action, None).unwrap(), group_duration)
    }

    fn event(value: serde_json::Value) -> Event {
        Event::from_value("log", value).unwrap()
    }

    fn raw_count() -> ActionConfig {
        ActionConfig::Count(CountConfig {
            output_format: OutputFormat::Raw,
            ..CountConfig::default()
        })
    }

    #[test]
    fn absorbs_then_concludes_due_groups() {
        let engine = engine(raw_count(), Duration::from_millis(50));
        let key = GroupKey::new("g");
        for _ in 0..3 {
            let outcome = engine.process_event(&key, event(json!({"a": 1}))).unwrap();
            assert!(matches!(outcome, EventOutcome::Absorbed));
        }
        assert_eq!(engine.group_count(), 1);
        assert!(engine.next_deadline().is_some());

        assert!(engine.conclude_due_groups(Instant::now()).is_empty());
        let events = engine.conclude_due_groups(Instant::now() + Duration::from_secs(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("aggr._count"), Some(&json!(3)));
        assert_eq!(engine.group_count(), 0);

        let metrics = engine.metrics().snapshot();
        assert_eq!(metrics.groups_created, 1);
        assert_eq!(metrics.groups_concluded, 1);
        assert_eq!(metrics.handle_events_absorbed, 3);
        assert_eq!(metrics.conclude_group_events_out, 1);
    }

    #[test]
    fn concluded_group_is_replaced_by_fresh_one() {
        let engine = engine(raw_count(), Duration::from_secs(60));
        let key = GroupKey::new("g");
        engine.process_event(&key, event(json!({}))).unwrap();
        assert_eq!(engine.conclude_group(&key).unwrap().len(), 1);
        assert_eq!(engine.group_count(), 0);

        engine.process_event(&key, event(json!({}))).unwrap();
        let events = engine.conclude_all(false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("aggr._count"), Some(&json!(1)));
        assert_eq!(engine.metrics().snapshot().groups_created, 2);
    }

    #[test]
    fn conclude_unknown_group_is_empty() {
        let engine = engine(ActionConfig::PutAll, Duration::from_secs(1));
        assert!(engine.conclude_group(&GroupKey::new("missing")).unwrap().is_empty());
    }

    #[test]
    fn idle_timeout_concludes_before_group_duration() {
        let engine = engine(raw_count(), Duration::from_secs(600))
            .with_idle_timeout(Some(Duration::from_millis(10)));
        let key = GroupKey::new("g");
        engine.process_event(&key, event(json!({}))).unwrap();
        let events = engine.conclude_due_groups(Instant::now() + Duration::from_secs(1));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn deferred_conclusion_keeps_group_alive() {
        let config = ActionConfig::TailSampler(TailSamplerConfig {
            percent: 100.0,
            wait_period_ms: 60_000,
            condition: None,
        });
        let engine = engine(config, Duration::from_secs(1));
        let key = GroupKey::new("trace");
        for i in 0..4 {
            engine.process_event(&key, event(json!({"i": i}))).unwrap();
        }
        assert!(engine.conclude_group(&key).unwrap().is_empty());
        assert_eq!(engine.group_count(), 1);
        assert_eq!(engine.metrics().snapshot().groups_deferred, 1);

        let flushed = engine.conclude_all(true);
        assert_eq!(flushed.len(), 4);
        assert_eq!(engine.group_count(), 0);
    }

    #[test]
    fn idle_timeout_does_not_churn_deferred_groups() {
        let config = ActionConfig::TailSampler(TailSamplerConfig {
            percent: 100.0,
            wait_period_ms: 100,
            condition: None,
        });
        let engine = engine(config, Duration::from_secs(60))
            .with_idle_timeout(Some(Duration::from_millis(5)));
        let key = GroupKey::new("trace");
        engine.process_event(&key, event(json!({"i": 1}))).unwrap();

        let start = Instant::now();
        let mut events = Vec::new();
        while start.elapsed() < Duration::from_millis(200) && events.is_empty() {
            events.extend(engine.conclude_due_groups(Instant::now()));
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(events.len(), 1);
        assert!(start.elapsed() >= Duration::from_millis(90));
        let metrics = engine.metrics().snapshot();
        assert_eq!(metrics.groups_deferred, 1);
        assert_eq!(metrics.groups_concluded, 1);
        assert_eq!(engine.group_count(), 0);
    }

    #[test]
    fn discard_drops_groups_without_output() {
        let engine = engine(ActionConfig::PutAll, Duration::from_secs(60));
        for name in ["a", "b"] {
            engine
                .process_event(&GroupKey::new(name), event(json!({"k": name})))
                .unwrap();
        }
        assert_eq!(engine.discard_all(), 2);
        assert_eq!(engine.group_count(), 0);
        assert!(engine.conclude_all(true).is_empty());
        assert_eq!(engine.metrics().snapshot().groups_discarded, 2);
    }

    #[test]
    fn blocking_rate_limiter_waits_instead_of_dropping() {
        let config = ActionConfig::RateLimiter(RateLimiterConfig {
            events_per_second: 100,
            when_exceeds: RateLimiterMode::Block,
        });
        let engine = engine(config, Duration::from_secs(60));
        let key = GroupKey::new("g");
        let start = Instant::now();
        for _ in 0..3 {
            let outcome = engine.process_event(&key, event(json!({}))).unwrap();
            assert!(matches!(outcome, EventOutcome::Forwarded(_)));
        }
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(engine.metrics().snapshot().handle_events_out, 3);
        let group = engine.groups.get_group(&key).unwrap();
        assert_eq!(group.lock().event_count(), 3);
    }

    #[test]
    fn action_errors_are_counted() {
        let config = ActionConfig::Histogram(crate::actions::HistogramConfig::new(
            "latency",
            vec![1.0, 2.0],
        ));
        let engine = engine(config, Duration::from_secs(60));
        let err = engine
            .process_event(&GroupKey::new("g"), event(json!({"latency": "fast"})))
            .unwrap_err();
        assert!(matches!(err, AggregateError::InvalidField { .. }));
        assert_eq!(engine.metrics().snapshot().handle_events_failed, 1);
    }
}
