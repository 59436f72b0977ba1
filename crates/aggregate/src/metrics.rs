use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking aggregation outcomes.
///
/// All counters use relaxed ordering. For a consistent point-in-time view,
/// call [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct AggregateMetrics {
    /// Events handed to the processor.
    pub records_in: AtomicU64,
    /// Events emitted by the processor (pass-through and concluded).
    pub records_out: AtomicU64,
    /// Events an action passed straight through.
    pub handle_events_out: AtomicU64,
    /// Events an action buffered into group state.
    pub handle_events_absorbed: AtomicU64,
    /// Events an action refused (sampling or rate limiting).
    pub handle_events_dropped: AtomicU64,
    /// Events whose handling failed.
    pub handle_events_failed: AtomicU64,
    /// Events that did not match `aggregate_when`.
    pub events_skipped: AtomicU64,
    /// Events emitted by group conclusion.
    pub conclude_group_events_out: AtomicU64,
    /// Conclusions that produced no events.
    pub conclude_group_events_dropped: AtomicU64,
    /// Groups created.
    pub groups_created: AtomicU64,
    /// Groups concluded and removed.
    pub groups_concluded: AtomicU64,
    /// Conclusions postponed by the action.
    pub groups_deferred: AtomicU64,
    /// Groups dropped without conclusion at shutdown.
    pub groups_discarded: AtomicU64,
    /// Conclusions that failed.
    pub conclude_group_failures: AtomicU64,
}

impl AggregateMetrics {
    pub fn add_records_in(&self, count: u64) {
        self.records_in.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_records_out(&self, count: u64) {
        self.records_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_handle_events_out(&self) {
        self.handle_events_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handle_events_absorbed(&self) {
        self.handle_events_absorbed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handle_events_dropped(&self) {
        self.handle_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handle_events_failed(&self) {
        self.handle_events_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_skipped(&self) {
        self.events_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_conclude_group_events_out(&self, count: u64) {
        self.conclude_group_events_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_conclude_group_events_dropped(&self) {
        self.conclude_group_events_dropped
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_groups_created(&self) {
        self.groups_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_groups_concluded(&self) {
        self.groups_concluded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_groups_deferred(&self) {
        self.groups_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_groups_discarded(&self, count: u64) {
        self.groups_discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_conclude_group_failures(&self) {
        self.conclude_group_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_in: self.records_in.load(Ordering::Relaxed),
            records_out: self.records_out.load(Ordering::Relaxed),
            handle_events_out: self.handle_events_out.load(Ordering::Relaxed),
            handle_events_absorbed: self.handle_events_absorbed.load(Ordering::Relaxed),
            handle_events_dropped: self.handle_events_dropped.load(Ordering::Relaxed),
            handle_events_failed: self.handle_events_failed.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            conclude_group_events_out: self.conclude_group_events_out.load(Ordering::Relaxed),
            conclude_group_events_dropped: self
                .conclude_group_events_dropped
                .load(Ordering::Relaxed),
            groups_created: self.groups_created.load(Ordering::Relaxed),
            groups_concluded: self.groups_concluded.load(Ordering::Relaxed),
            groups_deferred: self.groups_deferred.load(Ordering::Relaxed),
            groups_discarded: self.groups_discarded.load(Ordering::Relaxed),
            conclude_group_failures: self.conclude_group_failures.load(Ordering::Relaxed),
        }
    }
}

/// A plain-data snapshot of [`AggregateMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub records_in: u64,
    pub records_out: u64,
    pub handle_events_out: u64,
    pub handle_events_absorbed: u64,
    pub handle_events_dropped: u64,
    pub handle_events_failed: u64,
    pub events_skipped: u64,
    pub conclude_group_events_out: u64,
    pub conclude_group_events_dropped: u64,
    pub groups_created: u64,
    pub groups_concluded: u64,
    pub groups_deferred: u64,
    pub groups_discarded: u64,
    pub conclude_group_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = AggregateMetrics::default();
        metrics.add_records_in(5);
        metrics.increment_handle_events_out();
        metrics.increment_handle_events_dropped();
        metrics.increment_handle_events_dropped();
        metrics.add_conclude_group_events_out(3);
        metrics.increment_groups_concluded();

        let snap = metrics.snapshot();
        assert_eq!(snap.records_in, 5);
        assert_eq!(snap.handle_events_out, 1);
        assert_eq!(snap.handle_events_dropped, 2);
        assert_eq!(snap.conclude_group_events_out, 3);
        assert_eq!(snap.groups_concluded, 1);
        assert_eq!(snap.records_out, 0);
    }
}
