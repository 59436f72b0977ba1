//! Concurrent store of live aggregation groups.
//!
//! Groups live in a sharded map, each behind its own mutex, so events for
//! different keys never contend on a shared lock. Conclusion deadlines sit in
//! an expiry queue ordered by due time.
//!
//! Lock order: a group's mutex may be held while touching the map (removal
//! on conclusion); the map is never held while waiting on a group's mutex.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tally_core::GroupKey;

use crate::error::AggregateError;
use crate::group::AggregateGroup;

pub type SharedGroup = Arc<Mutex<AggregateGroup>>;

#[derive(Debug)]
struct Expiry {
    at: Instant,
    group_id: u64,
    key: GroupKey,
}

impl PartialEq for Expiry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.group_id == other.group_id
    }
}

impl Eq for Expiry {}

impl PartialOrd for Expiry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expiry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.group_id.cmp(&other.group_id))
    }
}

/// Manages the live groups of one engine.
#[derive(Debug, Default)]
pub struct GroupManager {
    groups: DashMap<GroupKey, SharedGroup>,
    expiry: Mutex<BinaryHeap<Reverse<Expiry>>>,
    next_id: AtomicU64,
}

impl GroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a group by its key.
    pub fn get_group(&self, key: &GroupKey) -> Option<SharedGroup> {
        self.groups.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a group, creating it with `create` when absent.
    ///
    /// `create` receives a fresh group id. Returns the group and whether it
    /// was created by this call.
    pub fn get_or_create<F>(
        &self,
        key: &GroupKey,
        create: F,
    ) -> Result<(SharedGroup, bool), AggregateError>
    where
        F: FnOnce(u64) -> Result<AggregateGroup, AggregateError>,
    {
        if let Some(group) = self.get_group(key) {
            return Ok((group, false));
        }
        match self.groups.entry(key.clone()) {
            Entry::Occupied(entry) => Ok((Arc::clone(entry.get()), false)),
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
                let group = Arc::new(Mutex::new(create(id)?));
                entry.insert(Arc::clone(&group));
                Ok((group, true))
            }
        }
    }

    /// Remove `group` from the store if it is still the entry for `key`.
    pub fn remove_group(&self, key: &GroupKey, group: &SharedGroup) -> bool {
        self.groups
            .remove_if(key, |_, current| Arc::ptr_eq(current, group))
            .is_some()
    }

    /// Register a deadline for the group with `group_id`.
    pub fn schedule(&self, key: GroupKey, group_id: u64, at: Instant) {
        self.expiry
            .lock()
            .push(Reverse(Expiry { at, group_id, key }));
    }

    /// Remove and return every deadline at or before `now`.
    pub fn pop_due(&self, now: Instant) -> Vec<(GroupKey, u64)> {
        let mut expiry = self.expiry.lock();
        let mut due = Vec::new();
        while let Some(Reverse(next)) = expiry.peek() {
            if next.at > now {
                break;
            }
            if let Some(Reverse(entry)) = expiry.pop() {
                due.push((entry.key, entry.group_id));
            }
        }
        due
    }

    /// The earliest registered deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.expiry.lock().peek().map(|Reverse(entry)| entry.at)
    }

    /// A point-in-time copy of every live group.
    pub fn snapshot(&self) -> Vec<(GroupKey, SharedGroup)> {
        self.groups
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Get the number of active groups.
    pub fn active_group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::actions::PutAllAction;

    fn group(id: u64, key: &GroupKey, now: Instant) -> AggregateGroup {
        AggregateGroup::new(
            id,
            key.clone(),
            Box::new(PutAllAction::new()),
            now,
            Duration::from_secs(1),
        )
    }

    #[test]
    fn get_or_create_reuses_existing_group() {
        let manager = GroupManager::new();
        let key = GroupKey::new("a");
        let now = Instant::now();

        let (first, created) = manager.get_or_create(&key, |id| Ok(group(id, &key, now))).unwrap();
        assert!(created);
        let (second, created) = manager
            .get_or_create(&key, |_| panic!("must not create twice"))
            .unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.active_group_count(), 1);
    }

    #[test]
    fn group_ids_are_unique() {
        let manager = GroupManager::new();
        let now = Instant::now();
        let a = GroupKey::new("a");
        let b = GroupKey::new("b");
        let (ga, _) = manager.get_or_create(&a, |id| Ok(group(id, &a, now))).unwrap();
        let (gb, _) = manager.get_or_create(&b, |id| Ok(group(id, &b, now))).unwrap();
        assert_ne!(ga.lock().id(), gb.lock().id());
    }

    #[test]
    fn failed_creation_leaves_no_entry() {
        let manager = GroupManager::new();
        let key = GroupKey::new("a");
        let result = manager.get_or_create(&key, |_| {
            Err(AggregateError::Configuration("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(manager.active_group_count(), 0);
    }

    #[test]
    fn remove_only_matching_group() {
        let manager = GroupManager::new();
        let key = GroupKey::new("a");
        let now = Instant::now();
        let (original, _) = manager.get_or_create(&key, |id| Ok(group(id, &key, now))).unwrap();
        let stranger: SharedGroup = Arc::new(Mutex::new(group(99, &key, now)));

        assert!(!manager.remove_group(&key, &stranger));
        assert_eq!(manager.active_group_count(), 1);
        assert!(manager.remove_group(&key, &original));
        assert_eq!(manager.active_group_count(), 0);
        assert!(manager.get_group(&key).is_none());
    }

    #[test]
    fn pop_due_returns_expired_in_order() {
        let manager = GroupManager::new();
        let now = Instant::now();
        manager.schedule(GroupKey::new("late"), 3, now + Duration::from_secs(10));
        manager.schedule(GroupKey::new("second"), 2, now + Duration::from_secs(2));
        manager.schedule(GroupKey::new("first"), 1, now + Duration::from_secs(1));

        assert!(manager.pop_due(now).is_empty());
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(1)));

        let due = manager.pop_due(now + Duration::from_secs(5));
        let ids: Vec<_> = due.iter().map(|(key, _)| key.id().to_owned()).collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert_eq!(manager.next_deadline(), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn snapshot_lists_live_groups() {
        let manager = GroupManager::new();
        let now = Instant::now();
        for name in ["a", "b", "c"] {
            let key = GroupKey::new(name);
            manager.get_or_create(&key, |id| Ok(group(id, &key, now))).unwrap();
        }
        let mut keys: Vec<_> = manager
            .snapshot()
            .into_iter()
            .map(|(key, _)| key.id().to_owned())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
