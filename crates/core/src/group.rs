//! Group identity and per-group accumulator state.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of one aggregation group.
///
/// Equality and hashing use the opaque `id` only. The defining `fields`
/// (identification key values) travel with the key so actions can attach
/// them to their output.
#[derive(Debug, Clone)]
pub struct GroupKey {
    id: Arc<str>,
    fields: Arc<Map<String, Value>>,
}

impl GroupKey {
    /// Create an opaque key with no defining fields.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_fields(id, Map::new())
    }

    /// Create a key carrying the field values it was derived from.
    pub fn with_fields(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: Arc::from(id.into()),
            fields: Arc::new(fields),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The identification key values that define this group.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Ordered key/value accumulator owned by a single group.
///
/// Only the holder of the group's lock may touch it; actions receive it by
/// mutable reference for the duration of one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupState(Map<String, Value>);

impl GroupState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert a value, returning the previous one for that key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    /// Copy every entry of `fields` into the state, overwriting existing keys.
    pub fn put_all(&mut self, fields: &Map<String, Value>) {
        for (key, value) in fields {
            self.0.insert(key.clone(), value.clone());
        }
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// A copy of the current contents.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.0.clone()
    }

    /// Move the contents out, leaving the state empty.
    pub fn take(&mut self) -> Map<String, Value> {
        std::mem::take(&mut self.0)
    }
}

impl From<Map<String, Value>> for GroupState {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
