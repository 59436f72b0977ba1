//! Events flowing through the aggregation stage.
//!
//! An event is an ordered JSON object plus metadata. Field keys may be
//! `/`-separated paths addressing nested objects (`/http/status` or
//! `http/status`); keys without a separator address top-level fields.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EventError;

/// Event type assigned to maps synthesized by aggregate actions.
pub const EVENT_TYPE_EVENT: &str = "event";

/// Event type assigned to OTel-shaped metric records.
pub const EVENT_TYPE_METRIC: &str = "METRIC";

/// Metadata carried alongside an event's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Opaque type label (`log`, `event`, `METRIC`, ...).
    pub event_type: String,

    /// When the event entered the pipeline.
    pub time_received: DateTime<Utc>,

    /// Free-form tags attached by processors.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl EventMetadata {
    /// Create metadata stamped with the current time.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            time_received: Utc::now(),
            tags: BTreeSet::new(),
        }
    }
}

/// An ordered string-to-value map with metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    data: Map<String, Value>,
    metadata: EventMetadata,
}

impl Event {
    /// Build an event from an already-decoded field map.
    pub fn new(event_type: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            data,
            metadata: EventMetadata::new(event_type),
        }
    }

    /// Build an event from a JSON value, which must be an object.
    pub fn from_value(event_type: impl Into<String>, value: Value) -> Result<Self, EventError> {
        match value {
            Value::Object(data) => Ok(Self::new(event_type, data)),
            other => Err(EventError::NotAnObject(kind_of(&other))),
        }
    }

    /// Parse an event from a JSON document.
    pub fn from_json(event_type: impl Into<String>, json: &str) -> Result<Self, EventError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(event_type, value)
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut EventMetadata {
        &mut self.metadata
    }

    pub fn event_type(&self) -> &str {
        &self.metadata.event_type
    }

    /// Borrow the event's fields as an ordered map.
    pub fn to_map(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.data
    }

    /// Look up a field by key or `/`-separated path.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if let Some(value) = self.data.get(key) {
            return Some(value);
        }
        let mut parts = key.trim_start_matches('/').split('/');
        let mut current = self.data.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Look up a field and deserialize it into `T`.
    ///
    /// Returns `Ok(None)` when the field is absent and an error when it is
    /// present with an incompatible type.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, EventError> {
        self.get(key)
            .map(|value| {
                T::deserialize(value).map_err(|e| EventError::TypeMismatch {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set a field, creating intermediate objects for nested paths.
    ///
    /// A non-object value sitting on the path is replaced by an object.
    pub fn put(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let path = key.trim_start_matches('/');
        let Some((parents, leaf)) = path.rsplit_once('/') else {
            self.data.insert(path.to_owned(), value);
            return;
        };
        let mut current = &mut self.data;
        for part in parents.split('/') {
            let entry = current
                .entry(part.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(next) = entry else {
                return;
            };
            current = next;
        }
        current.insert(leaf.to_owned(), value);
    }

    /// Remove a field, keeping the order of the remaining fields.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if self.data.contains_key(key) {
            return self.data.shift_remove(key);
        }
        let path = key.trim_start_matches('/');
        let Some((parents, leaf)) = path.rsplit_once('/') else {
            return self.data.shift_remove(path);
        };
        let mut current = &mut self.data;
        for part in parents.split('/') {
            current = current.get_mut(part)?.as_object_mut()?;
        }
        current.shift_remove(leaf)
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.metadata.tags.insert(tag.into());
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.contains(tag)
    }

    /// Render the event's fields as a single-line JSON document.
    pub fn to_json_string(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(&self.data)?)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
