//! Derive group keys from configured identification keys.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tally_core::{Event, GroupKey};

/// Builds a [`GroupKey`] from the values of a fixed list of event keys.
#[derive(Debug, Clone)]
pub struct IdentificationKeysHasher {
    keys: Vec<String>,
}

impl IdentificationKeysHasher {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Collect the identification values of `event` (missing keys map to
    /// null) and hash them into a key.
    pub fn group_key(&self, event: &Event) -> GroupKey {
        let mut fields = Map::with_capacity(self.keys.len());
        for key in &self.keys {
            let value = event.get(key).cloned().unwrap_or(Value::Null);
            fields.insert(key.clone(), value);
        }
        GroupKey::with_fields(compute_group_key(&fields), fields)
    }
}

/// SHA-256 over `key=value;` pairs in configured order, hex encoded.
fn compute_group_key(fields: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in fields {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}
