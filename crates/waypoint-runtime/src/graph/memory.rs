use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Committed run memory shared between graph nodes.
///
/// Nodes never write here directly. Each attempt works on an
/// [`AttemptMemory`] overlay that is committed only if the attempt succeeds,
/// so a failed attempt leaves nothing behind for its retry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedMemory {
    data: HashMap<String, Value>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: HashMap<String, Value>) -> Self {
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    pub fn into_inner(self) -> HashMap<String, Value> {
        self.data
    }

    /// Values for `keys`, skipping absent ones.
    pub fn select(&self, keys: &[String]) -> HashMap<String, Value> {
        keys.iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Open a fresh overlay for one attempt.
    pub fn begin_attempt(&self) -> AttemptMemory {
        AttemptMemory {
            base: self.data.clone(),
            writes: HashMap::new(),
        }
    }

    /// Fold a successful attempt in: its writes first, then the node output
    /// entries named by `output_keys` (every entry when the list is empty).
    pub fn commit(
        &mut self,
        attempt: AttemptMemory,
        output: &HashMap<String, Value>,
        output_keys: &[String],
    ) {
        self.data.extend(attempt.writes);
        if output_keys.is_empty() {
            for (k, v) in output {
                self.data.insert(k.clone(), v.clone());
            }
        } else {
            for key in output_keys {
                if let Some(v) = output.get(key) {
                    self.data.insert(key.clone(), v.clone());
                }
            }
        }
    }
}

/// Attempt-scoped view: reads see committed memory plus this attempt's own
/// writes.
#[derive(Debug, Clone, Default)]
pub struct AttemptMemory {
    base: HashMap<String, Value>,
    writes: HashMap<String, Value>,
}

impl AttemptMemory {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.writes.get(key).or_else(|| self.base.get(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.writes.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Every visible key, committed or written by this attempt.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.base
            .keys()
            .chain(self.writes.keys().filter(|k| !self.base.contains_key(*k)))
    }
}
