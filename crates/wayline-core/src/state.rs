use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Last worker chosen by a router node.
pub const SELECTED_WORKER_KEY: &str = "selected_worker";
/// Ordered routing history: `[{ "node_id": .., "worker": .. }]`.
pub const ROUTING_KEY: &str = "_routing";
/// Failure description written when an execution fails.
pub const ERROR_KEY: &str = "_error";
/// Per-loop-node iteration counters.
pub const ITERATIONS_KEY: &str = "_iterations";
/// Branch failures tolerated by a best-effort fanout.
pub const BRANCH_ERRORS_KEY: &str = "_branch_errors";

/// Key under which an approval node records its outcome.
pub fn decision_key(node_id: &str) -> String {
    format!("{}_decision", node_id)
}

/// Execution state threaded through the nodes of a workflow.
///
/// Keys are strings; values are JSON. The map is ordered so that snapshots
/// serialize identically across runs, which replay comparisons rely on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    data: BTreeMap<String, Value>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a JSON value. Non-object values are stored under `input`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self {
                data: map.into_iter().collect(),
            },
            Value::Null => Self::new(),
            other => {
                let mut state = Self::new();
                state.set("input", other);
                state
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), Value::String(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Merge another state into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &State) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Merge the top-level keys of a JSON object. Non-objects are ignored.
    pub fn merge_value(&mut self, value: &Value) {
        if let Some(obj) = value.as_object() {
            for (k, v) in obj {
                self.data.insert(k.clone(), v.clone());
            }
        }
    }

    /// Keys whose values differ from `base` (added or changed), with their new values.
    pub fn changes_since(&self, base: &State) -> State {
        let data = self
            .data
            .iter()
            .filter(|(k, v)| base.data.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self { data }
    }

    /// Project the given keys into a JSON object. An empty key list selects everything.
    pub fn project(&self, keys: &[String]) -> Value {
        if keys.is_empty() {
            return self.to_value();
        }
        let map = keys
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        Value::Object(map)
    }

    /// Append a value to an array stored under `key`, creating it if absent.
    pub fn push(&mut self, key: &str, value: Value) {
        match self.data.get_mut(key) {
            Some(Value::Array(items)) => items.push(value),
            _ => {
                self.data.insert(key.to_string(), Value::Array(vec![value]));
            }
        }
    }

    /// Read a counter stored in an object under `key`.
    pub fn counter(&self, key: &str, name: &str) -> u64 {
        self.data
            .get(key)
            .and_then(|v| v.get(name))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Write a counter stored in an object under `key`.
    pub fn set_counter(&mut self, key: &str, name: &str, value: u64) {
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
            *entry = Value::Object(Default::default());
        }
        if let Some(obj) = entry.as_object_mut() {
            obj.insert(name.to_string(), Value::from(value));
        }
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
