use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Result, StrandError};

/// Global state passed from step to step.
///
/// Copy-on-write: every update returns a new `GlobalState` and leaves the
/// receiver untouched, so snapshots can be shared across concurrent branches.
/// Keys are only added or overwritten, never removed, and keep their first
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalState {
    data: Arc<IndexMap<String, Value>>,
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state from initial data.
    pub fn from_map(data: IndexMap<String, Value>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    /// Build a state from a JSON object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self::from_map(map.into_iter().collect())),
            Value::Null => Ok(Self::new()),
            other => Err(StrandError::config(format!(
                "state must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    /// Return a new state with `key` set to `value`.
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.data).insert(key.into(), value.into());
        next
    }

    /// Return a new state with a string value set.
    pub fn with_str(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(key, Value::String(value.into()))
    }

    /// Return a new state with every entry of `other` applied (overwrites on conflict).
    pub fn merge(&self, other: &GlobalState) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        let mut next = self.clone();
        let data = Arc::make_mut(&mut next.data);
        for (k, v) in other.data.iter() {
            data.insert(k.clone(), v.clone());
        }
        next
    }

    /// Entries of `self` that are new or changed relative to `base`.
    pub fn diff(&self, base: &GlobalState) -> Self {
        let changed = self
            .data
            .iter()
            .filter(|(k, v)| base.get(k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self::from_map(changed)
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &IndexMap<String, Value> {
        &self.data
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl Serialize for GlobalState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.data.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for GlobalState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        IndexMap::<String, Value>::deserialize(deserializer).map(Self::from_map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for GlobalState {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_is_copy_on_write() {
        let base = GlobalState::new().with("a", 1);
        let next = base.with("b", 2);

        assert_eq!(base.len(), 1);
        assert!(!base.contains_key("b"));
        assert_eq!(next.get("a"), Some(&json!(1)));
        assert_eq!(next.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_insertion_order_kept() {
        let state = GlobalState::new()
            .with("z", 1)
            .with("a", 2)
            .with("m", 3)
            .with("z", 4);
        let keys: Vec<&str> = state.keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
        assert_eq!(state.get("z"), Some(&json!(4)));
    }

    #[test]
    fn test_merge_overwrites() {
        let a = GlobalState::new().with_str("a", "1").with_str("b", "2");
        let b = GlobalState::new().with_str("b", "overwritten").with_str("c", "3");
        let merged = a.merge(&b);

        assert_eq!(merged.get_str("a"), Some("1"));
        assert_eq!(merged.get_str("b"), Some("overwritten"));
        assert_eq!(merged.get_str("c"), Some("3"));
        assert_eq!(a.get_str("b"), Some("2"));
    }

    #[test]
    fn test_diff_reports_new_and_changed() {
        let base = GlobalState::new().with("a", 1).with("b", 2);
        let after = base.with("b", 3).with("c", 4);
        let delta = after.diff(&base);

        let keys: Vec<&str> = delta.keys().collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert!(base.diff(&base).is_empty());
    }

    #[test]
    fn test_from_value() {
        let state = GlobalState::from_value(json!({"topic": "AI"})).unwrap();
        assert_eq!(state.get_str("topic"), Some("AI"));
        assert!(GlobalState::from_value(Value::Null).unwrap().is_empty());
        assert!(GlobalState::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_serde_transparent_map() {
        let state = GlobalState::new().with("x", 1).with("y", "two");
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"x":1,"y":"two"}"#);
        let parsed: GlobalState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
