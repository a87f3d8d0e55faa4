//! Actor facts: a small integer blackboard that conditions read and events write.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Facts {
    values: BTreeMap<String, i64>,
    /// Bumped on every write
    #[serde(skip)]
    revision: u64,
}

impl PartialEq for Facts {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for Facts {}

impl Facts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: BTreeMap<String, i64>) -> Self {
        Self { values, revision: 0 }
    }

    pub fn to_values(&self) -> BTreeMap<String, i64> {
        self.values.clone()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Unset facts read as zero
    pub fn get(&self, key: &str) -> i64 {
        self.values.get(key).copied().unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: i64) {
        self.values.insert(key.to_string(), value);
        self.revision += 1;
    }

    /// Add to a fact and return the new value
    pub fn add(&mut self, key: &str, delta: i64) -> i64 {
        let value = self.values.entry(key.to_string()).or_insert(0);
        *value = value.saturating_add(delta);
        let value = *value;
        self.revision += 1;
        value
    }

    pub fn remove(&mut self, key: &str) -> Option<i64> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.revision += 1;
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.values.iter().map(|(key, value)| (key.as_str(), *value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facts() {
        let mut facts = Facts::new();
        assert_eq!(facts.get("gold"), 0);
        assert!(!facts.contains("gold"));

        facts.set("gold", 10);
        assert_eq!(facts.add("gold", -3), 7);
        assert_eq!(facts.add("keys", 1), 1);
        assert_eq!(facts.remove("gold"), Some(7));
        assert_eq!(facts.iter().count(), 1);
    }

    #[test]
    fn test_revision_tracks_writes() {
        let mut facts = Facts::from_values(BTreeMap::from([("gold".to_string(), 5)]));
        assert_eq!(facts.revision(), 0);
        assert_eq!(facts.get("gold"), 5);

        facts.set("gold", 6);
        facts.add("gold", 1);
        assert_eq!(facts.remove("missing"), None);
        assert_eq!(facts.revision(), 2);

        // Equality ignores the revision
        assert_eq!(facts, Facts::from_values(facts.to_values()));
    }
}
