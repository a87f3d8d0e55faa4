//! Task Ledger
//!
//! Per-actor record of how many times each task string has been completed.
//! Counts only ever go up while an actor is live; a restore replaces them.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Build the canonical task string for a task name and its argument.
///
/// `"TalkToNPC"` + `"Captain Rhea"` becomes `"talktonpc_captainrhea"`.
pub fn make_task_string(task: &str, argument: &str) -> String {
    let mut task_string = format!("{}_{}", task, argument).to_lowercase();
    task_string.retain(|c| !c.is_whitespace());
    task_string
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLedger {
    counts: HashMap<String, u32>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_counts(counts: BTreeMap<String, u32>) -> Self {
        Self {
            counts: counts.into_iter().collect(),
        }
    }

    /// Record one completion. Returns true the first time this string is seen.
    pub fn record(&mut self, task_string: &str) -> bool {
        let count = self.counts.entry(task_string.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count == 1
    }

    pub fn count_of(&self, task_string: &str) -> u32 {
        self.counts.get(task_string).copied().unwrap_or(0)
    }

    pub fn has_at_least(&self, task_string: &str, quantity: u32) -> bool {
        self.count_of(task_string) >= quantity
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.counts.iter().map(|(task, count)| (task.as_str(), *count))
    }

    /// Sorted copy of the counts for saving
    pub fn to_counts(&self) -> BTreeMap<String, u32> {
        self.counts
            .iter()
            .map(|(task, count)| (task.clone(), *count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_string_canonicalization() {
        assert_eq!(make_task_string("Talk", "Guard"), "talk_guard");
        assert_eq!(make_task_string("TalkToNPC", "Captain Rhea"), "talktonpc_captainrhea");
        assert_eq!(make_task_string("Find Item", " Old\tKey "), "finditem_oldkey");
    }

    #[test]
    fn test_record_reports_first_time() {
        let mut ledger = TaskLedger::new();
        assert!(ledger.record("talk_guard"));
        assert!(!ledger.record("talk_guard"));
        assert!(!ledger.record("talk_guard"));

        assert_eq!(ledger.count_of("talk_guard"), 3);
        assert_eq!(ledger.count_of("talk_merchant"), 0);
        assert!(ledger.has_at_least("talk_guard", 3));
        assert!(!ledger.has_at_least("talk_guard", 4));
        assert!(ledger.has_at_least("never_seen", 0));
    }

    #[test]
    fn test_counts_survive_export() {
        let mut ledger = TaskLedger::new();
        ledger.record("a_b");
        ledger.record("a_b");
        ledger.record("c_d");

        let restored = TaskLedger::from_counts(ledger.to_counts());
        assert_eq!(restored, ledger);
        assert_eq!(restored.len(), 2);
    }
}
