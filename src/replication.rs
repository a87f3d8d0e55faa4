//! Replication Log
//!
//! The authority appends every narrative mutation to an ordered log; the
//! follower replays unapplied entries through its own quests and ledger.
//! Entries carry a sequence number so a resent buffer is applied only once.
//! Transport is the host's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// World time in seconds, used to stamp and prune log entries
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> f64;
}

/// Seconds since the clock was created
#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(secs: f64) -> Self {
        Self {
            bits: AtomicU64::new(secs.to_bits()),
        }
    }

    pub fn set(&self, secs: f64) {
        self.bits.store(secs.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, secs: f64) {
        self.set(self.now_secs() + secs);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateKind {
    /// Canonical task string
    CompleteTask { task: String },
    BeginQuest { quest: String, start_state: Option<String> },
    RestartQuest { quest: String, start_state: Option<String> },
    ForgetQuest { quest: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationUpdate {
    pub sequence: u64,
    pub update: UpdateKind,
    pub created_at: f64,
    /// Follower-side bookkeeping, never sent
    #[serde(skip)]
    pub acked: bool,
}

/// Authority side: ordered, pruned log of narrative mutations
#[derive(Debug, Clone)]
pub struct ReplicationLog {
    entries: Vec<ReplicationUpdate>,
    next_sequence: u64,
    stale_after_secs: f64,
}

impl ReplicationLog {
    pub fn new(stale_after_secs: f64) -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 1,
            stale_after_secs,
        }
    }

    /// Append an update stamped with `now` and drop stale history.
    /// Returns the new entry's sequence number.
    pub fn append(&mut self, update: UpdateKind, now: f64) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(ReplicationUpdate {
            sequence,
            update,
            created_at: now,
            acked: false,
        });
        self.prune(now);
        sequence
    }

    /// Find the newest entry (other than the one just appended) older than
    /// the staleness window and remove it with everything before it
    fn prune(&mut self, now: f64) {
        if self.entries.len() < 2 {
            return;
        }

        let newest_stale = (0..self.entries.len() - 1)
            .rev()
            .find(|&index| now - self.entries[index].created_at > self.stale_after_secs);

        if let Some(index) = newest_stale {
            self.entries.drain(..=index);
            debug!("Pruned {} stale replication entries", index + 1);
        }
    }

    pub fn entries(&self) -> &[ReplicationUpdate] {
        &self.entries
    }

    /// Entries a peer that has applied up to `sequence` has not seen
    pub fn since(&self, sequence: u64) -> &[ReplicationUpdate] {
        let start = self.entries.partition_point(|entry| entry.sequence <= sequence);
        &self.entries[start..]
    }

    pub fn last_sequence(&self) -> u64 {
        self.next_sequence - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Follower side: receive buffer that hands out each update once
#[derive(Debug, Clone, Default)]
pub struct ReplicationInbox {
    pending: Vec<ReplicationUpdate>,
    last_applied: u64,
}

impl ReplicationInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive(&mut self, updates: impl IntoIterator<Item = ReplicationUpdate>) {
        self.pending.extend(updates);
    }

    /// Updates not applied yet, in order. Marks them applied and clears the
    /// buffer.
    pub fn take_unapplied(&mut self) -> Vec<UpdateKind> {
        let mut fresh = Vec::new();
        for entry in &mut self.pending {
            if entry.acked || entry.sequence <= self.last_applied {
                continue;
            }
            entry.acked = true;
            self.last_applied = entry.sequence;
            fresh.push(entry.update.clone());
        }
        self.pending.clear();
        fresh
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Skip everything up to `sequence`, used after seeding from a snapshot
    pub fn mark_applied(&mut self, sequence: u64) {
        self.last_applied = self.last_applied.max(sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str) -> UpdateKind {
        UpdateKind::CompleteTask {
            task: name.to_string(),
        }
    }

    #[test]
    fn test_prune_removes_newest_stale_and_older() {
        let mut log = ReplicationLog::new(30.0);
        log.append(task("a"), 0.0);
        log.append(task("b"), 10.0);
        log.append(task("c"), 20.0);
        assert_eq!(log.len(), 3);

        log.append(task("d"), 45.0);
        let remaining: Vec<f64> = log.entries().iter().map(|e| e.created_at).collect();
        assert_eq!(remaining, vec![20.0, 45.0]);
    }

    #[test]
    fn test_newest_entry_is_never_pruned() {
        let mut log = ReplicationLog::new(30.0);
        log.append(task("a"), 0.0);
        log.append(task("b"), 500.0);
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].update, task("b"));
        assert_eq!(log.last_sequence(), 2);
    }

    #[test]
    fn test_since_returns_unseen_entries() {
        let mut log = ReplicationLog::new(30.0);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            log.append(task(name), i as f64);
        }
        assert_eq!(log.since(0).len(), 3);
        assert_eq!(log.since(2).len(), 1);
        assert!(log.since(3).is_empty());
    }

    #[test]
    fn test_inbox_applies_each_update_once() {
        let mut log = ReplicationLog::new(30.0);
        log.append(task("a"), 0.0);
        log.append(task("b"), 1.0);

        let mut inbox = ReplicationInbox::new();
        inbox.receive(log.entries().to_vec());
        assert_eq!(inbox.take_unapplied(), vec![task("a"), task("b")]);

        // The whole buffer arrives again with one new entry
        log.append(task("c"), 2.0);
        inbox.receive(log.entries().to_vec());
        assert_eq!(inbox.take_unapplied(), vec![task("c")]);

        inbox.receive(log.entries().to_vec());
        assert!(inbox.take_unapplied().is_empty());
        assert_eq!(inbox.last_applied(), 3);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(5.0);
        clock.advance(2.5);
        assert_eq!(clock.now_secs(), 7.5);
    }
}
