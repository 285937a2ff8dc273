//! Pending update ledger and resend backoff

use std::collections::{BTreeMap, HashMap};
use tagsync_protocol::BranchKey;

/// An update batch sent to the server and not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub updates: Vec<String>,
    pub update_id: u64,
    /// When the batch was added
    pub sent_at: u64,
    /// When the batch was last put on the wire (or added, if never sent)
    pub last_attempt_at: u64,
    /// Transmissions so far; zero while deferred
    pub attempt_count: u32,
}

impl PendingUpdate {
    pub fn new(update_id: u64, updates: Vec<String>, now: u64) -> Self {
        Self {
            updates,
            update_id,
            sent_at: now,
            last_attempt_at: now,
            attempt_count: 0,
        }
    }

    /// Record a transmission
    pub fn mark_attempt(&mut self, now: u64) {
        self.attempt_count += 1;
        self.last_attempt_at = now;
    }
}

/// Exponential resend delay: `base * 2^min(attempts - 1, max_exponent)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_exponent: u32,
}

impl Backoff {
    pub fn new(base_ms: u64, max_exponent: u32) -> Self {
        Self {
            base_ms,
            max_exponent,
        }
    }

    pub fn retry_after(&self, attempt_count: u32) -> u64 {
        let exponent = attempt_count.saturating_sub(1).min(self.max_exponent);
        self.base_ms.saturating_mul(1u64 << exponent)
    }

    pub fn is_due(&self, update: &PendingUpdate, now: u64) -> bool {
        now.saturating_sub(update.last_attempt_at) >= self.retry_after(update.attempt_count)
    }
}

/// Unacknowledged updates per branch.
///
/// Update ids are allocated per ledger (one per client), not per branch.
/// Branch entries are dropped as soon as their last update is removed.
#[derive(Debug, Default)]
pub struct PendingLedger {
    last_update_id: u64,
    branches: HashMap<BranchKey, BTreeMap<u64, PendingUpdate>>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next update id
    pub fn next_update_id(&mut self) -> u64 {
        self.last_update_id += 1;
        self.last_update_id
    }

    /// Insert an update. Returns true when the branch had nothing pending.
    pub fn insert(&mut self, key: &BranchKey, update: PendingUpdate) -> bool {
        let pending = self.branches.entry(key.clone()).or_default();
        let was_empty = pending.is_empty();
        pending.insert(update.update_id, update);
        was_empty
    }

    /// Remove an acknowledged update. Returns the update and whether the
    /// branch has nothing left pending.
    pub fn remove(&mut self, key: &BranchKey, update_id: u64) -> Option<(PendingUpdate, bool)> {
        let pending = self.branches.get_mut(key)?;
        let update = pending.remove(&update_id)?;
        let now_empty = pending.is_empty();
        if now_empty {
            self.branches.remove(key);
        }
        Some((update, now_empty))
    }

    /// Pending updates of a branch in id order
    pub fn branch(&self, key: &BranchKey) -> impl Iterator<Item = &PendingUpdate> {
        self.branches.get(key).into_iter().flat_map(|pending| pending.values())
    }

    pub fn branch_mut(&mut self, key: &BranchKey) -> impl Iterator<Item = &mut PendingUpdate> {
        self.branches
            .get_mut(key)
            .into_iter()
            .flat_map(|pending| pending.values_mut())
    }

    /// Every pending update
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&BranchKey, &mut PendingUpdate)> {
        self.branches
            .iter_mut()
            .flat_map(|(key, pending)| pending.values_mut().map(move |update| (key, update)))
    }

    pub fn branch_len(&self, key: &BranchKey) -> usize {
        self.branches.get(key).map_or(0, BTreeMap::len)
    }

    pub fn len(&self) -> usize {
        self.branches.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}
