//! In-Sync Replica Set Registry
//!
//! Tracks which replicas the leader currently considers in sync. Two sets
//! are kept while a membership change is in flight with the supervisor: the
//! `local` set the leader enforces, and the `remote` set it has proposed but
//! not yet had acknowledged. While `synchronizing`, externally visible
//! membership is the union of both and the replica count is the max of
//! either endpoint, so acknowledgement requirements never relax mid-change.

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Guarded membership state. One lock covers all four fields so readers
/// always observe a consistent (sets, flag, confirm offset) triple.
struct SyncSets {
    /// Membership the leader currently enforces
    local: HashSet<String>,
    /// Membership proposed to the supervisor, meaningful only while
    /// `synchronizing`
    remote: HashSet<String>,
    /// A proposal is awaiting supervisor acknowledgement
    synchronizing: bool,
    /// Offset replicated on every member of `local`; -1 until first computed
    confirm_offset: i64,
}

/// Registry of in-sync replicas plus the per-follower caught-up clock.
pub struct SyncStateSet {
    sets: RwLock<SyncSets>,
    /// follower address -> last wall-clock millis its ack reached the
    /// leader's max offset; merged by per-key monotonic max
    caught_up: RwLock<HashMap<String, i64>>,
}

impl SyncStateSet {
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(SyncSets {
                local: HashSet::new(),
                remote: HashSet::new(),
                synchronizing: false,
                confirm_offset: -1,
            }),
            caught_up: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of the locally enforced membership.
    pub async fn local_set(&self) -> HashSet<String> {
        self.sets.read().await.local.clone()
    }

    /// Externally visible membership: the union of local and proposed sets
    /// while a change is in flight, otherwise the local set.
    pub async fn effective_set(&self) -> HashSet<String> {
        let sets = self.sets.read().await;
        if sets.synchronizing {
            sets.local.union(&sets.remote).cloned().collect()
        } else {
            sets.local.clone()
        }
    }

    /// Replica count for acknowledgement requirements. While a change is in
    /// flight this is the max of both endpoints of the transition.
    pub async fn replica_count(&self) -> usize {
        let sets = self.sets.read().await;
        if sets.synchronizing {
            sets.local.len().max(sets.remote.len())
        } else {
            sets.local.len()
        }
    }

    pub async fn contains_local(&self, follower: &str) -> bool {
        self.sets.read().await.local.contains(follower)
    }

    pub async fn is_synchronizing(&self) -> bool {
        self.sets.read().await.synchronizing
    }

    /// Record a proposal: the given set is now pending supervisor
    /// acknowledgement.
    pub async fn mark_synchronizing(&self, proposal: HashSet<String>) {
        let mut sets = self.sets.write().await;
        sets.synchronizing = true;
        sets.remote = proposal;
    }

    /// Install a supervisor-acknowledged membership and its recomputed
    /// confirm offset; ends the in-flight proposal.
    pub async fn commit(&self, new_set: HashSet<String>, confirm_offset: i64) {
        let mut sets = self.sets.write().await;
        sets.synchronizing = false;
        sets.local = new_set;
        sets.remote.clear();
        sets.confirm_offset = confirm_offset;
    }

    /// Replace all membership state at once. Used when a role transition
    /// re-seeds the registry.
    pub async fn reset(&self, local: HashSet<String>, confirm_offset: i64) {
        let mut sets = self.sets.write().await;
        sets.synchronizing = false;
        sets.local = local;
        sets.remote.clear();
        sets.confirm_offset = confirm_offset;
    }

    pub async fn confirm_offset(&self) -> i64 {
        self.sets.read().await.confirm_offset
    }

    pub async fn set_confirm_offset(&self, offset: i64) {
        self.sets.write().await.confirm_offset = offset;
    }

    /// Merge a follower's caught-up timestamp by monotonic max.
    pub async fn update_caught_up(&self, follower: &str, ts_ms: i64) {
        let mut table = self.caught_up.write().await;
        let entry = table.entry(follower.to_string()).or_insert(0);
        *entry = (*entry).max(ts_ms);
    }

    pub async fn caught_up(&self, follower: &str) -> Option<i64> {
        self.caught_up.read().await.get(follower).copied()
    }

    /// Build a shrink proposal: the local set minus every member whose
    /// caught-up timestamp is older than `max_lag_ms`. Returns the proposal
    /// and whether anything was actually evicted. Does not mutate the sets.
    pub async fn shrink_proposal(&self, max_lag_ms: i64, now_ms: i64) -> (HashSet<String>, bool) {
        let mut proposal = self.local_set().await;
        let table = self.caught_up.read().await;
        let mut changed = false;
        for (follower, &last_caught_up) in table.iter() {
            if proposal.contains(follower) && now_ms - last_caught_up > max_lag_ms {
                proposal.remove(follower);
                changed = true;
            }
        }
        (proposal, changed)
    }
}

impl Default for SyncStateSet {
    fn default() -> Self {
        Self::new()
    }
}
