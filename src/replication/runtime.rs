//! Replication Runtime Diagnostics
//!
//! Structured snapshot of replication state for status endpoints and
//! operator tooling.

use serde::Serialize;

/// Point-in-time view of the replication service.
#[derive(Debug, Clone, Serialize)]
pub struct HaRuntimeInfo {
    /// Whether this node currently serves as leader
    pub master: bool,
    /// Leader's commit-log put offset at snapshot time (leader only)
    pub leader_max_offset: u64,
    /// Members of the enforced in-sync set besides the leader itself
    pub in_sync_follower_count: usize,
    /// One entry per live inbound follower channel (leader only)
    pub connections: Vec<ConnectionRuntimeInfo>,
    /// Upstream client state (follower only)
    pub client: Option<ClientRuntimeInfo>,
}

/// Per-follower replication progress as seen by the leader.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRuntimeInfo {
    pub follower_address: String,
    pub ack_offset: u64,
    /// How far the follower's acks trail the leader's put offset
    pub diff: i64,
    pub transferred_bytes_per_second: u64,
    pub transfer_from_offset: u64,
    /// Whether the follower is in the enforced in-sync set
    pub in_sync: bool,
}

/// Upstream replication state as seen by a follower.
#[derive(Debug, Clone, Serialize)]
pub struct ClientRuntimeInfo {
    /// Replication endpoint discovered from the leader, if any yet
    pub leader_address: Option<String>,
    pub max_offset: u64,
    pub last_read_timestamp_ms: i64,
    pub last_write_timestamp_ms: i64,
    pub transferred_bytes_per_second: u64,
    /// Highest offset the local store has durably flushed
    pub flush_offset: u64,
}
