//! Log Store Contract
//!
//! The HA core drives replication for a commit-log store it does not own.
//! This module defines the narrow contract the core needs from that store:
//! offset queries, mapped reads for tail validation, truncation, dispatch
//! progress, and the transient write-buffer pool switches made during role
//! transitions.

mod memory;

pub use memory::MemoryLogStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Role of a replica node. The log store is the source of truth; the HA
/// core reads it but never mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Node accepts writes and replicates them to followers
    Leader,
    /// Node replicates from an upstream leader
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
        }
    }
}

/// A mapped read of the commit log starting at a record boundary.
#[derive(Debug, Clone)]
pub struct ReadWindow {
    /// Log offset of the first byte in `bytes`
    pub start_offset: u64,
    /// Raw log bytes
    pub bytes: Vec<u8>,
}

impl ReadWindow {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Outcome of validating one record at the head of a byte slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCheck {
    /// A whole, well-formed record of `size` bytes
    Valid { size: usize },
    /// End-of-segment marker; the reader must roll to the next segment file
    SegmentEnd,
    /// The bytes do not form a complete, well-formed record
    Invalid,
}

/// Contract the HA core requires from the underlying commit-log store.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Current role of this node
    fn role(&self) -> Role;

    /// Highest byte offset of the commit log
    fn max_offset(&self) -> u64;

    /// Highest offset durably flushed to disk
    fn flushed_offset(&self) -> u64;

    /// How many bytes the queue-index dispatcher lags behind the log
    fn dispatch_behind_bytes(&self) -> u64;

    /// Mapped read starting at the given offset, or `None` past the tail
    fn read_window(&self, offset: u64) -> Option<ReadWindow>;

    /// Validate the record at the head of `buf`
    fn check_message(&self, buf: &[u8]) -> MessageCheck;

    /// First offset of the segment following the one containing `offset`
    fn roll_next_offset(&self, offset: u64) -> u64;

    /// Discard all log bytes at and above `offset`
    async fn truncate_to(&self, offset: u64) -> Result<()>;

    /// Rebuild per-topic queue metadata from the (now canonical) log
    async fn rebuild_queue_index(&self) -> Result<()>;

    /// Stamp the store with the current leader term so downstream consumers
    /// can detect term boundaries
    fn set_state_machine_version(&self, version: u64);

    fn state_machine_version(&self) -> u64;

    /// Bytes buffered in the transient pool, not yet committed to mapped files
    fn pending_commit_bytes(&self) -> u64;

    /// Nudge the commit thread to drain pending transient-pool data
    fn wake_commit(&self);

    /// Switch the transient pool between direct commit (leader) and
    /// buffered (follower) modes
    fn set_direct_commit(&self, direct: bool);

    /// Whether the store is shutting down
    fn is_shutdown(&self) -> bool;
}
