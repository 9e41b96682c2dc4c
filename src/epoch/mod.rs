//! Epoch Boundary Tracking
//!
//! An epoch is the term identifier the supervisor assigns on every leader
//! change. This module keeps the durable, append-only record of
//! (epoch, start offset) boundaries that replicas use to detect log
//! divergence and negotiate truncation points.

mod cache;

pub use cache::EpochFileCache;

use serde::{Deserialize, Serialize};

/// One leader-term boundary in the commit log.
///
/// `start_offset` is the first log offset written under this epoch. The end
/// offset is derived from the next entry's start offset; the current epoch
/// is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochEntry {
    /// Term identifier, strictly increasing across entries
    pub epoch: u32,
    /// First log offset written under this epoch
    pub start_offset: u64,
    /// First offset of the next epoch; `None` while this epoch is current
    pub end_offset: Option<u64>,
}

impl EpochEntry {
    /// Check whether a log offset falls inside this epoch's range.
    pub fn covers(&self, offset: u64) -> bool {
        offset >= self.start_offset && self.end_offset.map_or(true, |end| offset < end)
    }
}

impl std::fmt::Display for EpochEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end_offset {
            Some(end) => write!(f, "epoch {} [{}, {})", self.epoch, self.start_offset, end),
            None => write!(f, "epoch {} [{}, ..)", self.epoch, self.start_offset),
        }
    }
}
