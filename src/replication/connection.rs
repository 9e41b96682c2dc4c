//! Replication Channel Supervision
//!
//! On a leader the core owns a registry of inbound follower channels; on a
//! follower it owns the single upstream client replicating from the leader.
//! The byte-level wire protocol behind both lives outside this crate; these
//! traits surface exactly what the membership and confirm-offset logic needs:
//! ack offsets, throughput, and lifecycle control.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

/// An inbound channel from one follower, as seen by the leader.
pub trait FollowerChannel: Send + Sync {
    /// Stable follower identity (host:port)
    fn follower_address(&self) -> String;

    /// Remote socket address of the channel
    fn client_address(&self) -> String;

    /// Highest log offset the follower has acknowledged
    fn ack_offset(&self) -> u64;

    /// Offset replication to this follower started from
    fn transfer_from_offset(&self) -> u64;

    fn transferred_bytes_per_second(&self) -> u64;

    /// Close the channel, aborting any in-flight transfer
    fn close(&self);
}

/// The outbound client a follower runs against its leader.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Begin the catch-up protocol against the configured leader
    async fn start(&self) -> Result<()>;

    async fn shutdown(&self);

    /// Reset a previously stopped client so it can be started again
    async fn reopen(&self) -> Result<()>;

    fn set_local_address(&self, addr: &str);

    fn set_follower_id(&self, id: u64);

    /// Leader address assigned by the supervisor
    fn set_leader_address(&self, addr: &str);

    /// Replication endpoint discovered during the handshake; cleared on
    /// every role change
    fn set_transfer_address(&self, addr: Option<&str>);

    fn transfer_address(&self) -> Option<String>;

    fn last_read_timestamp_ms(&self) -> i64;

    fn last_write_timestamp_ms(&self) -> i64;

    fn transferred_bytes_per_second(&self) -> u64;
}

/// Produces upstream clients. The connection factory is wired in by the
/// embedding broker; the core only drives lifecycle.
pub trait UpstreamFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn UpstreamClient>>;
}

/// Live follower channels on a leader. A reconnecting follower replaces its
/// previous channel; identities are never recycled within a process.
pub struct ConnectionRegistry {
    channels: RwLock<Vec<Arc<dyn FollowerChannel>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
        }
    }

    /// Add a channel, closing and replacing any previous channel from the
    /// same follower address.
    pub async fn register(&self, channel: Arc<dyn FollowerChannel>) {
        let address = channel.follower_address();
        let mut channels = self.channels.write().await;
        if let Some(pos) = channels
            .iter()
            .position(|c| c.follower_address() == address)
        {
            let old = channels.swap_remove(pos);
            old.close();
            tracing::info!("Replaced existing replication channel from {}", address);
        }
        channels.push(channel);
    }

    /// Remove and close the channel from the given follower, if present.
    pub async fn remove(&self, follower: &str) -> Option<Arc<dyn FollowerChannel>> {
        let mut channels = self.channels.write().await;
        let pos = channels
            .iter()
            .position(|c| c.follower_address() == follower)?;
        let channel = channels.swap_remove(pos);
        channel.close();
        Some(channel)
    }

    /// Snapshot of all live channels.
    pub async fn snapshot(&self) -> Vec<Arc<dyn FollowerChannel>> {
        self.channels.read().await.clone()
    }

    /// Close every channel and forget it. Followers are expected to
    /// reconnect after the role change settles.
    pub async fn close_all(&self) {
        let mut channels = self.channels.write().await;
        for channel in channels.drain(..) {
            channel.close();
        }
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
