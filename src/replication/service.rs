//! Auto-Switching Replication Service
//!
//! The orchestrator a broker embeds once per instance. It takes role
//! decisions from the external supervisor (`change_to_leader` /
//! `change_to_follower`), keeps the epoch file and the in-sync replica set
//! consistent across those transitions, and computes the confirm offset:
//! the offset up to which the log is replicated on every enforced in-sync
//! member.
//!
//! Role transitions are serialized by the caller; everything else here may
//! be invoked concurrently from channel I/O tasks and the supervisor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use super::connection::{ConnectionRegistry, FollowerChannel, UpstreamClient, UpstreamFactory};
use super::notifier::{SyncSetListener, SyncSetNotifier};
use super::runtime::{ClientRuntimeInfo, ConnectionRuntimeInfo, HaRuntimeInfo};
use super::sync_state::SyncStateSet;
use crate::config::HaCoreConfig;
use crate::epoch::{EpochEntry, EpochFileCache};
use crate::error::{Error, Result};
use crate::store::{LogStore, MessageCheck, Role};

/// Auto-switching HA replication service. One per broker instance.
pub struct HaService {
    config: HaCoreConfig,
    store: Arc<dyn LogStore>,
    epoch_cache: RwLock<EpochFileCache>,
    sync_state: SyncStateSet,
    connections: ConnectionRegistry,
    notifier: SyncSetNotifier,
    upstream_factory: Arc<dyn UpstreamFactory>,
    upstream: RwLock<Option<Arc<dyn UpstreamClient>>>,
    local_address: RwLock<Option<String>>,
}

impl HaService {
    /// Create the service and load the epoch file from disk.
    pub fn new(
        config: HaCoreConfig,
        store: Arc<dyn LogStore>,
        upstream_factory: Arc<dyn UpstreamFactory>,
    ) -> Result<Self> {
        let epoch_cache = EpochFileCache::open(&config.epoch_file)?;
        Ok(Self {
            config,
            store,
            epoch_cache: RwLock::new(epoch_cache),
            sync_state: SyncStateSet::new(),
            connections: ConnectionRegistry::new(),
            notifier: SyncSetNotifier::new(),
            upstream_factory,
            upstream: RwLock::new(None),
            local_address: RwLock::new(None),
        })
    }

    /// Service name used in telemetry, prefixed with the container
    /// identifier when the broker runs inside one.
    pub fn service_name(&self) -> String {
        match self.config.container_identifier.as_deref() {
            Some(id) if !id.is_empty() => format!("{}HaService", id),
            _ => "HaService".to_string(),
        }
    }

    /// This node's replication address, used as its identity in sync sets.
    pub async fn set_local_address(&self, addr: &str) {
        *self.local_address.write().await = Some(addr.to_string());
    }

    pub async fn local_address(&self) -> Option<String> {
        self.local_address.read().await.clone()
    }

    /// Stop channels, the upstream client, and the notification worker.
    pub async fn shutdown(&self) {
        self.connections.close_all().await;
        if let Some(client) = self.upstream.read().await.clone() {
            client.shutdown().await;
        }
        self.notifier.shutdown().await;
    }

    // ---------- Role transitions ----------

    /// Take over as leader for the given epoch.
    ///
    /// Tears down every replication channel, drops any partially replicated
    /// log tail, reconciles and extends the epoch file, waits for the
    /// dispatcher and transient buffers to drain, and re-seeds the in-sync
    /// set with this node alone. On failure the node must not accept leader
    /// writes; the supervisor is expected to retry with a role decision.
    pub async fn change_to_leader(&self, epoch: u32) -> Result<()> {
        let last_epoch = self.epoch_cache.read().await.last_epoch();
        if epoch < last_epoch {
            tracing::warn!(
                "Refusing promotion to epoch {}: local epoch record already at {}",
                epoch,
                last_epoch
            );
            return Err(Error::StaleEpoch { epoch, last_epoch });
        }

        self.connections.close_all().await;
        if let Some(client) = self.upstream.read().await.clone() {
            client.shutdown().await;
        }

        // Drop bytes whose dispatch never completed under the old leader
        let truncated = self.truncate_invalid_tail().await?;

        let confirm = self.compute_confirm_offset().await;
        self.sync_state.set_confirm_offset(confirm).await;

        {
            let mut cache = self.epoch_cache.write().await;
            if let Some(offset) = truncated {
                cache.truncate_suffix_by_offset(offset)?;
            }
            if cache.last_epoch() >= epoch {
                // A stale term with this epoch was started locally but never
                // completed; reclaim it
                cache.truncate_suffix_by_epoch(epoch)?;
            }
            cache.append(epoch, self.store.max_offset())?;
        }

        self.wait_for_dispatch_drain().await?;

        if self.config.transient_store_pool {
            self.wait_for_commit_drain().await;
            self.store.set_direct_commit(true);
        }

        self.store.rebuild_queue_index().await?;

        // Alone in the in-sync set until the supervisor commits a wider one
        let mut seed = HashSet::new();
        if let Some(addr) = self.local_address.read().await.clone() {
            seed.insert(addr);
        }
        let max_offset = self.store.max_offset();
        self.sync_state.reset(seed, max_offset as i64).await;

        self.store.set_state_machine_version(epoch as u64);
        tracing::info!(
            "Changed to leader, epoch {}, truncated to {:?}, log tail {}",
            epoch,
            truncated,
            max_offset
        );
        Ok(())
    }

    /// Start following the leader at `leader_addr` under the given epoch.
    pub async fn change_to_follower(
        &self,
        leader_addr: &str,
        epoch: u32,
        follower_id: u64,
    ) -> Result<()> {
        let last_epoch = self.epoch_cache.read().await.last_epoch();
        if epoch < last_epoch {
            tracing::warn!(
                "Refusing demotion to epoch {}: local epoch record already at {}",
                epoch,
                last_epoch
            );
            return Err(Error::StaleEpoch { epoch, last_epoch });
        }

        self.connections.close_all().await;

        let client = {
            let mut upstream = self.upstream.write().await;
            match upstream.as_ref() {
                Some(client) => {
                    let client = client.clone();
                    client
                        .reopen()
                        .await
                        .map_err(|e| Error::FollowerStart(e.to_string()))?;
                    client
                }
                None => {
                    let client = self
                        .upstream_factory
                        .create()
                        .map_err(|e| Error::FollowerStart(e.to_string()))?;
                    *upstream = Some(client.clone());
                    client
                }
            }
        };

        if let Some(addr) = self.local_address.read().await.clone() {
            client.set_local_address(&addr);
        }
        client.set_follower_id(follower_id);
        client.set_leader_address(leader_addr);
        // The replication endpoint is re-discovered from the new leader
        client.set_transfer_address(None);
        client.start().await?;

        if self.config.transient_store_pool {
            self.wait_for_commit_drain().await;
            self.store.set_direct_commit(false);
        }

        self.store.set_state_machine_version(epoch as u64);
        tracing::info!(
            "Changed to follower of {}, epoch {}, follower id {}",
            leader_addr,
            epoch,
            follower_id
        );
        Ok(())
    }

    /// Scan forward from the dispatcher watermark and truncate the log at
    /// the first record that fails validation.
    ///
    /// Bytes past the dispatcher are exactly those a previous leader may
    /// have shipped without completing the write; everything that validates
    /// is kept, the rest is discarded before this node takes leader writes.
    /// Returns the truncation offset, or `None` when dispatch is caught up.
    pub async fn truncate_invalid_tail(&self) -> Result<Option<u64>> {
        let behind = self.store.dispatch_behind_bytes();
        if behind == 0 {
            tracing::info!("Dispatch caught up, skipping tail validation");
            return Ok(None);
        }

        let mut scan = self.store.max_offset().saturating_sub(behind);
        let mut keep_going = true;
        while keep_going && scan < self.store.max_offset() {
            let Some(window) = self.store.read_window(scan) else {
                break;
            };
            scan = window.start_offset;
            let mut read = 0usize;
            while read < window.len() {
                match self.store.check_message(&window.bytes[read..]) {
                    MessageCheck::Valid { size } => {
                        scan += size as u64;
                        read += size;
                    }
                    MessageCheck::SegmentEnd => {
                        scan = self.store.roll_next_offset(scan);
                        break;
                    }
                    MessageCheck::Invalid => {
                        keep_going = false;
                        break;
                    }
                }
            }
        }

        tracing::info!("Truncating commit log to record boundary {}", scan);
        self.store
            .truncate_to(scan)
            .await
            .map_err(|e| Error::Truncation {
                offset: scan,
                reason: e.to_string(),
            })?;
        Ok(Some(scan))
    }

    async fn wait_for_dispatch_drain(&self) -> Result<()> {
        let poll = Duration::from_millis(self.config.drain_poll_ms);
        let mut waited_ms = 0u64;
        while self.store.dispatch_behind_bytes() > 0 {
            if self.config.drain_timeout_ms > 0 && waited_ms >= self.config.drain_timeout_ms {
                return Err(Error::DispatchStall { waited_ms });
            }
            tokio::time::sleep(poll).await;
            waited_ms += self.config.drain_poll_ms;
        }
        Ok(())
    }

    async fn wait_for_commit_drain(&self) {
        while self.store.pending_commit_bytes() > 0 {
            self.store.wake_commit();
            tokio::time::sleep(Duration::from_millis(self.config.drain_poll_ms)).await;
        }
    }

    // ---------- Channel supervision ----------

    /// Adopt an inbound follower channel produced by the accept service.
    pub async fn register_connection(&self, channel: Arc<dyn FollowerChannel>) {
        self.connections.register(channel).await;
    }

    /// Handle a follower channel teardown. Unless the store is shutting
    /// down, the follower is proposed out of the in-sync set.
    pub async fn remove_connection(&self, follower: &str) {
        if !self.store.is_shutdown() {
            let mut proposal = self.sync_state.local_set().await;
            if proposal.remove(follower) {
                self.sync_state.mark_synchronizing(proposal.clone()).await;
                self.notifier.notify(proposal).await;
            }
        }
        self.connections.remove(follower).await;
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.len().await
    }

    /// Current upstream client, if this node has ever been a follower.
    pub async fn upstream(&self) -> Option<Arc<dyn UpstreamClient>> {
        self.upstream.read().await.clone()
    }

    /// Point the upstream client at a re-discovered replication endpoint.
    pub async fn update_upstream_transfer_address(&self, addr: Option<&str>) {
        if let Some(client) = self.upstream.read().await.clone() {
            client.set_transfer_address(addr);
        }
    }

    // ---------- In-sync set management ----------

    /// Record that a follower's ack reached the leader's max offset.
    pub async fn update_last_caught_up(&self, follower: &str, ts_ms: i64) {
        self.sync_state.update_caught_up(follower, ts_ms).await;
    }

    /// Propose adding a follower to the in-sync set once its acks are at the
    /// confirm offset AND inside the current leader epoch. The second
    /// condition keeps out followers whose tail merely matches bytes written
    /// under an earlier term.
    pub async fn maybe_expand_sync_set(&self, follower: &str, follower_max_offset: u64) {
        let current = self.sync_state.local_set().await;
        if current.contains(follower) {
            return;
        }
        let confirm = self.confirm_offset().await;
        if (follower_max_offset as i64) < confirm {
            return;
        }
        let current_epoch = match self.epoch_cache.read().await.last_entry() {
            Some(entry) => entry,
            None => {
                tracing::warn!("No epoch recorded yet, cannot expand in-sync set");
                return;
            }
        };
        if follower_max_offset < current_epoch.start_offset {
            return;
        }

        let mut proposal = current;
        proposal.insert(follower.to_string());
        tracing::info!(
            "Proposing {} into the in-sync set at offset {} ({})",
            follower,
            follower_max_offset,
            current_epoch
        );
        self.sync_state.mark_synchronizing(proposal.clone()).await;
        self.notifier.notify(proposal).await;
    }

    /// Propose evicting every in-sync member that has not caught up within
    /// the configured lag bound. Returns the proposed set; the supervisor
    /// decides whether to commit it.
    pub async fn maybe_shrink_sync_set(&self) -> HashSet<String> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (proposal, changed) = self
            .sync_state
            .shrink_proposal(self.config.max_follower_lag_ms as i64, now_ms)
            .await;
        if changed {
            tracing::info!("Proposing shrunken in-sync set {:?}", proposal);
            self.sync_state.mark_synchronizing(proposal.clone()).await;
        }
        proposal
    }

    /// Install the in-sync set the supervisor acknowledged.
    pub async fn commit_sync_set(&self, new_set: HashSet<String>) {
        let confirm = self.compute_confirm_offset_for(&new_set).await;
        self.sync_state.commit(new_set, confirm).await;
    }

    /// Externally visible membership (union while a proposal is in flight).
    pub async fn sync_set(&self) -> HashSet<String> {
        self.sync_state.effective_set().await
    }

    /// Membership the leader enforces locally.
    pub async fn local_sync_set(&self) -> HashSet<String> {
        self.sync_state.local_set().await
    }

    pub async fn in_sync_replica_count(&self) -> usize {
        self.sync_state.replica_count().await
    }

    pub async fn is_synchronizing(&self) -> bool {
        self.sync_state.is_synchronizing().await
    }

    /// Listener invoked (in proposal order, off the I/O paths) whenever a
    /// new in-sync set is proposed to the supervisor.
    pub async fn register_sync_set_listener(&self, listener: SyncSetListener) {
        self.notifier.register(listener).await;
    }

    // ---------- Confirm offset ----------

    /// Offset replicated on every enforced in-sync member. With no follower
    /// in the set this is the log tail itself.
    pub async fn confirm_offset(&self) -> i64 {
        if self.store.role() != Role::Follower {
            if self.sync_state.local_set().await.len() == 1 {
                return self.store.max_offset() as i64;
            }
            if self.sync_state.confirm_offset().await <= 0 {
                let computed = self.compute_confirm_offset().await;
                self.sync_state.set_confirm_offset(computed).await;
            }
        }
        // On a follower this is whatever the last leader term left behind
        self.sync_state.confirm_offset().await
    }

    pub async fn set_confirm_offset(&self, offset: i64) {
        self.sync_state.set_confirm_offset(offset).await;
    }

    /// Recompute the confirm offset after an ack from an in-sync follower.
    pub async fn on_follower_ack(&self, follower: &str) {
        if self.sync_state.contains_local(follower).await {
            let computed = self.compute_confirm_offset().await;
            self.sync_state.set_confirm_offset(computed).await;
        }
    }

    async fn compute_confirm_offset(&self) -> i64 {
        let members = self.sync_state.effective_set().await;
        self.compute_confirm_offset_for(&members).await
    }

    async fn compute_confirm_offset_for(&self, members: &HashSet<String>) -> i64 {
        let mut confirm = self.store.max_offset() as i64;
        for channel in self.connections.snapshot().await {
            if members.contains(&channel.follower_address()) {
                confirm = confirm.min(channel.ack_offset() as i64);
            }
        }
        confirm
    }

    // ---------- Epoch file ----------

    pub async fn last_epoch(&self) -> u32 {
        self.epoch_cache.read().await.last_epoch()
    }

    pub async fn epoch_entries(&self) -> Vec<EpochEntry> {
        self.epoch_cache.read().await.entries()
    }

    pub async fn find_epoch_entry_by_epoch(&self, epoch: u32) -> Option<EpochEntry> {
        self.epoch_cache.read().await.find_entry_by_epoch(epoch)
    }

    pub async fn find_epoch_entry_at_offset(&self, offset: u64) -> Option<EpochEntry> {
        self.epoch_cache.read().await.find_entry_at_offset(offset)
    }

    /// Drop epoch records fully below the surviving log range (after log
    /// head retention deleted old segments).
    pub async fn truncate_epoch_prefix(&self, offset: u64) -> Result<()> {
        self.epoch_cache
            .write()
            .await
            .truncate_prefix_by_offset(offset)
    }

    /// Drop epoch records at and above a truncated log tail.
    pub async fn truncate_epoch_suffix(&self, offset: u64) -> Result<()> {
        self.epoch_cache
            .write()
            .await
            .truncate_suffix_by_offset(offset)
    }

    // ---------- Diagnostics ----------

    /// Structured snapshot for status reporting. `leader_put_offset` is the
    /// leader's current commit-log put position.
    pub async fn runtime_info(&self, leader_put_offset: u64) -> HaRuntimeInfo {
        if self.store.role() == Role::Follower {
            let client = self.upstream.read().await.clone().map(|c| ClientRuntimeInfo {
                leader_address: c.transfer_address(),
                max_offset: self.store.max_offset(),
                last_read_timestamp_ms: c.last_read_timestamp_ms(),
                last_write_timestamp_ms: c.last_write_timestamp_ms(),
                transferred_bytes_per_second: c.transferred_bytes_per_second(),
                flush_offset: self.store.flushed_offset(),
            });
            return HaRuntimeInfo {
                master: false,
                leader_max_offset: 0,
                in_sync_follower_count: 0,
                connections: Vec::new(),
                client,
            };
        }

        let local = self.sync_state.local_set().await;
        let connections = self
            .connections
            .snapshot()
            .await
            .iter()
            .map(|channel| {
                let follower_address = channel.follower_address();
                let ack_offset = channel.ack_offset();
                ConnectionRuntimeInfo {
                    in_sync: local.contains(&follower_address),
                    follower_address,
                    ack_offset,
                    diff: leader_put_offset as i64 - ack_offset as i64,
                    transferred_bytes_per_second: channel.transferred_bytes_per_second(),
                    transfer_from_offset: channel.transfer_from_offset(),
                }
            })
            .collect();

        HaRuntimeInfo {
            master: true,
            leader_max_offset: leader_put_offset,
            in_sync_follower_count: local.len().saturating_sub(1),
            connections,
            client: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::connection::testing::{MockFollowerChannel, MockUpstreamFactory};
    use super::*;
    use crate::store::MemoryLogStore;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    const SELF_ADDR: &str = "127.0.0.1:10912";

    fn set_of(members: &[&str]) -> HashSet<String> {
        members.iter().map(|s| s.to_string()).collect()
    }

    fn test_config(dir: &tempfile::TempDir) -> HaCoreConfig {
        HaCoreConfig {
            epoch_file: dir.path().join("epoch"),
            max_follower_lag_ms: 5_000,
            drain_poll_ms: 5,
            ..HaCoreConfig::default()
        }
    }

    struct Fixture {
        service: HaService,
        store: Arc<MemoryLogStore>,
        factory: Arc<MockUpstreamFactory>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(role: Role) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryLogStore::new(role));
        let factory = MockUpstreamFactory::new();
        let service = HaService::new(
            test_config(&dir),
            store.clone() as Arc<dyn LogStore>,
            factory.clone() as Arc<dyn UpstreamFactory>,
        )
        .unwrap();
        service.set_local_address(SELF_ADDR).await;
        Fixture {
            service,
            store,
            factory,
            _dir: dir,
        }
    }

    /// Append framed records of `record_size` bytes each until the log tail
    /// reaches `target`.
    fn fill_log(store: &MemoryLogStore, target: u64, record_size: usize) {
        while store.max_offset() < target {
            store.append_record(&vec![0u8; record_size - 8]);
        }
        assert_eq!(store.max_offset(), target);
    }

    #[tokio::test]
    async fn test_fresh_promotion_on_empty_log() {
        let fx = fixture(Role::Leader).await;

        fx.service.change_to_leader(1).await.unwrap();

        let entries = fx.service.epoch_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].epoch, 1);
        assert_eq!(entries[0].start_offset, 0);
        assert_eq!(entries[0].end_offset, None);

        assert_eq!(fx.service.confirm_offset().await, 0);
        assert_eq!(fx.service.in_sync_replica_count().await, 1);
        assert_eq!(fx.service.local_sync_set().await, set_of(&[SELF_ADDR]));
        assert!(!fx.service.is_synchronizing().await);
        assert_eq!(fx.store.state_machine_version(), 1);
    }

    #[tokio::test]
    async fn test_promotion_truncates_dirty_tail() {
        let fx = fixture(Role::Leader).await;

        // 850 bytes of valid records, then 150 bytes of garbage
        fill_log(&fx.store, 800, 100);
        fx.store.append_record(&vec![0u8; 42]); // 50-byte record at 800
        fx.store.append_raw(&[0xFF; 150]);
        assert_eq!(fx.store.max_offset(), 1000);
        // Dispatcher saw everything up to 800 and keeps running during the
        // promotion's drain wait
        fx.store.set_dispatched(800);
        fx.store.set_instant_dispatch(true);

        // Previous term on disk
        {
            let mut cache = EpochFileCache::open(fx._dir.path().join("epoch")).unwrap();
            cache.append(4, 500).unwrap();
        }
        let service = HaService::new(
            test_config(&fx._dir),
            fx.store.clone() as Arc<dyn LogStore>,
            fx.factory.clone() as Arc<dyn UpstreamFactory>,
        )
        .unwrap();
        service.set_local_address(SELF_ADDR).await;

        service.change_to_leader(5).await.unwrap();

        assert_eq!(fx.store.max_offset(), 850);
        let entries = service.epoch_entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].epoch, entries[0].start_offset), (4, 500));
        assert_eq!(entries[0].end_offset, Some(850));
        assert_eq!((entries[1].epoch, entries[1].start_offset), (5, 850));
        assert_eq!(fx.store.state_machine_version(), 5);
    }

    #[tokio::test]
    async fn test_promotion_reclaims_stale_term_with_same_epoch() {
        let fx = fixture(Role::Leader).await;
        fill_log(&fx.store, 400, 100);
        fx.store.dispatch_all();

        {
            let mut cache = EpochFileCache::open(fx._dir.path().join("epoch")).unwrap();
            cache.append(2, 100).unwrap();
            cache.append(3, 900).unwrap(); // aborted term, log never got there
        }
        let service = HaService::new(
            test_config(&fx._dir),
            fx.store.clone() as Arc<dyn LogStore>,
            fx.factory.clone() as Arc<dyn UpstreamFactory>,
        )
        .unwrap();
        service.set_local_address(SELF_ADDR).await;

        service.change_to_leader(3).await.unwrap();

        let entries = service.epoch_entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].epoch, entries[0].start_offset), (2, 100));
        assert_eq!((entries[1].epoch, entries[1].start_offset), (3, 400));
    }

    #[tokio::test]
    async fn test_promotion_rejects_stale_epoch() {
        let fx = fixture(Role::Leader).await;
        fx.service.change_to_leader(5).await.unwrap();

        let err = fx.service.change_to_leader(4).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StaleEpoch {
                epoch: 4,
                last_epoch: 5
            }
        ));
        // No state was disturbed
        assert_eq!(fx.service.last_epoch().await, 5);

        let err = fx
            .service
            .change_to_follower("10.0.0.9:10912", 4, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleEpoch { .. }));
    }

    #[tokio::test]
    async fn test_tail_validation_is_idempotent() {
        let fx = fixture(Role::Leader).await;
        fill_log(&fx.store, 800, 100);
        fx.store.append_record(&vec![0u8; 42]);
        fx.store.append_raw(&[0xFF; 150]);
        fx.store.set_dispatched(800);

        assert_eq!(fx.service.truncate_invalid_tail().await.unwrap(), Some(850));
        // Quiescent log: a second pass lands on the same boundary
        assert_eq!(fx.service.truncate_invalid_tail().await.unwrap(), Some(850));

        fx.store.dispatch_all();
        assert_eq!(fx.service.truncate_invalid_tail().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expansion_requires_confirm_offset_and_current_epoch() {
        let fx = fixture(Role::Leader).await;
        fill_log(&fx.store, 900, 100);
        fx.store.dispatch_all();
        fx.service.change_to_leader(5).await.unwrap(); // epoch starts at 900
        fill_log(&fx.store, 1000, 100);

        // Committed set {self, B} with B acked at 800 -> confirm offset 800
        let b = MockFollowerChannel::new("10.0.0.3:10912", 800);
        fx.service.register_connection(b.clone()).await;
        fx.service
            .commit_sync_set(set_of(&[SELF_ADDR, "10.0.0.3:10912"]))
            .await;
        assert_eq!(fx.service.confirm_offset().await, 800);

        // A is past the confirm offset but has not replicated into epoch 5
        let a = MockFollowerChannel::new("10.0.0.2:10912", 850);
        fx.service.register_connection(a.clone()).await;
        fx.service
            .maybe_expand_sync_set("10.0.0.2:10912", 850)
            .await;
        assert!(!fx.service.is_synchronizing().await);
        assert!(!fx.service.sync_set().await.contains("10.0.0.2:10912"));

        // Once A has bytes from the current term, the proposal goes out
        a.set_ack(950);
        fx.service
            .maybe_expand_sync_set("10.0.0.2:10912", 950)
            .await;
        assert!(fx.service.is_synchronizing().await);
        assert!(fx.service.sync_set().await.contains("10.0.0.2:10912"));
    }

    #[tokio::test]
    async fn test_expansion_and_supervisor_commit() {
        let fx = fixture(Role::Leader).await;
        fill_log(&fx.store, 900, 100);
        fx.store.dispatch_all();
        fx.service.change_to_leader(1).await.unwrap();
        fill_log(&fx.store, 1200, 100);

        let notified: Arc<StdMutex<Vec<HashSet<String>>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&notified);
        fx.service
            .register_sync_set_listener(Box::new(move |set| {
                sink.lock().unwrap().push(set.clone());
            }))
            .await;

        let a = MockFollowerChannel::new("10.0.0.2:10912", 1200);
        fx.service.register_connection(a.clone()).await;
        fx.service
            .maybe_expand_sync_set("10.0.0.2:10912", 1200)
            .await;

        assert!(fx.service.is_synchronizing().await);
        assert_eq!(
            fx.service.sync_set().await,
            set_of(&[SELF_ADDR, "10.0.0.2:10912"])
        );
        assert_eq!(fx.service.in_sync_replica_count().await, 2);
        // The enforced set does not change until the supervisor commits
        assert_eq!(fx.service.local_sync_set().await, set_of(&[SELF_ADDR]));

        fx.service
            .commit_sync_set(set_of(&[SELF_ADDR, "10.0.0.2:10912"]))
            .await;
        assert!(!fx.service.is_synchronizing().await);
        assert_eq!(fx.service.confirm_offset().await, 1200);

        // Give the notifier worker time to fan out, then check ordering
        fx.service.shutdown().await;
        let notified = notified.lock().unwrap();
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0], set_of(&[SELF_ADDR, "10.0.0.2:10912"]));
    }

    #[tokio::test]
    async fn test_shrink_evicts_lagging_follower() {
        let fx = fixture(Role::Leader).await;
        fill_log(&fx.store, 500, 100);
        fx.store.dispatch_all();
        fx.service.change_to_leader(1).await.unwrap();

        fx.service
            .commit_sync_set(set_of(&["10.0.0.2:10912", "10.0.0.3:10912"]))
            .await;

        let now = chrono::Utc::now().timestamp_millis();
        fx.service.update_last_caught_up("10.0.0.2:10912", now).await;
        fx.service
            .update_last_caught_up("10.0.0.3:10912", now - 6_000)
            .await;

        let proposal = fx.service.maybe_shrink_sync_set().await;
        assert_eq!(proposal, set_of(&["10.0.0.2:10912"]));
        assert!(fx.service.is_synchronizing().await);
        // Acknowledgement requirements stay at the stricter endpoint
        assert_eq!(fx.service.in_sync_replica_count().await, 2);
        // Shrinking proposes but never commits on its own
        assert_eq!(
            fx.service.local_sync_set().await,
            set_of(&["10.0.0.2:10912", "10.0.0.3:10912"])
        );
    }

    #[tokio::test]
    async fn test_shrink_without_lag_changes_nothing() {
        let fx = fixture(Role::Leader).await;
        fx.service.change_to_leader(1).await.unwrap();
        fx.service
            .commit_sync_set(set_of(&[SELF_ADDR, "10.0.0.2:10912"]))
            .await;
        fx.service
            .update_last_caught_up("10.0.0.2:10912", chrono::Utc::now().timestamp_millis())
            .await;

        let proposal = fx.service.maybe_shrink_sync_set().await;
        assert_eq!(proposal, set_of(&[SELF_ADDR, "10.0.0.2:10912"]));
        assert!(!fx.service.is_synchronizing().await);
    }

    #[tokio::test]
    async fn test_follower_ack_advances_confirm_offset() {
        let fx = fixture(Role::Leader).await;
        fill_log(&fx.store, 1000, 100);
        fx.store.dispatch_all();
        fx.service.change_to_leader(1).await.unwrap();

        let a = MockFollowerChannel::new("10.0.0.2:10912", 900);
        fx.service.register_connection(a.clone()).await;
        fx.service
            .commit_sync_set(set_of(&[SELF_ADDR, "10.0.0.2:10912"]))
            .await;
        assert_eq!(fx.service.confirm_offset().await, 900);

        a.set_ack(950);
        fx.service.on_follower_ack("10.0.0.2:10912").await;
        assert_eq!(fx.service.confirm_offset().await, 950);

        // Acks from replicas outside the enforced set are ignored
        let c = MockFollowerChannel::new("10.0.0.7:10912", 100);
        fx.service.register_connection(c).await;
        fx.service.on_follower_ack("10.0.0.7:10912").await;
        assert_eq!(fx.service.confirm_offset().await, 950);
    }

    #[tokio::test]
    async fn test_demotion_closes_channels_and_starts_upstream() {
        let fx = fixture(Role::Leader).await;
        fx.service.change_to_leader(5).await.unwrap();

        let a = MockFollowerChannel::new("10.0.0.2:10912", 0);
        let b = MockFollowerChannel::new("10.0.0.3:10912", 0);
        fx.service.register_connection(a.clone()).await;
        fx.service.register_connection(b.clone()).await;

        fx.service
            .change_to_follower("10.0.0.9:10912", 7, 2)
            .await
            .unwrap();

        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(fx.service.connection_count().await, 0);

        let client = &fx.factory.client;
        assert!(client.started.load(Ordering::SeqCst));
        assert_eq!(
            client.leader_address.lock().unwrap().as_deref(),
            Some("10.0.0.9:10912")
        );
        assert_eq!(client.local_address.lock().unwrap().as_deref(), Some(SELF_ADDR));
        assert_eq!(client.follower_id.load(Ordering::SeqCst), 2);
        assert_eq!(client.transfer_address(), None);
        assert_eq!(fx.store.state_machine_version(), 7);

        // A second demotion reopens the existing client instead of
        // creating a new one
        fx.service
            .change_to_follower("10.0.0.8:10912", 8, 2)
            .await
            .unwrap();
        assert_eq!(fx.factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(client.reopens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_demotion_failure_surfaces_to_supervisor() {
        let fx = fixture(Role::Leader).await;
        fx.factory.client.fail_start.store(true, Ordering::SeqCst);

        let err = fx
            .service
            .change_to_follower("10.0.0.9:10912", 3, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FollowerStart(_)));
    }

    #[tokio::test]
    async fn test_disconnect_proposes_removal() {
        let fx = fixture(Role::Leader).await;
        fx.service.change_to_leader(1).await.unwrap();
        let a = MockFollowerChannel::new("10.0.0.2:10912", 0);
        fx.service.register_connection(a.clone()).await;
        fx.service
            .commit_sync_set(set_of(&[SELF_ADDR, "10.0.0.2:10912"]))
            .await;

        let notified: Arc<StdMutex<Vec<HashSet<String>>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&notified);
        fx.service
            .register_sync_set_listener(Box::new(move |set| {
                sink.lock().unwrap().push(set.clone());
            }))
            .await;

        fx.service.remove_connection("10.0.0.2:10912").await;

        assert!(a.is_closed());
        assert_eq!(fx.service.connection_count().await, 0);
        assert!(fx.service.is_synchronizing().await);
        // Union still reports the departing follower until the supervisor
        // commits the shrink
        assert_eq!(
            fx.service.sync_set().await,
            set_of(&[SELF_ADDR, "10.0.0.2:10912"])
        );

        fx.service.shutdown().await;
        assert_eq!(*notified.lock().unwrap(), vec![set_of(&[SELF_ADDR])]);
    }

    #[tokio::test]
    async fn test_disconnect_during_store_shutdown_skips_proposal() {
        let fx = fixture(Role::Leader).await;
        fx.service.change_to_leader(1).await.unwrap();
        let a = MockFollowerChannel::new("10.0.0.2:10912", 0);
        fx.service.register_connection(a.clone()).await;
        fx.service
            .commit_sync_set(set_of(&[SELF_ADDR, "10.0.0.2:10912"]))
            .await;

        fx.store.set_shutdown(true);
        fx.service.remove_connection("10.0.0.2:10912").await;

        assert!(a.is_closed());
        assert!(!fx.service.is_synchronizing().await);
    }

    #[tokio::test]
    async fn test_transient_pool_switches_on_transitions() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryLogStore::new(Role::Leader));
        let factory = MockUpstreamFactory::new();
        let mut config = test_config(&dir);
        config.transient_store_pool = true;
        let service = HaService::new(
            config,
            store.clone() as Arc<dyn LogStore>,
            factory.clone() as Arc<dyn UpstreamFactory>,
        )
        .unwrap();
        service.set_local_address(SELF_ADDR).await;

        store.set_pending_commit(4096);
        service.change_to_leader(1).await.unwrap();
        assert_eq!(store.pending_commit_bytes(), 0);
        assert!(store.direct_commit());

        store.set_pending_commit(1024);
        service.change_to_follower("10.0.0.9:10912", 2, 1).await.unwrap();
        assert_eq!(store.pending_commit_bytes(), 0);
        assert!(!store.direct_commit());
    }

    #[tokio::test]
    async fn test_runtime_info_on_leader() {
        let fx = fixture(Role::Leader).await;
        fill_log(&fx.store, 1000, 100);
        fx.store.dispatch_all();
        fx.service.change_to_leader(1).await.unwrap();

        let a = MockFollowerChannel::new("10.0.0.2:10912", 900);
        fx.service.register_connection(a).await;
        fx.service
            .commit_sync_set(set_of(&[SELF_ADDR, "10.0.0.2:10912"]))
            .await;

        let info = fx.service.runtime_info(1000).await;
        assert!(info.master);
        assert_eq!(info.leader_max_offset, 1000);
        assert_eq!(info.in_sync_follower_count, 1);
        assert_eq!(info.connections.len(), 1);
        let conn = &info.connections[0];
        assert_eq!(conn.follower_address, "10.0.0.2:10912");
        assert_eq!(conn.ack_offset, 900);
        assert_eq!(conn.diff, 100);
        assert!(conn.in_sync);
        assert!(info.client.is_none());
    }

    #[tokio::test]
    async fn test_runtime_info_on_follower() {
        let fx = fixture(Role::Follower).await;
        fx.service
            .change_to_follower("10.0.0.9:10912", 3, 1)
            .await
            .unwrap();
        fx.service
            .update_upstream_transfer_address(Some("10.0.0.9:10913"))
            .await;
        fx.store.append_record(b"replicated");

        let info = fx.service.runtime_info(0).await;
        assert!(!info.master);
        let client = info.client.expect("follower exposes client info");
        assert_eq!(client.leader_address.as_deref(), Some("10.0.0.9:10913"));
        assert_eq!(client.max_offset, fx.store.max_offset());
        assert_eq!(client.flush_offset, fx.store.flushed_offset());
        assert!(info.connections.is_empty());
    }

    #[tokio::test]
    async fn test_service_name_uses_container_identifier() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryLogStore::new(Role::Leader));
        let factory = MockUpstreamFactory::new();
        let mut config = test_config(&dir);
        config.container_identifier = Some("broker-a_".to_string());
        let service = HaService::new(
            config,
            store as Arc<dyn LogStore>,
            factory as Arc<dyn UpstreamFactory>,
        )
        .unwrap();
        assert_eq!(service.service_name(), "broker-a_HaService");
    }
}
