//! In-Memory Log Store
//!
//! A single-segment, heap-backed implementation of the log-store contract.
//! Used for embedding the HA core in tests and simulations; records use a
//! small length-prefixed framing so tail validation has real bytes to walk.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use super::{LogStore, MessageCheck, ReadWindow, Role};
use crate::error::Result;

/// Record framing: total size (u32 LE) | magic (u32 LE) | payload
const RECORD_HEADER: usize = 8;
const RECORD_MAGIC: u32 = 0xCAFE_D00D;

/// Heap-backed commit log implementing [`LogStore`].
pub struct MemoryLogStore {
    buf: Mutex<Vec<u8>>,
    role: RwLock<Role>,
    dispatched: AtomicU64,
    instant_dispatch: AtomicBool,
    flushed: AtomicU64,
    state_machine_version: AtomicU64,
    pending_commit: AtomicU64,
    direct_commit: AtomicBool,
    shutdown: AtomicBool,
}

impl MemoryLogStore {
    pub fn new(role: Role) -> Self {
        Self {
            buf: Mutex::new(Vec::new()),
            role: RwLock::new(role),
            dispatched: AtomicU64::new(0),
            instant_dispatch: AtomicBool::new(false),
            flushed: AtomicU64::new(0),
            state_machine_version: AtomicU64::new(0),
            pending_commit: AtomicU64::new(0),
            direct_commit: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Append one framed record, returning its start offset.
    pub fn append_record(&self, payload: &[u8]) -> u64 {
        let mut buf = self.buf.lock().unwrap();
        let start = buf.len() as u64;
        let total = (RECORD_HEADER + payload.len()) as u32;
        buf.extend_from_slice(&total.to_le_bytes());
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(payload);
        self.flushed.store(buf.len() as u64, Ordering::SeqCst);
        start
    }

    /// Append raw bytes without framing. Lets tests plant a corrupt tail.
    pub fn append_raw(&self, bytes: &[u8]) -> u64 {
        let mut buf = self.buf.lock().unwrap();
        let start = buf.len() as u64;
        buf.extend_from_slice(bytes);
        self.flushed.store(buf.len() as u64, Ordering::SeqCst);
        start
    }

    /// Move the dispatcher watermark.
    pub fn set_dispatched(&self, offset: u64) {
        self.dispatched.store(offset, Ordering::SeqCst);
    }

    /// Mark the dispatcher as fully caught up.
    pub fn dispatch_all(&self) {
        let len = self.buf.lock().unwrap().len() as u64;
        self.dispatched.store(len, Ordering::SeqCst);
    }

    /// Treat the dispatcher as infinitely fast: each lag observation
    /// reports the lag as of the previous poll, then catches up.
    pub fn set_instant_dispatch(&self, enabled: bool) {
        self.instant_dispatch.store(enabled, Ordering::SeqCst);
    }

    pub fn set_role(&self, role: Role) {
        *self.role.write().unwrap() = role;
    }

    pub fn set_pending_commit(&self, bytes: u64) {
        self.pending_commit.store(bytes, Ordering::SeqCst);
    }

    pub fn set_shutdown(&self, shutdown: bool) {
        self.shutdown.store(shutdown, Ordering::SeqCst);
    }

    pub fn direct_commit(&self) -> bool {
        self.direct_commit.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    fn role(&self) -> Role {
        *self.role.read().unwrap()
    }

    fn max_offset(&self) -> u64 {
        self.buf.lock().unwrap().len() as u64
    }

    fn flushed_offset(&self) -> u64 {
        self.flushed.load(Ordering::SeqCst)
    }

    fn dispatch_behind_bytes(&self) -> u64 {
        let len = self.buf.lock().unwrap().len() as u64;
        let behind = len.saturating_sub(self.dispatched.load(Ordering::SeqCst));
        if behind > 0 && self.instant_dispatch.load(Ordering::SeqCst) {
            self.dispatched.store(len, Ordering::SeqCst);
        }
        behind
    }

    fn read_window(&self, offset: u64) -> Option<ReadWindow> {
        let buf = self.buf.lock().unwrap();
        if offset >= buf.len() as u64 {
            return None;
        }
        Some(ReadWindow {
            start_offset: offset,
            bytes: buf[offset as usize..].to_vec(),
        })
    }

    fn check_message(&self, buf: &[u8]) -> MessageCheck {
        if buf.len() < 4 {
            return MessageCheck::Invalid;
        }
        let total = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        if total == 0 {
            return MessageCheck::SegmentEnd;
        }
        if total < RECORD_HEADER || total > buf.len() {
            return MessageCheck::Invalid;
        }
        let magic = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if magic != RECORD_MAGIC {
            return MessageCheck::Invalid;
        }
        MessageCheck::Valid { size: total }
    }

    fn roll_next_offset(&self, _offset: u64) -> u64 {
        // Single segment; rolling lands at the log tail
        self.max_offset()
    }

    async fn truncate_to(&self, offset: u64) -> Result<()> {
        let mut buf = self.buf.lock().unwrap();
        if (offset as usize) < buf.len() {
            buf.truncate(offset as usize);
        }
        let len = buf.len() as u64;
        let clamp = |v: &AtomicU64| {
            let cur = v.load(Ordering::SeqCst);
            if cur > len {
                v.store(len, Ordering::SeqCst);
            }
        };
        clamp(&self.dispatched);
        clamp(&self.flushed);
        Ok(())
    }

    async fn rebuild_queue_index(&self) -> Result<()> {
        self.dispatch_all();
        Ok(())
    }

    fn set_state_machine_version(&self, version: u64) {
        self.state_machine_version.store(version, Ordering::SeqCst);
    }

    fn state_machine_version(&self) -> u64 {
        self.state_machine_version.load(Ordering::SeqCst)
    }

    fn pending_commit_bytes(&self) -> u64 {
        self.pending_commit.load(Ordering::SeqCst)
    }

    fn wake_commit(&self) {
        // Commit thread stand-in: waking it drains everything pending
        self.pending_commit.store(0, Ordering::SeqCst);
    }

    fn set_direct_commit(&self, direct: bool) {
        self.direct_commit.store(direct, Ordering::SeqCst);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
