//! Epoch File Cache
//!
//! Durable, append-only store of (epoch, start offset) records, fully loaded
//! into memory and mutable only at the ends. Appends are fsynced before they
//! are acknowledged; truncations rewrite a fresh file and rename it over the
//! old one so a crash never leaves a half-rewritten sequence.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use super::EpochEntry;
use crate::error::{Error, Result};

/// On-disk record width: epoch (u32) | start offset (i64), network byte order
const RECORD_SIZE: usize = 12;

/// In-memory image of the epoch file.
///
/// Not internally synchronized; callers serialize access (the HA service
/// keeps it behind a `tokio::sync::RwLock`).
pub struct EpochFileCache {
    /// File path
    path: PathBuf,
    /// Open handle, positioned at end-of-file between appends
    file: File,
    /// Loaded records, oldest first
    records: Vec<(u32, u64)>,
    /// Set after a failed persist; all further appends are refused
    poisoned: bool,
}

impl EpochFileCache {
    /// Open the epoch file, creating it if absent, and load all records.
    ///
    /// A trailing partial record (torn write) is discarded and the file is
    /// clipped back to the last whole record. A non-tail record that breaks
    /// epoch/offset monotonicity fails the load.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let torn = bytes.len() % RECORD_SIZE;
        if torn != 0 {
            let keep = (bytes.len() - torn) as u64;
            tracing::warn!(
                "Discarding {} torn byte(s) at the tail of {}",
                torn,
                path.display()
            );
            file.set_len(keep)?;
            file.sync_all()?;
            bytes.truncate(keep as usize);
        }

        let mut records = Vec::with_capacity(bytes.len() / RECORD_SIZE);
        for (i, chunk) in bytes.chunks_exact(RECORD_SIZE).enumerate() {
            let epoch = u32::from_be_bytes(chunk[0..4].try_into().unwrap());
            let start_offset = i64::from_be_bytes(chunk[4..12].try_into().unwrap());
            if start_offset < 0 {
                return Err(Error::EpochFileCorrupted {
                    record: i,
                    reason: format!("negative start offset {}", start_offset),
                });
            }
            let start_offset = start_offset as u64;

            if let Some(&(last_epoch, last_start)) = records.last() {
                if epoch <= last_epoch || start_offset < last_start {
                    return Err(Error::EpochFileCorrupted {
                        record: i,
                        reason: format!(
                            "record ({}, {}) does not follow ({}, {})",
                            epoch, start_offset, last_epoch, last_start
                        ),
                    });
                }
            }
            records.push((epoch, start_offset));
        }

        file.seek(SeekFrom::End(0))?;
        tracing::info!(
            "Loaded {} epoch record(s) from {}",
            records.len(),
            path.display()
        );

        Ok(Self {
            path,
            file,
            records,
            poisoned: false,
        })
    }

    /// Last recorded epoch, 0 when the file is empty.
    pub fn last_epoch(&self) -> u32 {
        self.records.last().map_or(0, |&(epoch, _)| epoch)
    }

    /// Last (open-ended) entry, if any.
    pub fn last_entry(&self) -> Option<EpochEntry> {
        self.records.last().map(|&(epoch, start_offset)| EpochEntry {
            epoch,
            start_offset,
            end_offset: None,
        })
    }

    /// Snapshot of all entries with derived end offsets.
    pub fn entries(&self) -> Vec<EpochEntry> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, &(epoch, start_offset))| EpochEntry {
                epoch,
                start_offset,
                end_offset: self.records.get(i + 1).map(|&(_, next_start)| next_start),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a new epoch boundary and fsync it before returning.
    ///
    /// The epoch must be strictly greater than the last recorded epoch and
    /// the start offset must not regress. A write or fsync failure poisons
    /// the cache: every later append fails until the process restarts.
    pub fn append(&mut self, epoch: u32, start_offset: u64) -> Result<()> {
        if self.poisoned {
            return Err(Error::EpochPersistence(
                "epoch file poisoned by earlier write failure".into(),
            ));
        }

        if let Some(&(last_epoch, last_start)) = self.records.last() {
            if epoch <= last_epoch || start_offset < last_start {
                return Err(Error::EpochOrder {
                    epoch,
                    start_offset,
                    last_epoch,
                    last_start_offset: last_start,
                });
            }
        }

        let mut record = [0u8; RECORD_SIZE];
        record[0..4].copy_from_slice(&epoch.to_be_bytes());
        record[4..12].copy_from_slice(&(start_offset as i64).to_be_bytes());

        if let Err(e) = self.persist_append(&record) {
            self.poisoned = true;
            return Err(Error::EpochPersistence(e.to_string()));
        }

        self.records.push((epoch, start_offset));
        tracing::info!(
            "Appended epoch {} starting at offset {} to {}",
            epoch,
            start_offset,
            self.path.display()
        );
        Ok(())
    }

    fn persist_append(&mut self, record: &[u8]) -> std::io::Result<()> {
        self.file.write_all(record)?;
        self.file.sync_all()
    }

    /// Remove all entries with `epoch >= from_epoch`. Idempotent.
    ///
    /// Used when a new leader takes over an epoch that is already present
    /// locally (a stale, aborted term).
    pub fn truncate_suffix_by_epoch(&mut self, from_epoch: u32) -> Result<()> {
        let keep = self
            .records
            .iter()
            .take_while(|&&(epoch, _)| epoch < from_epoch)
            .count();
        self.truncate_to(keep, "suffix-by-epoch")
    }

    /// Remove all entries with `start_offset >= offset`. Idempotent.
    pub fn truncate_suffix_by_offset(&mut self, offset: u64) -> Result<()> {
        let keep = self
            .records
            .iter()
            .take_while(|&&(_, start)| start < offset)
            .count();
        self.truncate_to(keep, "suffix-by-offset")
    }

    /// Remove entries that end at or below `offset` (fully under the
    /// surviving log range). Always preserves at least one entry.
    pub fn truncate_prefix_by_offset(&mut self, offset: u64) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        let mut drop = 0;
        for i in 0..self.records.len() - 1 {
            // end offset of record i is the start of record i + 1
            if self.records[i + 1].1 <= offset {
                drop = i + 1;
            } else {
                break;
            }
        }
        if drop == 0 {
            return Ok(());
        }
        self.records.drain(..drop);
        let survivors = std::mem::take(&mut self.records);
        let result = self.rewrite(&survivors);
        self.records = survivors;
        tracing::info!(
            "Dropped {} epoch record(s) below offset {} from {}",
            drop,
            offset,
            self.path.display()
        );
        result
    }

    /// Entry covering the given log offset, if any.
    pub fn find_entry_at_offset(&self, offset: u64) -> Option<EpochEntry> {
        self.entries().into_iter().find(|e| e.covers(offset))
    }

    /// Entry for an exact epoch, if recorded.
    pub fn find_entry_by_epoch(&self, epoch: u32) -> Option<EpochEntry> {
        self.entries().into_iter().find(|e| e.epoch == epoch)
    }

    fn truncate_to(&mut self, keep: usize, what: &str) -> Result<()> {
        if keep >= self.records.len() {
            return Ok(());
        }
        let dropped = self.records.len() - keep;
        self.records.truncate(keep);
        let survivors = std::mem::take(&mut self.records);
        let result = self.rewrite(&survivors);
        self.records = survivors;
        tracing::info!(
            "Truncated {} epoch record(s) ({}) from {}",
            dropped,
            what,
            self.path.display()
        );
        result
    }

    /// Write the surviving records to a fresh file and rename it into place.
    fn rewrite(&mut self, records: &[(u32, u64)]) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let write_all = || -> std::io::Result<File> {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            for &(epoch, start_offset) in records {
                let mut record = [0u8; RECORD_SIZE];
                record[0..4].copy_from_slice(&epoch.to_be_bytes());
                record[4..12].copy_from_slice(&(start_offset as i64).to_be_bytes());
                tmp.write_all(&record)?;
            }
            tmp.sync_all()?;
            std::fs::rename(&tmp_path, &self.path)?;
            let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            file.seek(SeekFrom::End(0))?;
            Ok(file)
        };

        match write_all() {
            Ok(file) => {
                self.file = file;
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(Error::EpochPersistence(e.to_string()))
            }
        }
    }
}
