//! Haswitch Error Types

use thiserror::Error;

/// Result type alias for haswitch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Haswitch error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Epoch file errors
    #[error("Stale epoch {epoch}: local epoch record already at {last_epoch}")]
    StaleEpoch { epoch: u32, last_epoch: u32 },

    #[error("Epoch order violation: epoch {epoch} / start offset {start_offset} not after last epoch {last_epoch} @ {last_start_offset}")]
    EpochOrder {
        epoch: u32,
        start_offset: u64,
        last_epoch: u32,
        last_start_offset: u64,
    },

    #[error("Epoch file corrupted at record {record}: {reason}")]
    EpochFileCorrupted { record: usize, reason: String },

    #[error("Epoch file persistence failure: {0}")]
    EpochPersistence(String),

    // Log store errors
    #[error("Log store error: {0}")]
    Store(String),

    #[error("Log truncation to offset {offset} failed: {reason}")]
    Truncation { offset: u64, reason: String },

    #[error("Dispatch drain stalled after {waited_ms} ms")]
    DispatchStall { waited_ms: u64 },

    // Role transition errors
    #[error("Follower client start failed: {0}")]
    FollowerStart(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error makes the node unfit to serve as leader
    /// until the supervisor intervenes.
    pub fn is_fatal_for_leadership(&self) -> bool {
        matches!(
            self,
            Error::EpochPersistence(_)
                | Error::EpochFileCorrupted { .. }
                | Error::Truncation { .. }
        )
    }

    /// Check if the supervisor may simply retry the same role transition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DispatchStall { .. } | Error::FollowerStart(_) | Error::Store(_)
        )
    }
}
