//! Durable per-script cursor storage.
//!
//! One checkpoint per script name holds the last sequence id whose batch finished. The poll
//! loop owning that name is the only writer. Loading never fails: anything unreadable is
//! treated as "no checkpoint", which makes the loop cold-start from the current time.
//!
//! Operations are synchronous file I/O; async callers run them on the blocking pool.

mod store;

pub use store::{CheckpointPolicy, FileCheckpointStore, MemoryCheckpointStore};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid script name for checkpoint: {0:?}")]
    InvalidScriptName(String),
}

/// Passive durable map from script name to last processed sequence id.
pub trait CheckpointStore: Send + Sync {
    /// Returns the persisted cursor, or `None` when absent, unreadable or not a valid id.
    fn load(&self, script_name: &str) -> Option<u64>;

    /// Durably replaces the cursor for `script_name`.
    fn save(&self, script_name: &str, sequence_id: u64) -> Result<(), CheckpointError>;
}

/// Script names become file names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_script_name(script_name: &str) -> Result<(), CheckpointError> {
    let valid = !script_name.is_empty()
        && script_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidScriptName(script_name.to_string()))
    }
}
