//! Error taxonomy for the sync pipeline.
//!
//! Per-task and per-path errors never abort the daemon; only configuration
//! and metadata-store initialisation failures are process-fatal.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Network failure, timeout or any non-zero exit the tool may recover from.
    #[error("transfer of {path} to {target} failed: {message}")]
    TransientTransfer {
        target: String,
        path: String,
        message: String,
    },

    /// Failure that retrying will not fix (authentication, unknown module).
    #[error("transfer of {path} to {target} failed permanently: {message}")]
    PermanentTransfer {
        target: String,
        path: String,
        message: String,
    },

    #[error("filter evaluation failed for {path}: {reason}")]
    FilterEvaluation { path: String, reason: String },

    #[error("metadata for {path} is corrupt: {reason}")]
    MetadataCorruption { path: String, reason: String },

    #[error("conflict on {path} requires manual resolution")]
    ConflictUnresolvable { path: String },

    #[error("failed to write backup of {path} to {backup}: {source}")]
    BackupWrite {
        path: String,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("metadata store at {path} could not be initialised: {reason}")]
    MetadataStoreInit { path: PathBuf, reason: String },

    #[error("I/O error while {operation} {path}: {source}")]
    Io {
        path: PathBuf,
        operation: String,
        #[source]
        source: io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl SyncError {
    /// Attach the operation and path to an `io::Error`.
    pub fn io(source: io::Error, operation: &str, path: impl Into<PathBuf>) -> Self {
        SyncError::Io {
            path: path.into(),
            operation: operation.to_string(),
            source,
        }
    }

    /// Whether the fail log should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientTransfer { .. } | SyncError::Io { .. })
    }

    /// Whether the error must stop the daemon.
    pub fn is_process_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_) | SyncError::MetadataStoreInit { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
