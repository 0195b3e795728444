use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::model::RecordId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Failed to enumerate {}: {source}", path.display())]
    Enumeration {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Failures of the key-value storage behind the calibration store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("quota exceeded writing '{key}': {needed} bytes needed, quota is {quota}")]
    QuotaExceeded {
        key: String,
        needed: usize,
        quota: usize,
    },

    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed stored value: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A single file could not be hashed. The batch carries on without it.
#[derive(Error, Debug)]
#[error("failed to hash '{path}': {source}")]
pub struct HashError {
    pub record_id: RecordId,
    pub path: String,
    #[source]
    pub source: std::io::Error,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("hash worker channel disconnected")]
    Disconnected,

    #[error("hash worker did not answer a health check within {waited:?}")]
    Unresponsive { waited: Duration },

    #[error("failed to spawn hash worker: {0}")]
    SpawnFailed(String),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to read source for upload: {0}")]
    Read(#[source] std::io::Error),

    #[error("upload destination rejected the file: {0}")]
    Rejected(String),

    #[error("upload IO error: {0}")]
    Io(#[from] std::io::Error),
}
