//! Error types for backup and restore operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// The backup cannot be taken or restored as configured.
    #[error("Invalid backup: {0}")]
    InvalidBackup(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    /// Stored data disagrees with its metadata. Never retried.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Unsupported metadata version: {0}")]
    UnsupportedVersion(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BackupError {
    /// True for errors raised while validating a request, before any object is written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BackupError::InvalidBackup(_) | BackupError::InvalidVolume(_) | BackupError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
