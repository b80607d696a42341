//! Chunk Backup Library
//!
//! Chunked block-volume backup into an object store, with block-level
//! incremental backups and restore of a full-plus-incrementals chain.

pub mod catalog;
pub mod config;
pub mod daemon;
pub mod events;
pub mod executor;
pub mod model;
pub mod restore;
pub mod storage;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupEngine, BackupOptions, BackupOutcome};
pub use model::{Backup, BackupStatus, SharedBackup};
pub use restore::RestoreEngine;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
