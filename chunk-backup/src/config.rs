//! Configuration management for backup and restore.
//!
//! Loaded from a TOML file; every field has a default so a partial file (or
//! none at all) is valid. Engines receive their section explicitly.

use crate::sync::Compression;
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Compression algorithm (none, zlib, bz2, zstd)
    #[serde(default)]
    pub compression: Compression,

    /// Bytes read from the volume per iteration
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    /// Digest block size; must divide `chunk_size_bytes`
    #[serde(default = "default_block_size")]
    pub block_size_bytes: usize,

    /// Seconds between timer-driven progress notifications
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Enable the timer-driven progress notifications
    #[serde(default = "default_true")]
    pub progress_timer: bool,

    /// Chunks processed between count-driven progress notifications
    #[serde(default = "default_objects_per_notification")]
    pub objects_per_notification: u64,

    /// Concurrent CPU jobs (hashing, compression)
    #[serde(default = "default_cpu_workers")]
    pub cpu_workers: usize,

    /// Container used when a backup does not name one
    #[serde(default = "default_container")]
    pub container: String,

    /// Zone recorded in generated object prefixes
    #[serde(default = "default_availability_zone")]
    pub availability_zone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Check each object's MD5 after decompression
    #[serde(default = "default_true")]
    pub verify_md5: bool,

    /// Concurrent CPU jobs (decompression, checksums)
    #[serde(default = "default_cpu_workers")]
    pub cpu_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of the local object store and backup catalog
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_chunk_size() -> usize {
    32 * 1024 * 1024 // 32MB
}

fn default_block_size() -> usize {
    crate::sync::digest::DEFAULT_BLOCK_SIZE
}

fn default_progress_interval() -> u64 {
    120
}

fn default_objects_per_notification() -> u64 {
    10
}

fn default_cpu_workers() -> usize {
    4
}

fn default_container() -> String {
    "volumebackups".to_string()
}

fn default_availability_zone() -> String {
    "nova".to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/chunk-backup")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            chunk_size_bytes: default_chunk_size(),
            block_size_bytes: default_block_size(),
            progress_interval_secs: default_progress_interval(),
            progress_timer: true,
            objects_per_notification: default_objects_per_notification(),
            cpu_workers: default_cpu_workers(),
            container: default_container(),
            availability_zone: default_availability_zone(),
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            verify_md5: true,
            cpu_workers: default_cpu_workers(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BackupConfig {
    /// Check the chunk/block size relationship.
    pub fn validate(&self) -> Result<()> {
        if self.block_size_bytes == 0 || self.chunk_size_bytes == 0 {
            return Err(BackupError::InvalidBackup(format!(
                "chunk size {} and block size {} must be non-zero",
                self.chunk_size_bytes, self.block_size_bytes
            )));
        }
        if self.chunk_size_bytes % self.block_size_bytes != 0 {
            return Err(BackupError::InvalidBackup(format!(
                "chunk size {} is not a multiple of block size {}",
                self.chunk_size_bytes, self.block_size_bytes
            )));
        }
        Ok(())
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.backup.validate().unwrap();
        assert_eq!(config.backup.compression, Compression::Zlib);
        assert_eq!(config.backup.progress_interval(), Duration::from_secs(120));
        assert!(config.restore.verify_md5);
    }

    #[test]
    fn test_partial_file() {
        let config = Config::from_toml(
            r#"
            [backup]
            compression = "bzip2"
            chunk_size_bytes = 8192
            block_size_bytes = 4096

            [store]
            path = "/tmp/repo"
            "#,
        )
        .unwrap();

        assert_eq!(config.backup.compression, Compression::Bz2);
        assert_eq!(config.backup.chunk_size_bytes, 8192);
        assert_eq!(config.backup.objects_per_notification, 10);
        assert_eq!(config.store.path, PathBuf::from("/tmp/repo"));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_ratio_validation() {
        let mut backup = BackupConfig {
            chunk_size_bytes: 10_000,
            block_size_bytes: 4096,
            ..BackupConfig::default()
        };
        assert!(matches!(backup.validate(), Err(BackupError::InvalidBackup(_))));

        backup.block_size_bytes = 0;
        assert!(matches!(backup.validate(), Err(BackupError::InvalidBackup(_))));

        backup.block_size_bytes = 2500;
        backup.validate().unwrap();
    }

    #[test]
    fn test_unknown_compression_is_rejected() {
        assert!(Config::from_toml("[backup]\ncompression = \"lz4\"").is_err());
    }

    #[test]
    fn test_empty_file() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.backup.container, "volumebackups");
    }
}
