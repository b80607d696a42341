//! Backup records and their lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle status of a backup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    Creating,
    Available,
    Deleting,
    Deleted,
    Error,
}

impl BackupStatus {
    /// A backup in one of these states must stop streaming.
    pub fn is_cancelled(self) -> bool {
        matches!(self, BackupStatus::Deleting | BackupStatus::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Creating => "CREATING",
            BackupStatus::Available => "AVAILABLE",
            BackupStatus::Deleting => "DELETING",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single backup of a volume. Incremental backups point at their parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Logical bucket holding this backup's objects (allocated during prepare)
    #[serde(default)]
    pub container: Option<String>,
    /// Object-name namespace for this backup (allocated during prepare)
    #[serde(default)]
    pub prefix: Option<String>,
    pub volume_id: String,
    /// Volume size in bytes
    pub size: u64,
    pub status: BackupStatus,
    #[serde(default)]
    pub object_count: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Backup {
    /// Create a new record in `CREATING` state with a random id.
    pub fn new(volume_id: impl Into<String>, size: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            container: None,
            prefix: None,
            volume_id: volume_id.into(),
            size,
            status: BackupStatus::Creating,
            object_count: 0,
            name: None,
            description: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn is_incremental(&self) -> bool {
        self.parent_id.is_some()
    }

    /// Wrap the record so the engine and an external controller can share it.
    pub fn shared(self) -> SharedBackup {
        Arc::new(RwLock::new(self))
    }
}

/// Backup record shared between a running engine and whoever may cancel it.
///
/// The engine polls `status` once per chunk; setting it to `DELETING`
/// cancels the backup at the next poll.
pub type SharedBackup = Arc<RwLock<Backup>>;
