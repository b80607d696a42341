//! Restore engine - Rebuilds a volume from a chain of backups.
//!
//! The chain runs from the root full backup to the target, oldest first.
//! Before any byte reaches the destination every member is checked: status,
//! linkage, manifest ownership, and that the chunk objects in the store are
//! exactly the ones its manifest lists.

pub mod merge;
pub mod playback;

pub use merge::{merge_chain, ChainMember, Segment, SegmentMap};
pub use playback::{Playback, VolumeWriter};

use crate::config::RestoreConfig;
use crate::events::{BackupEvent, EventBus};
use crate::executor::manifest::{chunk_name_prefix, read_manifest};
use crate::model::{Backup, BackupStatus};
use crate::storage::ObjectStore;
use crate::transfer::format_bytes;
use crate::transfer::progress::percent_complete;
use crate::utils::pool::CpuPool;
use crate::{BackupError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Restore execution result
#[derive(Debug, Clone)]
pub struct RestoreSummary {
    pub backup_id: String,
    pub chain_length: usize,
    pub segments: usize,
    pub restored_bytes: u64,
}

pub struct RestoreEngine {
    store: Arc<dyn ObjectStore>,
    config: RestoreConfig,
    pool: CpuPool,
    events: EventBus,
}

impl RestoreEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: RestoreConfig, events: EventBus) -> Self {
        let pool = CpuPool::new(config.cpu_workers);
        Self {
            store,
            config,
            pool,
            events,
        }
    }

    /// Restore the last backup of `chain` into `dest`.
    ///
    /// Exactly `target.size` bytes are written on success. On failure the
    /// destination holds whatever was flushed before the error.
    pub async fn restore<W>(&self, chain: &[Backup], dest: &mut W) -> Result<RestoreSummary>
    where
        W: VolumeWriter,
    {
        let target = chain
            .last()
            .ok_or_else(|| BackupError::InvalidBackup("empty backup chain".to_string()))?;
        check_linkage(chain)?;

        let mut members = Vec::with_capacity(chain.len());
        for backup in chain {
            members.push(self.load_member(backup).await?);
        }

        let map = merge_chain(&members)?;
        info!(
            "Restoring backup {} of volume {}: {} backups, {} segments covering {} of {}",
            target.id,
            target.volume_id,
            chain.len(),
            map.len(),
            format_bytes(map.covered_bytes()),
            format_bytes(target.size)
        );
        self.events.emit(BackupEvent::RestoreStarted {
            backup_id: target.id.clone(),
            chain_length: chain.len(),
            segments: map.len(),
        });

        let playback = Playback::new(self.store.as_ref(), &self.pool, self.config.verify_md5);
        let restored_bytes = playback
            .play(&map, target.size, dest, |done| {
                self.events.emit(BackupEvent::RestoreProgress {
                    backup_id: target.id.clone(),
                    percent: percent_complete(done, target.size),
                    restored_bytes: done,
                    total_bytes: target.size,
                });
            })
            .await?;

        info!(
            "Restore of backup {} completed ({})",
            target.id,
            format_bytes(restored_bytes)
        );
        self.events.emit(BackupEvent::RestoreCompleted {
            backup_id: target.id.clone(),
            restored_bytes,
        });

        Ok(RestoreSummary {
            backup_id: target.id.clone(),
            chain_length: chain.len(),
            segments: map.len(),
            restored_bytes,
        })
    }

    /// Read a member's manifest and compare it with the store.
    async fn load_member(&self, backup: &Backup) -> Result<ChainMember> {
        if backup.status != BackupStatus::Available {
            return Err(BackupError::InvalidBackup(format!(
                "backup {} is {}, not AVAILABLE",
                backup.id, backup.status
            )));
        }
        let (container, prefix) = match (&backup.container, &backup.prefix) {
            (Some(container), Some(prefix)) => (container, prefix),
            _ => {
                return Err(BackupError::InvalidBackup(format!(
                    "backup {} has no stored objects",
                    backup.id
                )))
            }
        };

        let manifest = read_manifest(self.store.as_ref(), container, prefix).await?;
        if manifest.backup_id != backup.id || manifest.parent_id != backup.parent_id {
            return Err(BackupError::Integrity(format!(
                "manifest under {} belongs to backup {} (parent {:?}), expected {} (parent {:?})",
                prefix, manifest.backup_id, manifest.parent_id, backup.id, backup.parent_id
            )));
        }

        manifest.check_extents()?;

        let present = self
            .store
            .get_container_entries(container, &chunk_name_prefix(prefix))
            .await?;
        let listed: BTreeSet<String> = manifest.objects.iter().map(|o| o.name.clone()).collect();
        if present != listed {
            let missing: Vec<_> = listed.difference(&present).collect();
            let unexpected: Vec<_> = present.difference(&listed).collect();
            warn!(
                "Backup {} object mismatch: missing {:?}, unexpected {:?}",
                backup.id, missing, unexpected
            );
            return Err(BackupError::Integrity(format!(
                "backup {} has {} missing and {} unexpected objects",
                backup.id,
                missing.len(),
                unexpected.len()
            )));
        }

        Ok(ChainMember {
            container: container.clone(),
            manifest,
        })
    }
}

/// The root has no parent and every later member names its predecessor.
fn check_linkage(chain: &[Backup]) -> Result<()> {
    let mut expected_parent: Option<&str> = None;
    for backup in chain {
        if backup.parent_id.as_deref() != expected_parent {
            return Err(BackupError::InvalidBackup(format!(
                "backup {} has parent {:?}, expected {:?}",
                backup.id, backup.parent_id, expected_parent
            )));
        }
        expected_parent = Some(&backup.id);
    }
    Ok(())
}
