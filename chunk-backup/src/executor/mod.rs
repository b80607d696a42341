//! Backup engine - Orchestrates one backup of a volume.
//!
//! A backup is a single sequential pass over the volume:
//! - PREPARE: validate sizes, load the parent's digest list, allocate names
//! - STREAMING: read a chunk, hash its blocks, store the whole chunk (full)
//!   or only its dirty runs (incremental), record every stored object
//! - FINALIZING: write the manifest and digest list, mark the backup AVAILABLE
//!
//! The loop polls the backup record once per chunk; a record marked DELETING
//! cancels the backup and removes everything written so far. Any failure
//! after the first object is written also removes what was written.

pub mod canonical;
pub mod manifest;

use crate::config::BackupConfig;
use crate::events::{BackupEvent, EventBus, ProgressTrigger};
use crate::model::{Backup, BackupStatus, SharedBackup};
use crate::storage::{put_object, ObjectStore};
use crate::sync::{
    block_count, block_digests, choose_codec, dirty_bytes, dirty_ranges, Compression,
};
use crate::transfer::timer::ProgressReporter;
use crate::transfer::{format_bytes, format_duration, ProgressCounters, ProgressTimer};
use crate::utils::pool::CpuPool;
use crate::{BackupError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use manifest::{
    chunk_name_prefix, chunk_object_name, digest_object_name, format_created_at,
    metadata_object_name, read_digestlist, read_manifest, write_digestlist, write_manifest,
    ChunkObject, DigestList, Manifest, MANIFEST_VERSION,
};
use md5::{Digest, Md5};
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};

/// Stages of a backup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    Prepare,
    Streaming,
    Finalizing,
    Done,
    Cancelled,
    Failed,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupPhase::Prepare => "PREPARE",
            BackupPhase::Streaming => "STREAMING",
            BackupPhase::Finalizing => "FINALIZING",
            BackupPhase::Done => "DONE",
            BackupPhase::Cancelled => "CANCELLED",
            BackupPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Caller-supplied metadata recorded in the manifest.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Opaque volume metadata (stored as `volume_meta`)
    pub volume_meta: Option<String>,
    /// Passed to the object store with every write and stored in the manifest
    pub extra_metadata: Option<serde_json::Value>,
}

/// Backup execution result
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub backup_id: String,
    pub incremental: bool,
    pub object_count: u64,
    /// Bytes read from the volume
    pub processed_bytes: u64,
    /// Uncompressed bytes stored as chunk objects
    pub changed_bytes: u64,
    /// Bytes written to the store after compression
    pub stored_bytes: u64,
    pub duration_secs: u64,
}

#[derive(Debug)]
pub enum BackupOutcome {
    Completed(BackupSummary),
    /// The backup record was marked for deletion while streaming
    Cancelled { objects_removed: usize },
}

/// Everything resolved during PREPARE.
struct Plan {
    backup_id: String,
    volume_id: String,
    size: u64,
    container: String,
    prefix: String,
    parent_id: Option<String>,
    parent_digests: Option<Vec<String>>,
    name: Option<String>,
    description: Option<String>,
    created_at: DateTime<Utc>,
}

/// Objects and digests produced while streaming.
struct Written {
    /// Every object name a write was attempted for, for cleanup
    names: Vec<String>,
    objects: Vec<ChunkObject>,
    digests: Vec<String>,
    next_seq: u64,
}

impl Written {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            objects: Vec::new(),
            digests: Vec::new(),
            next_seq: 1,
        }
    }
}

enum Streamed {
    Finished,
    Cancelled,
}

/// Main backup engine
pub struct BackupEngine {
    store: Arc<dyn ObjectStore>,
    config: BackupConfig,
    pool: CpuPool,
    events: EventBus,
}

impl BackupEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: BackupConfig, events: EventBus) -> Self {
        let pool = CpuPool::new(config.cpu_workers);
        Self {
            store,
            config,
            pool,
            events,
        }
    }

    /// Back up `volume` into the store.
    ///
    /// `parent` must be the record named by the backup's `parent_id` for an
    /// incremental backup, and `None` for a full one. The backup record is
    /// updated in place: container and prefix during prepare, then
    /// `object_count` and status at the end.
    pub async fn backup<R>(
        &self,
        backup: &SharedBackup,
        parent: Option<&Backup>,
        volume: R,
        options: BackupOptions,
    ) -> Result<BackupOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let start_time = Instant::now();
        let backup_id = backup.read().await.id.clone();

        info!("Backup {}: {}", backup_id, BackupPhase::Prepare);
        let plan = match self.prepare(backup, parent).await {
            Ok(plan) => plan,
            Err(e) => {
                error!("Backup {} rejected: {}", backup_id, e);
                self.fail(backup, &backup_id, &e).await;
                return Err(e);
            }
        };

        let incremental = plan.parent_digests.is_some();
        info!(
            "Backup {}: {} ({} backup of volume {}, {}, prefix {})",
            backup_id,
            BackupPhase::Streaming,
            if incremental { "incremental" } else { "full" },
            plan.volume_id,
            format_bytes(plan.size),
            plan.prefix
        );
        self.events.emit(BackupEvent::BackupStarted {
            backup_id: backup_id.clone(),
            volume_id: plan.volume_id.clone(),
            incremental,
        });

        let counters = Arc::new(ProgressCounters::new());
        let reporter = Arc::new(ProgressReporter::new(
            self.events.clone(),
            backup_id.clone(),
            plan.volume_id.clone(),
            plan.size,
            Arc::clone(&counters),
        ));
        let timer = if self.config.progress_timer {
            ProgressTimer::start(self.config.progress_interval(), Arc::clone(&reporter))
        } else {
            ProgressTimer::disabled()
        };

        let mut written = Written::new();
        let streamed = self
            .stream(backup, &plan, volume, &reporter, &mut written, &options)
            .await;

        // The timer must not outlive the loop, whatever the outcome
        timer.stop().await;

        match streamed {
            Ok(Streamed::Finished) => {}
            Ok(Streamed::Cancelled) => {
                let objects_removed = self.remove_objects(&plan.container, &written.names).await;
                info!(
                    "Backup {}: {} ({} objects removed)",
                    backup_id,
                    BackupPhase::Cancelled,
                    objects_removed
                );
                self.events.emit(BackupEvent::BackupCancelled {
                    backup_id,
                    objects_removed,
                });
                return Ok(BackupOutcome::Cancelled { objects_removed });
            }
            Err(e) => {
                error!("Backup {} failed while streaming: {}", backup_id, e);
                self.remove_objects(&plan.container, &written.names).await;
                self.fail(backup, &backup_id, &e).await;
                return Err(e);
            }
        }

        info!("Backup {}: {}", backup_id, BackupPhase::Finalizing);
        let object_count = written.objects.len() as u64;
        let objects = std::mem::take(&mut written.objects);
        let digests = std::mem::take(&mut written.digests);

        if let Err(e) = self.finalize(&plan, objects, digests, &options).await {
            error!("Backup {} failed to persist metadata: {}", backup_id, e);
            let mut names = written.names;
            names.push(metadata_object_name(&plan.prefix));
            names.push(digest_object_name(&plan.prefix));
            self.remove_objects(&plan.container, &names).await;
            self.fail(backup, &backup_id, &e).await;
            return Err(e);
        }

        {
            let mut record = backup.write().await;
            record.object_count = object_count;
            record.status = BackupStatus::Available;
        }

        let snap = counters.snapshot();
        let duration_secs = start_time.elapsed().as_secs();
        info!(
            "Backup {}: {} ({} objects, {} changed, {} stored, {})",
            backup_id,
            BackupPhase::Done,
            object_count,
            format_bytes(snap.changed_bytes),
            format_bytes(snap.stored_bytes),
            format_duration(duration_secs)
        );
        self.events.emit(BackupEvent::BackupCompleted {
            backup_id: backup_id.clone(),
            object_count,
            changed_bytes: snap.changed_bytes,
            stored_bytes: snap.stored_bytes,
        });

        Ok(BackupOutcome::Completed(BackupSummary {
            backup_id,
            incremental,
            object_count,
            processed_bytes: snap.processed_bytes,
            changed_bytes: snap.changed_bytes,
            stored_bytes: snap.stored_bytes,
            duration_secs,
        }))
    }

    /// Remove every object of a backup and mark it DELETED.
    ///
    /// Returns the number of objects deleted. A backup that never got a
    /// container or prefix has nothing to remove.
    pub async fn delete_backup(&self, backup: &SharedBackup) -> Result<usize> {
        let (backup_id, container, prefix) = {
            let mut record = backup.write().await;
            record.status = BackupStatus::Deleting;
            (record.id.clone(), record.container.clone(), record.prefix.clone())
        };

        let removed = match (container, prefix) {
            (Some(container), Some(prefix)) => {
                match self.delete_backup_objects(&container, &prefix).await {
                    Ok(removed) => removed,
                    Err(e) => {
                        error!("Failed to delete backup {}: {}", backup_id, e);
                        backup.write().await.status = BackupStatus::Error;
                        return Err(e);
                    }
                }
            }
            _ => 0,
        };

        backup.write().await.status = BackupStatus::Deleted;
        info!("Deleted backup {} ({} objects)", backup_id, removed);
        Ok(removed)
    }

    async fn delete_backup_objects(&self, container: &str, prefix: &str) -> Result<usize> {
        let entries = match self.store.get_container_entries(container, prefix).await {
            Ok(entries) => entries,
            Err(BackupError::NotFound(_)) => BTreeSet::new(),
            Err(e) => return Err(e),
        };

        let chunk_prefix = chunk_name_prefix(prefix);
        let metadata = metadata_object_name(prefix);
        let digests = digest_object_name(prefix);
        let owned = entries.iter().filter(|name| {
            name.starts_with(&chunk_prefix) || **name == metadata || **name == digests
        });

        let mut removed = 0;
        for name in owned {
            self.store.delete_object(container, name).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn prepare(&self, backup: &SharedBackup, parent: Option<&Backup>) -> Result<Plan> {
        self.config.validate()?;
        let record = backup.read().await.clone();

        if record.size == 0 {
            return Err(BackupError::InvalidVolume(format!(
                "volume {} has size 0",
                record.volume_id
            )));
        }

        let parent_digests = match (&record.parent_id, parent) {
            (None, None) => None,
            (Some(parent_id), Some(parent)) if *parent_id == parent.id => {
                Some(self.load_parent(&record, parent).await?)
            }
            (Some(parent_id), Some(parent)) => {
                return Err(BackupError::InvalidBackup(format!(
                    "parent_id {} does not match supplied parent {}",
                    parent_id, parent.id
                )))
            }
            (Some(parent_id), None) => {
                return Err(BackupError::InvalidBackup(format!(
                    "parent backup {} was not supplied",
                    parent_id
                )))
            }
            (None, Some(parent)) => {
                return Err(BackupError::InvalidBackup(format!(
                    "full backup supplied with parent {}",
                    parent.id
                )))
            }
        };

        let container = record
            .container
            .clone()
            .unwrap_or_else(|| self.config.container.clone());
        let prefix = record.prefix.clone().unwrap_or_else(|| {
            generate_prefix(&record, &self.config.availability_zone, Utc::now())
        });

        self.store.put_container(&container).await?;
        {
            let mut shared = backup.write().await;
            shared.container = Some(container.clone());
            shared.prefix = Some(prefix.clone());
        }

        Ok(Plan {
            backup_id: record.id,
            volume_id: record.volume_id,
            size: record.size,
            container,
            prefix,
            parent_id: record.parent_id,
            parent_digests,
            name: record.name,
            description: record.description,
            created_at: record.created_at,
        })
    }

    /// Validate the parent and return its digest list.
    async fn load_parent(&self, record: &Backup, parent: &Backup) -> Result<Vec<String>> {
        if parent.status != BackupStatus::Available {
            return Err(BackupError::InvalidBackup(format!(
                "parent backup {} is {}, not AVAILABLE",
                parent.id, parent.status
            )));
        }
        if parent.volume_id != record.volume_id {
            return Err(BackupError::InvalidBackup(format!(
                "parent backup {} belongs to volume {}, not {}",
                parent.id, parent.volume_id, record.volume_id
            )));
        }
        if record.size > parent.size {
            return Err(BackupError::InvalidBackup(format!(
                "volume grew since parent backup {} ({} > {} bytes), do a full backup",
                parent.id, record.size, parent.size
            )));
        }

        let (container, prefix) = match (&parent.container, &parent.prefix) {
            (Some(container), Some(prefix)) => (container, prefix),
            _ => {
                return Err(BackupError::InvalidBackup(format!(
                    "parent backup {} has no stored objects",
                    parent.id
                )))
            }
        };

        let digests = read_digestlist(self.store.as_ref(), container, prefix).await?;
        if digests.block_size() != self.config.block_size_bytes {
            return Err(BackupError::InvalidBackup(format!(
                "block size {} differs from parent backup {} block size {}, do a full backup",
                self.config.block_size_bytes,
                parent.id,
                digests.block_size()
            )));
        }

        let expected = block_count(parent.size, digests.block_size());
        if digests.sha256s.len() as u64 != expected {
            return Err(BackupError::InvalidBackup(format!(
                "digest list of parent backup {} has {} digests, expected {}",
                parent.id,
                digests.sha256s.len(),
                expected
            )));
        }

        let manifest = read_manifest(self.store.as_ref(), container, prefix).await?;
        if manifest.backup_id != parent.id || digests.backup_id != parent.id {
            return Err(BackupError::InvalidBackup(format!(
                "metadata under {} does not belong to parent backup {}",
                prefix, parent.id
            )));
        }

        debug!(
            "Loaded parent {}: {} digests, {} objects ({})",
            parent.id,
            digests.sha256s.len(),
            manifest.objects.len(),
            format_bytes(manifest.changed_bytes())
        );
        Ok(digests.sha256s)
    }

    async fn stream<R>(
        &self,
        backup: &SharedBackup,
        plan: &Plan,
        volume: R,
        reporter: &ProgressReporter,
        written: &mut Written,
        options: &BackupOptions,
    ) -> Result<Streamed>
    where
        R: AsyncRead + Unpin + Send,
    {
        let chunk_size = self.config.chunk_size_bytes;
        let block_size = self.config.block_size_bytes;
        let notify_every = self.config.objects_per_notification;
        let mut volume = volume.take(plan.size);
        let mut offset = 0u64;

        loop {
            let status = backup.read().await.status;
            if status.is_cancelled() {
                info!(
                    "Backup {} is {}, stopping at offset {}",
                    plan.backup_id, status, offset
                );
                return Ok(Streamed::Cancelled);
            }

            let chunk = read_chunk(&mut volume, chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            let data = Bytes::from(chunk);
            let len = data.len();

            let digests = {
                let data = data.clone();
                self.pool
                    .run(move || block_digests(&data, block_size))
                    .await?
            };

            let ranges = match &plan.parent_digests {
                None => vec![0..len],
                Some(parent) => {
                    let first_block = (offset / block_size as u64) as usize;
                    dirty_ranges(&digests, parent, first_block, block_size, len)
                }
            };

            if plan.parent_digests.is_some() {
                debug!(
                    "Chunk at offset {}: {} dirty runs, {} of {} bytes changed",
                    offset,
                    ranges.len(),
                    dirty_bytes(&ranges),
                    len
                );
            }

            for range in ranges {
                let object_offset = offset + range.start as u64;
                let object = data.slice(range);
                self.write_object(plan, object, object_offset, written, reporter, options)
                    .await?;
            }

            written.digests.extend(digests);
            offset += len as u64;

            let chunks = reporter.counters().add_chunk(len as u64);
            if notify_every > 0 && chunks % notify_every == 0 {
                reporter.report(ProgressTrigger::ChunkCount);
            }

            tokio::task::yield_now().await;
        }

        if offset < plan.size {
            warn!(
                "Volume {} ended after {} of {} bytes",
                plan.volume_id, offset, plan.size
            );
        }

        Ok(Streamed::Finished)
    }

    /// Compress, checksum and store one chunk object.
    async fn write_object(
        &self,
        plan: &Plan,
        data: Bytes,
        offset: u64,
        written: &mut Written,
        reporter: &ProgressReporter,
        options: &BackupOptions,
    ) -> Result<()> {
        let algorithm = self.config.compression;
        let length = data.len() as u64;

        let (compression, stored, md5) = self
            .pool
            .run(move || -> io::Result<(Compression, Bytes, String)> {
                let md5 = hex::encode(Md5::digest(&data));
                let (compression, stored) = choose_codec(data, algorithm)?;
                Ok((compression, stored, md5))
            })
            .await?
            .map_err(|e| BackupError::Compression(e.to_string()))?;

        let name = chunk_object_name(&plan.prefix, written.next_seq);
        written.next_seq += 1;
        written.names.push(name.clone());

        put_object(
            self.store.as_ref(),
            &plan.container,
            &name,
            &stored,
            options.extra_metadata.as_ref(),
        )
        .await?;

        debug!(
            "Stored {} at offset {} ({} bytes, {} as {})",
            name,
            offset,
            length,
            stored.len(),
            compression
        );
        reporter.counters().add_object(length, stored.len() as u64);

        written.objects.push(ChunkObject {
            name,
            offset,
            length,
            compression,
            md5,
        });
        Ok(())
    }

    async fn finalize(
        &self,
        plan: &Plan,
        objects: Vec<ChunkObject>,
        digests: Vec<String>,
        options: &BackupOptions,
    ) -> Result<()> {
        let created_at = format_created_at(plan.created_at);

        let manifest = Manifest {
            backup_description: plan.description.clone(),
            backup_id: plan.backup_id.clone(),
            backup_name: plan.name.clone(),
            created_at: created_at.clone(),
            extra_metadata: options.extra_metadata.clone(),
            objects,
            parent_id: plan.parent_id.clone(),
            version: MANIFEST_VERSION.to_string(),
            volume_id: plan.volume_id.clone(),
            volume_meta: options.volume_meta.clone(),
        };
        write_manifest(self.store.as_ref(), &plan.container, &plan.prefix, &manifest).await?;

        let digest_list = DigestList {
            backup_description: plan.description.clone(),
            backup_id: plan.backup_id.clone(),
            backup_name: plan.name.clone(),
            chunk_size: self.config.block_size_bytes,
            created_at,
            sha256s: digests,
            version: MANIFEST_VERSION.to_string(),
            volume_id: plan.volume_id.clone(),
        };
        write_digestlist(
            self.store.as_ref(),
            &plan.container,
            &plan.prefix,
            &digest_list,
            options.extra_metadata.as_ref(),
        )
        .await
    }

    /// Best-effort delete of `names`. Returns how many deletes succeeded.
    async fn remove_objects(&self, container: &str, names: &[String]) -> usize {
        let mut removed = 0;
        for name in names {
            match self.store.delete_object(container, name).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}/{}: {}", container, name, e),
            }
        }
        removed
    }

    async fn fail(&self, backup: &SharedBackup, backup_id: &str, e: &BackupError) {
        backup.write().await.status = BackupStatus::Error;
        info!("Backup {}: {}", backup_id, BackupPhase::Failed);
        self.events.emit(BackupEvent::BackupFailed {
            backup_id: backup_id.to_string(),
            error: e.to_string(),
        });
    }
}

/// Object-name namespace for a new backup.
pub fn generate_prefix(backup: &Backup, availability_zone: &str, at: DateTime<Utc>) -> String {
    format!(
        "volume_{}/{}/az_{}_backup_{}",
        backup.volume_id,
        at.format("%Y%m%d%H%M%S"),
        availability_zone,
        backup.id
    )
}

/// Read up to `chunk_size` bytes; a short or empty result means end of stream.
async fn read_chunk<R>(reader: &mut R, chunk_size: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(chunk_size);
    (&mut *reader)
        .take(chunk_size as u64)
        .read_to_end(&mut buf)
        .await?;
    Ok(buf)
}
