//! Chunk Backup - Command line entry point
//!
//! Backs up block volumes (files or devices) into a local object store and
//! restores any backup of a chain.

use anyhow::{bail, Context, Result};
use chunk_backup::catalog::Catalog;
use chunk_backup::config::Config;
use chunk_backup::daemon::ShutdownCoordinator;
use chunk_backup::events::{BackupEvent, EventBus};
use chunk_backup::executor::{BackupEngine, BackupOptions, BackupOutcome};
use chunk_backup::restore::RestoreEngine;
use chunk_backup::storage::LocalObjectStore;
use chunk_backup::transfer::{format_bytes, format_duration};
use chunk_backup::{utils, Backup};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Store directory (overrides config)
    #[arg(short, long, value_name = "DIR")]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up a volume
    Backup {
        /// Volume file or block device
        #[arg(long, value_name = "PATH")]
        volume: PathBuf,

        #[arg(long)]
        volume_id: String,

        /// Volume size in bytes (required for block devices)
        #[arg(long)]
        size: Option<u64>,

        /// Incremental backup on top of this backup
        #[arg(long, conflicts_with = "incremental")]
        parent: Option<String>,

        /// Incremental backup on top of the latest available backup of the volume
        #[arg(long)]
        incremental: bool,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,
    },

    /// Restore a backup into a file or device
    Restore {
        #[arg(long)]
        backup: String,

        #[arg(long, value_name = "PATH")]
        target: PathBuf,
    },

    /// Delete a backup and its objects
    Delete {
        #[arg(long)]
        backup: String,
    },

    /// List known backups
    List {
        #[arg(long)]
        volume_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    if let Some(store) = args.store {
        config.store.path = store;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let store = Arc::new(LocalObjectStore::new(config.store.path.join("objects")));
    let mut catalog = Catalog::open(config.store.path.join("catalog.json")).await?;

    let events = EventBus::new();
    let logger = tokio::spawn(log_events(events.subscribe()));

    let result = match args.command {
        Command::Backup {
            volume,
            volume_id,
            size,
            parent,
            incremental,
            name,
            description,
        } => {
            let engine = BackupEngine::new(store, config.backup.clone(), events.clone());
            let request = BackupRequest {
                volume,
                volume_id,
                size,
                parent,
                incremental,
                name,
                description,
            };
            run_backup(&engine, &mut catalog, request).await
        }
        Command::Restore { backup, target } => {
            let engine = RestoreEngine::new(store, config.restore.clone(), events.clone());
            run_restore(&engine, &catalog, &backup, &target).await
        }
        Command::Delete { backup } => {
            let engine = BackupEngine::new(store, config.backup.clone(), events.clone());
            run_delete(&engine, &mut catalog, &backup).await
        }
        Command::List { volume_id } => {
            print_backups(&catalog, volume_id.as_deref());
            Ok(())
        }
    };

    // Let the logger drain
    drop(events);
    let _ = logger.await;

    result
}

struct BackupRequest {
    volume: PathBuf,
    volume_id: String,
    size: Option<u64>,
    parent: Option<String>,
    incremental: bool,
    name: Option<String>,
    description: Option<String>,
}

async fn run_backup(
    engine: &BackupEngine,
    catalog: &mut Catalog,
    request: BackupRequest,
) -> Result<()> {
    // Nothing reaches the catalog until the volume is readable
    let volume = tokio::fs::File::open(&request.volume)
        .await
        .with_context(|| format!("Failed to open {}", request.volume.display()))?;

    let size = match request.size {
        Some(size) => size,
        None => volume
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", request.volume.display()))?
            .len(),
    };

    let parent = if let Some(parent_id) = &request.parent {
        Some(catalog.require(parent_id)?.clone())
    } else if request.incremental {
        match catalog.latest_available(&request.volume_id) {
            Some(parent) => Some(parent.clone()),
            None => bail!(
                "Volume {} has no available backup to build an incremental on",
                request.volume_id
            ),
        }
    } else {
        None
    };

    let mut record = Backup::new(request.volume_id, size);
    record.parent_id = parent.as_ref().map(|p| p.id.clone());
    record.name = request.name;
    record.description = request.description;
    catalog.insert(record.clone());
    catalog.save().await?;

    // Ctrl-C marks the backup DELETING; the engine then cancels and cleans up
    let shared = record.shared();
    let coordinator = Arc::new(ShutdownCoordinator::new());
    let watch = coordinator.cancel_on_shutdown(shared.clone());
    let signals = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.wait_for_signal().await })
    };

    let outcome = engine
        .backup(&shared, parent.as_ref(), volume, BackupOptions::default())
        .await;

    signals.abort();
    watch.abort();

    let record = shared.read().await.clone();
    match outcome {
        Ok(BackupOutcome::Completed(summary)) => {
            catalog.insert(record);
            catalog.save().await?;
            tracing::info!(
                "Backup {} available: {} objects, {} changed, {} stored in {}",
                summary.backup_id,
                summary.object_count,
                format_bytes(summary.changed_bytes),
                format_bytes(summary.stored_bytes),
                format_duration(summary.duration_secs)
            );
            Ok(())
        }
        Ok(BackupOutcome::Cancelled { objects_removed }) => {
            catalog.remove(&record.id);
            catalog.save().await?;
            tracing::warn!(
                "Backup {} cancelled, {} objects removed",
                record.id,
                objects_removed
            );
            Ok(())
        }
        Err(e) => {
            catalog.insert(record);
            catalog.save().await?;
            Err(e.into())
        }
    }
}

async fn run_restore(
    engine: &RestoreEngine,
    catalog: &Catalog,
    backup_id: &str,
    target: &Path,
) -> Result<()> {
    let chain = catalog.chain(backup_id)?;

    let mut dest = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(target)
        .await
        .with_context(|| format!("Failed to open {}", target.display()))?;

    let summary = engine.restore(&chain, &mut dest).await?;
    tracing::info!(
        "Restored backup {} ({} in chain, {}) to {}",
        summary.backup_id,
        summary.chain_length,
        format_bytes(summary.restored_bytes),
        target.display()
    );
    Ok(())
}

async fn run_delete(engine: &BackupEngine, catalog: &mut Catalog, backup_id: &str) -> Result<()> {
    let record = catalog.require(backup_id)?.clone();

    let children = catalog.children(backup_id);
    if !children.is_empty() {
        let ids: Vec<&str> = children.iter().map(|b| b.id.as_str()).collect();
        bail!(
            "Backup {} has dependent incremental backups: {}",
            backup_id,
            ids.join(", ")
        );
    }

    let shared = record.shared();
    let result = engine.delete_backup(&shared).await;
    let record = shared.read().await.clone();

    match result {
        Ok(removed) => {
            catalog.remove(backup_id);
            catalog.save().await?;
            tracing::info!("Deleted backup {} ({} objects)", backup_id, removed);
            Ok(())
        }
        Err(e) => {
            catalog.insert(record);
            catalog.save().await?;
            Err(e.into())
        }
    }
}

fn print_backups(catalog: &Catalog, volume_id: Option<&str>) {
    let backups = catalog.list(volume_id);
    if backups.is_empty() {
        println!("No backups");
        return;
    }

    println!(
        "{:<36}  {:<20}  {:<11}  {:<9}  {:>10}  {:>7}  {:<36}  CREATED",
        "ID", "VOLUME", "TYPE", "STATUS", "SIZE", "OBJECTS", "PARENT"
    );
    for backup in backups {
        println!(
            "{:<36}  {:<20}  {:<11}  {:<9}  {:>10}  {:>7}  {:<36}  {}",
            backup.id,
            backup.volume_id,
            if backup.is_incremental() { "incremental" } else { "full" },
            backup.status,
            format_bytes(backup.size),
            backup.object_count,
            backup.parent_id.as_deref().unwrap_or("-"),
            backup.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

/// Forward engine events to the log until every sender is gone.
async fn log_events(mut rx: broadcast::Receiver<BackupEvent>) {
    loop {
        match rx.recv().await {
            Ok(BackupEvent::BackupProgress(progress)) => tracing::info!(
                "Backup {}: {:.1}% ({} of {}, {})",
                progress.backup_id,
                progress.percent,
                format_bytes(progress.processed_bytes),
                format_bytes(progress.total_bytes),
                progress.speed
            ),
            Ok(BackupEvent::RestoreProgress {
                backup_id, percent, ..
            }) => tracing::debug!("Restore {}: {:.1}%", backup_id, percent),
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!("Event: {}", json),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event log skipped {} events", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunk_backup::config::BackupConfig;
    use chunk_backup::BackupStatus;

    fn request(volume: PathBuf, parent: Option<String>) -> BackupRequest {
        BackupRequest {
            volume,
            volume_id: "vol".to_string(),
            size: None,
            parent,
            incremental: false,
            name: None,
            description: None,
        }
    }

    fn engine(dir: &Path) -> BackupEngine {
        let config = BackupConfig {
            chunk_size_bytes: 8,
            block_size_bytes: 4,
            progress_timer: false,
            ..BackupConfig::default()
        };
        let store = Arc::new(LocalObjectStore::new(dir.join("objects")));
        BackupEngine::new(store, config, EventBus::new())
    }

    #[tokio::test]
    async fn test_unreadable_volume_is_not_cataloged() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("catalog.json");
        let mut catalog = Catalog::open(&catalog_path).await.unwrap();

        let missing = dir.path().join("missing.img");
        let result = run_backup(&engine(dir.path()), &mut catalog, request(missing, None)).await;

        assert!(result.is_err());
        assert!(catalog.list(None).is_empty());
        assert!(!catalog_path.exists());
    }

    #[tokio::test]
    async fn test_backup_is_cataloged_as_available() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("volume.img");
        std::fs::write(&volume, (0u8..24).collect::<Vec<_>>()).unwrap();
        let mut catalog = Catalog::open(dir.path().join("catalog.json")).await.unwrap();
        let engine = engine(dir.path());

        run_backup(&engine, &mut catalog, request(volume.clone(), None))
            .await
            .unwrap();
        let full = catalog.list(None)[0].clone();
        assert_eq!(full.status, BackupStatus::Available);
        assert_eq!(full.size, 24);
        assert_eq!(full.object_count, 3);

        run_backup(&engine, &mut catalog, request(volume, Some(full.id.clone())))
            .await
            .unwrap();
        let children = catalog.children(&full.id);
        assert_eq!(children.len(), 1);
        assert!(children[0].is_incremental());
        assert_eq!(children[0].object_count, 0);

        // A backup with dependents cannot be deleted
        assert!(run_delete(&engine, &mut catalog, &full.id).await.is_err());
    }
}
