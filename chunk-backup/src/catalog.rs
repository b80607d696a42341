//! Backup catalog - the set of known backup records.
//!
//! Records are kept in a single JSON file next to the object store. Saving
//! writes a temporary file and renames it over the old one, so a crash never
//! leaves a half-written catalog.

use crate::model::{Backup, BackupStatus};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    backups: Vec<Backup>,
}

pub struct Catalog {
    path: PathBuf,
    backups: BTreeMap<String, Backup>,
}

impl Catalog {
    /// Load the catalog at `path`. A missing file is an empty catalog.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file: CatalogFile = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogFile::default(),
            Err(e) => return Err(e.into()),
        };

        let backups = file
            .backups
            .into_iter()
            .map(|backup| (backup.id.clone(), backup))
            .collect::<BTreeMap<_, _>>();
        debug!("Loaded {} backups from {}", backups.len(), path.display());

        Ok(Self { path, backups })
    }

    /// Persist all records.
    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = CatalogFile {
            backups: self.backups.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Add a record or replace the one with the same id.
    pub fn insert(&mut self, backup: Backup) {
        self.backups.insert(backup.id.clone(), backup);
    }

    pub fn remove(&mut self, id: &str) -> Option<Backup> {
        self.backups.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Backup> {
        self.backups.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&Backup> {
        self.get(id)
            .ok_or_else(|| BackupError::NotFound(format!("backup {}", id)))
    }

    /// Records, oldest first, optionally for one volume.
    pub fn list(&self, volume_id: Option<&str>) -> Vec<&Backup> {
        let mut backups: Vec<&Backup> = self
            .backups
            .values()
            .filter(|b| volume_id.map_or(true, |v| b.volume_id == v))
            .collect();
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        backups
    }

    /// Backups whose parent is `id`.
    pub fn children(&self, id: &str) -> Vec<&Backup> {
        self.backups
            .values()
            .filter(|b| b.parent_id.as_deref() == Some(id))
            .collect()
    }

    /// The chain ending at `target`, root full backup first.
    pub fn chain(&self, target: &str) -> Result<Vec<Backup>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(target.to_string());

        while let Some(id) = next {
            if !seen.insert(id.clone()) {
                return Err(BackupError::Integrity(format!(
                    "backup chain of {} loops at {}",
                    target, id
                )));
            }
            let backup = self.require(&id)?;
            next = backup.parent_id.clone();
            chain.push(backup.clone());
        }

        chain.reverse();
        Ok(chain)
    }

    /// Newest AVAILABLE backup of a volume, the natural parent for an incremental.
    pub fn latest_available(&self, volume_id: &str) -> Option<&Backup> {
        self.list(Some(volume_id))
            .into_iter()
            .filter(|b| b.status == BackupStatus::Available)
            .next_back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn backup(id: &str, volume: &str, parent: Option<&str>, age_secs: i64) -> Backup {
        let mut backup = Backup::new(volume, 1024);
        backup.id = id.to_string();
        backup.parent_id = parent.map(str::to_string);
        backup.status = BackupStatus::Available;
        backup.created_at -= Duration::seconds(age_secs);
        backup
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.json")).await.unwrap();
        assert!(catalog.list(None).is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.json");

        let mut catalog = Catalog::open(&path).await.unwrap();
        catalog.insert(backup("a", "vol", None, 10));
        catalog.insert(backup("b", "vol", Some("a"), 5));
        catalog.save().await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = Catalog::open(&path).await.unwrap();
        assert_eq!(reopened.list(None).len(), 2);
        assert_eq!(reopened.require("b").unwrap().parent_id.as_deref(), Some("a"));
        assert!(matches!(reopened.require("zzz"), Err(BackupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_chain_and_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path().join("c.json")).await.unwrap();
        catalog.insert(backup("full", "vol", None, 30));
        catalog.insert(backup("inc1", "vol", Some("full"), 20));
        catalog.insert(backup("inc2", "vol", Some("inc1"), 10));
        catalog.insert(backup("other", "vol-2", None, 5));

        let ids: Vec<_> = catalog
            .chain("inc2")
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["full", "inc1", "inc2"]);

        assert_eq!(catalog.children("full").len(), 1);
        assert!(catalog.children("inc2").is_empty());
        assert_eq!(catalog.list(Some("vol")).len(), 3);
        assert_eq!(catalog.latest_available("vol").unwrap().id, "inc2");

        catalog.insert(backup("dangling", "vol", Some("gone"), 1));
        assert!(matches!(catalog.chain("dangling"), Err(BackupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_chain_loop_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path().join("c.json")).await.unwrap();
        catalog.insert(backup("x", "vol", Some("y"), 2));
        catalog.insert(backup("y", "vol", Some("x"), 1));

        assert!(matches!(catalog.chain("x"), Err(BackupError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_latest_available_skips_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::open(dir.path().join("c.json")).await.unwrap();
        catalog.insert(backup("old", "vol", None, 20));
        let mut failed = backup("new", "vol", None, 1);
        failed.status = BackupStatus::Error;
        catalog.insert(failed);

        assert_eq!(catalog.latest_available("vol").unwrap().id, "old");
        assert!(catalog.latest_available("nope").is_none());
    }
}
