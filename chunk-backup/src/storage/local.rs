//! Object store backed by a local directory tree.
//!
//! Each container is a directory under the root and object names map to
//! relative paths, so a name such as `volume_1/2024/az_nova_backup_x-00001`
//! lands in nested directories.
//!
//! Writers fill a `.partial` sibling that is renamed into place on shutdown.
//! Partial files are never listed, and an abandoned writer removes its own.

use super::{ObjectReader, ObjectStore, ObjectWriter};
use crate::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncWrite;
use tracing::{debug, warn};
use walkdir::WalkDir;

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn container_path(&self, container: &str) -> Result<PathBuf> {
        validate_relative(container)?;
        Ok(self.root.join(container))
    }

    fn object_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        validate_relative(name)?;
        if name.ends_with(PARTIAL_SUFFIX) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("object name '{}' uses a reserved suffix", name),
            )
            .into());
        }
        Ok(self.container_path(container)?.join(name))
    }
}

/// Reject names that would escape the container directory.
fn validate_relative(name: &str) -> Result<()> {
    let path = Path::new(name);
    let escapes = name.is_empty()
        || name.contains('\\')
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid object name '{}'", name),
        )
        .into());
    }
    Ok(())
}

/// List files under `dir` as `/`-separated names relative to it.
fn list_names(dir: &Path, prefix: &str) -> io::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if name.starts_with(prefix) && !name.ends_with(PARTIAL_SUFFIX) {
            names.insert(name);
        }
    }
    Ok(names)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_container(&self, container: &str) -> Result<()> {
        let path = self.container_path(container)?;
        tokio::fs::create_dir_all(&path).await?;
        Ok(())
    }

    async fn get_container_entries(
        &self,
        container: &str,
        prefix: &str,
    ) -> Result<BTreeSet<String>> {
        let dir = self.container_path(container)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(BackupError::NotFound(format!("container {}", container)));
        }

        let prefix = prefix.to_string();
        let names = tokio::task::spawn_blocking(move || list_names(&dir, &prefix))
            .await
            .map_err(|e| BackupError::Worker(e.to_string()))??;
        Ok(names)
    }

    async fn get_object_writer(
        &self,
        container: &str,
        name: &str,
        extra_metadata: Option<&serde_json::Value>,
    ) -> Result<ObjectWriter> {
        let container_dir = self.container_path(container)?;
        if !tokio::fs::try_exists(&container_dir).await? {
            return Err(BackupError::NotFound(format!("container {}", container)));
        }

        let path = self.object_path(container, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if extra_metadata.is_some() {
            debug!("Local store ignores extra metadata for {}", name);
        }

        if tokio::fs::try_exists(&path).await? {
            return Err(already_exists(&path).into());
        }

        let mut partial = path.clone().into_os_string();
        partial.push(format!(".{}{}", uuid::Uuid::new_v4().simple(), PARTIAL_SUFFIX));
        let partial = PathBuf::from(partial);

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&partial)
            .await?;
        Ok(Box::new(LocalObjectWriter {
            file,
            partial,
            path,
            commit: None,
            committed: false,
        }))
    }

    async fn get_object_reader(
        &self,
        container: &str,
        name: &str,
        _extra_metadata: Option<&serde_json::Value>,
    ) -> Result<ObjectReader> {
        let path = self.object_path(container, name)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackupError::NotFound(
                format!("object {}/{}", container, name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        let path = self.object_path(container, name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn already_exists(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("object {} already exists", path.display()),
    )
}

type Commit = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Writes into a partial file; `shutdown` renames it to the object path.
struct LocalObjectWriter {
    file: tokio::fs::File,
    partial: PathBuf,
    path: PathBuf,
    commit: Option<Commit>,
    committed: bool,
}

impl AsyncWrite for LocalObjectWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.committed {
            return Poll::Ready(Ok(()));
        }

        if this.commit.is_none() {
            ready!(Pin::new(&mut this.file).poll_shutdown(cx))?;
            let partial = this.partial.clone();
            let path = this.path.clone();
            this.commit = Some(Box::pin(async move {
                if tokio::fs::try_exists(&path).await? {
                    return Err(already_exists(&path));
                }
                tokio::fs::rename(&partial, &path).await
            }));
        }

        let result = match this.commit.as_mut() {
            Some(commit) => ready!(commit.as_mut().poll(cx)),
            None => Ok(()),
        };
        this.commit = None;
        result?;
        this.committed = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for LocalObjectWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.partial) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.partial.display(), e);
            }
        }
    }
}
