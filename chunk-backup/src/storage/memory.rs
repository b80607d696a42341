//! In-process object store.
//!
//! Objects live in a shared map. Writers buffer until `shutdown()` and only
//! then publish the object, so an abandoned writer leaves nothing behind.
//! Write failures can be injected by name suffix to exercise cleanup paths.

use super::{ObjectReader, ObjectStore, ObjectWriter};
use crate::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

type Containers = BTreeMap<String, BTreeMap<String, Bytes>>;

#[derive(Default)]
struct Inner {
    containers: Containers,
    failing_suffixes: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned map is still structurally valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every later write of an object whose name ends with `suffix` fail.
    pub fn fail_writes_ending_with(&self, suffix: impl Into<String>) {
        self.lock().failing_suffixes.push(suffix.into());
    }

    /// Stop injecting write failures.
    pub fn clear_failures(&self) {
        self.lock().failing_suffixes.clear();
    }

    /// Stored bytes of an object, if present.
    pub fn object(&self, container: &str, name: &str) -> Option<Bytes> {
        self.lock()
            .containers
            .get(container)
            .and_then(|objects| objects.get(name))
            .cloned()
    }

    /// Replace the stored bytes of an object.
    pub fn overwrite(&self, container: &str, name: &str, data: impl Into<Bytes>) {
        self.lock()
            .containers
            .entry(container.to_string())
            .or_default()
            .insert(name.to_string(), data.into());
    }

    /// Number of objects across all containers.
    pub fn object_count(&self) -> usize {
        self.lock().containers.values().map(|c| c.len()).sum()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_container(&self, container: &str) -> Result<()> {
        self.lock()
            .containers
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn get_container_entries(
        &self,
        container: &str,
        prefix: &str,
    ) -> Result<BTreeSet<String>> {
        let inner = self.lock();
        let objects = inner
            .containers
            .get(container)
            .ok_or_else(|| BackupError::NotFound(format!("container {}", container)))?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn get_object_writer(
        &self,
        container: &str,
        name: &str,
        _extra_metadata: Option<&serde_json::Value>,
    ) -> Result<ObjectWriter> {
        let inner = self.lock();
        let objects = inner
            .containers
            .get(container)
            .ok_or_else(|| BackupError::NotFound(format!("container {}", container)))?;
        if objects.contains_key(name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("object {} already exists", name),
            )
            .into());
        }
        let fail = inner.failing_suffixes.iter().any(|s| name.ends_with(s));

        Ok(Box::new(MemoryObjectWriter {
            store: self.clone(),
            container: container.to_string(),
            name: name.to_string(),
            buffer: Vec::new(),
            fail,
        }))
    }

    async fn get_object_reader(
        &self,
        container: &str,
        name: &str,
        _extra_metadata: Option<&serde_json::Value>,
    ) -> Result<ObjectReader> {
        let data = self
            .object(container, name)
            .ok_or_else(|| BackupError::NotFound(format!("object {}/{}", container, name)))?;
        Ok(Box::new(io::Cursor::new(data)))
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        if let Some(objects) = self.lock().containers.get_mut(container) {
            objects.remove(name);
        }
        Ok(())
    }
}

struct MemoryObjectWriter {
    store: MemoryObjectStore,
    container: String,
    name: String,
    buffer: Vec<u8>,
    fail: bool,
}

impl MemoryObjectWriter {
    fn injected_failure(&self) -> io::Error {
        io::Error::other(format!("injected write failure for {}", self.name))
    }
}

impl AsyncWrite for MemoryObjectWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.fail {
            return Poll::Ready(Err(self.injected_failure()));
        }
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.fail {
            return Poll::Ready(Err(self.injected_failure()));
        }
        let data = Bytes::from(std::mem::take(&mut self.buffer));
        let this = &*self;
        this.store.overwrite(&this.container, &this.name, data);
        Poll::Ready(Ok(()))
    }
}
