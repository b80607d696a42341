//! Object-store contract used by the backup and restore engines.
//!
//! Drivers only need to provide containers, prefix listing, write-once
//! writers, readers and idempotent deletes. Everything else (naming, metadata
//! encoding, cleanup) lives in the engines.

pub mod local;
pub mod memory;

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write-once object stream. The object is committed by `shutdown()`.
pub type ObjectWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read-only object stream.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create a container. Succeeds if it already exists.
    async fn put_container(&self, container: &str) -> Result<()>;

    /// List object names in `container` that start with `prefix`, in order.
    async fn get_container_entries(&self, container: &str, prefix: &str)
        -> Result<BTreeSet<String>>;

    /// Open a writer for a new object.
    async fn get_object_writer(
        &self,
        container: &str,
        name: &str,
        extra_metadata: Option<&serde_json::Value>,
    ) -> Result<ObjectWriter>;

    /// Open a reader for an existing object.
    async fn get_object_reader(
        &self,
        container: &str,
        name: &str,
        extra_metadata: Option<&serde_json::Value>,
    ) -> Result<ObjectReader>;

    /// Delete an object. A missing object is not an error.
    async fn delete_object(&self, container: &str, name: &str) -> Result<()>;
}

/// Write `data` as a complete object and close the writer.
pub async fn put_object(
    store: &dyn ObjectStore,
    container: &str,
    name: &str,
    data: &[u8],
    extra_metadata: Option<&serde_json::Value>,
) -> Result<()> {
    let mut writer = store
        .get_object_writer(container, name, extra_metadata)
        .await?;
    writer.write_all(data).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read a complete object into memory.
pub async fn get_object(
    store: &dyn ObjectStore,
    container: &str,
    name: &str,
    extra_metadata: Option<&serde_json::Value>,
) -> Result<Vec<u8>> {
    let mut reader = store
        .get_object_reader(container, name, extra_metadata)
        .await?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await?;
    Ok(data)
}
