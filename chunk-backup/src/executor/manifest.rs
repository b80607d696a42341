//! Backup metadata objects and their persistence.
//!
//! Every backup writes two metadata objects next to its chunks:
//! - `{prefix}_metadata`: the manifest, listing each stored chunk object
//!   with its logical offset, length, compression and MD5.
//! - `{prefix}_sha256file`: the digest list, one SHA-256 per block of the
//!   whole volume, used as the baseline for a child incremental backup.
//!
//! Both are written in the canonical JSON layout so that any implementation
//! produces the same bytes for the same backup.

use super::canonical::to_canonical_json;
use crate::storage::{get_object, put_object, ObjectStore};
use crate::sync::Compression;
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata format version written by this implementation.
pub const MANIFEST_VERSION: &str = "1.0.0";

/// One stored chunk object, as listed in a manifest.
///
/// On the wire each entry is a single-key map: `{"<name>": {compression,
/// length, md5, offset}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, ObjectBody>",
    into = "BTreeMap<String, ObjectBody>"
)]
pub struct ChunkObject {
    pub name: String,
    /// Logical byte offset in the volume
    pub offset: u64,
    /// Uncompressed length in bytes
    pub length: u64,
    pub compression: Compression,
    /// Hex MD5 of the uncompressed bytes
    pub md5: String,
}

impl ChunkObject {
    /// Logical end offset (exclusive). Saturates for extents that
    /// [`Manifest::check_extents`] would reject.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Wire form of a manifest entry body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectBody {
    pub compression: Compression,
    pub length: u64,
    pub md5: String,
    pub offset: u64,
}

impl TryFrom<BTreeMap<String, ObjectBody>> for ChunkObject {
    type Error = String;

    fn try_from(map: BTreeMap<String, ObjectBody>) -> std::result::Result<Self, Self::Error> {
        if map.len() != 1 {
            return Err(format!(
                "manifest object entry must have exactly one name, found {}",
                map.len()
            ));
        }
        let Some((name, body)) = map.into_iter().next() else {
            return Err("empty manifest object entry".to_string());
        };
        Ok(ChunkObject {
            name,
            offset: body.offset,
            length: body.length,
            compression: body.compression,
            md5: body.md5,
        })
    }
}

impl From<ChunkObject> for BTreeMap<String, ObjectBody> {
    fn from(object: ChunkObject) -> Self {
        let body = ObjectBody {
            compression: object.compression,
            length: object.length,
            md5: object.md5,
            offset: object.offset,
        };
        BTreeMap::from([(object.name, body)])
    }
}

/// Backup manifest, serialized as `{prefix}_metadata`.
///
/// Fields are declared in key order; the canonical encoding relies on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub backup_description: Option<String>,
    pub backup_id: String,
    pub backup_name: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_metadata: Option<serde_json::Value>,
    pub objects: Vec<ChunkObject>,
    pub parent_id: Option<String>,
    pub version: String,
    pub volume_id: String,
    /// Opaque volume metadata captured at backup time
    pub volume_meta: Option<String>,
}

impl Manifest {
    /// Sum of the uncompressed lengths of all listed objects.
    pub fn changed_bytes(&self) -> u64 {
        self.objects.iter().map(|o| o.length).sum()
    }

    /// Every listed object must cover a non-empty range that fits in `u64`.
    pub fn check_extents(&self) -> Result<()> {
        for object in &self.objects {
            if object.length == 0 || object.offset.checked_add(object.length).is_none() {
                return Err(BackupError::Integrity(format!(
                    "manifest of backup {} lists {} at offset {} with length {}",
                    self.backup_id, object.name, object.offset, object.length
                )));
            }
        }
        Ok(())
    }
}

/// Per-block digest list, serialized as `{prefix}_sha256file`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestList {
    pub backup_description: Option<String>,
    pub backup_id: String,
    pub backup_name: Option<String>,
    /// Digest block size in bytes (named `chunk_size` on the wire)
    pub chunk_size: usize,
    pub created_at: String,
    pub sha256s: Vec<String>,
    pub version: String,
    pub volume_id: String,
}

impl DigestList {
    pub fn block_size(&self) -> usize {
        self.chunk_size
    }
}

/// Timestamp layout used in metadata objects.
pub fn format_created_at(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Name of the `seq`-th chunk object of a backup.
pub fn chunk_object_name(prefix: &str, seq: u64) -> String {
    format!("{}-{:05}", prefix, seq)
}

/// Listing prefix matching only a backup's chunk objects.
pub fn chunk_name_prefix(prefix: &str) -> String {
    format!("{}-", prefix)
}

pub fn metadata_object_name(prefix: &str) -> String {
    format!("{}_metadata", prefix)
}

pub fn digest_object_name(prefix: &str) -> String {
    format!("{}_sha256file", prefix)
}

pub fn encode_manifest(manifest: &Manifest) -> Result<Vec<u8>> {
    Ok(to_canonical_json(manifest)?)
}

pub fn decode_manifest(data: &[u8]) -> Result<Manifest> {
    Ok(serde_json::from_slice(data)?)
}

pub fn encode_digestlist(digests: &DigestList) -> Result<Vec<u8>> {
    Ok(to_canonical_json(digests)?)
}

pub fn decode_digestlist(data: &[u8]) -> Result<DigestList> {
    Ok(serde_json::from_slice(data)?)
}

/// Persist a manifest as `{prefix}_metadata`.
pub async fn write_manifest(
    store: &dyn ObjectStore,
    container: &str,
    prefix: &str,
    manifest: &Manifest,
) -> Result<()> {
    let data = encode_manifest(manifest)?;
    put_object(
        store,
        container,
        &metadata_object_name(prefix),
        &data,
        manifest.extra_metadata.as_ref(),
    )
    .await
}

/// Load the manifest of the backup stored under `prefix`.
pub async fn read_manifest(
    store: &dyn ObjectStore,
    container: &str,
    prefix: &str,
) -> Result<Manifest> {
    let name = metadata_object_name(prefix);
    let data = get_object(store, container, &name, None)
        .await
        .map_err(|e| not_found_as(e, "manifest", &name))?;
    decode_manifest(&data)
}

/// Persist a digest list as `{prefix}_sha256file`.
pub async fn write_digestlist(
    store: &dyn ObjectStore,
    container: &str,
    prefix: &str,
    digests: &DigestList,
    extra_metadata: Option<&serde_json::Value>,
) -> Result<()> {
    let data = encode_digestlist(digests)?;
    put_object(
        store,
        container,
        &digest_object_name(prefix),
        &data,
        extra_metadata,
    )
    .await
}

/// Load the digest list of the backup stored under `prefix`.
pub async fn read_digestlist(
    store: &dyn ObjectStore,
    container: &str,
    prefix: &str,
) -> Result<DigestList> {
    let name = digest_object_name(prefix);
    let data = get_object(store, container, &name, None)
        .await
        .map_err(|e| not_found_as(e, "digest list", &name))?;
    decode_digestlist(&data)
}

fn not_found_as(error: BackupError, what: &str, name: &str) -> BackupError {
    match error {
        BackupError::NotFound(_) => BackupError::NotFound(format!("{} {}", what, name)),
        other => other,
    }
}
