//! Compression policy for stored chunk objects.
//!
//! Every object records the algorithm it was stored with. Compression is only
//! kept when it actually shrinks the data; otherwise the object is stored raw
//! and tagged `none`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use crate::utils::errors::BackupError;

/// Compression algorithm recorded per chunk object.
///
/// Aliases are accepted when parsing configuration or reading manifests;
/// serialization always uses the canonical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    #[serde(rename = "none", alias = "off", alias = "no")]
    None,
    #[default]
    #[serde(rename = "zlib", alias = "gzip")]
    Zlib,
    #[serde(rename = "bz2", alias = "bzip2")]
    Bz2,
    #[serde(rename = "zstd")]
    Zstd,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Zlib => "zlib",
            Compression::Bz2 => "bz2",
            Compression::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" | "no" => Ok(Compression::None),
            "zlib" | "gzip" => Ok(Compression::Zlib),
            "bz2" | "bzip2" => Ok(Compression::Bz2),
            "zstd" => Ok(Compression::Zstd),
            other => Err(BackupError::Config(format!(
                "unknown compression algorithm '{}'",
                other
            ))),
        }
    }
}

/// Zstd level used for chunk objects
const ZSTD_LEVEL: i32 = 3;

/// Compress `data` with `algorithm`. `Compression::None` copies the input.
pub fn compress(algorithm: Compression, data: &[u8]) -> io::Result<Vec<u8>> {
    match algorithm {
        Compression::None => Ok(data.to_vec()),
        Compression::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Compression::Bz2 => {
            let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Compression::Zstd => zstd::stream::encode_all(data, ZSTD_LEVEL),
    }
}

/// Exact inverse of [`compress`] for the same algorithm.
pub fn decompress(algorithm: Compression, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut output = Vec::new();
    match algorithm {
        Compression::None => output.extend_from_slice(data),
        Compression::Zlib => {
            flate2::read::ZlibDecoder::new(data).read_to_end(&mut output)?;
        }
        Compression::Bz2 => {
            bzip2::read::BzDecoder::new(data).read_to_end(&mut output)?;
        }
        Compression::Zstd => output = zstd::stream::decode_all(data)?,
    }
    Ok(output)
}

/// Choose the stored representation of a chunk.
///
/// Returns the algorithm actually used and the bytes to store. If compression
/// does not make the data strictly smaller the original bytes are returned
/// tagged [`Compression::None`].
pub fn choose_codec(data: Bytes, algorithm: Compression) -> io::Result<(Compression, Bytes)> {
    if algorithm == Compression::None {
        return Ok((Compression::None, data));
    }

    let compressed = compress(algorithm, &data)?;
    if compressed.len() >= data.len() {
        Ok((Compression::None, data))
    } else {
        Ok((algorithm, Bytes::from(compressed)))
    }
}
