//! Per-block SHA-256 digests.
//!
//! A digest list covers a buffer in fixed-size blocks; the final block may be
//! shorter. Backups keep the digest list of the whole volume so a later
//! incremental backup can find changed blocks without reading the parent's data.

use sha2::{Digest, Sha256};

/// Default block size for digest generation (32KB)
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

/// Compute one hex SHA-256 digest per `block_size` slice of `data`.
///
/// # Arguments
/// * `data` - Buffer to digest
/// * `block_size` - Block size in bytes, must be non-zero
///
/// # Returns
/// * `Vec<String>` - Lowercase hex digests in block order
///
/// # Example
/// ```
/// use chunk_backup::sync::digest::block_digests;
///
/// let digests = block_digests(b"AAAABBBBCC", 4);
/// assert_eq!(digests.len(), 3);
/// ```
pub fn block_digests(data: &[u8], block_size: usize) -> Vec<String> {
    assert!(block_size > 0, "block_size must be non-zero");
    data.chunks(block_size)
        .map(|block| hex::encode(Sha256::digest(block)))
        .collect()
}

/// Number of digests a buffer of `len` bytes produces.
pub fn block_count(len: u64, block_size: usize) -> u64 {
    len.div_ceil(block_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let digests = block_digests(b"abc", 4);
        assert_eq!(
            digests,
            vec!["ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".to_string()]
        );
    }

    #[test]
    fn test_final_block_may_be_short() {
        let data = vec![7u8; 10];
        let digests = block_digests(&data, 4);
        assert_eq!(digests.len(), 3);
        assert_eq!(digests[0], digests[1]);
        assert_ne!(digests[1], digests[2]);
        assert_eq!(block_count(10, 4), 3);
    }

    #[test]
    fn test_empty_buffer_has_no_digests() {
        assert!(block_digests(&[], 4096).is_empty());
        assert_eq!(block_count(0, 4096), 0);
    }

    #[test]
    fn test_rehashing_is_deterministic() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();
        assert_eq!(block_digests(&data, 64), block_digests(&data, 64));
    }

    #[test]
    fn test_single_byte_change_touches_one_block() {
        let original: Vec<u8> = (0..4096u32).map(|i| (i % 199) as u8).collect();
        let mut modified = original.clone();
        modified[1500] ^= 0xFF;

        let before = block_digests(&original, 512);
        let after = block_digests(&modified, 512);

        let changed: Vec<usize> = before
            .iter()
            .zip(&after)
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(changed, vec![1500 / 512]);
    }
}
