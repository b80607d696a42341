//! Changed-range detection against a parent digest list.
//!
//! An incremental backup hashes each chunk it reads and compares the block
//! digests with the parent's digests at the same block index. Consecutive
//! differing blocks form one dirty run, and each run becomes one stored object.

use std::ops::Range;

/// Find the dirty byte ranges of a chunk.
///
/// # Arguments
/// * `chunk_digests` - Block digests of the chunk being backed up
/// * `parent_digests` - The parent's digest list for the whole volume
/// * `first_block` - Volume block index of the chunk's first block
/// * `block_size` - Block size used for both digest lists
/// * `chunk_len` - Length of the chunk in bytes
///
/// # Returns
/// Byte ranges relative to the chunk start, in ascending order. Blocks beyond
/// the end of the parent's list are always dirty.
pub fn dirty_ranges(
    chunk_digests: &[String],
    parent_digests: &[String],
    first_block: usize,
    block_size: usize,
    chunk_len: usize,
) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut run_start: Option<usize> = None;

    for (index, digest) in chunk_digests.iter().enumerate() {
        let unchanged = parent_digests
            .get(first_block + index)
            .is_some_and(|parent| parent == digest);
        let block_start = index * block_size;

        match (unchanged, run_start) {
            (false, None) => run_start = Some(block_start),
            (true, Some(start)) => {
                ranges.push(start..block_start);
                run_start = None;
            }
            _ => {}
        }
    }

    if let Some(start) = run_start {
        ranges.push(start..chunk_len);
    }

    ranges
}

/// Total bytes covered by `ranges`.
pub fn dirty_bytes(ranges: &[Range<usize>]) -> usize {
    ranges.iter().map(|r| r.len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::digest::block_digests;

    #[test]
    fn test_identical_chunk_has_no_dirty_ranges() {
        let data = b"AAAABBBBCCCCDDDD";
        let digests = block_digests(data, 4);
        assert!(dirty_ranges(&digests, &digests, 0, 4, data.len()).is_empty());
    }

    #[test]
    fn test_single_changed_block() {
        let parent = block_digests(b"AAAABBBBCCCCDDDD", 4);
        let chunk = block_digests(b"CCCCDDDD", 4);
        let changed = block_digests(b"XXXXDDDD", 4);

        // Second half of the volume, unchanged
        assert!(dirty_ranges(&chunk, &parent, 2, 4, 8).is_empty());
        // Same chunk with its first block rewritten
        assert_eq!(dirty_ranges(&changed, &parent, 2, 4, 8), vec![0..4]);
    }

    #[test]
    fn test_adjacent_dirty_blocks_form_one_run() {
        let parent = block_digests(b"AAAABBBBCCCCDDDD", 4);
        let chunk = block_digests(b"AAAAXXXXYYYYDDDD", 4);
        assert_eq!(dirty_ranges(&chunk, &parent, 0, 4, 16), vec![4..12]);
    }

    #[test]
    fn test_separate_runs() {
        let parent = block_digests(b"AAAABBBBCCCCDDDD", 4);
        let chunk = block_digests(b"XXXXBBBBYYYYDDDD", 4);
        assert_eq!(dirty_ranges(&chunk, &parent, 0, 4, 16), vec![0..4, 8..12]);
    }

    #[test]
    fn test_open_run_closes_at_short_chunk_end() {
        let parent = block_digests(b"AAAABBBBCC", 4);
        let chunk = block_digests(b"AAAABBBBXY", 4);
        let ranges = dirty_ranges(&chunk, &parent, 0, 4, 10);
        assert_eq!(ranges, vec![8..10]);
        assert_eq!(dirty_bytes(&ranges), 2);
    }

    #[test]
    fn test_blocks_past_parent_end_are_dirty() {
        let parent = block_digests(b"AAAA", 4);
        let chunk = block_digests(b"AAAABBBB", 4);
        assert_eq!(dirty_ranges(&chunk, &parent, 0, 4, 8), vec![4..8]);
    }
}
