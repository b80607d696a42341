//! Block hashing, changed-range detection and chunk compression.

pub mod codec;
pub mod delta;
pub mod digest;

pub use codec::{choose_codec, Compression};
pub use delta::{dirty_bytes, dirty_ranges};
pub use digest::{block_count, block_digests};
