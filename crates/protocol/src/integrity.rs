//! Checkpoint integrity
//!
//! A CRC32 over the serialized checkpoint payload guards restore against
//! truncated or corrupted save files.

use crc32fast::Hasher;

/// Compute CRC32 checksum for data
#[inline]
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify CRC32 checksum for data
#[inline]
pub fn verify_checksum(data: &[u8], expected_checksum: u32) -> bool {
    compute_checksum(data) == expected_checksum
}
