pub mod checksum;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh32::xxh32;

pub use checksum::RollingChecksum;

const STRONG_HASH_SEED: u32 = 0;

/// Descriptor of one content-defined block as tracked by the block index.
/// A weak match is checksum equality; a strong match additionally requires
/// `strong_hash` equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub checksum: RollingChecksum,
    pub strong_hash: u32,
    pub block_index: usize,
    pub block_size: usize,
    pub payload: Option<Vec<u8>>,
}

impl BlockMetadata {
    pub fn new(
        checksum: RollingChecksum,
        strong_hash: u32,
        block_index: usize,
        block_size: usize,
    ) -> Self {
        Self {
            checksum,
            strong_hash,
            block_index,
            block_size,
            payload: None,
        }
    }

    /// Builds metadata directly from block contents, computing both the
    /// rolling checksum and the strong hash. The payload is not retained.
    pub fn from_block(block: &[u8], block_index: usize) -> Self {
        Self {
            checksum: RollingChecksum::compute(block),
            strong_hash: xxh32(block, STRONG_HASH_SEED),
            block_index,
            block_size: block.len(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_block_fills_both_hashes() {
        let meta = BlockMetadata::from_block(b"0123456789abcdef", 3);
        assert_eq!(meta.checksum, RollingChecksum::compute(b"0123456789abcdef"));
        assert_eq!(meta.strong_hash, xxh32(b"0123456789abcdef", STRONG_HASH_SEED));
        assert_eq!(meta.block_index, 3);
        assert_eq!(meta.block_size, 16);
        assert!(meta.payload.is_none());
    }

    #[test]
    fn with_payload_retains_data() {
        let meta = BlockMetadata::from_block(b"xyz", 0).with_payload(b"xyz".to_vec());
        assert_eq!(meta.payload.as_deref(), Some(b"xyz".as_slice()));
    }
}
