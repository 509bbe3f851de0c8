//! Block lookup specialization of the n-ary splay tree, keyed by rolling
//! checksum: the index a delta-synchronization pass consults while sliding
//! its window over new data.

use parking_lot::MappedMutexGuard;

use super::NarySplayTree;
use crate::types::{BlockMetadata, RollingChecksum};

/// Index of content-defined blocks addressed by rolling checksum.
pub type BlockIndex = NarySplayTree<RollingChecksum, BlockMetadata>;

impl NarySplayTree<RollingChecksum, BlockMetadata> {
    /// Registers a block under its own checksum. A block with the same
    /// checksum replaces the previous entry.
    pub fn insert_block(&self, block: BlockMetadata) -> bool {
        self.insert(block.checksum, block)
    }

    /// Weak lookup: any block whose rolling checksum matches. The returned
    /// metadata carries the strong hash for confirmation.
    pub fn find_block(&self, checksum: RollingChecksum) -> Option<MappedMutexGuard<'_, BlockMetadata>> {
        self.search(&checksum)
    }

    /// Strong lookup: blocks matching both the rolling checksum and the
    /// strong hash. Checksums are unique keys here, so the result holds at
    /// most one entry.
    pub fn find_matching_blocks(
        &self,
        checksum: RollingChecksum,
        strong_hash: u32,
    ) -> Vec<BlockMetadata> {
        match self.search(&checksum) {
            Some(meta) if meta.strong_hash == strong_hash => vec![meta.clone()],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_requires_both_hashes() {
        let index = BlockIndex::default();
        assert!(index.insert_block(BlockMetadata::new(
            RollingChecksum::new(1, 0),
            0xAA,
            0,
            512,
        )));
        assert!(index.insert_block(BlockMetadata::new(
            RollingChecksum::new(2, 0),
            0xBB,
            1,
            512,
        )));

        let hits = index.find_matching_blocks(RollingChecksum::new(1, 0), 0xAA);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].block_index, 0);

        // weak match alone is not enough
        assert!(index
            .find_matching_blocks(RollingChecksum::new(1, 0), 0xFF)
            .is_empty());
        // nor is an unknown checksum
        assert!(index
            .find_matching_blocks(RollingChecksum::new(3, 0), 0xAA)
            .is_empty());
    }

    #[test]
    fn find_block_returns_live_metadata() {
        let index = BlockIndex::default();
        index.insert_block(BlockMetadata::from_block(b"some block payload", 7));
        let checksum = RollingChecksum::compute(b"some block payload");
        let found = index.find_block(checksum).expect("block present");
        assert_eq!(found.block_index, 7);
        assert_eq!(found.block_size, 18);
        drop(found);
        assert!(index.find_block(RollingChecksum::new(9, 9)).is_none());
    }

    #[test]
    fn same_checksum_replaces_entry() {
        let index = BlockIndex::default();
        let cs = RollingChecksum::new(5, 5);
        assert!(index.insert_block(BlockMetadata::new(cs, 0x11, 0, 256)));
        assert!(!index.insert_block(BlockMetadata::new(cs, 0x22, 1, 256)));
        assert_eq!(index.len(), 1);
        let hits = index.find_matching_blocks(cs, 0x22);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].block_index, 1);
        assert!(index.find_matching_blocks(cs, 0x11).is_empty());
    }
}
