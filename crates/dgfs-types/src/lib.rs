#![forbid(unsafe_code)]
//! Core value types shared across the DataGrid FS workspace.
//!
//! Defines [`BlockId`], [`ReadOutcome`], and [`BlockGeometry`], the
//! offset/block arithmetic every adapter in the I/O pipeline relies on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default block size for the cache-through read pipeline: 16 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Index of a fixed-size block within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockId {
    /// The block immediately after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Result of a positional read.
///
/// `eof` is a status, not an error: a short read at file end returns the
/// bytes it could serve together with `eof = true` on the same call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    /// Number of bytes placed into the caller's buffer.
    pub len: usize,
    /// Whether the read reached the end of the file.
    pub eof: bool,
}

impl ReadOutcome {
    #[must_use]
    pub fn new(len: usize, eof: bool) -> Self {
        Self { len, eof }
    }

    /// A zero-byte read that did not reach EOF.
    #[must_use]
    pub fn empty() -> Self {
        Self { len: 0, eof: false }
    }
}

/// Offset/block arithmetic for a fixed block size.
///
/// Pure computation, no state, no I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    block_size: usize,
}

impl BlockGeometry {
    /// Create a geometry for the given block size.
    ///
    /// # Panics
    ///
    /// Panics if `block_size == 0`.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0, "block_size must be > 0");
        Self { block_size }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Block containing the given byte offset.
    #[must_use]
    pub fn block_id(&self, offset: u64) -> BlockId {
        BlockId(offset / self.block_size as u64)
    }

    /// Byte offset where the given block starts.
    #[must_use]
    pub fn block_start(&self, id: BlockId) -> u64 {
        id.0 * self.block_size as u64
    }

    /// Whether `offset` falls exactly on a block boundary.
    #[must_use]
    pub fn is_aligned(&self, offset: u64) -> bool {
        offset % self.block_size as u64 == 0
    }

    /// Intersection of the window `[offset, offset + length)` with block
    /// `id`, as `(start_offset, length)`. Returns `(0, 0)` when the window
    /// does not touch the block.
    #[must_use]
    pub fn block_range(&self, offset: u64, length: usize, id: BlockId) -> (u64, usize) {
        let block_start = self.block_start(id);
        let block_end = block_start + self.block_size as u64;
        let window_end = offset + length as u64;

        if block_end <= offset || block_start >= window_end {
            return (0, 0);
        }

        let start = block_start.max(offset);
        let end = block_end.min(window_end);
        (start, (end - start) as usize)
    }

    /// First and last blocks touched by the window `[offset, offset + length)`.
    #[must_use]
    pub fn first_and_last_block_id(&self, offset: u64, length: usize) -> (BlockId, BlockId) {
        let first = self.block_id(offset);
        let last_offset = offset + (length as u64).saturating_sub(1);
        let last = self.block_id(last_offset);
        (first, last.max(first))
    }

    /// Every block touched by the window, in ascending order.
    #[must_use]
    pub fn block_ids(&self, offset: u64, length: usize) -> Vec<BlockId> {
        let (first, last) = self.first_and_last_block_id(offset, length);
        (first.0..=last.0).map(BlockId).collect()
    }

    /// Last block of a file of `size` bytes. `size` must be > 0.
    #[must_use]
    pub fn last_block_id(&self, size: u64) -> BlockId {
        self.block_id(size.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn block_id_for_offsets() {
        let geo = BlockGeometry::new(1024);
        assert_eq!(geo.block_id(0), BlockId(0));
        assert_eq!(geo.block_id(1023), BlockId(0));
        assert_eq!(geo.block_id(1024), BlockId(1));
        assert_eq!(geo.block_id(10 * 1024 + 1), BlockId(10));
    }

    #[test]
    fn block_start_inverts_block_id() {
        let geo = BlockGeometry::new(4096);
        assert_eq!(geo.block_start(BlockId(0)), 0);
        assert_eq!(geo.block_start(BlockId(3)), 3 * 4096);
        assert!(geo.is_aligned(geo.block_start(BlockId(7))));
        assert!(!geo.is_aligned(4097));
    }

    #[test]
    fn block_range_clamps_to_window() {
        let geo = BlockGeometry::new(100);

        // Window entirely inside one block.
        assert_eq!(geo.block_range(10, 20, BlockId(0)), (10, 20));
        // Window spanning two blocks.
        assert_eq!(geo.block_range(50, 100, BlockId(0)), (50, 50));
        assert_eq!(geo.block_range(50, 100, BlockId(1)), (100, 50));
        // Block not touched.
        assert_eq!(geo.block_range(50, 100, BlockId(2)), (0, 0));
        assert_eq!(geo.block_range(250, 10, BlockId(0)), (0, 0));
    }

    #[test]
    fn block_ids_cover_window() {
        let geo = BlockGeometry::new(100);
        assert_eq!(geo.block_ids(0, 1), vec![BlockId(0)]);
        assert_eq!(geo.block_ids(0, 100), vec![BlockId(0)]);
        assert_eq!(geo.block_ids(0, 101), vec![BlockId(0), BlockId(1)]);
        assert_eq!(geo.block_ids(99, 2), vec![BlockId(0), BlockId(1)]);
        assert_eq!(
            geo.block_ids(150, 200),
            vec![BlockId(1), BlockId(2), BlockId(3)]
        );
    }

    #[test]
    fn last_block_id_for_sizes() {
        let geo = BlockGeometry::new(100);
        assert_eq!(geo.last_block_id(1), BlockId(0));
        assert_eq!(geo.last_block_id(100), BlockId(0));
        assert_eq!(geo.last_block_id(101), BlockId(1));
        assert_eq!(geo.last_block_id(250), BlockId(2));
    }

    proptest! {
        // block_range returns (0, 0) iff the block does not intersect the
        // window; otherwise the returned range lies within both the block
        // and the window.
        #[test]
        fn block_range_intersection(
            offset in 0_u64..1_000_000,
            length in 1_usize..100_000,
            block_size in 1_usize..10_000,
            id in 0_u64..2_000,
        ) {
            let geo = BlockGeometry::new(block_size);
            let id = BlockId(id);
            let (start, len) = geo.block_range(offset, length, id);

            let block_start = geo.block_start(id);
            let block_end = block_start + block_size as u64;
            let window_end = offset + length as u64;
            let intersects = block_start < window_end && block_end > offset;

            if intersects {
                prop_assert!(len > 0);
                prop_assert!(start >= block_start && start >= offset);
                prop_assert!(start + len as u64 <= block_end);
                prop_assert!(start + len as u64 <= window_end);
            } else {
                prop_assert_eq!((start, len), (0, 0));
            }
        }

        #[test]
        fn last_block_matches_division(size in 1_u64..10_000_000, block_size in 1_usize..100_000) {
            let geo = BlockGeometry::new(block_size);
            prop_assert_eq!(geo.last_block_id(size).0, (size - 1) / block_size as u64);
        }

        #[test]
        fn block_ranges_tile_the_window(
            offset in 0_u64..100_000,
            length in 1_usize..50_000,
            block_size in 1_usize..5_000,
        ) {
            let geo = BlockGeometry::new(block_size);
            let mut covered = 0_usize;
            let mut cursor = offset;
            for id in geo.block_ids(offset, length) {
                let (start, len) = geo.block_range(offset, length, id);
                prop_assert_eq!(start, cursor);
                covered += len;
                cursor += len as u64;
            }
            prop_assert_eq!(covered, length);
        }
    }
}
