//! Decides which block to fetch speculatively for a sequential reader.

use dgfs_types::{BlockGeometry, BlockId};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Fraction of the current block a read must pass before the next block
/// is prefetched.
pub const PREFETCH_TRIGGER_RATIO: f64 = 0.3;

/// Per-reader prefetch planner.
///
/// Memoises every block it has already asked for; the memo lives as long
/// as the reader, so a block is suggested at most once per session.
#[derive(Debug)]
pub struct Prefetcher {
    geometry: BlockGeometry,
    requested: Mutex<HashSet<u64>>,
}

impl Prefetcher {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            geometry: BlockGeometry::new(block_size),
            requested: Mutex::new(HashSet::new()),
        }
    }

    /// Blocks worth fetching speculatively given the current read
    /// position and the file size. Empty when the read has not advanced
    /// past the trigger point or the candidate was already requested.
    #[must_use]
    pub fn determine(&self, offset: u64, file_size: u64) -> Vec<BlockId> {
        let id = self.geometry.block_id(offset);
        let in_block_offset = offset - self.geometry.block_start(id);
        let trigger_point = self.geometry.block_size() as f64 * PREFETCH_TRIGGER_RATIO;
        if (in_block_offset as f64) < trigger_point {
            return Vec::new();
        }

        // Past the last block, wrap to block 0: archive formats keep
        // their entry tables in a trailer, and the next read tends to
        // land at the file start.
        let target = if id >= self.geometry.last_block_id(file_size) {
            BlockId(0)
        } else {
            id.next()
        };

        let mut requested = self.requested.lock();
        if !requested.insert(target.0) {
            return Vec::new();
        }
        vec![target]
    }
}
