//! Inode number allocation.
//!
//! Three disjoint ranges keep the kinds apart: remote entries map by
//! identity onto their server id, virtual directories and overlay
//! entries draw monotonically from their own ranges, memoised by path
//! so a path always resolves to the same inode for the mount's
//! lifetime.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Base of the remote-entry inode range.
pub const REMOTE_INODE_BASE: u64 = 1_000_000_000_000_000_000;
/// Base of the virtual-directory inode range.
pub const VIRTUAL_DIR_INODE_BASE: u64 = 9_000_000_000_000_000_000;
/// Base of the overlay-entry inode range.
pub const OVERLAY_INODE_BASE: u64 = 9_000_100_000_000_000_000;

#[derive(Debug, Default)]
struct InodeState {
    next_virtual: u64,
    next_overlay: u64,
    virtual_by_path: HashMap<String, u64>,
    overlay_by_path: HashMap<String, u64>,
}

/// Process-wide inode service for one mount.
#[derive(Debug, Default)]
pub struct InodeAllocator {
    state: Mutex<InodeState>,
}

impl InodeAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inode for a remote entry: identity on the server id.
    #[must_use]
    pub fn inode_for_remote_id(&self, remote_id: i64) -> u64 {
        REMOTE_INODE_BASE + remote_id as u64
    }

    /// Inode for a virtual directory, stable per virtual path.
    #[must_use]
    pub fn inode_for_virtual_path(&self, vpath: &str) -> u64 {
        let mut state = self.state.lock();
        if let Some(inode) = state.virtual_by_path.get(vpath) {
            return *inode;
        }
        let inode = VIRTUAL_DIR_INODE_BASE + state.next_virtual;
        state.next_virtual += 1;
        state.virtual_by_path.insert(vpath.to_owned(), inode);
        inode
    }

    /// Inode for an overlay entry, stable per remote path.
    #[must_use]
    pub fn inode_for_overlay_path(&self, remote_path: &str) -> u64 {
        let mut state = self.state.lock();
        if let Some(inode) = state.overlay_by_path.get(remote_path) {
            return *inode;
        }
        let inode = OVERLAY_INODE_BASE + state.next_overlay;
        state.next_overlay += 1;
        state.overlay_by_path.insert(remote_path.to_owned(), inode);
        inode
    }
}
