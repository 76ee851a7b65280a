#![forbid(unsafe_code)]
//! Content-addressed cache substrate with group-scoped invalidation.
//!
//! Two [`CacheStore`] tiers share one contract: [`MemCacheStore`] keeps
//! payloads in RAM under a byte-bounded LRU, [`DiskCacheStore`] persists
//! them as content-named files under an entry-count-bounded LRU. Entries
//! carry a group tag (one group per file path) so a whole file's blocks
//! can be invalidated together.
//!
//! [`RamBuffer`] is a separate animal: a named-group bounded buffer with
//! cap-wait semantics, used by the write pipeline for producer-side
//! backpressure.

mod buffer;
mod disk;
mod mem;

pub use buffer::{RamBuffer, RamBufferEntry, RamBufferGroup};
pub use disk::DiskCacheStore;
pub use mem::MemCacheStore;

use dgfs_error::Result;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::SystemTime;

/// One cached payload (typically a file block).
pub trait CacheEntry: Send + Sync {
    fn key(&self) -> &str;

    /// Invalidation group this entry belongs to.
    fn group(&self) -> &str;

    /// Payload size in bytes.
    fn size(&self) -> usize;

    fn creation_time(&self) -> SystemTime;

    /// Copy payload bytes starting at `offset` into `buf`, returning the
    /// number of bytes copied. May be called without any store lock held.
    fn read_data(&self, buf: &mut [u8], offset: usize) -> Result<usize>;
}

impl std::fmt::Debug for dyn CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key())
            .field("group", &self.group())
            .field("size", &self.size())
            .finish()
    }
}

/// A bounded content-addressed store of cache entries.
pub trait CacheStore: Send + Sync {
    /// Purge the store and drop backing resources.
    fn release(&self);

    /// Largest payload a single entry may carry.
    fn entry_size_cap(&self) -> usize;

    /// Total capacity in bytes.
    fn size_cap(&self) -> u64;

    fn total_entries(&self) -> usize;

    /// Bytes currently accounted to entries. The disk tier reports the
    /// upper bound `count * entry_size_cap`.
    fn total_entry_size(&self) -> u64;

    fn available_size(&self) -> u64;

    fn delete_all_entries(&self);

    /// Remove every entry tagged with `group`, atomically with respect
    /// to other operations on this store.
    fn delete_all_entries_for_group(&self, group: &str);

    fn entry_keys(&self) -> Vec<String>;

    fn entry_keys_for_group(&self, group: &str) -> Vec<String>;

    /// Insert a payload, evicting least-recently-used entries as needed.
    /// Replaces any prior entry under the same key. Fails with
    /// `TooLarge` when the payload exceeds the per-entry cap.
    fn create_entry(&self, key: &str, group: &str, data: &[u8]) -> Result<Arc<dyn CacheEntry>>;

    fn has_entry(&self, key: &str) -> bool;

    fn get_entry(&self, key: &str) -> Option<Arc<dyn CacheEntry>>;

    /// Idempotent removal.
    fn delete_entry(&self, key: &str);
}

/// File name for a cache key: hex-encoded SHA-1 of the key string.
#[must_use]
pub fn cache_file_name(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
