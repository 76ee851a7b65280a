//! Disk tier of the cache substrate.
//!
//! Payloads live as files named `hex(sha1(key))` under a root directory.
//! The index is an entry-count-bounded LRU; eviction unlinks the payload
//! file synchronously and maintains the reverse group index. Payload
//! reads happen outside the store lock through the entry handle.

use crate::{CacheEntry, CacheStore, cache_file_name};
use dgfs_error::{DgfsError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct DiskCacheEntry {
    key: String,
    group: String,
    size: usize,
    creation_time: SystemTime,
    file_path: PathBuf,
}

impl DiskCacheEntry {
    /// Unlink the payload file. A missing file is not an error; the
    /// entry may have been purged by `release` already.
    fn delete_data_file(&self) {
        if let Err(err) = fs::remove_file(&self.file_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    event = "cache_file_unlink_failed",
                    file = %self.file_path.display(),
                    error = %err
                );
            }
        }
    }
}

impl CacheEntry for DiskCacheEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn size(&self) -> usize {
        self.size
    }

    fn creation_time(&self) -> SystemTime {
        self.creation_time
    }

    fn read_data(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let file = fs::File::open(&self.file_path)?;
        let mut total = 0_usize;
        while total < buf.len() {
            let n = file.read_at(&mut buf[total..], (offset + total) as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }
}

#[derive(Debug)]
struct DiskState {
    lru: LruCache<String, Arc<DiskCacheEntry>>,
    groups: HashMap<String, HashSet<String>>,
}

impl DiskState {
    fn forget_group_member(&mut self, group: &str, key: &str) {
        if let Some(members) = self.groups.get_mut(group) {
            members.remove(key);
            if members.is_empty() {
                self.groups.remove(group);
            }
        }
    }

    fn drop_entry(&mut self, entry: &Arc<DiskCacheEntry>) {
        entry.delete_data_file();
        self.forget_group_member(&entry.group, &entry.key);
    }
}

/// Disk-backed [`CacheStore`].
#[derive(Debug)]
pub struct DiskCacheStore {
    entry_size_cap: usize,
    size_cap: u64,
    entry_count_cap: usize,
    root: PathBuf,
    state: Mutex<DiskState>,
}

impl DiskCacheStore {
    /// Create a store rooted at `root`, creating the directory if
    /// missing. Capacity is `size_cap / entry_size_cap` entries.
    pub fn new(size_cap: u64, entry_size_cap: usize, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let entry_count_cap = usize::try_from(size_cap / entry_size_cap.max(1) as u64)
            .unwrap_or(usize::MAX)
            .max(1);
        debug!(
            event = "disk_cache_open",
            root = %root.display(),
            entry_count_cap,
            entry_size_cap
        );
        Ok(Self {
            entry_size_cap,
            size_cap,
            entry_count_cap,
            root,
            state: Mutex::new(DiskState {
                lru: LruCache::new(
                    NonZeroUsize::new(entry_count_cap).unwrap_or(NonZeroUsize::MIN),
                ),
                groups: HashMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl CacheStore for DiskCacheStore {
    fn release(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.groups.clear();
        drop(state);

        if let Err(err) = fs::remove_dir_all(&self.root) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(event = "disk_cache_cleanup_failed", root = %self.root.display(), error = %err);
            }
        }
    }

    fn entry_size_cap(&self) -> usize {
        self.entry_size_cap
    }

    fn size_cap(&self) -> u64 {
        self.size_cap
    }

    fn total_entries(&self) -> usize {
        self.state.lock().lru.len()
    }

    fn total_entry_size(&self) -> u64 {
        // Upper bound: every slot is charged the full entry size cap.
        self.state.lock().lru.len() as u64 * self.entry_size_cap as u64
    }

    fn available_size(&self) -> u64 {
        let used = self.state.lock().lru.len();
        (self.entry_count_cap.saturating_sub(used)) as u64 * self.entry_size_cap as u64
    }

    fn delete_all_entries(&self) {
        let mut state = self.state.lock();
        while let Some((_, entry)) = state.lru.pop_lru() {
            entry.delete_data_file();
        }
        state.groups.clear();
    }

    fn delete_all_entries_for_group(&self, group: &str) {
        let mut state = self.state.lock();
        let Some(members) = state.groups.remove(group) else {
            return;
        };
        for key in members {
            if let Some(entry) = state.lru.pop(&key) {
                entry.delete_data_file();
            }
        }
        trace!(event = "cache_group_purged", group = group);
    }

    fn entry_keys(&self) -> Vec<String> {
        self.state
            .lock()
            .lru
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn entry_keys_for_group(&self, group: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .groups
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .filter(|key| state.lru.contains(*key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn create_entry(&self, key: &str, group: &str, data: &[u8]) -> Result<Arc<dyn CacheEntry>> {
        if data.len() > self.entry_size_cap {
            return Err(DgfsError::TooLarge {
                requested: data.len(),
                cap: self.entry_size_cap,
            });
        }

        // Payload write happens outside the index lock. A failed write
        // leaves no index entry behind.
        let file_path = self.root.join(cache_file_name(key));
        fs::write(&file_path, data)?;

        let entry = Arc::new(DiskCacheEntry {
            key: key.to_owned(),
            group: group.to_owned(),
            size: data.len(),
            creation_time: SystemTime::now(),
            file_path,
        });

        let mut state = self.state.lock();
        if let Some((displaced_key, displaced)) = state.lru.push(key.to_owned(), Arc::clone(&entry))
        {
            if displaced_key == key {
                // Same-key replacement: the payload file was already
                // overwritten above, only the group index may change.
                if displaced.group != group {
                    state.forget_group_member(&displaced.group, &displaced_key);
                }
            } else {
                trace!(event = "cache_evict", key = displaced_key.as_str());
                state.drop_entry(&displaced);
            }
        }
        state
            .groups
            .entry(group.to_owned())
            .or_default()
            .insert(key.to_owned());
        drop(state);

        trace!(event = "cache_entry_created", key = key, bytes = data.len());
        Ok(entry)
    }

    fn has_entry(&self, key: &str) -> bool {
        self.state.lock().lru.contains(key)
    }

    fn get_entry(&self, key: &str) -> Option<Arc<dyn CacheEntry>> {
        let mut state = self.state.lock();
        state
            .lru
            .get(key)
            .map(|entry| Arc::clone(entry) as Arc<dyn CacheEntry>)
    }

    fn delete_entry(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.lru.pop(key) {
            state.drop_entry(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, size_cap: u64, entry_cap: usize) -> DiskCacheStore {
        DiskCacheStore::new(size_cap, entry_cap, dir.path().join("cache")).unwrap()
    }

    #[test]
    fn create_then_get_roundtrips_bytes() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1024, 256);

        store.create_entry("k1", "/f", b"hello cache").unwrap();
        let entry = store.get_entry("k1").unwrap();
        assert_eq!(entry.size(), 11);

        let mut buf = vec![0_u8; 11];
        assert_eq!(entry.read_data(&mut buf, 0).unwrap(), 11);
        assert_eq!(&buf, b"hello cache");

        let mut tail = vec![0_u8; 5];
        assert_eq!(entry.read_data(&mut tail, 6).unwrap(), 5);
        assert_eq!(&tail, b"cache");
    }

    #[test]
    fn entry_file_uses_hashed_name() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1024, 256);
        store.create_entry("k1", "/f", b"payload").unwrap();

        let expected = store.root().join(cache_file_name("k1"));
        assert!(expected.exists());
    }

    #[test]
    fn too_large_payload_is_rejected_without_index_entry() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1024, 8);

        let err = store.create_entry("k", "/f", &[0_u8; 9]).unwrap_err();
        assert!(matches!(err, DgfsError::TooLarge { requested: 9, cap: 8 }));
        assert!(!store.has_entry("k"));
        assert_eq!(store.total_entries(), 0);
    }

    #[test]
    fn eviction_removes_least_recently_used_and_unlinks_file() {
        let dir = TempDir::new().unwrap();
        // Capacity: 2 entries.
        let store = open_store(&dir, 512, 256);

        store.create_entry("a", "/f", b"aa").unwrap();
        store.create_entry("b", "/f", b"bb").unwrap();
        // Touch "a" so "b" becomes the LRU victim.
        let _ = store.get_entry("a").unwrap();
        store.create_entry("c", "/f", b"cc").unwrap();

        assert!(store.has_entry("a"));
        assert!(!store.has_entry("b"));
        assert!(store.has_entry("c"));
        assert!(!store.root().join(cache_file_name("b")).exists());
        assert!(store.root().join(cache_file_name("a")).exists());
    }

    #[test]
    fn same_key_create_replaces_payload() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1024, 256);

        store.create_entry("k", "/f", b"old").unwrap();
        store.create_entry("k", "/f", b"newer").unwrap();

        assert_eq!(store.total_entries(), 1);
        let entry = store.get_entry("k").unwrap();
        let mut buf = vec![0_u8; entry.size()];
        entry.read_data(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"newer");
    }

    #[test]
    fn group_purge_removes_only_that_group() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 4096, 256);

        store.create_entry("f1:0", "/f1", b"one").unwrap();
        store.create_entry("f1:1", "/f1", b"two").unwrap();
        store.create_entry("f2:0", "/f2", b"three").unwrap();

        assert_eq!(store.entry_keys_for_group("/f1").len(), 2);
        store.delete_all_entries_for_group("/f1");

        assert!(!store.has_entry("f1:0"));
        assert!(!store.has_entry("f1:1"));
        assert!(store.has_entry("f2:0"));
        assert!(store.entry_keys_for_group("/f1").is_empty());
        assert!(!store.root().join(cache_file_name("f1:0")).exists());
    }

    #[test]
    fn delete_entry_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1024, 256);
        store.create_entry("k", "/f", b"x").unwrap();

        store.delete_entry("k");
        store.delete_entry("k");
        assert!(!store.has_entry("k"));
    }

    #[test]
    fn zero_length_entries_are_valid() {
        // The EOF sentinel in the block store is a zero-length entry.
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1024, 256);

        store.create_entry("sentinel", "/f", &[]).unwrap();
        let entry = store.get_entry("sentinel").unwrap();
        assert_eq!(entry.size(), 0);
        let mut buf = [0_u8; 4];
        assert_eq!(entry.read_data(&mut buf, 0).unwrap(), 0);
    }

    #[test]
    fn release_removes_backing_directory() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1024, 256);
        store.create_entry("k", "/f", b"x").unwrap();

        let root = store.root().to_path_buf();
        assert!(root.exists());
        store.release();
        assert!(!root.exists());
    }

    #[test]
    fn size_accounting_uses_entry_cap_upper_bound() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 1024, 256);
        store.create_entry("k", "/f", b"tiny").unwrap();

        assert_eq!(store.total_entry_size(), 256);
        assert_eq!(store.available_size(), 3 * 256);
    }
}
