//! RAM tier of the cache substrate.
//!
//! Byte-bounded LRU over in-memory payloads. Unlike the disk tier the
//! accounting here is exact; eviction pops least-recently-used entries
//! until the total fits the cap again.

use crate::{CacheEntry, CacheStore};
use dgfs_error::{DgfsError, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::trace;

#[derive(Debug)]
struct MemCacheEntry {
    key: String,
    group: String,
    data: Vec<u8>,
    creation_time: SystemTime,
}

impl CacheEntry for MemCacheEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn creation_time(&self) -> SystemTime {
        self.creation_time
    }

    fn read_data(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

#[derive(Debug)]
struct MemState {
    lru: LruCache<String, Arc<MemCacheEntry>>,
    groups: HashMap<String, HashSet<String>>,
    total_bytes: u64,
}

impl MemState {
    fn forget(&mut self, entry: &Arc<MemCacheEntry>) {
        self.total_bytes = self.total_bytes.saturating_sub(entry.data.len() as u64);
        if let Some(members) = self.groups.get_mut(&entry.group) {
            members.remove(&entry.key);
            if members.is_empty() {
                self.groups.remove(&entry.group);
            }
        }
    }
}

/// In-memory [`CacheStore`] bounded by total payload bytes.
#[derive(Debug)]
pub struct MemCacheStore {
    entry_size_cap: usize,
    size_cap: u64,
    state: Mutex<MemState>,
}

impl MemCacheStore {
    #[must_use]
    pub fn new(size_cap: u64, entry_size_cap: usize) -> Self {
        Self {
            entry_size_cap,
            size_cap,
            state: Mutex::new(MemState {
                lru: LruCache::unbounded(),
                groups: HashMap::new(),
                total_bytes: 0,
            }),
        }
    }
}

impl CacheStore for MemCacheStore {
    fn release(&self) {
        self.delete_all_entries();
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
        self.state.lock().total_bytes
    }

    fn available_size(&self) -> u64 {
        let state = self.state.lock();
        self.size_cap.saturating_sub(state.total_bytes)
    }

    fn delete_all_entries(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.groups.clear();
        state.total_bytes = 0;
    }

    fn delete_all_entries_for_group(&self, group: &str) {
        let mut state = self.state.lock();
        let Some(members) = state.groups.remove(group) else {
            return;
        };
        for key in members {
            if let Some(entry) = state.lru.pop(&key) {
                state.total_bytes = state.total_bytes.saturating_sub(entry.data.len() as u64);
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
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn create_entry(&self, key: &str, group: &str, data: &[u8]) -> Result<Arc<dyn CacheEntry>> {
        if data.len() > self.entry_size_cap {
            return Err(DgfsError::TooLarge {
                requested: data.len(),
                cap: self.entry_size_cap,
            });
        }

        let entry = Arc::new(MemCacheEntry {
            key: key.to_owned(),
            group: group.to_owned(),
            data: data.to_vec(),
            creation_time: SystemTime::now(),
        });

        let mut state = self.state.lock();
        if let Some(prior) = state.lru.pop(key) {
            state.forget(&prior);
        }
        let _ = state.lru.push(key.to_owned(), Arc::clone(&entry));
        state.total_bytes += data.len() as u64;
        state
            .groups
            .entry(group.to_owned())
            .or_default()
            .insert(key.to_owned());

        while state.total_bytes > self.size_cap {
            let Some((victim_key, victim)) = state.lru.pop_lru() else {
                break;
            };
            trace!(event = "cache_evict", key = victim_key.as_str());
            state.forget(&victim);
        }
        drop(state);

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
            state.forget(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_accounting() {
        let store = MemCacheStore::new(100, 50);
        store.create_entry("k", "/f", b"abcdef").unwrap();

        assert_eq!(store.total_entries(), 1);
        assert_eq!(store.total_entry_size(), 6);
        assert_eq!(store.available_size(), 94);

        let entry = store.get_entry("k").unwrap();
        let mut buf = vec![0_u8; 6];
        assert_eq!(entry.read_data(&mut buf, 0).unwrap(), 6);
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn byte_cap_evicts_oldest_accessed_first() {
        let store = MemCacheStore::new(10, 10);
        store.create_entry("a", "/f", &[1_u8; 4]).unwrap();
        store.create_entry("b", "/f", &[2_u8; 4]).unwrap();
        // Touch "a"; inserting 4 more bytes must evict "b".
        let _ = store.get_entry("a").unwrap();
        store.create_entry("c", "/f", &[3_u8; 4]).unwrap();

        assert!(store.has_entry("a"));
        assert!(!store.has_entry("b"));
        assert!(store.has_entry("c"));
        assert!(store.total_entry_size() <= 10);
    }

    #[test]
    fn replace_same_key_updates_bytes() {
        let store = MemCacheStore::new(100, 50);
        store.create_entry("k", "/f", &[0_u8; 30]).unwrap();
        store.create_entry("k", "/f", &[0_u8; 10]).unwrap();
        assert_eq!(store.total_entry_size(), 10);
        assert_eq!(store.total_entries(), 1);
    }

    #[test]
    fn group_purge() {
        let store = MemCacheStore::new(1000, 100);
        store.create_entry("f1:0", "/f1", b"x").unwrap();
        store.create_entry("f2:0", "/f2", b"y").unwrap();

        store.delete_all_entries_for_group("/f1");
        assert!(!store.has_entry("f1:0"));
        assert!(store.has_entry("f2:0"));
        assert_eq!(store.total_entry_size(), 1);
    }

    #[test]
    fn too_large_rejected() {
        let store = MemCacheStore::new(1000, 4);
        assert!(matches!(
            store.create_entry("k", "/f", &[0_u8; 5]),
            Err(DgfsError::TooLarge { .. })
        ));
    }
}
