//! Named-group bounded buffer with cap-wait backpressure.
//!
//! Producers call [`RamBufferGroup::create_entry`], which blocks while
//! the buffer is at capacity; consumers pop entries and thereby wake the
//! blocked producers. One group per writer keeps teardown scoped: a
//! writer's pending entries vanish together with its group.
//!
//! A group handle holds a non-owning capability to signal the shared
//! buffer core rather than a back-pointer, so there is no ownership
//! cycle and a single mutex/condvar pair covers all capacity decisions.

use dgfs_error::{DgfsError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;
use tracing::trace;

/// One pending payload.
#[derive(Debug)]
pub struct RamBufferEntry {
    key: String,
    data: Vec<u8>,
    access_count: AtomicUsize,
    creation_time: SystemTime,
}

impl RamBufferEntry {
    fn new(key: &str, data: &[u8]) -> Self {
        Self {
            key: key.to_owned(),
            data: data.to_vec(),
            access_count: AtomicUsize::new(0),
            creation_time: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn access_count(&self) -> usize {
        self.access_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn creation_time(&self) -> SystemTime {
        self.creation_time
    }

    /// Payload bytes; each call bumps the access count.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        &self.data
    }
}

#[derive(Debug, Default)]
struct GroupState {
    entries: HashMap<String, Arc<RamBufferEntry>>,
    size: u64,
}

#[derive(Debug)]
struct BufferCore {
    size_cap: u64,
    state: Mutex<HashMap<String, GroupState>>,
    space_freed: Condvar,
}

impl BufferCore {
    fn total_size(groups: &HashMap<String, GroupState>) -> u64 {
        groups.values().map(|group| group.size).sum()
    }
}

/// Bounded buffer of named entry groups.
#[derive(Debug, Clone)]
pub struct RamBuffer {
    core: Arc<BufferCore>,
}

impl RamBuffer {
    #[must_use]
    pub fn new(size_cap: u64) -> Self {
        Self {
            core: Arc::new(BufferCore {
                size_cap,
                state: Mutex::new(HashMap::new()),
                space_freed: Condvar::new(),
            }),
        }
    }

    #[must_use]
    pub fn size_cap(&self) -> u64 {
        self.core.size_cap
    }

    /// Create (or reattach to) a named group and return its handle.
    #[must_use]
    pub fn create_group(&self, name: &str) -> RamBufferGroup {
        let mut groups = self.core.state.lock();
        groups.entry(name.to_owned()).or_default();
        drop(groups);
        RamBufferGroup {
            core: Arc::clone(&self.core),
            name: name.to_owned(),
        }
    }

    /// Handle to an existing group, if present.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<RamBufferGroup> {
        let groups = self.core.state.lock();
        groups.contains_key(name).then(|| RamBufferGroup {
            core: Arc::clone(&self.core),
            name: name.to_owned(),
        })
    }

    /// Drop a group and all its entries, waking blocked producers.
    pub fn delete_group(&self, name: &str) {
        let mut groups = self.core.state.lock();
        groups.remove(name);
        self.core.space_freed.notify_all();
    }

    pub fn delete_all_groups(&self) {
        let mut groups = self.core.state.lock();
        groups.clear();
        self.core.space_freed.notify_all();
    }

    #[must_use]
    pub fn total_entries(&self) -> usize {
        let groups = self.core.state.lock();
        groups.values().map(|group| group.entries.len()).sum()
    }

    #[must_use]
    pub fn total_entry_size(&self) -> u64 {
        let groups = self.core.state.lock();
        BufferCore::total_size(&groups)
    }

    #[must_use]
    pub fn available_size(&self) -> u64 {
        let groups = self.core.state.lock();
        self.core
            .size_cap
            .saturating_sub(BufferCore::total_size(&groups))
    }

    /// Block until `bytes` of space are available. Returns false when the
    /// request can never be satisfied.
    #[must_use]
    pub fn wait_for_space(&self, bytes: u64) -> bool {
        if bytes > self.core.size_cap {
            return false;
        }
        let mut groups = self.core.state.lock();
        while self.core.size_cap - BufferCore::total_size(&groups) < bytes {
            self.core.space_freed.wait(&mut groups);
        }
        true
    }

    pub fn release(&self) {
        self.delete_all_groups();
    }
}

/// Handle onto one named group of a [`RamBuffer`].
#[derive(Debug, Clone)]
pub struct RamBufferGroup {
    core: Arc<BufferCore>,
    name: String,
}

impl RamBufferGroup {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert an entry, blocking while the buffer is at capacity.
    ///
    /// Fails with `TooLarge` when the payload alone exceeds the cap.
    pub fn create_entry(&self, key: &str, data: &[u8]) -> Result<Arc<RamBufferEntry>> {
        if data.len() as u64 > self.core.size_cap {
            return Err(DgfsError::TooLarge {
                requested: data.len(),
                cap: usize::try_from(self.core.size_cap).unwrap_or(usize::MAX),
            });
        }

        let mut groups = self.core.state.lock();
        while self.core.size_cap - BufferCore::total_size(&groups) < data.len() as u64 {
            trace!(event = "buffer_cap_wait", group = self.name.as_str(), bytes = data.len());
            self.core.space_freed.wait(&mut groups);
        }

        let entry = Arc::new(RamBufferEntry::new(key, data));
        let group = groups.entry(self.name.clone()).or_default();
        if let Some(prior) = group.entries.insert(key.to_owned(), Arc::clone(&entry)) {
            group.size = group.size.saturating_sub(prior.size() as u64);
        }
        group.size += data.len() as u64;
        Ok(entry)
    }

    #[must_use]
    pub fn get_entry(&self, key: &str) -> Option<Arc<RamBufferEntry>> {
        let groups = self.core.state.lock();
        groups
            .get(&self.name)
            .and_then(|group| group.entries.get(key).cloned())
    }

    /// Remove and return an entry, waking blocked producers.
    #[must_use]
    pub fn pop_entry(&self, key: &str) -> Option<Arc<RamBufferEntry>> {
        let mut groups = self.core.state.lock();
        let group = groups.get_mut(&self.name)?;
        let entry = group.entries.remove(key)?;
        group.size = group.size.saturating_sub(entry.size() as u64);
        self.core.space_freed.notify_all();
        Some(entry)
    }

    /// Remove an entry, waking blocked producers.
    pub fn delete_entry(&self, key: &str) {
        let _ = self.pop_entry(key);
    }

    pub fn delete_all_entries(&self) {
        let mut groups = self.core.state.lock();
        if let Some(group) = groups.get_mut(&self.name) {
            group.entries.clear();
            group.size = 0;
            self.core.space_freed.notify_all();
        }
    }

    #[must_use]
    pub fn entry_keys(&self) -> Vec<String> {
        let groups = self.core.state.lock();
        groups
            .get(&self.name)
            .map(|group| group.entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        let groups = self.core.state.lock();
        groups
            .get(&self.name)
            .map(|group| group.entries.len())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        let groups = self.core.state.lock();
        groups.get(&self.name).map(|group| group.size).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn entries_roundtrip_within_cap() {
        let buffer = RamBuffer::new(100);
        let group = buffer.create_group("/f");

        group.create_entry("0", b"aaaa").unwrap();
        group.create_entry("4", b"bbbb").unwrap();

        assert_eq!(buffer.total_entries(), 2);
        assert_eq!(buffer.total_entry_size(), 8);
        assert_eq!(buffer.available_size(), 92);

        let entry = group.pop_entry("0").unwrap();
        assert_eq!(entry.data(), b"aaaa");
        assert_eq!(entry.access_count(), 1);
        assert_eq!(buffer.total_entry_size(), 4);
        assert!(group.get_entry("0").is_none());
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let buffer = RamBuffer::new(4);
        let group = buffer.create_group("/f");
        assert!(matches!(
            group.create_entry("k", &[0_u8; 5]),
            Err(DgfsError::TooLarge { .. })
        ));
    }

    #[test]
    fn producer_blocks_until_pop_frees_space() {
        let buffer = RamBuffer::new(8);
        let group = buffer.create_group("/f");
        group.create_entry("first", &[1_u8; 8]).unwrap();

        let producer_group = group.clone();
        let producer = thread::spawn(move || {
            // Blocks: buffer is full.
            producer_group.create_entry("second", &[2_u8; 8]).unwrap();
        });

        // Give the producer time to reach the wait.
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        let _ = group.pop_entry("first").unwrap();
        producer.join().unwrap();
        assert!(group.get_entry("second").is_some());
    }

    #[test]
    fn group_delete_wakes_waiters() {
        let buffer = RamBuffer::new(8);
        let full = buffer.create_group("/full");
        full.create_entry("x", &[0_u8; 8]).unwrap();

        let other = buffer.create_group("/other");
        let waiter = thread::spawn(move || other.create_entry("y", &[0_u8; 4]).unwrap());

        thread::sleep(Duration::from_millis(50));
        buffer.delete_group("/full");
        waiter.join().unwrap();
        assert_eq!(buffer.total_entry_size(), 4);
    }

    #[test]
    fn wait_for_space_rejects_impossible_requests() {
        let buffer = RamBuffer::new(10);
        assert!(!buffer.wait_for_space(11));
        assert!(buffer.wait_for_space(10));
    }

    #[test]
    fn same_key_insert_replaces_size_accounting() {
        let buffer = RamBuffer::new(100);
        let group = buffer.create_group("/f");
        group.create_entry("k", &[0_u8; 30]).unwrap();
        group.create_entry("k", &[0_u8; 10]).unwrap();
        assert_eq!(group.size(), 10);
        assert_eq!(group.entry_count(), 1);
    }
}
