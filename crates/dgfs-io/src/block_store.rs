//! Per-open-file facade over the shared cache.
//!
//! Keeps a handful of hot blocks in a small in-process LRU and mirrors
//! completed blocks into the shared [`CacheStore`] under keys scoped to
//! `(path, checksum, block_id)`. The shared tier survives this file
//! session; the small LRU does not.

use dgfs_cache::CacheStore;
use dgfs_error::Result;
use dgfs_types::BlockId;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{trace, warn};

/// Capacity of the in-process block LRU.
const SMALL_LRU_BLOCKS: usize = 5;

/// One completed block of file data. Immutable after construction.
#[derive(Debug, Clone)]
pub struct FileBlock {
    id: BlockId,
    data: Vec<u8>,
    eof: bool,
}

impl FileBlock {
    #[must_use]
    pub fn new(id: BlockId, data: Vec<u8>, eof: bool) -> Self {
        Self { id, data, eof }
    }

    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the file ends inside (or exactly at the end of) this
    /// block.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }
}

struct StoreState {
    lru: LruCache<u64, Arc<FileBlock>>,
    shared: Option<Arc<dyn CacheStore>>,
}

/// Block cache facade for one open file.
pub struct FileBlockStore {
    path: String,
    checksum: String,
    block_size: usize,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for FileBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlockStore")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl FileBlockStore {
    #[must_use]
    pub fn new(
        shared: Option<Arc<dyn CacheStore>>,
        path: impl Into<String>,
        checksum: Option<String>,
        block_size: usize,
    ) -> Self {
        Self {
            path: path.into(),
            checksum: checksum.unwrap_or_default(),
            block_size,
            state: Mutex::new(StoreState {
                lru: LruCache::new(NonZeroUsize::new(SMALL_LRU_BLOCKS).unwrap_or(NonZeroUsize::MIN)),
                shared,
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn cache_key(&self, id: BlockId) -> String {
        format!("{}:{}:{}", self.path, self.checksum, id.0)
    }

    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        let state = self.state.lock();
        if state.lru.contains(&id.0) {
            return true;
        }
        state
            .shared
            .as_ref()
            .is_some_and(|shared| shared.has_entry(&self.cache_key(id)))
    }

    /// Fetch a block, reconstructing it from the shared cache on a small-LRU
    /// miss. `None` when the block is cached nowhere or the shared payload
    /// cannot be read.
    #[must_use]
    pub fn get(&self, id: BlockId) -> Option<Arc<FileBlock>> {
        let mut state = self.state.lock();
        if let Some(block) = state.lru.get(&id.0) {
            return Some(Arc::clone(block));
        }

        let shared = state.shared.clone()?;
        drop(state);

        let entry = shared.get_entry(&self.cache_key(id))?;
        let mut data = vec![0_u8; entry.size()];
        if let Err(err) = entry.read_data(&mut data, 0) {
            warn!(
                event = "cache_block_read_failed",
                path = self.path.as_str(),
                block = id.0,
                error = %err
            );
            return None;
        }

        // A shared-cache payload shorter than a full block means the
        // file ended inside it.
        let block = Arc::new(FileBlock::new(id, data, entry.size() < self.block_size));
        self.state.lock().lru.put(id.0, Arc::clone(&block));
        trace!(event = "cache_block_restored", path = self.path.as_str(), block = id.0);
        Some(block)
    }

    /// Insert a completed block, mirroring it into the shared cache.
    ///
    /// When the block is full and carries EOF, a zero-length sentinel
    /// entry is recorded for the next block id so a cold reader can
    /// discover EOF without another round trip.
    pub fn put(&self, block: FileBlock) -> Result<()> {
        let block = Arc::new(block);
        let shared = {
            let mut state = self.state.lock();
            state.lru.put(block.id().0, Arc::clone(&block));
            state.shared.clone()
        };

        let Some(shared) = shared else {
            return Ok(());
        };

        shared.create_entry(&self.cache_key(block.id()), &self.path, block.data())?;

        if block.len() == self.block_size && block.is_eof() {
            shared.create_entry(&self.cache_key(block.id().next()), &self.path, &[])?;
        }
        Ok(())
    }

    /// Purge the in-process LRU and detach from the shared cache. The
    /// shared tier keeps its entries for future sessions of the same
    /// file.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.shared = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dgfs_cache::MemCacheStore;

    fn shared_cache() -> Arc<dyn CacheStore> {
        Arc::new(MemCacheStore::new(1 << 20, 1 << 16))
    }

    #[test]
    fn put_then_get_from_small_lru() {
        let store = FileBlockStore::new(None, "/f", None, 100);
        store
            .put(FileBlock::new(BlockId(0), vec![1_u8; 100], false))
            .unwrap();

        let block = store.get(BlockId(0)).unwrap();
        assert_eq!(block.len(), 100);
        assert!(!block.is_eof());
        assert!(store.contains(BlockId(0)));
        assert!(!store.contains(BlockId(1)));
    }

    #[test]
    fn small_lru_eviction_falls_back_to_shared_cache() {
        let shared = shared_cache();
        let store = FileBlockStore::new(Some(Arc::clone(&shared)), "/f", None, 10);

        // Push SMALL_LRU_BLOCKS + 1 blocks; block 0 falls out of the LRU
        // but survives in the shared cache.
        for id in 0..=SMALL_LRU_BLOCKS as u64 {
            store
                .put(FileBlock::new(BlockId(id), vec![id as u8; 10], false))
                .unwrap();
        }

        let restored = store.get(BlockId(0)).unwrap();
        assert_eq!(restored.data(), &[0_u8; 10]);
        assert!(!restored.is_eof());
    }

    #[test]
    fn partial_shared_payload_restores_as_eof() {
        let shared = shared_cache();
        let store = FileBlockStore::new(Some(Arc::clone(&shared)), "/f", None, 10);
        store
            .put(FileBlock::new(BlockId(3), vec![7_u8; 4], true))
            .unwrap();

        // Force reconstruction from the shared tier.
        let fresh = FileBlockStore::new(Some(shared), "/f", None, 10);
        let block = fresh.get(BlockId(3)).unwrap();
        assert_eq!(block.len(), 4);
        assert!(block.is_eof());
    }

    #[test]
    fn full_eof_block_writes_sentinel() {
        let shared = shared_cache();
        let store = FileBlockStore::new(Some(Arc::clone(&shared)), "/f", None, 10);
        store
            .put(FileBlock::new(BlockId(2), vec![9_u8; 10], true))
            .unwrap();

        // Sentinel for block 3 exists and restores as an empty EOF block.
        assert!(store.contains(BlockId(3)));
        let sentinel = store.get(BlockId(3)).unwrap();
        assert_eq!(sentinel.len(), 0);
        assert!(sentinel.is_eof());
    }

    #[test]
    fn partial_block_writes_no_sentinel() {
        let shared = shared_cache();
        let store = FileBlockStore::new(Some(shared), "/f", None, 10);
        store
            .put(FileBlock::new(BlockId(0), vec![1_u8; 6], true))
            .unwrap();
        assert!(!store.contains(BlockId(1)));
    }

    #[test]
    fn keys_scope_by_checksum() {
        let shared = shared_cache();
        let v1 = FileBlockStore::new(
            Some(Arc::clone(&shared)),
            "/f",
            Some("aaaa".to_owned()),
            10,
        );
        v1.put(FileBlock::new(BlockId(0), vec![1_u8; 10], false))
            .unwrap();

        // A different checksum sees a cold cache for the same path.
        let v2 = FileBlockStore::new(Some(shared), "/f", Some("bbbb".to_owned()), 10);
        assert!(!v2.contains(BlockId(0)));
    }

    #[test]
    fn release_detaches_shared_cache() {
        let shared = shared_cache();
        let store = FileBlockStore::new(Some(Arc::clone(&shared)), "/f", None, 10);
        store
            .put(FileBlock::new(BlockId(0), vec![1_u8; 10], false))
            .unwrap();

        store.release();
        assert!(store.get(BlockId(0)).is_none());
        // Shared tier keeps the entry for later sessions.
        assert!(shared.has_entry("/f::0"));
    }
}
