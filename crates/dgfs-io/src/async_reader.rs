//! Cache-through read pipeline with a bounded connection pool.
//!
//! One [`AsyncCacheThroughReader`] owns N base readers (one per remote
//! connection). Readers circulate through a bounded channel: a
//! dispatcher thread pairs each queued block request with the next free
//! reader and spawns a transfer worker for the pair. Concurrent misses
//! on one block share a single in-flight [`BlockTransfer`]; completed
//! blocks land in the per-file [`FileBlockStore`] so later reads skip
//! the remote store entirely.
//!
//! With two or more base readers a [`Prefetcher`] speculates one block
//! ahead of the reading position, keeping idle connections busy during
//! sequential scans.
//!
//! # Teardown
//!
//! `release` flips the terminate flag, drops both channel senders,
//! fails every in-flight transfer so blocked consumers wake, joins the
//! dispatcher and workers, purges the block store, and releases every
//! base reader. Workers re-check the terminate flag before returning a
//! reader to the pool, so nobody sends into a disconnected channel.

use crate::block_store::{FileBlock, FileBlockStore};
use crate::prefetcher::Prefetcher;
use crate::transfer::{BlockTransfer, TransferMap};
use crate::{FileMeta, PositionalReader, READ_BUFFER_SIZE};
use crossbeam_channel::{Receiver, Sender, bounded};
use dgfs_cache::CacheStore;
use dgfs_error::{DgfsError, Result};
use dgfs_types::{BlockGeometry, BlockId, ReadOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Capacity of the free-reader pool channel.
const READER_POOL_CAP: usize = 10;
/// Capacity of the block request queue; the primary producer-side
/// backpressure for scheduling.
const BLOCK_REQUEST_CAP: usize = 5;

type BoxReader = Box<dyn PositionalReader>;

struct ControlState {
    terminate: bool,
    last_error: Option<DgfsError>,
    request_tx: Option<Sender<Arc<BlockTransfer>>>,
    reader_tx: Option<Sender<BoxReader>>,
}

struct ReaderShared {
    meta: FileMeta,
    geometry: BlockGeometry,
    block_store: FileBlockStore,
    transfers: TransferMap,
    prefetcher: Mutex<Option<Prefetcher>>,
    control: Mutex<ControlState>,
    reader_rx: Receiver<BoxReader>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReaderShared {
    fn terminated(&self) -> bool {
        self.control.lock().terminate
    }

    fn record_error(&self, err: DgfsError) {
        self.control.lock().last_error = Some(err);
    }

    /// Hand a reader back to the pool, or release it when tearing down.
    fn return_reader(&self, reader: BoxReader) {
        let tx = {
            let control = self.control.lock();
            if control.terminate {
                None
            } else {
                control.reader_tx.clone()
            }
        };
        match tx {
            Some(tx) => {
                if let Err(send_err) = tx.send(reader) {
                    send_err.into_inner().release();
                }
            }
            None => reader.release(),
        }
    }

    /// Fetch-or-create the transfer for `id`, scheduling a fetch when
    /// this call created it.
    fn schedule_block_transfer(&self, id: BlockId) -> Result<Arc<BlockTransfer>> {
        let request_tx = {
            let control = self.control.lock();
            if control.terminate {
                return Err(DgfsError::Terminated);
            }
            control
                .request_tx
                .clone()
                .ok_or(DgfsError::Terminated)?
        };

        let (transfer, created) = self.transfers.get_or_create(id);
        if !created {
            return Ok(transfer);
        }

        trace!(event = "block_transfer_scheduled", path = self.meta.path.as_str(), block = id.0);
        if request_tx.send(Arc::clone(&transfer)).is_err() {
            self.transfers.remove(id);
            transfer.mark_failed();
            return Err(DgfsError::Terminated);
        }

        // Close the race with release(): a transfer published after
        // fail_all ran would otherwise strand its waiters.
        if self.terminated() {
            transfer.mark_failed();
            self.transfers.remove(id);
            return Err(DgfsError::Terminated);
        }
        Ok(transfer)
    }
}

fn run_dispatcher(shared: Arc<ReaderShared>, request_rx: Receiver<Arc<BlockTransfer>>) {
    for transfer in request_rx.iter() {
        if shared.terminated() {
            break;
        }
        let Ok(reader) = shared.reader_rx.recv() else {
            break;
        };

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("dgfs-io-xfer".to_owned())
            .spawn(move || run_transfer_worker(&worker_shared, &transfer, reader))
            .expect("failed to spawn transfer worker thread");

        let mut workers = shared.workers.lock();
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
    }
}

fn run_transfer_worker(shared: &Arc<ReaderShared>, transfer: &Arc<BlockTransfer>, reader: BoxReader) {
    let block_size = shared.geometry.block_size();
    let id = transfer.block_id();
    trace!(event = "block_transfer_start", path = shared.meta.path.as_str(), block = id.0);

    let mut scratch = vec![0_u8; READ_BUFFER_SIZE];
    let mut total = 0_usize;
    let mut offset = shared.geometry.block_start(id);
    let mut eof = false;
    let mut aborted = false;

    while total < block_size {
        // fail_all may abandon this transfer mid-flight.
        if transfer.is_failed() {
            aborted = true;
            break;
        }

        let want = scratch.len().min(block_size - total);
        match reader.read_at(&mut scratch[..want], offset) {
            Ok(outcome) => {
                if outcome.len > 0 {
                    transfer.write(&scratch[..outcome.len]);
                    total += outcome.len;
                    offset += outcome.len as u64;
                }
                if outcome.eof {
                    eof = true;
                    break;
                }
                if outcome.len == 0 {
                    // No progress and no EOF signal: treat as end of
                    // data rather than spinning on the base reader.
                    eof = true;
                    break;
                }
            }
            Err(err) => {
                warn!(
                    event = "block_transfer_failed",
                    path = shared.meta.path.as_str(),
                    block = id.0,
                    error = %err
                );
                transfer.mark_failed();
                shared.record_error(err);
                aborted = true;
                break;
            }
        }
    }

    if !aborted {
        transfer.mark_completed(eof);
        trace!(
            event = "block_transfer_done",
            path = shared.meta.path.as_str(),
            block = id.0,
            bytes = total,
            eof
        );

        let (data, is_eof) = transfer.snapshot();
        if let Err(err) = shared.block_store.put(FileBlock::new(id, data, is_eof)) {
            // The block was already served from the transfer buffer;
            // a cache put failure is recorded but not fatal.
            warn!(
                event = "block_cache_put_failed",
                path = shared.meta.path.as_str(),
                block = id.0,
                error = %err
            );
            shared.record_error(err);
        }
    }

    shared.transfers.remove(id);
    shared.return_reader(reader);
}

/// Asynchronous cache-through [`PositionalReader`].
pub struct AsyncCacheThroughReader {
    shared: Arc<ReaderShared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AsyncCacheThroughReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCacheThroughReader")
            .field("path", &self.shared.meta.path)
            .field("block_size", &self.shared.geometry.block_size())
            .finish_non_exhaustive()
    }
}

impl AsyncCacheThroughReader {
    /// Build the pipeline over 1..N base readers.
    ///
    /// Prefetching engages only when more than one reader is available:
    /// with a single connection a speculative fetch would starve the
    /// demand path.
    ///
    /// # Panics
    ///
    /// Panics when `readers` is empty or exceeds the pool capacity of
    /// 10.
    #[must_use]
    pub fn new(
        readers: Vec<BoxReader>,
        meta: FileMeta,
        block_size: usize,
        cache: Option<Arc<dyn CacheStore>>,
    ) -> Self {
        assert!(!readers.is_empty(), "at least one base reader is required");
        assert!(
            readers.len() <= READER_POOL_CAP,
            "reader pool capacity is {READER_POOL_CAP}"
        );

        let (reader_tx, reader_rx) = bounded(READER_POOL_CAP);
        let (request_tx, request_rx) = bounded(BLOCK_REQUEST_CAP);

        let engage_prefetch = readers.len() > 1;
        for reader in readers {
            reader_tx
                .send(reader)
                .expect("reader pool channel disconnected during construction");
        }

        let shared = Arc::new(ReaderShared {
            block_store: FileBlockStore::new(
                cache,
                meta.path.clone(),
                meta.checksum.clone(),
                block_size,
            ),
            geometry: BlockGeometry::new(block_size),
            meta,
            transfers: TransferMap::new(),
            prefetcher: Mutex::new(engage_prefetch.then(|| Prefetcher::new(block_size))),
            control: Mutex::new(ControlState {
                terminate: false,
                last_error: None,
                request_tx: Some(request_tx),
                reader_tx: Some(reader_tx),
            }),
            reader_rx,
            workers: Mutex::new(Vec::new()),
        });

        let dispatcher_shared = Arc::clone(&shared);
        let dispatcher = thread::Builder::new()
            .name("dgfs-io-dispatch".to_owned())
            .spawn(move || run_dispatcher(dispatcher_shared, request_rx))
            .expect("failed to spawn dispatcher thread");

        Self {
            shared,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    #[must_use]
    pub fn meta(&self) -> &FileMeta {
        &self.shared.meta
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.shared.geometry.block_size()
    }

    /// Grow the connection pool with extra readers, engaging the
    /// prefetcher if the pool had only one reader so far.
    pub fn add_prefetch_readers(&self, readers: Vec<BoxReader>) {
        {
            let mut prefetcher = self.shared.prefetcher.lock();
            if prefetcher.is_none() {
                *prefetcher = Some(Prefetcher::new(self.shared.geometry.block_size()));
            }
        }

        let tx = self.shared.control.lock().reader_tx.clone();
        for reader in readers {
            match &tx {
                Some(tx) => {
                    if let Err(send_err) = tx.send(reader) {
                        send_err.into_inner().release();
                    }
                }
                None => reader.release(),
            }
        }
    }

    fn read_at_inner(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        let shared = &self.shared;
        let block_size = shared.geometry.block_size();
        let mut total = 0_usize;
        let mut cursor = offset;

        while total < buf.len() {
            let id = shared.geometry.block_id(cursor);
            let in_block = (cursor - shared.geometry.block_start(id)) as usize;

            // Cache-fast path.
            if let Some(block) = shared.block_store.get(id) {
                let data = block.data();
                if in_block < data.len() {
                    let n = (data.len() - in_block).min(buf.len() - total);
                    buf[total..total + n].copy_from_slice(&data[in_block..in_block + n]);
                    total += n;
                    cursor += n as u64;

                    if in_block + n == data.len() && block.is_eof() {
                        return Ok(ReadOutcome::new(total, true));
                    }
                    continue;
                }
                if block.is_eof() {
                    return Ok(ReadOutcome::new(total, true));
                }
                // A fully consumed non-EOF block: fall through and let a
                // transfer refill past its end.
            }

            let needed = (block_size - in_block).min(buf.len() - total);
            let outcome = self.read_from_transfer(&mut buf[total..total + needed], cursor)?;
            total += outcome.len;
            cursor += outcome.len as u64;
            if outcome.eof {
                return Ok(ReadOutcome::new(total, true));
            }
            if outcome.len == 0 {
                break;
            }
        }

        Ok(ReadOutcome::new(total, false))
    }

    fn read_from_transfer(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        let shared = &self.shared;
        let id = shared.geometry.block_id(offset);
        let in_block = (offset - shared.geometry.block_start(id)) as usize;

        let transfer = shared.schedule_block_transfer(id)?;

        debug!(
            event = "transfer_wait",
            path = shared.meta.path.as_str(),
            block = id.0,
            need = in_block + buf.len()
        );
        // Wait one byte past the request: either that byte arrives
        // (proving the window does not end the file) or the transfer
        // completes, so copy_to decides EOF on this call rather than
        // the next one. A request ending at the block boundary waits
        // for completion, which the worker signals once the block is
        // full.
        if !transfer.wait_for_data(in_block + buf.len() + 1) {
            return Err(DgfsError::TransferFailed { block: id.0 });
        }

        let (n, eof) = transfer.copy_to(buf, in_block);
        Ok(ReadOutcome::new(n, eof))
    }

    fn trigger_prefetch(&self, offset: u64) {
        let shared = &self.shared;
        let prefetcher = shared.prefetcher.lock();
        let Some(prefetcher) = prefetcher.as_ref() else {
            return;
        };

        for target in prefetcher.determine(offset, shared.meta.size) {
            if shared.transfers.contains(target) || shared.block_store.contains(target) {
                continue;
            }
            trace!(event = "prefetch_trigger", path = shared.meta.path.as_str(), block = target.0);
            if let Err(err) = shared.schedule_block_transfer(target) {
                debug!(
                    event = "prefetch_schedule_failed",
                    path = shared.meta.path.as_str(),
                    block = target.0,
                    error = %err
                );
            }
        }
    }
}

impl PositionalReader for AsyncCacheThroughReader {
    fn path(&self) -> &str {
        &self.shared.meta.path
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::empty());
        }

        let result = self.read_at_inner(buf, offset);
        // Prefetch keys off the entry offset so a long read does not
        // fan speculation past what the caller actually touched.
        self.trigger_prefetch(offset);
        result
    }

    fn available(&self, offset: u64) -> i64 {
        let shared = &self.shared;
        let id = shared.geometry.block_id(offset);
        let in_block = (offset - shared.geometry.block_start(id)) as i64;

        if shared.block_store.contains(id) {
            return shared.geometry.block_size() as i64 - in_block;
        }
        match shared.transfers.get(id) {
            Some(transfer) => transfer.buffer_len() as i64 - in_block,
            None => -1,
        }
    }

    fn pending_error(&self) -> Option<DgfsError> {
        self.shared.control.lock().last_error.clone()
    }

    fn release(&self) {
        {
            let mut control = self.shared.control.lock();
            if control.terminate {
                return;
            }
            control.terminate = true;
            control.request_tx = None;
            control.reader_tx = None;
        }
        debug!(event = "async_reader_release", path = self.shared.meta.path.as_str());

        // Wake every consumer blocked on an in-flight block.
        self.shared.transfers.fail_all();

        if let Some(dispatcher) = self.dispatcher.lock().take() {
            let _ = dispatcher.join();
        }
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }

        self.shared.block_store.release();
        self.shared.transfers.clear();

        while let Ok(reader) = self.shared.reader_rx.try_recv() {
            reader.release();
        }
    }
}

impl Drop for AsyncCacheThroughReader {
    fn drop(&mut self) {
        self.release();
    }
}
