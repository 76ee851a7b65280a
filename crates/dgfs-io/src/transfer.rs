//! Per-block rendezvous between one transfer worker and any number of
//! waiting consumers.
//!
//! A [`BlockTransfer`] is a grow-only buffer plus a terminal status.
//! The producing worker appends chunks as they arrive from the base
//! reader; consumers block in [`BlockTransfer::wait_for_data`] until
//! enough bytes exist or the transfer reaches a terminal state. Status
//! transitions are monotonic: once `Completed` or `Failed`, the buffer
//! stops growing.

use dgfs_types::BlockId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Lifecycle of a block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InFlight,
    Completed { eof: bool },
    Failed,
}

#[derive(Debug)]
struct TransferState {
    buffer: Vec<u8>,
    status: TransferStatus,
}

/// Single-producer / multi-consumer buffer for one block in flight.
#[derive(Debug)]
pub struct BlockTransfer {
    block_id: BlockId,
    state: Mutex<TransferState>,
    progress: Condvar,
}

impl BlockTransfer {
    #[must_use]
    pub fn new(block_id: BlockId) -> Self {
        Self {
            block_id,
            state: Mutex::new(TransferState {
                buffer: Vec::new(),
                status: TransferStatus::InFlight,
            }),
            progress: Condvar::new(),
        }
    }

    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Append bytes from the producer. Ignored after a terminal state.
    pub fn write(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        if state.status == TransferStatus::InFlight {
            state.buffer.extend_from_slice(bytes);
        }
        self.progress.notify_all();
    }

    /// Terminal success. `eof` records whether the base read ended the
    /// file inside this block.
    pub fn mark_completed(&self, eof: bool) {
        let mut state = self.state.lock();
        state.status = TransferStatus::Completed { eof };
        self.progress.notify_all();
        trace!(event = "transfer_completed", block = self.block_id.0, eof);
    }

    /// Terminal failure. A no-op once completed.
    pub fn mark_failed(&self) {
        let mut state = self.state.lock();
        if !matches!(state.status, TransferStatus::Completed { .. }) {
            state.status = TransferStatus::Failed;
        }
        self.progress.notify_all();
    }

    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.state.lock().status
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state.lock().status == TransferStatus::Failed
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.state.lock().status, TransferStatus::Completed { .. })
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(
            self.state.lock().status,
            TransferStatus::Completed { eof: true }
        )
    }

    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Block until `size` bytes are buffered, or the transfer reaches a
    /// terminal state. Returns false iff the transfer failed.
    #[must_use]
    pub fn wait_for_data(&self, size: usize) -> bool {
        let mut state = self.state.lock();
        while state.buffer.len() < size {
            match state.status {
                TransferStatus::Completed { .. } => return true,
                TransferStatus::Failed => return false,
                TransferStatus::InFlight => self.progress.wait(&mut state),
            }
        }
        true
    }

    /// Copy available bytes starting at `offset` into `dst`. Returns the
    /// count copied and whether the copy reached the end of an EOF
    /// transfer.
    #[must_use]
    pub fn copy_to(&self, dst: &mut [u8], offset: usize) -> (usize, bool) {
        let state = self.state.lock();
        let n = if offset >= state.buffer.len() {
            0
        } else {
            let n = dst.len().min(state.buffer.len() - offset);
            dst[..n].copy_from_slice(&state.buffer[offset..offset + n]);
            n
        };

        let eof = matches!(state.status, TransferStatus::Completed { eof: true })
            && offset + n >= state.buffer.len();
        (n, eof)
    }

    /// Clone of the buffered bytes plus the EOF flag, for constructing
    /// the cacheable block after completion.
    #[must_use]
    pub fn snapshot(&self) -> (Vec<u8>, bool) {
        let state = self.state.lock();
        let eof = matches!(state.status, TransferStatus::Completed { eof: true });
        (state.buffer.clone(), eof)
    }
}

/// All in-flight transfers of one reader, keyed by block.
#[derive(Debug, Default)]
pub struct TransferMap {
    transfers: Mutex<HashMap<u64, Arc<BlockTransfer>>>,
}

impl TransferMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, block_id: BlockId) -> Option<Arc<BlockTransfer>> {
        self.transfers.lock().get(&block_id.0).cloned()
    }

    /// Atomically fetch the transfer for `block_id`, creating it when
    /// absent. The boolean is true iff this call created the entry; only
    /// the creator schedules the transfer, which is what keeps one block
    /// single-flight under concurrent misses.
    #[must_use]
    pub fn get_or_create(&self, block_id: BlockId) -> (Arc<BlockTransfer>, bool) {
        let mut transfers = self.transfers.lock();
        if let Some(existing) = transfers.get(&block_id.0) {
            return (Arc::clone(existing), false);
        }
        let transfer = Arc::new(BlockTransfer::new(block_id));
        transfers.insert(block_id.0, Arc::clone(&transfer));
        (transfer, true)
    }

    pub fn put(&self, transfer: Arc<BlockTransfer>) {
        self.transfers.lock().insert(transfer.block_id().0, transfer);
    }

    pub fn remove(&self, block_id: BlockId) {
        self.transfers.lock().remove(&block_id.0);
    }

    #[must_use]
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.transfers.lock().contains_key(&block_id.0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transfers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transfers.lock().is_empty()
    }

    pub fn clear(&self) {
        self.transfers.lock().clear();
    }

    /// Fail every in-flight transfer so all blocked consumers wake.
    pub fn fail_all(&self) {
        let transfers = self.transfers.lock();
        for transfer in transfers.values() {
            transfer.mark_failed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn buffer_grows_and_wait_returns() {
        let transfer = BlockTransfer::new(BlockId(0));
        transfer.write(b"abcd");
        assert_eq!(transfer.buffer_len(), 4);
        assert!(transfer.wait_for_data(4));
        assert!(matches!(transfer.status(), TransferStatus::InFlight));
    }

    #[test]
    fn wait_blocks_until_producer_writes() {
        let transfer = Arc::new(BlockTransfer::new(BlockId(1)));
        let consumer = {
            let transfer = Arc::clone(&transfer);
            thread::spawn(move || transfer.wait_for_data(8))
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!consumer.is_finished());

        transfer.write(&[0_u8; 8]);
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn completion_releases_short_waiters() {
        let transfer = Arc::new(BlockTransfer::new(BlockId(2)));
        let consumer = {
            let transfer = Arc::clone(&transfer);
            thread::spawn(move || transfer.wait_for_data(1000))
        };

        transfer.write(b"tail");
        transfer.mark_completed(true);
        // Completed with fewer bytes than requested still satisfies the
        // wait; copy_to then reports EOF.
        assert!(consumer.join().unwrap());

        let mut dst = [0_u8; 16];
        let (n, eof) = transfer.copy_to(&mut dst, 0);
        assert_eq!(n, 4);
        assert!(eof);
    }

    #[test]
    fn failure_wakes_waiters_with_false() {
        let transfer = Arc::new(BlockTransfer::new(BlockId(3)));
        let consumer = {
            let transfer = Arc::clone(&transfer);
            thread::spawn(move || transfer.wait_for_data(10))
        };

        thread::sleep(Duration::from_millis(20));
        transfer.mark_failed();
        assert!(!consumer.join().unwrap());
    }

    #[test]
    fn failed_cannot_override_completed() {
        let transfer = BlockTransfer::new(BlockId(4));
        transfer.mark_completed(false);
        transfer.mark_failed();
        assert!(transfer.is_completed());
        assert!(!transfer.is_failed());
    }

    #[test]
    fn writes_after_terminal_state_are_dropped() {
        let transfer = BlockTransfer::new(BlockId(5));
        transfer.write(b"ab");
        transfer.mark_completed(false);
        transfer.write(b"cd");
        assert_eq!(transfer.buffer_len(), 2);
    }

    #[test]
    fn copy_to_mid_buffer_without_eof() {
        let transfer = BlockTransfer::new(BlockId(6));
        transfer.write(b"0123456789");
        transfer.mark_completed(false);

        let mut dst = [0_u8; 4];
        let (n, eof) = transfer.copy_to(&mut dst, 2);
        assert_eq!(n, 4);
        assert_eq!(&dst, b"2345");
        assert!(!eof);
    }

    #[test]
    fn map_single_flight_create() {
        let map = TransferMap::new();
        let (first, created_first) = map.get_or_create(BlockId(7));
        let (second, created_second) = map.get_or_create(BlockId(7));
        assert!(created_first);
        assert!(!created_second);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn map_put_get_remove() {
        let map = TransferMap::new();
        assert!(map.is_empty());

        map.put(Arc::new(BlockTransfer::new(BlockId(9))));
        assert!(map.contains(BlockId(9)));
        assert_eq!(map.get(BlockId(9)).unwrap().block_id(), BlockId(9));

        map.remove(BlockId(9));
        assert!(!map.contains(BlockId(9)));
        assert!(map.get(BlockId(9)).is_none());
    }

    #[test]
    fn fail_all_marks_every_inflight_transfer() {
        let map = TransferMap::new();
        let (a, _) = map.get_or_create(BlockId(0));
        let (b, _) = map.get_or_create(BlockId(1));
        map.fail_all();
        assert!(a.is_failed());
        assert!(b.is_failed());
    }
}
