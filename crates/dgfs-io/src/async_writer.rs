//! Ordered asynchronous write queue.
//!
//! `write_at` detaches the caller from remote latency: payload bytes go
//! into a [`RamBuffer`] group (cap-waiting when the buffer is full) and
//! a bounded order queue hands them to a single background worker that
//! calls the inner writer serially, in submission order.
//!
//! The first inner write error flips the writer into drain-only mode:
//! the worker keeps consuming orders without writing so `flush` cannot
//! deadlock, and every later submission fails fast with the recorded
//! error. Recovery means recreating the writer.

use crate::PositionalWriter;
use crossbeam_channel::{Receiver, Sender, bounded};
use dgfs_cache::{RamBuffer, RamBufferGroup};
use dgfs_error::{DgfsError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Capacity of the pending-order queue.
const WRITE_QUEUE_CAP: usize = 10;

#[derive(Debug)]
struct WriteOrder {
    offset: u64,
    key: String,
}

struct WriterShared {
    last_error: Mutex<Option<DgfsError>>,
    pending: Mutex<usize>,
    drained: Condvar,
}

impl WriterShared {
    fn record_error(&self, err: DgfsError) {
        let mut last_error = self.last_error.lock();
        if last_error.is_none() {
            *last_error = Some(err);
        }
    }

    fn take_error_snapshot(&self) -> Option<DgfsError> {
        self.last_error.lock().clone()
    }

    fn add_pending(&self) {
        *self.pending.lock() += 1;
    }

    fn finish_pending(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.drained.wait(&mut pending);
        }
    }
}

/// Asynchronous adapter over an inner [`PositionalWriter`].
pub struct AsyncWriter {
    path: String,
    inner: Arc<Mutex<Box<dyn PositionalWriter>>>,
    buffer: RamBuffer,
    group: RamBufferGroup,
    queue_tx: Option<Sender<WriteOrder>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<WriterShared>,
    seq: u64,
    released: bool,
}

impl AsyncWriter {
    /// Wrap `inner`; pending payloads are parked in `buffer` under a
    /// group named after the file path.
    #[must_use]
    pub fn new(inner: Box<dyn PositionalWriter>, buffer: &RamBuffer) -> Self {
        let path = inner.path().to_owned();
        let group = buffer.create_group(&path);
        let inner = Arc::new(Mutex::new(inner));
        let shared = Arc::new(WriterShared {
            last_error: Mutex::new(None),
            pending: Mutex::new(0),
            drained: Condvar::new(),
        });

        let (queue_tx, queue_rx) = bounded(WRITE_QUEUE_CAP);
        let worker = spawn_write_worker(
            path.clone(),
            queue_rx,
            group.clone(),
            Arc::clone(&inner),
            Arc::clone(&shared),
        );

        Self {
            path,
            inner,
            buffer: buffer.clone(),
            group,
            queue_tx: Some(queue_tx),
            worker: Some(worker),
            shared,
            seq: 0,
            released: false,
        }
    }
}

fn spawn_write_worker(
    path: String,
    queue_rx: Receiver<WriteOrder>,
    group: RamBufferGroup,
    inner: Arc<Mutex<Box<dyn PositionalWriter>>>,
    shared: Arc<WriterShared>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("dgfs-io-write".to_owned())
        .spawn(move || {
            for order in queue_rx.iter() {
                let entry = group.pop_entry(&order.key);

                let failed = shared.last_error.lock().is_some();
                if !failed {
                    if let Some(entry) = entry {
                        let data = entry.data();
                        if !data.is_empty() {
                            let mut guard = inner.lock();
                            if let Err(err) = guard.write_at(data, order.offset) {
                                error!(
                                    event = "async_write_failed",
                                    path = path.as_str(),
                                    offset = order.offset,
                                    len = data.len(),
                                    error = %err
                                );
                                shared.record_error(err);
                            }
                        }
                    }
                }
                // Drain-only mode after an error still consumes orders so
                // flush callers wake up.
                shared.finish_pending();
            }
        })
        .expect("failed to spawn write worker thread")
}

impl PositionalWriter for AsyncWriter {
    fn path(&self) -> &str {
        &self.path
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        if let Some(err) = self.shared.take_error_snapshot() {
            return Err(err);
        }

        let key = format!("{offset}:{}", self.seq);
        self.seq += 1;

        // Cap-wait backpressure: blocks while the buffer is over its
        // byte cap.
        self.group.create_entry(&key, data)?;
        self.shared.add_pending();

        debug!(
            event = "async_write_queued",
            path = self.path.as_str(),
            offset,
            len = data.len()
        );
        let Some(queue_tx) = self.queue_tx.as_ref() else {
            self.group.delete_entry(&key);
            self.shared.finish_pending();
            return Err(DgfsError::Terminated);
        };
        if queue_tx.send(WriteOrder { offset, key: key.clone() }).is_err() {
            self.group.delete_entry(&key);
            self.shared.finish_pending();
            return Err(DgfsError::Terminated);
        }

        // The worker may have failed between the checks; surface it now
        // rather than on the next call.
        if let Some(err) = self.shared.take_error_snapshot() {
            return Err(err);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.shared.wait_drained();
        self.inner.lock().flush()?;
        match self.shared.take_error_snapshot() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn pending_error(&self) -> Option<DgfsError> {
        self.shared.take_error_snapshot()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(err) = self.flush() {
            warn!(event = "async_writer_release_flush_failed", path = self.path.as_str(), error = %err);
        }

        // Disconnect the queue so the worker drains out and exits.
        self.queue_tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.buffer.delete_group(&self.path);
        self.inner.lock().release();
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingWriter {
        calls: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
        flushes: Arc<Mutex<usize>>,
        fail_writes: Arc<Mutex<bool>>,
        write_delay: Option<Duration>,
    }

    impl PositionalWriter for RecordingWriter {
        fn path(&self) -> &str {
            "/async-under-test"
        }

        fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize> {
            if let Some(delay) = self.write_delay {
                thread::sleep(delay);
            }
            if *self.fail_writes.lock() {
                return Err(DgfsError::Remote("injected write failure".to_owned()));
            }
            self.calls.lock().push((offset, data.to_vec()));
            Ok(data.len())
        }

        fn flush(&mut self) -> Result<()> {
            *self.flushes.lock() += 1;
            Ok(())
        }

        fn pending_error(&self) -> Option<DgfsError> {
            None
        }

        fn release(&mut self) {}
    }

    #[test]
    fn writes_reach_inner_in_submission_order() {
        let recorder = RecordingWriter::default();
        let calls = Arc::clone(&recorder.calls);
        let buffer = RamBuffer::new(1 << 20);
        let mut writer = AsyncWriter::new(Box::new(recorder), &buffer);

        writer.write_at(b"first", 0).unwrap();
        writer.write_at(b"second", 100).unwrap();
        writer.write_at(b"third", 50).unwrap();
        writer.flush().unwrap();

        let recorded = calls.lock();
        assert_eq!(
            *recorded,
            vec![
                (0, b"first".to_vec()),
                (100, b"second".to_vec()),
                (50, b"third".to_vec()),
            ]
        );
    }

    #[test]
    fn flush_waits_for_queue_to_drain() {
        let recorder = RecordingWriter {
            write_delay: Some(Duration::from_millis(20)),
            ..RecordingWriter::default()
        };
        let calls = Arc::clone(&recorder.calls);
        let buffer = RamBuffer::new(1 << 20);
        let mut writer = AsyncWriter::new(Box::new(recorder), &buffer);

        for i in 0..5_u64 {
            writer.write_at(&[i as u8; 16], i * 16).unwrap();
        }
        writer.flush().unwrap();
        assert_eq!(calls.lock().len(), 5);
    }

    #[test]
    fn inner_error_fails_subsequent_submissions_fast() {
        let recorder = RecordingWriter::default();
        let fail = Arc::clone(&recorder.fail_writes);
        let buffer = RamBuffer::new(1 << 20);
        let mut writer = AsyncWriter::new(Box::new(recorder), &buffer);

        *fail.lock() = true;
        // First submission may succeed (the error lands asynchronously);
        // after a flush the error must be visible and sticky.
        let _ = writer.write_at(b"doomed", 0);
        assert!(writer.flush().is_err());
        assert!(matches!(
            writer.write_at(b"rejected", 8),
            Err(DgfsError::Remote(_))
        ));
        assert!(writer.pending_error().is_some());
    }

    #[test]
    fn worker_keeps_draining_after_error() {
        // Queued work behind a failure must still be consumed so flush
        // terminates.
        let recorder = RecordingWriter::default();
        let fail = Arc::clone(&recorder.fail_writes);
        let buffer = RamBuffer::new(1 << 20);
        let mut writer = AsyncWriter::new(Box::new(recorder), &buffer);

        *fail.lock() = true;
        for i in 0..8_u64 {
            if writer.write_at(&[0_u8; 32], i * 32).is_err() {
                break;
            }
        }
        assert!(writer.flush().is_err());
        assert_eq!(buffer.total_entries(), 0);
    }

    #[test]
    fn release_deletes_buffer_group_and_joins_worker() {
        let recorder = RecordingWriter::default();
        let calls = Arc::clone(&recorder.calls);
        let buffer = RamBuffer::new(1 << 20);
        let mut writer = AsyncWriter::new(Box::new(recorder), &buffer);

        writer.write_at(b"payload", 0).unwrap();
        writer.release();

        assert_eq!(calls.lock().len(), 1);
        assert!(buffer.group("/async-under-test").is_none());
        assert!(matches!(
            writer.write_at(b"late", 0),
            Err(DgfsError::Terminated)
        ));
    }

    #[test]
    fn zero_length_write_is_a_noop() {
        let recorder = RecordingWriter::default();
        let calls = Arc::clone(&recorder.calls);
        let buffer = RamBuffer::new(1 << 20);
        let mut writer = AsyncWriter::new(Box::new(recorder), &buffer);

        assert_eq!(writer.write_at(&[], 10).unwrap(), 0);
        writer.flush().unwrap();
        assert!(calls.lock().is_empty());
    }
}
