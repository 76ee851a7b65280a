//! Coalescing writer for sequential streams.
//!
//! Buffers contiguous positional writes into one run and hands the run
//! to the inner writer in a single call at the run's start offset. A
//! write that breaks contiguity spills the current run first; so does
//! crossing the high-water mark.

use crate::PositionalWriter;
use dgfs_error::{DgfsError, Result};
use tracing::{debug, warn};

/// Default spill threshold for buffered runs: 8 MiB.
pub const DEFAULT_HIGH_WATER: usize = 8 * 1024 * 1024;

/// Write coalescer over an inner [`PositionalWriter`].
pub struct BufferedWriter {
    path: String,
    inner: Box<dyn PositionalWriter>,
    buffer: Vec<u8>,
    run_start: u64,
    high_water: usize,
    released: bool,
}

impl BufferedWriter {
    #[must_use]
    pub fn new(inner: Box<dyn PositionalWriter>) -> Self {
        Self::with_high_water(inner, DEFAULT_HIGH_WATER)
    }

    #[must_use]
    pub fn with_high_water(inner: Box<dyn PositionalWriter>, high_water: usize) -> Self {
        let path = inner.path().to_owned();
        Self {
            path,
            inner,
            buffer: Vec::new(),
            run_start: 0,
            high_water: high_water.max(1),
            released: false,
        }
    }

    /// Push the buffered run to the inner writer. The buffer is cleared
    /// even on failure; a partial run is discarded rather than replayed.
    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let run = std::mem::take(&mut self.buffer);
        let offset = self.run_start;
        self.run_start = 0;
        debug!(
            event = "buffered_spill",
            path = self.path.as_str(),
            offset,
            len = run.len()
        );
        self.inner.write_at(&run, offset)?;
        Ok(())
    }
}

impl PositionalWriter for BufferedWriter {
    fn path(&self) -> &str {
        &self.path
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        if self.buffer.is_empty() {
            self.run_start = offset;
            self.buffer.extend_from_slice(data);
        } else if self.run_start + self.buffer.len() as u64 == offset {
            // Contiguous with the current run: coalesce.
            self.buffer.extend_from_slice(data);
        } else {
            self.spill()?;
            self.run_start = offset;
            self.buffer.extend_from_slice(data);
        }

        if self.buffer.len() >= self.high_water {
            self.spill()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        self.spill()?;
        self.inner.flush()
    }

    fn pending_error(&self) -> Option<DgfsError> {
        self.inner.pending_error()
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.spill() {
            warn!(event = "buffered_release_spill_failed", path = self.path.as_str(), error = %err);
        }
        if let Err(err) = self.inner.flush() {
            warn!(event = "buffered_release_flush_failed", path = self.path.as_str(), error = %err);
        }
        self.inner.release();
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Inner writer that records every call it receives.
    #[derive(Clone, Default)]
    struct RecordingWriter {
        calls: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
        flushes: Arc<Mutex<usize>>,
        fail_writes: Arc<Mutex<bool>>,
    }

    impl PositionalWriter for RecordingWriter {
        fn path(&self) -> &str {
            "/recorded"
        }

        fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize> {
            if *self.fail_writes.lock() {
                return Err(DgfsError::Remote("injected".to_owned()));
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
    fn contiguous_writes_coalesce_into_one_call() {
        let recorder = RecordingWriter::default();
        let calls = Arc::clone(&recorder.calls);
        let mut writer = BufferedWriter::with_high_water(Box::new(recorder), 8 * 1024 * 1024);

        // Eight contiguous 1 MiB writes: exactly the high-water mark.
        let chunk = vec![5_u8; 1024 * 1024];
        for i in 0..8_u64 {
            writer.write_at(&chunk, i * 1024 * 1024).unwrap();
        }

        let recorded = calls.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, 0);
        assert_eq!(recorded[0].1.len(), 8 * 1024 * 1024);
    }

    #[test]
    fn discontiguous_write_spills_prior_run() {
        let recorder = RecordingWriter::default();
        let calls = Arc::clone(&recorder.calls);
        let mut writer = BufferedWriter::with_high_water(Box::new(recorder), 1024);

        writer.write_at(b"aaaa", 0).unwrap();
        writer.write_at(b"bbbb", 100).unwrap();
        writer.flush().unwrap();

        let recorded = calls.lock();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0], (0, b"aaaa".to_vec()));
        assert_eq!(recorded[1], (100, b"bbbb".to_vec()));
    }

    #[test]
    fn spill_offsets_accumulate_coalesced_lengths() {
        let recorder = RecordingWriter::default();
        let calls = Arc::clone(&recorder.calls);
        let mut writer = BufferedWriter::with_high_water(Box::new(recorder), 10);

        // 25 contiguous bytes in 5-byte writes with a 10-byte high water:
        // ceil(25/10) + 1 = 4 calls at most; offsets advance by spill size.
        for i in 0..5_u64 {
            writer.write_at(&[i as u8; 5], i * 5).unwrap();
        }
        writer.flush().unwrap();

        let recorded = calls.lock();
        assert!(recorded.len() <= 4);
        let mut expected_offset = 0_u64;
        let mut total = 0_usize;
        for (offset, data) in recorded.iter() {
            assert_eq!(*offset, expected_offset);
            expected_offset += data.len() as u64;
            total += data.len();
        }
        assert_eq!(total, 25);
    }

    #[test]
    fn zero_length_write_does_not_disturb_buffered_state() {
        let recorder = RecordingWriter::default();
        let calls = Arc::clone(&recorder.calls);
        let mut writer = BufferedWriter::with_high_water(Box::new(recorder), 1024);

        writer.write_at(b"abc", 7).unwrap();
        assert_eq!(writer.write_at(&[], 999).unwrap(), 0);
        writer.write_at(b"def", 10).unwrap();
        writer.flush().unwrap();

        let recorded = calls.lock();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0], (7, b"abcdef".to_vec()));
    }

    #[test]
    fn flush_forwards_to_inner_after_spill() {
        let recorder = RecordingWriter::default();
        let flushes = Arc::clone(&recorder.flushes);
        let mut writer = BufferedWriter::with_high_water(Box::new(recorder), 1024);

        writer.write_at(b"abc", 0).unwrap();
        writer.flush().unwrap();
        assert_eq!(*flushes.lock(), 1);
    }

    #[test]
    fn failed_spill_discards_partial_run() {
        let recorder = RecordingWriter::default();
        let fail = Arc::clone(&recorder.fail_writes);
        let calls = Arc::clone(&recorder.calls);
        let mut writer = BufferedWriter::with_high_water(Box::new(recorder), 1024);

        writer.write_at(b"doomed", 0).unwrap();
        *fail.lock() = true;
        assert!(writer.flush().is_err());

        // The run is gone; a later flush writes nothing.
        *fail.lock() = false;
        writer.flush().unwrap();
        assert!(calls.lock().is_empty());
    }
}
