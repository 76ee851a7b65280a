//! Leaf adapters: one remote file handle behind each capability.

use crate::{PositionalReader, PositionalWriter, ReportSink};
use dgfs_error::{DgfsError, Result};
use dgfs_remote::RemoteFileHandle;
use dgfs_types::ReadOutcome;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Synchronous positional reader over one remote handle.
///
/// Owns the handle: `release` closes it.
pub struct SyncReader {
    path: String,
    handle: Arc<dyn RemoteFileHandle>,
    report: Option<Arc<dyn ReportSink>>,
    released: AtomicBool,
}

impl SyncReader {
    #[must_use]
    pub fn new(handle: Arc<dyn RemoteFileHandle>, report: Option<Arc<dyn ReportSink>>) -> Self {
        let path = handle.entry().path;
        Self {
            path,
            handle,
            report,
            released: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn handle(&self) -> &Arc<dyn RemoteFileHandle> {
        &self.handle
    }
}

impl PositionalReader for SyncReader {
    fn path(&self) -> &str {
        &self.path
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::empty());
        }

        debug!(
            event = "sync_read",
            path = self.path.as_str(),
            offset,
            len = buf.len()
        );
        let outcome = self.handle.read_at(buf, offset)?;

        if let Some(report) = &self.report {
            report.file_access(&self.handle.id(), offset, outcome.len as u64);
        }
        Ok(outcome)
    }

    fn available(&self, offset: u64) -> i64 {
        self.handle.available(offset)
    }

    fn pending_error(&self) -> Option<DgfsError> {
        None
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.handle.close() {
            warn!(event = "handle_close_failed", path = self.path.as_str(), error = %err);
        }
    }
}

impl Drop for SyncReader {
    fn drop(&mut self) {
        self.release();
    }
}

/// Synchronous positional writer over one remote handle.
///
/// Owns the handle: `release` flushes and closes it.
pub struct SyncWriter {
    path: String,
    handle: Arc<dyn RemoteFileHandle>,
    report: Option<Arc<dyn ReportSink>>,
    released: bool,
}

impl SyncWriter {
    #[must_use]
    pub fn new(handle: Arc<dyn RemoteFileHandle>, report: Option<Arc<dyn ReportSink>>) -> Self {
        let path = handle.entry().path;
        Self {
            path,
            handle,
            report,
            released: false,
        }
    }
}

impl PositionalWriter for SyncWriter {
    fn path(&self) -> &str {
        &self.path
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        debug!(
            event = "sync_write",
            path = self.path.as_str(),
            offset,
            len = data.len()
        );
        let written = self.handle.write_at(data, offset)?;

        if let Some(report) = &self.report {
            report.file_access(&self.handle.id(), offset, written as u64);
        }
        Ok(written)
    }

    fn flush(&mut self) -> Result<()> {
        self.handle.flush()
    }

    fn pending_error(&self) -> Option<DgfsError> {
        None
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.handle.flush() {
            warn!(event = "handle_flush_failed", path = self.path.as_str(), error = %err);
        }
        if let Err(err) = self.handle.close() {
            warn!(event = "handle_close_failed", path = self.path.as_str(), error = %err);
        }
    }
}

impl Drop for SyncWriter {
    fn drop(&mut self) {
        self.release();
    }
}
