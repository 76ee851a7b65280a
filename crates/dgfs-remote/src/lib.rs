#![forbid(unsafe_code)]
//! Remote data-grid client contract.
//!
//! The I/O pipeline never talks a wire protocol itself; it consumes an
//! injected [`RemoteFsClient`] and per-file [`RemoteFileHandle`]s. The
//! traits here are the narrow seam between the acceleration core and
//! whatever client library the host wires in.
//!
//! [`MemoryRemoteClient`] is an in-memory implementation for tests and
//! local development.

mod memory;

pub use memory::{MemoryRemoteClient, RemoteCallLog};

use dgfs_error::Result;
use dgfs_types::ReadOutcome;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Kind of a remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteEntryKind {
    File,
    Dir,
}

/// Snapshot of a remote entry's metadata as returned by `stat`/`list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Server-assigned entry id, stable for the entry's lifetime.
    pub id: i64,
    pub path: String,
    pub name: String,
    pub kind: RemoteEntryKind,
    pub size: u64,
    /// Content checksum as reported by the server, if any.
    pub checksum: Option<String>,
    pub owner: String,
    pub create_time: SystemTime,
    pub modify_time: SystemTime,
}

impl RemoteEntry {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == RemoteEntryKind::Dir
    }
}

/// Open mode for a remote file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
    Append,
}

impl OpenMode {
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite | Self::Append)
    }
}

/// Extended attribute on a remote entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrEntry {
    pub name: String,
    pub value: String,
}

/// One access-control grant on a remote entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    pub user: String,
    pub level: String,
}

/// Positional file handle over one remote connection.
///
/// A handle is safe to share between threads, but the pipeline treats
/// each handle as single-owner between pool checkout and return.
pub trait RemoteFileHandle: Send + Sync {
    /// Stable identifier of this handle (connection-scoped).
    fn id(&self) -> String;

    /// Metadata snapshot taken at open time.
    fn entry(&self) -> RemoteEntry;

    fn open_mode(&self) -> OpenMode;

    /// Read up to `buf.len()` bytes at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome>;

    /// Write `data` at `offset`, returning the number of bytes written.
    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize>;

    /// Bytes known to be readable at `offset` without a round trip, or
    /// -1 when the remote API cannot answer.
    fn available(&self, offset: u64) -> i64;

    /// Advisory exclusive lock. Pass-through; no local semantics.
    fn lock(&self, wait: bool) -> Result<()>;

    /// Advisory shared lock. Pass-through; no local semantics.
    fn rlock(&self, wait: bool) -> Result<()>;

    fn unlock(&self) -> Result<()>;

    fn truncate(&self, size: u64) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

/// Client for a remote data-grid server exposing files by absolute path.
pub trait RemoteFsClient: Send + Sync {
    fn stat(&self, path: &str) -> Result<RemoteEntry>;

    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    fn exists_dir(&self, path: &str) -> bool;

    fn exists_file(&self, path: &str) -> bool;

    fn make_dir(&self, path: &str, recurse: bool) -> Result<()>;

    /// Open an existing file. `resource` selects a server-side storage
    /// resource and may be empty.
    fn open_file(
        &self,
        path: &str,
        resource: &str,
        mode: OpenMode,
    ) -> Result<Arc<dyn RemoteFileHandle>>;

    /// Create a new file and open it.
    fn create_file(
        &self,
        path: &str,
        resource: &str,
        mode: OpenMode,
    ) -> Result<Arc<dyn RemoteFileHandle>>;

    fn truncate_file(&self, path: &str, size: u64) -> Result<()>;

    fn remove_file(&self, path: &str, force: bool) -> Result<()>;

    fn remove_dir(&self, path: &str, recurse: bool, force: bool) -> Result<()>;

    fn rename_file(&self, src: &str, dest: &str) -> Result<()>;

    fn rename_dir(&self, src: &str, dest: &str) -> Result<()>;

    fn list_xattr(&self, path: &str) -> Result<Vec<XattrEntry>>;

    fn get_xattr(&self, path: &str, name: &str) -> Result<Option<XattrEntry>>;

    fn set_xattr(&self, path: &str, name: &str, value: &str) -> Result<()>;

    fn remove_xattr(&self, path: &str, name: &str) -> Result<()>;

    fn list_dir_acls(&self, path: &str) -> Result<Vec<AccessEntry>>;

    fn list_file_acls(&self, path: &str) -> Result<Vec<AccessEntry>>;

    fn user_groups(&self, user: &str) -> Result<Vec<String>>;

    /// Number of server connections currently held.
    fn connections(&self) -> usize;

    fn release(&self);
}
