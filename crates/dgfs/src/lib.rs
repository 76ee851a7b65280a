#![forbid(unsafe_code)]
//! DataGrid FS public API facade.
//!
//! Re-exports the mount assembly from `dgfs-core` through a stable
//! external interface, plus the building blocks hosts typically need
//! to inject: the remote client contract, the cache stores, and the
//! positional I/O capabilities.

pub use dgfs_core::*;

pub use dgfs_cache::{CacheEntry, CacheStore, DiskCacheStore, MemCacheStore, RamBuffer};
pub use dgfs_error::{DgfsError, Result};
pub use dgfs_io::{PositionalReader, PositionalWriter, ReportSink};
pub use dgfs_remote::{
    MemoryRemoteClient, OpenMode, RemoteEntry, RemoteEntryKind, RemoteFileHandle, RemoteFsClient,
};
pub use dgfs_types::{BlockGeometry, BlockId, ReadOutcome};
pub use dgfs_vpath::{InodeAllocator, VPathManager, VPathMapping};
