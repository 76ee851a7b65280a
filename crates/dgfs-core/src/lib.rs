#![forbid(unsafe_code)]
//! Mount assembly: wires the virtual path layer, the cache substrate,
//! and the adapter pipeline into per-file read/write stacks.
//!
//! A [`Mount`] owns the injected remote client, the virtual tree built
//! from the user's mappings, the inode allocator, an optional shared
//! block cache, and the bounded write buffer every writer draws from.
//! `open_reader` builds `Async(Cache(Sync))` stacks over N remote
//! connections; `open_writer` builds `Buffered(Async(Sync))` stacks.

use dgfs_cache::{CacheStore, RamBuffer};
use dgfs_error::{DgfsError, Result};
use dgfs_io::{
    AsyncCacheThroughReader, AsyncWriter, BufferedWriter, FileMeta, PositionalReader, ReportSink,
    SyncReader, SyncWriter,
};
use dgfs_remote::{OpenMode, RemoteEntry, RemoteEntryKind, RemoteFsClient, XattrEntry};
use dgfs_types::DEFAULT_BLOCK_SIZE;
use dgfs_vpath::{InodeAllocator, VPathEntry, VPathEntryKind, VPathManager, VPathMapping};
use std::sync::Arc;
use tracing::{debug, info};

/// Tunables of one mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Block size of the cache-through read pipeline.
    pub block_size: usize,
    /// Remote connections opened per file reader; values above one
    /// enable prefetch.
    pub read_connections: usize,
    /// Byte cap of the shared write buffer.
    pub write_buffer_cap: u64,
    /// Spill threshold of the coalescing writer.
    pub write_high_water: usize,
    /// Server-side resource name passed to open/create calls.
    pub resource: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            read_connections: 2,
            write_buffer_cap: 64 * 1024 * 1024,
            write_high_water: dgfs_io::DEFAULT_HIGH_WATER,
            resource: String::new(),
        }
    }
}

/// Stat result of one mount entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub inode: u64,
    /// Virtual path of the entry.
    pub path: String,
    pub kind: RemoteEntryKind,
    pub size: u64,
    pub read_only: bool,
}

/// One mounted view over a remote data grid.
pub struct Mount {
    client: Arc<dyn RemoteFsClient>,
    vpaths: VPathManager,
    inodes: InodeAllocator,
    cache: Option<Arc<dyn CacheStore>>,
    write_buffer: RamBuffer,
    report: Option<Arc<dyn ReportSink>>,
    config: MountConfig,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("vpaths", &self.vpaths)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Mount {
    pub fn new(
        client: Arc<dyn RemoteFsClient>,
        mappings: Vec<VPathMapping>,
        cache: Option<Arc<dyn CacheStore>>,
        report: Option<Arc<dyn ReportSink>>,
        config: MountConfig,
    ) -> Result<Self> {
        let vpaths = VPathManager::new(Arc::clone(&client), mappings)?;
        info!(
            event = "mount_ready",
            block_size = config.block_size,
            read_connections = config.read_connections
        );
        Ok(Self {
            client,
            vpaths,
            inodes: InodeAllocator::new(),
            cache,
            write_buffer: RamBuffer::new(config.write_buffer_cap),
            report,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    #[must_use]
    pub fn vpaths(&self) -> &VPathManager {
        &self.vpaths
    }

    fn entry_from_vpath(&self, vpath: &str, entry: &VPathEntry) -> MountEntry {
        match &entry.kind {
            VPathEntryKind::VirtualDir { .. } => MountEntry {
                inode: self.inodes.inode_for_virtual_path(&entry.path),
                path: entry.path.clone(),
                kind: RemoteEntryKind::Dir,
                size: 0,
                read_only: entry.read_only,
            },
            VPathEntryKind::Remote { entry: remote } => MountEntry {
                inode: self.inodes.inode_for_remote_id(remote.id),
                path: vpath.to_owned(),
                kind: remote.kind,
                size: remote.size,
                read_only: entry.read_only,
            },
        }
    }

    fn entry_from_remote(&self, vpath: &str, remote: &RemoteEntry, read_only: bool) -> MountEntry {
        MountEntry {
            inode: self.inodes.inode_for_remote_id(remote.id),
            path: vpath.to_owned(),
            kind: remote.kind,
            size: remote.size,
            read_only,
        }
    }

    /// Resolve `vpath` to the remote path plus the effective read-only
    /// flag of the mapping that covers it.
    fn resolve(&self, vpath: &str) -> Result<(String, bool)> {
        let entry = self
            .vpaths
            .get_closest_entry(vpath)
            .ok_or_else(|| DgfsError::NotFound(vpath.to_owned()))?;
        let remote_path = entry.remote_path(vpath)?;
        Ok((remote_path, entry.read_only))
    }

    fn resolve_writable(&self, vpath: &str) -> Result<String> {
        let (remote_path, read_only) = self.resolve(vpath)?;
        if read_only {
            return Err(DgfsError::PermissionDenied);
        }
        Ok(remote_path)
    }

    pub fn stat(&self, vpath: &str) -> Result<MountEntry> {
        if let Some(entry) = self.vpaths.get_entry(vpath) {
            return Ok(self.entry_from_vpath(vpath, entry));
        }

        let (remote_path, read_only) = self.resolve(vpath)?;
        let remote = self.client.stat(&remote_path)?;
        Ok(self.entry_from_remote(vpath, &remote, read_only))
    }

    pub fn list(&self, vpath: &str) -> Result<Vec<MountEntry>> {
        if let Some(entry) = self.vpaths.get_entry(vpath) {
            if let VPathEntryKind::VirtualDir { children, .. } = &entry.kind {
                return Ok(children
                    .iter()
                    .filter_map(|child| self.vpaths.get_entry(child))
                    .map(|child| self.entry_from_vpath(&child.path, child))
                    .collect());
            }
        }

        let (remote_path, read_only) = self.resolve(vpath)?;
        let base = vpath.trim_end_matches('/');
        Ok(self
            .client
            .list(&remote_path)?
            .iter()
            .map(|remote| {
                let child_vpath = format!("{base}/{}", remote.name);
                self.entry_from_remote(&child_vpath, remote, read_only)
            })
            .collect())
    }

    /// Open a cache-through read stack over `read_connections` remote
    /// handles.
    pub fn open_reader(&self, vpath: &str) -> Result<AsyncCacheThroughReader> {
        let (remote_path, _) = self.resolve(vpath)?;
        let remote = self.client.stat(&remote_path)?;
        if remote.is_dir() {
            return Err(DgfsError::IsDirectory(vpath.to_owned()));
        }

        let connections = self.config.read_connections.max(1);
        let mut readers: Vec<Box<dyn PositionalReader>> = Vec::with_capacity(connections);
        for _ in 0..connections {
            let handle = self
                .client
                .open_file(&remote_path, &self.config.resource, OpenMode::Read)?;
            readers.push(Box::new(SyncReader::new(handle, self.report.clone())));
        }

        debug!(
            event = "reader_stack_open",
            vpath = vpath,
            remote = remote_path.as_str(),
            connections
        );
        let meta = FileMeta::new(remote_path, remote.size, remote.checksum.clone());
        Ok(AsyncCacheThroughReader::new(
            readers,
            meta,
            self.config.block_size,
            self.cache.clone(),
        ))
    }

    /// Open a coalescing write stack; fails with `PermissionDenied` on
    /// read-only mappings.
    pub fn open_writer(&self, vpath: &str) -> Result<BufferedWriter> {
        let remote_path = self.resolve_writable(vpath)?;
        let handle = match self
            .client
            .open_file(&remote_path, &self.config.resource, OpenMode::ReadWrite)
        {
            Ok(handle) => handle,
            Err(err) if err.is_not_found() => {
                self.client
                    .create_file(&remote_path, &self.config.resource, OpenMode::ReadWrite)?
            }
            Err(err) => return Err(err),
        };

        debug!(event = "writer_stack_open", vpath = vpath, remote = remote_path.as_str());
        let sync = SyncWriter::new(handle, self.report.clone());
        let async_writer = AsyncWriter::new(Box::new(sync), &self.write_buffer);
        Ok(BufferedWriter::with_high_water(
            Box::new(async_writer),
            self.config.write_high_water,
        ))
    }

    pub fn make_dir(&self, vpath: &str, recurse: bool) -> Result<()> {
        let remote_path = self.resolve_writable(vpath)?;
        self.client.make_dir(&remote_path, recurse)
    }

    pub fn remove_file(&self, vpath: &str, force: bool) -> Result<()> {
        let remote_path = self.resolve_writable(vpath)?;
        self.invalidate_cached_blocks(&remote_path);
        self.client.remove_file(&remote_path, force)
    }

    pub fn remove_dir(&self, vpath: &str, recurse: bool, force: bool) -> Result<()> {
        let remote_path = self.resolve_writable(vpath)?;
        self.client.remove_dir(&remote_path, recurse, force)
    }

    pub fn rename_file(&self, src_vpath: &str, dest_vpath: &str) -> Result<()> {
        let src = self.resolve_writable(src_vpath)?;
        let dest = self.resolve_writable(dest_vpath)?;
        self.invalidate_cached_blocks(&src);
        self.client.rename_file(&src, &dest)
    }

    pub fn rename_dir(&self, src_vpath: &str, dest_vpath: &str) -> Result<()> {
        let src = self.resolve_writable(src_vpath)?;
        let dest = self.resolve_writable(dest_vpath)?;
        self.client.rename_dir(&src, &dest)
    }

    pub fn truncate_file(&self, vpath: &str, size: u64) -> Result<()> {
        let remote_path = self.resolve_writable(vpath)?;
        self.invalidate_cached_blocks(&remote_path);
        self.client.truncate_file(&remote_path, size)
    }

    pub fn list_xattr(&self, vpath: &str) -> Result<Vec<XattrEntry>> {
        let (remote_path, _) = self.resolve(vpath)?;
        self.client.list_xattr(&remote_path)
    }

    pub fn get_xattr(&self, vpath: &str, name: &str) -> Result<Option<XattrEntry>> {
        let (remote_path, _) = self.resolve(vpath)?;
        self.client.get_xattr(&remote_path, name)
    }

    pub fn set_xattr(&self, vpath: &str, name: &str, value: &str) -> Result<()> {
        let remote_path = self.resolve_writable(vpath)?;
        self.client.set_xattr(&remote_path, name, value)
    }

    pub fn remove_xattr(&self, vpath: &str, name: &str) -> Result<()> {
        let remote_path = self.resolve_writable(vpath)?;
        self.client.remove_xattr(&remote_path, name)
    }

    pub fn user_groups(&self, user: &str) -> Result<Vec<String>> {
        self.client.user_groups(user)
    }

    /// Drop every cached block of one remote file. Mutations that move
    /// or destroy remote content call this so stale blocks cannot be
    /// served afterwards.
    fn invalidate_cached_blocks(&self, remote_path: &str) {
        if let Some(cache) = &self.cache {
            cache.delete_all_entries_for_group(remote_path);
        }
    }

    /// Tear down mount-wide resources. Open reader/writer stacks must
    /// be released by their owners first.
    pub fn release(&self) {
        info!(event = "mount_release");
        self.write_buffer.release();
        if let Some(cache) = &self.cache {
            cache.release();
        }
        self.client.release();
    }
}
