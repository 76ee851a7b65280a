//! In-memory remote store for tests and local development.
//!
//! Keeps the whole namespace in a mutex-protected tree and records every
//! positional read/write in a call log so tests can assert on the
//! traffic the pipeline actually generates.

use crate::{
    AccessEntry, OpenMode, RemoteEntry, RemoteEntryKind, RemoteFileHandle, RemoteFsClient,
    XattrEntry,
};
use dgfs_error::{DgfsError, Result};
use dgfs_types::ReadOutcome;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;
use tracing::trace;

/// One recorded positional call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub path: String,
    pub offset: u64,
    pub len: usize,
}

/// Log of positional reads and writes issued against a
/// [`MemoryRemoteClient`].
#[derive(Debug, Default, Clone)]
pub struct RemoteCallLog {
    pub reads: Vec<RemoteCall>,
    pub writes: Vec<RemoteCall>,
}

impl RemoteCallLog {
    /// Number of reads on `path` overlapping `[start, end)`.
    #[must_use]
    pub fn reads_overlapping(&self, path: &str, start: u64, end: u64) -> usize {
        self.reads
            .iter()
            .filter(|call| {
                call.path == path && call.offset < end && call.offset + call.len as u64 > start
            })
            .count()
    }

    #[must_use]
    pub fn read_count(&self, path: &str) -> usize {
        self.reads.iter().filter(|call| call.path == path).count()
    }

    #[must_use]
    pub fn write_count(&self, path: &str) -> usize {
        self.writes.iter().filter(|call| call.path == path).count()
    }
}

#[derive(Debug, Clone)]
struct MemNode {
    id: i64,
    kind: RemoteEntryKind,
    data: Vec<u8>,
    xattrs: HashMap<String, String>,
    create_time: SystemTime,
    modify_time: SystemTime,
}

impl MemNode {
    fn new(id: i64, kind: RemoteEntryKind) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            kind,
            data: Vec::new(),
            xattrs: HashMap::new(),
            create_time: now,
            modify_time: now,
        }
    }
}

#[derive(Debug)]
struct TreeState {
    nodes: HashMap<String, MemNode>,
    next_id: i64,
}

impl TreeState {
    fn alloc_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[derive(Debug)]
struct ClientShared {
    tree: Mutex<TreeState>,
    log: Mutex<RemoteCallLog>,
    user_groups: Mutex<HashMap<String, Vec<String>>>,
    owner: String,
    /// Cap on bytes served per read call; exercises the pipeline's
    /// short-read handling when smaller than the request.
    read_chunk_cap: Mutex<Option<usize>>,
    open_handles: AtomicUsize,
    next_handle: AtomicUsize,
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn entry_for(path: &str, node: &MemNode) -> RemoteEntry {
    RemoteEntry {
        id: node.id,
        path: path.to_owned(),
        name: name_of(path).to_owned(),
        kind: node.kind,
        size: node.data.len() as u64,
        checksum: None,
        owner: String::new(),
        create_time: node.create_time,
        modify_time: node.modify_time,
    }
}

/// In-memory [`RemoteFsClient`] implementation.
#[derive(Debug, Clone)]
pub struct MemoryRemoteClient {
    shared: Arc<ClientShared>,
}

impl Default for MemoryRemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteClient {
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_owned(), MemNode::new(0, RemoteEntryKind::Dir));
        Self {
            shared: Arc::new(ClientShared {
                tree: Mutex::new(TreeState { nodes, next_id: 1 }),
                log: Mutex::new(RemoteCallLog::default()),
                user_groups: Mutex::new(HashMap::new()),
                owner: "dgfs".to_owned(),
                read_chunk_cap: Mutex::new(None),
                open_handles: AtomicUsize::new(0),
                next_handle: AtomicUsize::new(1),
            }),
        }
    }

    /// Create a file with the given content, creating parent directories
    /// as needed.
    pub fn add_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut tree = self.shared.tree.lock();
        let mut ancestors = Vec::new();
        let mut cursor = path.to_owned();
        while let Some(parent) = parent_of(&cursor).map(str::to_owned) {
            if parent == "/" {
                break;
            }
            ancestors.push(parent.clone());
            cursor = parent;
        }
        for dir in ancestors.into_iter().rev() {
            if !tree.nodes.contains_key(&dir) {
                let id = tree.alloc_id();
                tree.nodes.insert(dir, MemNode::new(id, RemoteEntryKind::Dir));
            }
        }
        let id = tree.alloc_id();
        let mut node = MemNode::new(id, RemoteEntryKind::File);
        node.data = data.to_vec();
        tree.nodes.insert(path.to_owned(), node);
        Ok(())
    }

    /// Raw file content, for test assertions.
    #[must_use]
    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        let tree = self.shared.tree.lock();
        tree.nodes
            .get(path)
            .filter(|node| node.kind == RemoteEntryKind::File)
            .map(|node| node.data.clone())
    }

    /// Snapshot of the positional call log.
    #[must_use]
    pub fn call_log(&self) -> RemoteCallLog {
        self.shared.log.lock().clone()
    }

    pub fn clear_call_log(&self) {
        *self.shared.log.lock() = RemoteCallLog::default();
    }

    /// Limit bytes served per read call to exercise short reads.
    pub fn set_read_chunk_cap(&self, cap: Option<usize>) {
        *self.shared.read_chunk_cap.lock() = cap;
    }

    pub fn set_user_groups(&self, user: &str, groups: Vec<String>) {
        self.shared
            .user_groups
            .lock()
            .insert(user.to_owned(), groups);
    }

    fn open_common(&self, path: &str, mode: OpenMode) -> Result<Arc<dyn RemoteFileHandle>> {
        let entry = {
            let tree = self.shared.tree.lock();
            let node = tree
                .nodes
                .get(path)
                .ok_or_else(|| DgfsError::NotFound(path.to_owned()))?;
            if node.kind == RemoteEntryKind::Dir {
                return Err(DgfsError::IsDirectory(path.to_owned()));
            }
            entry_for(path, node)
        };

        let handle_seq = self.shared.next_handle.fetch_add(1, Ordering::SeqCst);
        self.shared.open_handles.fetch_add(1, Ordering::SeqCst);
        trace!(event = "remote_open", path = path, handle = handle_seq);
        Ok(Arc::new(MemoryFileHandle {
            shared: Arc::clone(&self.shared),
            path: path.to_owned(),
            id: format!("mem-{handle_seq}"),
            mode,
            entry,
        }))
    }
}

impl RemoteFsClient for MemoryRemoteClient {
    fn stat(&self, path: &str) -> Result<RemoteEntry> {
        let tree = self.shared.tree.lock();
        tree.nodes
            .get(path)
            .map(|node| entry_for(path, node))
            .ok_or_else(|| DgfsError::NotFound(path.to_owned()))
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| DgfsError::NotFound(path.to_owned()))?;
        if node.kind != RemoteEntryKind::Dir {
            return Err(DgfsError::NotDirectory(path.to_owned()));
        }

        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        let mut entries: Vec<RemoteEntry> = tree
            .nodes
            .iter()
            .filter(|(child, _)| {
                child.starts_with(&prefix)
                    && child.len() > prefix.len()
                    && !child[prefix.len()..].contains('/')
            })
            .map(|(child, node)| entry_for(child, node))
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn exists_dir(&self, path: &str) -> bool {
        let tree = self.shared.tree.lock();
        tree.nodes
            .get(path)
            .is_some_and(|node| node.kind == RemoteEntryKind::Dir)
    }

    fn exists_file(&self, path: &str) -> bool {
        let tree = self.shared.tree.lock();
        tree.nodes
            .get(path)
            .is_some_and(|node| node.kind == RemoteEntryKind::File)
    }

    fn make_dir(&self, path: &str, recurse: bool) -> Result<()> {
        let mut tree = self.shared.tree.lock();
        if tree.nodes.contains_key(path) {
            return Err(DgfsError::Exists(path.to_owned()));
        }

        if recurse {
            let mut missing = vec![path.to_owned()];
            let mut cursor = path.to_owned();
            while let Some(parent) = parent_of(&cursor).map(str::to_owned) {
                if tree.nodes.contains_key(&parent) {
                    break;
                }
                missing.push(parent.clone());
                cursor = parent;
            }
            for dir in missing.into_iter().rev() {
                let id = tree.alloc_id();
                tree.nodes.insert(dir, MemNode::new(id, RemoteEntryKind::Dir));
            }
        } else {
            let parent = parent_of(path).ok_or_else(|| DgfsError::NotFound(path.to_owned()))?;
            if !tree.nodes.contains_key(parent) {
                return Err(DgfsError::NotFound(parent.to_owned()));
            }
            let id = tree.alloc_id();
            tree.nodes
                .insert(path.to_owned(), MemNode::new(id, RemoteEntryKind::Dir));
        }
        Ok(())
    }

    fn open_file(
        &self,
        path: &str,
        _resource: &str,
        mode: OpenMode,
    ) -> Result<Arc<dyn RemoteFileHandle>> {
        self.open_common(path, mode)
    }

    fn create_file(
        &self,
        path: &str,
        _resource: &str,
        mode: OpenMode,
    ) -> Result<Arc<dyn RemoteFileHandle>> {
        {
            let mut tree = self.shared.tree.lock();
            if tree.nodes.contains_key(path) {
                return Err(DgfsError::Exists(path.to_owned()));
            }
            let parent = parent_of(path).ok_or_else(|| DgfsError::NotFound(path.to_owned()))?;
            if !tree.nodes.contains_key(parent) {
                return Err(DgfsError::NotFound(parent.to_owned()));
            }
            let id = tree.alloc_id();
            tree.nodes
                .insert(path.to_owned(), MemNode::new(id, RemoteEntryKind::File));
        }
        self.open_common(path, mode)
    }

    fn truncate_file(&self, path: &str, size: u64) -> Result<()> {
        let mut tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| DgfsError::NotFound(path.to_owned()))?;
        if node.kind == RemoteEntryKind::Dir {
            return Err(DgfsError::IsDirectory(path.to_owned()));
        }
        node.data.resize(size as usize, 0);
        node.modify_time = SystemTime::now();
        Ok(())
    }

    fn remove_file(&self, path: &str, _force: bool) -> Result<()> {
        let mut tree = self.shared.tree.lock();
        match tree.nodes.get(path) {
            Some(node) if node.kind == RemoteEntryKind::Dir => {
                Err(DgfsError::IsDirectory(path.to_owned()))
            }
            Some(_) => {
                tree.nodes.remove(path);
                Ok(())
            }
            None => Err(DgfsError::NotFound(path.to_owned())),
        }
    }

    fn remove_dir(&self, path: &str, recurse: bool, _force: bool) -> Result<()> {
        let mut tree = self.shared.tree.lock();
        match tree.nodes.get(path) {
            Some(node) if node.kind != RemoteEntryKind::Dir => {
                Err(DgfsError::NotDirectory(path.to_owned()))
            }
            Some(_) => {
                let prefix = format!("{path}/");
                let has_children = tree.nodes.keys().any(|child| child.starts_with(&prefix));
                if has_children && !recurse {
                    return Err(DgfsError::Remote(format!("directory not empty: {path}")));
                }
                tree.nodes
                    .retain(|child, _| child.as_str() != path && !child.starts_with(&prefix));
                Ok(())
            }
            None => Err(DgfsError::NotFound(path.to_owned())),
        }
    }

    fn rename_file(&self, src: &str, dest: &str) -> Result<()> {
        let mut tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .remove(src)
            .ok_or_else(|| DgfsError::NotFound(src.to_owned()))?;
        tree.nodes.insert(dest.to_owned(), node);
        Ok(())
    }

    fn rename_dir(&self, src: &str, dest: &str) -> Result<()> {
        let mut tree = self.shared.tree.lock();
        if !tree.nodes.contains_key(src) {
            return Err(DgfsError::NotFound(src.to_owned()));
        }

        let prefix = format!("{src}/");
        let moved: Vec<(String, MemNode)> = tree
            .nodes
            .iter()
            .filter(|(path, _)| path.as_str() == src || path.starts_with(&prefix))
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect();
        for (path, _) in &moved {
            tree.nodes.remove(path);
        }
        for (path, node) in moved {
            let renamed = format!("{dest}{}", &path[src.len()..]);
            tree.nodes.insert(renamed, node);
        }
        Ok(())
    }

    fn list_xattr(&self, path: &str) -> Result<Vec<XattrEntry>> {
        let tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| DgfsError::NotFound(path.to_owned()))?;
        let mut attrs: Vec<XattrEntry> = node
            .xattrs
            .iter()
            .map(|(name, value)| XattrEntry {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        attrs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(attrs)
    }

    fn get_xattr(&self, path: &str, name: &str) -> Result<Option<XattrEntry>> {
        let tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .get(path)
            .ok_or_else(|| DgfsError::NotFound(path.to_owned()))?;
        Ok(node.xattrs.get(name).map(|value| XattrEntry {
            name: name.to_owned(),
            value: value.clone(),
        }))
    }

    fn set_xattr(&self, path: &str, name: &str, value: &str) -> Result<()> {
        let mut tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| DgfsError::NotFound(path.to_owned()))?;
        node.xattrs.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_xattr(&self, path: &str, name: &str) -> Result<()> {
        let mut tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| DgfsError::NotFound(path.to_owned()))?;
        node.xattrs.remove(name);
        Ok(())
    }

    fn list_dir_acls(&self, path: &str) -> Result<Vec<AccessEntry>> {
        let tree = self.shared.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(DgfsError::NotFound(path.to_owned()));
        }
        Ok(vec![AccessEntry {
            user: self.shared.owner.clone(),
            level: "own".to_owned(),
        }])
    }

    fn list_file_acls(&self, path: &str) -> Result<Vec<AccessEntry>> {
        self.list_dir_acls(path)
    }

    fn user_groups(&self, user: &str) -> Result<Vec<String>> {
        Ok(self
            .shared
            .user_groups
            .lock()
            .get(user)
            .cloned()
            .unwrap_or_default())
    }

    fn connections(&self) -> usize {
        self.shared.open_handles.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.shared.tree.lock().nodes.clear();
    }
}

#[derive(Debug)]
struct MemoryFileHandle {
    shared: Arc<ClientShared>,
    path: String,
    id: String,
    mode: OpenMode,
    entry: RemoteEntry,
}

impl RemoteFileHandle for MemoryFileHandle {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn entry(&self) -> RemoteEntry {
        self.entry.clone()
    }

    fn open_mode(&self) -> OpenMode {
        self.mode
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::empty());
        }

        let chunk_cap = *self.shared.read_chunk_cap.lock();
        let tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .get(&self.path)
            .ok_or_else(|| DgfsError::NotFound(self.path.clone()))?;
        let file_len = node.data.len() as u64;

        let outcome = if offset >= file_len {
            ReadOutcome::new(0, true)
        } else {
            let start = offset as usize;
            let mut n = buf.len().min(node.data.len() - start);
            if let Some(cap) = chunk_cap {
                n = n.min(cap);
            }
            buf[..n].copy_from_slice(&node.data[start..start + n]);
            ReadOutcome::new(n, offset + n as u64 >= file_len)
        };
        drop(tree);

        self.shared.log.lock().reads.push(RemoteCall {
            path: self.path.clone(),
            offset,
            len: outcome.len,
        });
        Ok(outcome)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .get_mut(&self.path)
            .ok_or_else(|| DgfsError::NotFound(self.path.clone()))?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        node.modify_time = SystemTime::now();
        drop(tree);

        self.shared.log.lock().writes.push(RemoteCall {
            path: self.path.clone(),
            offset,
            len: data.len(),
        });
        Ok(data.len())
    }

    fn available(&self, offset: u64) -> i64 {
        let tree = self.shared.tree.lock();
        match tree.nodes.get(&self.path) {
            Some(node) => {
                let file_len = node.data.len() as u64;
                if offset >= file_len {
                    0
                } else {
                    (file_len - offset) as i64
                }
            }
            None => -1,
        }
    }

    fn lock(&self, _wait: bool) -> Result<()> {
        Ok(())
    }

    fn rlock(&self, _wait: bool) -> Result<()> {
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, size: u64) -> Result<()> {
        let mut tree = self.shared.tree.lock();
        let node = tree
            .nodes
            .get_mut(&self.path)
            .ok_or_else(|| DgfsError::NotFound(self.path.clone()))?;
        node.data.resize(size as usize, 0);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
