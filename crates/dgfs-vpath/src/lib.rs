#![forbid(unsafe_code)]
//! Virtual path hierarchy over a remote data-grid namespace.
//!
//! A mount exposes a synthetic tree assembled from user-supplied
//! [`VPathMapping`]s: virtual directories are fabricated for every
//! ancestor of a mapping path, and each mapping leaf snapshots the
//! remote entry it points at. Resolution from a virtual path back to a
//! remote path walks the deepest matching mapping.

mod ino;
mod mapping;

pub use ino::{
    InodeAllocator, OVERLAY_INODE_BASE, REMOTE_INODE_BASE, VIRTUAL_DIR_INODE_BASE,
};
pub use mapping::{MappingResourceType, VPathMapping, validate_mappings};

use dgfs_error::{DgfsError, Result};
use dgfs_remote::{RemoteEntry, RemoteFsClient};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Owner name recorded on fabricated virtual directories.
const VIRTUAL_DIR_OWNER: &str = "dgfs";

/// Payload of a virtual path entry.
#[derive(Debug, Clone)]
pub enum VPathEntryKind {
    /// Fabricated read-only directory holding other entries.
    VirtualDir {
        owner: String,
        create_time: SystemTime,
        /// Virtual paths of the direct children.
        children: Vec<String>,
    },
    /// Snapshot of a remote entry taken at build time.
    Remote { entry: RemoteEntry },
}

/// One node of the virtual tree.
#[derive(Debug, Clone)]
pub struct VPathEntry {
    /// Virtual path of this entry.
    pub path: String,
    pub read_only: bool,
    pub kind: VPathEntryKind,
}

impl VPathEntry {
    #[must_use]
    pub fn is_virtual_dir(&self) -> bool {
        matches!(self.kind, VPathEntryKind::VirtualDir { .. })
    }

    #[must_use]
    pub fn remote_entry(&self) -> Option<&RemoteEntry> {
        match &self.kind {
            VPathEntryKind::Remote { entry } => Some(entry),
            VPathEntryKind::VirtualDir { .. } => None,
        }
    }

    /// Remote path for `vpath`, which must be this entry's path or lie
    /// beneath it. Fails for virtual entries.
    pub fn remote_path(&self, vpath: &str) -> Result<String> {
        let VPathEntryKind::Remote { entry } = &self.kind else {
            return Err(DgfsError::InvalidMapping(format!(
                "virtual path {vpath} is not backed by a remote entry"
            )));
        };

        if vpath == self.path {
            return Ok(entry.path.clone());
        }
        let Some(suffix) = vpath.strip_prefix(&format!("{}/", self.path)) else {
            return Err(DgfsError::InvalidMapping(format!(
                "{vpath} is outside mapping {}",
                self.path
            )));
        };
        Ok(format!("{}/{}", entry.path.trim_end_matches('/'), suffix))
    }
}

/// Ancestor directories of `path`, root first, excluding `path` itself.
fn ancestors(path: &str) -> Vec<String> {
    let mut result = vec!["/".to_owned()];
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }

    let segments: Vec<&str> = trimmed.split('/').collect();
    let mut current = String::new();
    for segment in &segments[..segments.len() - 1] {
        current.push('/');
        current.push_str(segment);
        result.push(current.clone());
    }
    result
}

/// Manager of the virtual path tree.
pub struct VPathManager {
    mappings: Vec<VPathMapping>,
    entries: HashMap<String, VPathEntry>,
    client: Arc<dyn RemoteFsClient>,
}

impl std::fmt::Debug for VPathManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VPathManager")
            .field("mappings", &self.mappings.len())
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl VPathManager {
    /// Validate `mappings` and build the tree, statting every mapping
    /// leaf against the remote store.
    pub fn new(client: Arc<dyn RemoteFsClient>, mappings: Vec<VPathMapping>) -> Result<Self> {
        validate_mappings(&mappings)?;

        let mut manager = Self {
            mappings,
            entries: HashMap::new(),
            client,
        };

        info!(event = "vpath_build", mappings = manager.mappings.len());
        for mapping in manager.mappings.clone() {
            manager.build_one(&mapping)?;
        }
        Ok(manager)
    }

    fn build_one(&mut self, mapping: &VPathMapping) -> Result<()> {
        debug!(
            event = "vpath_build_mapping",
            remote = mapping.remote_path.as_str(),
            vpath = mapping.mapping_path.as_str()
        );

        let parents = ancestors(&mapping.mapping_path);
        for (idx, parent) in parents.iter().enumerate() {
            if let Some(existing) = self.entries.get(parent) {
                if !existing.is_virtual_dir() {
                    return Err(DgfsError::InvalidMapping(format!(
                        "cannot fabricate virtual dir {parent}: a remote entry is mapped there"
                    )));
                }
                continue;
            }

            let entry = VPathEntry {
                path: parent.clone(),
                read_only: true,
                kind: VPathEntryKind::VirtualDir {
                    owner: VIRTUAL_DIR_OWNER.to_owned(),
                    create_time: SystemTime::now(),
                    children: Vec::new(),
                },
            };
            self.entries.insert(parent.clone(), entry);
            if idx > 0 {
                self.attach_child(&parents[idx - 1], parent);
            }
        }

        if mapping.resource_type == MappingResourceType::Dir
            && mapping.create_dir
            && !self.client.exists_dir(&mapping.remote_path)
        {
            debug!(event = "vpath_create_remote_dir", remote = mapping.remote_path.as_str());
            if let Err(err) = self.client.make_dir(&mapping.remote_path, true) {
                warn!(
                    event = "vpath_create_remote_dir_failed",
                    remote = mapping.remote_path.as_str(),
                    error = %err
                );
            }
        }

        let remote_entry = match self.client.stat(&mapping.remote_path) {
            Ok(entry) => entry,
            Err(err) => {
                if mapping.ignore_not_exist {
                    debug!(
                        event = "vpath_mapping_skipped",
                        remote = mapping.remote_path.as_str(),
                        error = %err
                    );
                    return Ok(());
                }
                return Err(err);
            }
        };

        let leaf = VPathEntry {
            path: mapping.mapping_path.clone(),
            read_only: mapping.read_only,
            kind: VPathEntryKind::Remote {
                entry: remote_entry,
            },
        };
        self.entries.insert(mapping.mapping_path.clone(), leaf);
        if let Some(parent) = parents.last() {
            self.attach_child(parent, &mapping.mapping_path);
        }
        Ok(())
    }

    fn attach_child(&mut self, parent: &str, child: &str) {
        if let Some(VPathEntry {
            kind: VPathEntryKind::VirtualDir { children, .. },
            ..
        }) = self.entries.get_mut(parent)
        {
            if !children.iter().any(|existing| existing == child) {
                children.push(child.to_owned());
            }
        }
    }

    #[must_use]
    pub fn has_entry(&self, vpath: &str) -> bool {
        self.entries.contains_key(vpath)
    }

    #[must_use]
    pub fn get_entry(&self, vpath: &str) -> Option<&VPathEntry> {
        self.entries.get(vpath)
    }

    /// Deepest existing entry on the ancestor chain of `vpath`,
    /// including `vpath` itself. Walks from the root and stops at the
    /// first gap.
    #[must_use]
    pub fn get_closest_entry(&self, vpath: &str) -> Option<&VPathEntry> {
        if let Some(entry) = self.entries.get(vpath) {
            return Some(entry);
        }

        let mut closest = None;
        for parent in ancestors(vpath) {
            match self.entries.get(&parent) {
                Some(entry) => closest = Some(entry),
                None => break,
            }
        }
        closest
    }

    /// Resolve a virtual path to its remote path through the deepest
    /// matching mapping.
    pub fn remote_path(&self, vpath: &str) -> Result<String> {
        let entry = self
            .get_closest_entry(vpath)
            .ok_or_else(|| DgfsError::NotFound(vpath.to_owned()))?;
        entry.remote_path(vpath)
    }

    #[must_use]
    pub fn entries(&self) -> impl Iterator<Item = &VPathEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn mappings(&self) -> &[VPathMapping] {
        &self.mappings
    }
}
