//! Handle-to-directory registry for active watches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Opaque token identifying one registered directory watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchHandle(u64);

/// Mapping between watch handles and the directories they were registered
/// for.
///
/// Owned exclusively by the dispatch loop; nothing else reads or writes it
/// while a session is active, so no locking is involved. Entries are removed
/// when a directory is deleted, but a stale entry is harmless: lookups for
/// it simply stop matching.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    directories: HashMap<WatchHandle, PathBuf>,
    handles: HashMap<PathBuf, WatchHandle>,
    next_handle: u64,
}

impl WatchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `directory`, issuing a fresh handle for it.
    ///
    /// Registering a directory that already has a live handle returns the
    /// existing handle unchanged.
    pub fn register(&mut self, directory: impl Into<PathBuf>) -> WatchHandle {
        let directory = directory.into();
        if let Some(handle) = self.handles.get(&directory) {
            return *handle;
        }

        let handle = WatchHandle(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(directory.clone(), handle);
        self.directories.insert(handle, directory);
        handle
    }

    /// Resolve a handle to its directory.
    pub fn directory(&self, handle: WatchHandle) -> Option<&Path> {
        self.directories.get(&handle).map(PathBuf::as_path)
    }

    /// Resolve a directory to its handle.
    pub fn handle_for(&self, directory: &Path) -> Option<WatchHandle> {
        self.handles.get(directory).copied()
    }

    /// Whether `directory` currently has a live handle.
    pub fn contains(&self, directory: &Path) -> bool {
        self.handles.contains_key(directory)
    }

    /// Remove the entry for `directory`, returning its handle if present.
    pub fn remove(&mut self, directory: &Path) -> Option<WatchHandle> {
        let handle = self.handles.remove(directory)?;
        self.directories.remove(&handle);
        Some(handle)
    }

    /// Iterate over all registered directories.
    pub fn directories(&self) -> impl Iterator<Item = &Path> {
        self.handles.keys().map(PathBuf::as_path)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
