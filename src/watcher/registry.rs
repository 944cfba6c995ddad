//! Watch registry mapping watched paths to kernel watch handles.
//!
//! Keeps a forward map, its inverse, and a sorted path index so that a whole
//! directory subtree can be located with one binary search and a scan over
//! just that subtree.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use super::error::{WatchError, WatchResult};

/// Kernel watch descriptor identifying one active watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub i32);

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bidirectional path/handle store with a sorted path index.
///
/// Paths are ordered component-wise (the `Ord` of [`Path`]), so every
/// descendant of a directory sorts directly after it and before any sibling
/// such as `/ab` next to `/a`.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    /// Path -> handle.
    watches: HashMap<PathBuf, WatchHandle>,
    /// Handle -> path.
    handles: HashMap<WatchHandle, PathBuf>,
    /// All watched paths, sorted.
    index: Vec<PathBuf>,
}

impl WatchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new watch.
    ///
    /// Fails with [`WatchError::DuplicateWatch`] if the path is already
    /// tracked. If the kernel handed out a handle still mapped to another
    /// path, that older entry is stale and gets dropped.
    pub fn add(&mut self, path: PathBuf, handle: WatchHandle) -> WatchResult<()> {
        if self.watches.contains_key(&path) {
            return Err(WatchError::DuplicateWatch { path });
        }

        if let Some(stale) = self.handles.get(&handle).cloned() {
            crate::debug_event!(
                "registry",
                "handle reused",
                "{handle} moved from {} to {}",
                stale.display(),
                path.display()
            );
            self.remove(&stale);
        }

        let idx = match self.index.binary_search(&path) {
            Ok(idx) | Err(idx) => idx,
        };
        self.index.insert(idx, path.clone());
        self.handles.insert(handle, path.clone());
        self.watches.insert(path, handle);
        Ok(())
    }

    /// Stop tracking a path, returning its handle if it was tracked.
    pub fn remove(&mut self, path: &Path) -> Option<WatchHandle> {
        let handle = self.watches.remove(path)?;
        self.handles.remove(&handle);
        if let Ok(idx) = self.index.binary_search_by(|p| p.as_path().cmp(path)) {
            self.index.remove(idx);
        }
        Some(handle)
    }

    /// Stop tracking `root` and every path beneath it.
    ///
    /// Returns the removed entries in index order.
    pub fn remove_subtree(&mut self, root: &Path) -> Vec<(PathBuf, WatchHandle)> {
        let start = self.index.partition_point(|p| p.as_path() < root);
        let end = start
            + self.index[start..]
                .iter()
                .take_while(|p| p.starts_with(root))
                .count();

        let removed: Vec<PathBuf> = self.index.drain(start..end).collect();
        removed
            .into_iter()
            .filter_map(|path| {
                let handle = self.watches.remove(&path)?;
                self.handles.remove(&handle);
                Some((path, handle))
            })
            .collect()
    }

    /// Path watched by `handle`, if any.
    pub fn resolve(&self, handle: WatchHandle) -> Option<&Path> {
        self.handles.get(&handle).map(PathBuf::as_path)
    }

    /// Handle watching `path`, if any.
    pub fn handle(&self, path: &Path) -> Option<WatchHandle> {
        self.watches.get(path).copied()
    }

    /// Check if a path is watched.
    pub fn contains(&self, path: &Path) -> bool {
        self.watches.contains_key(path)
    }

    /// All watched paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.index.iter().map(PathBuf::as_path)
    }

    /// Number of watched paths.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
