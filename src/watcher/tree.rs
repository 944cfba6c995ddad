//! Recursive watcher that keeps a whole directory tree under watch.
//!
//! [`TreeWatcher`] wraps an [`EventSource`]. Every event pulled from the source
//! is first used to maintain the watch set (new directories get watched, gone
//! directories are forgotten) and then handed to the caller unchanged.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::Settings;

use super::backend::{Inotify, NotifyBackend};
use super::error::{WatchError, WatchResult};
use super::framer::Event;
use super::mask::EventMask;
use super::source::{BlockDuration, DEFAULT_READ_BUFFER_SIZE, EventSource, Notice, WatchOptions};

/// Watches one or more directory trees and follows their changes.
pub struct TreeWatcher<B: NotifyBackend = Inotify> {
    source: EventSource<B>,
    /// Caller's mask plus [`EventMask::STRUCTURAL`].
    mask: EventMask,
    /// Event held back because its maintenance failed.
    pending: Option<Notice>,
}

impl TreeWatcher<Inotify> {
    /// Watch the tree under `root` for all events.
    pub fn new(root: impl Into<PathBuf>) -> WatchResult<Self> {
        Self::with_roots([root], WatchOptions::default())
    }

    /// Watch several trees through one inotify handle.
    pub fn with_roots<I, P>(roots: I, options: WatchOptions) -> WatchResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut watcher = Self::with_backend(Inotify::init()?, options)?;
        for root in roots {
            let root = root.into();
            crate::debug_event!("tree", "loading", "{}", root.display());
            watcher.load_tree(root)?;
        }
        Ok(watcher)
    }

    /// Create a builder for configuring the watcher.
    pub fn builder() -> TreeWatcherBuilder {
        TreeWatcherBuilder::new()
    }

    /// Build a watcher from loaded settings.
    pub fn from_settings(settings: &Settings) -> WatchResult<Self> {
        TreeWatcherBuilder::from_settings(settings)?.build()
    }
}

impl<B: NotifyBackend> TreeWatcher<B> {
    /// Wrap `backend` without watching anything yet.
    pub fn with_backend(backend: B, options: WatchOptions) -> WatchResult<Self> {
        let mask = options.mask | EventMask::STRUCTURAL;
        let source = EventSource::with_backend(backend, WatchOptions { mask, ..options })?;

        Ok(Self {
            source,
            mask,
            pending: None,
        })
    }

    /// Mask installed on every directory.
    pub fn mask(&self) -> EventMask {
        self.mask
    }

    /// Watch `root` and every directory below it, breadth first.
    ///
    /// Symlinks are not followed. Directories already watched are left alone
    /// but still descended into. Returns the number of watches installed.
    ///
    /// A directory below `root` that disappears while the walk is underway is
    /// skipped; the rest of the queue is still loaded. Failures on `root`
    /// itself are returned.
    pub fn load_tree(&mut self, root: impl Into<PathBuf>) -> WatchResult<usize> {
        let root = root.into();
        let mut queue = VecDeque::from([root.clone()]);
        let mut installed = 0;

        while let Some(dir) = queue.pop_front() {
            match self.load_dir(&dir, &mut queue) {
                Ok(added) => installed += usize::from(added),
                Err(e) if dir != root && e.is_vanished() => {
                    crate::debug_event!("tree", "vanished while loading", "{}", dir.display());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(installed)
    }

    /// Watch one directory and queue its child directories.
    fn load_dir(&mut self, dir: &Path, queue: &mut VecDeque<PathBuf>) -> WatchResult<bool> {
        let added = if self.source.is_watched(dir) {
            crate::debug_event!("tree", "already watched", "{}", dir.display());
            false
        } else {
            self.source.add_watch(dir, self.mask)?;
            true
        };

        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|source| WatchError::Traverse {
                path: dir.to_path_buf(),
                source,
            })?;
            if entry.file_type().is_dir() {
                queue.push_back(entry.into_path());
            }
        }

        Ok(added)
    }

    /// Apply the watch-set side effects of one event.
    pub fn maintain(&mut self, event: &Event) -> WatchResult<()> {
        let mask = event.mask();

        if mask.contains(EventMask::Q_OVERFLOW) {
            crate::warn_event!("tree", "queue overflow", "kernel dropped events");
            return Ok(());
        }

        if mask.contains(EventMask::IGNORED) {
            return self.retire(event);
        }

        if !mask.contains(EventMask::ISDIR) {
            return Ok(());
        }

        let Some(path) = event.full_path() else {
            crate::debug_event!("tree", "event on retired watch", "{event}");
            return Ok(());
        };

        if mask.contains(EventMask::CREATE) {
            crate::log_event!("tree", "directory created", "{}", path.display());
            self.load_tree(path)?;
        } else if mask.contains(EventMask::MOVED_TO) {
            crate::log_event!("tree", "directory moved in", "{}", path.display());
            // Whatever was tracked under this name belongs to the replaced entry.
            self.source.remove_watch_subtree(&path, true)?;
            self.load_tree(path)?;
        } else if mask.contains(EventMask::DELETE) {
            // The kernel already dropped the directory's own watch.
            crate::log_event!("tree", "directory deleted", "{}", path.display());
            self.source.remove_watch(&path, true)?;
        } else if mask.contains(EventMask::MOVED_FROM) {
            // No events are raised for nested directories, and moved watches
            // stay alive in the kernel.
            crate::log_event!("tree", "directory moved out", "{}", path.display());
            self.source.remove_watch_subtree(&path, false)?;
        }

        Ok(())
    }

    /// Forget a watch the kernel reported as gone.
    fn retire(&mut self, event: &Event) -> WatchResult<()> {
        let Some(path) = event.path.as_deref() else {
            return Ok(());
        };
        if self.source.registry().handle(path) == Some(event.header.handle) {
            crate::debug_event!("tree", "watch retired by kernel", "{}", path.display());
            self.source.remove_watch(path, true)?;
        }
        Ok(())
    }

    /// Pull the next notice, maintaining the watch set on the way.
    ///
    /// If maintenance fails the error comes first and the event itself is
    /// returned by the following call.
    pub fn next_notice(&mut self) -> WatchResult<Notice> {
        if let Some(notice) = self.pending.take() {
            return Ok(notice);
        }

        let notice = self.source.next_notice()?;
        if let Notice::Event(event) = &notice {
            if let Err(e) = self.maintain(event) {
                self.pending = Some(notice);
                return Err(e);
            }
        }
        Ok(notice)
    }

    /// Endless stream of events and heartbeats across all watched trees.
    ///
    /// The iterator ends after yielding a fatal error.
    pub fn events(&mut self) -> TreeEvents<'_, B> {
        TreeEvents {
            watcher: self,
            done: false,
        }
    }

    pub fn source(&self) -> &EventSource<B> {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut EventSource<B> {
        &mut self.source
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.source.is_watched(path)
    }
}

/// Iterator returned by [`TreeWatcher::events`].
pub struct TreeEvents<'a, B: NotifyBackend> {
    watcher: &'a mut TreeWatcher<B>,
    done: bool,
}

impl<B: NotifyBackend> Iterator for TreeEvents<'_, B> {
    type Item = WatchResult<Notice>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.watcher.next_notice();
        if let Err(e) = &result {
            self.done = e.is_fatal();
        }
        Some(result)
    }
}

/// Builder for constructing a TreeWatcher.
pub struct TreeWatcherBuilder {
    roots: Vec<PathBuf>,
    mask: EventMask,
    block_duration: BlockDuration,
    read_buffer_size: usize,
}

impl TreeWatcherBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self {
            roots: Vec::new(),
            mask: EventMask::ALL_EVENTS,
            block_duration: BlockDuration::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Start from the `[watch]` section of the settings.
    pub fn from_settings(settings: &Settings) -> WatchResult<Self> {
        let options = settings.watch_options()?;
        Ok(Self {
            roots: settings.watch.roots.clone(),
            mask: options.mask,
            block_duration: options.block_duration,
            read_buffer_size: options.read_buffer_size,
        })
    }

    /// Add a tree to watch.
    pub fn root(mut self, path: impl Into<PathBuf>) -> Self {
        self.roots.push(path.into());
        self
    }

    /// Set the events to observe, in addition to the structural ones.
    pub fn mask(mut self, mask: EventMask) -> Self {
        self.mask = mask;
        self
    }

    /// Set how long each poll may block.
    pub fn block_duration(mut self, duration: impl Into<BlockDuration>) -> Self {
        self.block_duration = duration.into();
        self
    }

    /// Set the size of each kernel read.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Build the TreeWatcher on a new inotify handle.
    pub fn build(self) -> WatchResult<TreeWatcher> {
        let backend = Inotify::init()?;
        self.build_with_backend(backend)
    }

    /// Build on a caller-supplied backend.
    pub fn build_with_backend<B: NotifyBackend>(self, backend: B) -> WatchResult<TreeWatcher<B>> {
        let options = WatchOptions {
            mask: self.mask,
            block_duration: self.block_duration,
            read_buffer_size: self.read_buffer_size,
        };
        let mut watcher = TreeWatcher::with_backend(backend, options)?;
        for root in self.roots {
            crate::debug_event!("tree", "loading", "{}", root.display());
            watcher.load_tree(root)?;
        }
        Ok(watcher)
    }
}

impl Default for TreeWatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::registry::WatchHandle;
    use crate::watcher::testing::{ScriptedBackend, encode_frame};
    use std::fs;
    use tempfile::TempDir;

    const CREATE_DIR: u32 = 0x4000_0100;
    const DELETE_DIR: u32 = 0x4000_0200;
    const MOVED_FROM_DIR: u32 = 0x4000_0040;
    const MOVED_TO_DIR: u32 = 0x4000_0080;

    fn scripted_tree(root: &Path) -> TreeWatcher<ScriptedBackend> {
        TreeWatcher::builder()
            .mask(EventMask::MODIFY)
            .root(root)
            .build_with_backend(ScriptedBackend::new())
            .unwrap()
    }

    fn handle(watcher: &TreeWatcher<ScriptedBackend>, path: &Path) -> WatchHandle {
        watcher.source().registry().handle(path).unwrap()
    }

    /// Queue one read carrying a single event, and pull it through the watcher.
    fn deliver(
        watcher: &mut TreeWatcher<ScriptedBackend>,
        wd: WatchHandle,
        mask: u32,
        name: &str,
    ) -> Event {
        let frame = encode_frame(wd.0, mask, 0, name.as_bytes());
        watcher.source_mut().backend_mut().push_read(frame);
        let notice = watcher.next_notice().unwrap();
        notice.into_event().unwrap()
    }

    #[test]
    fn test_load_tree_watches_directories_only() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::create_dir(root.join("d")).unwrap();
        fs::write(root.join("a/file.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("a"), root.join("link")).unwrap();

        let watcher = scripted_tree(root);

        let watched: Vec<_> = watcher
            .source()
            .registry()
            .paths()
            .map(Path::to_path_buf)
            .collect();
        assert_eq!(
            watched,
            vec![
                root.to_path_buf(),
                root.join("a"),
                root.join("a/b"),
                root.join("a/b/c"),
                root.join("d"),
            ]
        );

        // Breadth first: the root, then both children, then grandchildren.
        let added = &watcher.source().backend().added;
        assert_eq!(added[0].0, root);
        assert_eq!(added[3].0, root.join("a/b"));
        assert_eq!(added[4].0, root.join("a/b/c"));

        let expected_mask = EventMask::MODIFY | EventMask::STRUCTURAL;
        assert!(added.iter().all(|(_, mask, _)| *mask == expected_mask));
        assert_eq!(watcher.mask(), expected_mask);
    }

    #[test]
    fn test_load_tree_skips_watched_directories() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/b")).unwrap();
        let mut watcher = scripted_tree(temp.path());

        fs::create_dir(temp.path().join("a/new")).unwrap();
        let installed = watcher.load_tree(temp.path()).unwrap();

        assert_eq!(installed, 1);
        assert!(watcher.is_watched(&temp.path().join("a/new")));
        assert_eq!(watcher.source().watch_count(), 4);
    }

    #[test]
    fn test_multiple_roots_share_source() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        fs::create_dir(second.path().join("inner")).unwrap();

        let watcher = TreeWatcher::builder()
            .root(first.path())
            .root(second.path())
            .build_with_backend(ScriptedBackend::new())
            .unwrap();

        assert_eq!(watcher.source().watch_count(), 3);
        assert!(watcher.is_watched(&second.path().join("inner")));
    }

    #[test]
    fn test_missing_root_fails() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing");
        let mut backend = ScriptedBackend::new();
        backend.reject.insert(missing.clone());

        let result = TreeWatcher::builder()
            .root(&missing)
            .build_with_backend(backend);
        assert!(matches!(result, Err(WatchError::WatchInstall { .. })));
    }

    #[test]
    fn test_created_directory_is_loaded() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let mut watcher = scripted_tree(root);

        // Already populated by the time the event is handled.
        fs::create_dir_all(root.join("x/nested")).unwrap();
        let root_wd = handle(&watcher, root);
        let event = deliver(&mut watcher, root_wd, CREATE_DIR, "x");

        assert_eq!(event.flags, vec!["IN_CREATE", "IN_ISDIR"]);
        assert_eq!(event.path.as_deref(), Some(root));
        assert!(watcher.is_watched(&root.join("x")));
        assert!(watcher.is_watched(&root.join("x/nested")));
    }

    #[test]
    fn test_moved_in_directory_is_loaded() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let mut watcher = scripted_tree(root);

        fs::create_dir_all(root.join("arrived/deep/deeper")).unwrap();
        let root_wd = handle(&watcher, root);
        deliver(&mut watcher, root_wd, MOVED_TO_DIR, "arrived");

        assert_eq!(watcher.source().watch_count(), 4);
        assert!(watcher.is_watched(&root.join("arrived/deep/deeper")));
        assert!(watcher.source().backend().removed.is_empty());
    }

    #[test]
    fn test_moved_in_over_existing_replaces_bookkeeping() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("target")).unwrap();
        let mut watcher = scripted_tree(root);
        let old = handle(&watcher, &root.join("target"));

        let root_wd = handle(&watcher, root);
        deliver(&mut watcher, root_wd, MOVED_TO_DIR, "target");

        let new = handle(&watcher, &root.join("target"));
        assert_ne!(old, new);
        assert!(watcher.source().registry().resolve(old).is_none());
        assert!(watcher.source().backend().removed.is_empty());
    }

    #[test]
    fn test_deleted_directory_is_forgotten_superficially() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("x")).unwrap();
        let mut watcher = scripted_tree(root);

        let root_wd = handle(&watcher, root);
        deliver(&mut watcher, root_wd, DELETE_DIR, "x");

        assert!(!watcher.is_watched(&root.join("x")));
        assert!(watcher.is_watched(root));
        assert!(watcher.source().backend().removed.is_empty());
    }

    #[test]
    fn test_moved_out_directory_tears_down_subtree() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("x/y")).unwrap();
        fs::create_dir(root.join("xy")).unwrap();
        let mut watcher = scripted_tree(root);

        let x = handle(&watcher, &root.join("x"));
        let y = handle(&watcher, &root.join("x/y"));
        let root_wd = handle(&watcher, root);
        deliver(&mut watcher, root_wd, MOVED_FROM_DIR, "x");

        assert!(!watcher.is_watched(&root.join("x")));
        assert!(!watcher.is_watched(&root.join("x/y")));
        assert!(watcher.is_watched(&root.join("xy")));
        assert_eq!(watcher.source().backend().removed, vec![x, y]);
    }

    #[test]
    fn test_moved_in_directory_survives_vanished_child() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let mut watcher = scripted_tree(root);

        for child in ["a", "b", "c"] {
            fs::create_dir_all(root.join("m").join(child).join("inner")).unwrap();
        }
        // Removed between listing and watching.
        let b = root.join("m/b");
        watcher.source_mut().backend_mut().reject.insert(b.clone());

        let root_wd = handle(&watcher, root);
        let event = deliver(&mut watcher, root_wd, MOVED_TO_DIR, "m");

        assert_eq!(event.name, "m");
        assert!(watcher.is_watched(&root.join("m")));
        assert!(!watcher.is_watched(&b));
        for path in ["m/a", "m/a/inner", "m/c", "m/c/inner"] {
            assert!(watcher.is_watched(&root.join(path)), "{path} not watched");
        }
    }

    #[test]
    fn test_failed_teardown_yields_error_then_event() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("x/y")).unwrap();
        let mut watcher = scripted_tree(root);

        let x = handle(&watcher, &root.join("x"));
        let y = handle(&watcher, &root.join("x/y"));
        watcher.source_mut().backend_mut().fail_remove.insert(x);

        let root_wd = handle(&watcher, root);
        let frame = encode_frame(root_wd.0, MOVED_FROM_DIR, 7, b"x");
        watcher.source_mut().backend_mut().push_read(frame);

        let results: Vec<_> = watcher.events().take(3).collect();
        assert!(matches!(
            results[0],
            Err(WatchError::WatchRemove { handle, .. }) if handle == x
        ));
        let event = results[1].as_ref().unwrap().event().unwrap();
        assert_eq!(event.name, "x");
        assert_eq!(event.header.cookie, 7);
        assert!(results[2].as_ref().unwrap().is_heartbeat());

        assert_eq!(watcher.source().backend().removed, vec![x, y]);
        assert!(!watcher.is_watched(&root.join("x")));
        assert!(!watcher.is_watched(&root.join("x/y")));
    }

    #[test]
    fn test_queue_overflow_is_forwarded() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("sub")).unwrap();
        let mut watcher = scripted_tree(root);

        let event = deliver(&mut watcher, WatchHandle(-1), 0x4000, "");

        assert_eq!(event.flags, vec!["IN_Q_OVERFLOW"]);
        assert!(event.path.is_none());
        assert!(event.name.is_empty());
        assert_eq!(watcher.source().watch_count(), 2);
        assert_eq!(watcher.source().backend().added.len(), 2);
        assert!(watcher.source().backend().removed.is_empty());
    }

    #[test]
    fn test_file_events_do_not_touch_watches() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let mut watcher = scripted_tree(root);

        let root_wd = handle(&watcher, root);
        for mask in [0x100, 0x200, 0x40, 0x80, 0x2] {
            deliver(&mut watcher, root_wd, mask, "file.txt");
        }

        assert_eq!(watcher.source().watch_count(), 1);
        assert_eq!(watcher.source().backend().added.len(), 1);
        assert!(watcher.source().backend().removed.is_empty());
    }

    #[test]
    fn test_events_pass_through_unchanged() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("gone")).unwrap();
        let mut watcher = scripted_tree(root);
        let root_wd = handle(&watcher, root);

        let mut bytes = encode_frame(root_wd.0, DELETE_DIR, 0, b"gone");
        bytes.extend(encode_frame(root_wd.0, 0x2, 0, b"f"));
        watcher.source_mut().backend_mut().push_read(bytes);

        let notices: Vec<Notice> = watcher.events().take(3).map(Result::unwrap).collect();

        let first = notices[0].event().unwrap();
        assert_eq!(first.header.mask, DELETE_DIR);
        assert_eq!(first.name, "gone");
        assert_eq!(first.full_path(), Some(root.join("gone")));
        assert_eq!(notices[1].event().unwrap().flags, vec!["IN_MODIFY"]);
        assert!(notices[2].is_heartbeat());
    }

    #[test]
    fn test_failed_maintenance_yields_error_then_event() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let mut watcher = scripted_tree(root);
        watcher.source_mut().backend_mut().reject.insert(root.join("flash"));

        let root_wd = handle(&watcher, root);
        let frame = encode_frame(root_wd.0, CREATE_DIR, 0, b"flash");
        watcher.source_mut().backend_mut().push_read(frame);

        let results: Vec<_> = watcher.events().take(3).collect();
        assert!(matches!(results[0], Err(WatchError::WatchInstall { .. })));
        assert_eq!(results[1].as_ref().unwrap().event().unwrap().name, "flash");
        assert!(results[2].as_ref().unwrap().is_heartbeat());
        assert!(!watcher.is_watched(&root.join("flash")));
    }

    #[test]
    fn test_ignored_retires_watch() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("sub")).unwrap();
        let mut watcher = scripted_tree(root);

        let sub = handle(&watcher, &root.join("sub"));
        let event = deliver(&mut watcher, sub, 0x8000, "");

        assert_eq!(event.path.as_deref(), Some(root.join("sub").as_path()));
        assert!(!watcher.is_watched(&root.join("sub")));

        // A second one for the same handle no longer resolves.
        let event = deliver(&mut watcher, sub, 0x8000, "");
        assert!(event.path.is_none());
        assert!(watcher.source().backend().removed.is_empty());
    }

    #[test]
    fn test_directory_event_on_retired_watch_is_forwarded() {
        let temp = TempDir::new().unwrap();
        let mut watcher = scripted_tree(temp.path());

        let event = deliver(&mut watcher, WatchHandle(99), CREATE_DIR, "x");

        assert!(event.path.is_none());
        assert_eq!(watcher.source().watch_count(), 1);
    }
}
