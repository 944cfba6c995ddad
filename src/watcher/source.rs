//! Blocking event source over an inotify handle.
//!
//! [`EventSource`] owns the notification backend, the watch registry and the
//! byte framer. Each pull either returns the next decoded event or, once all
//! notifications of a poll cycle are drained, a heartbeat.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::backend::{Inotify, NotifyBackend};
use super::error::{WatchError, WatchResult};
use super::framer::{Event, EventFramer, HEADER_SIZE};
use super::mask::EventMask;
use super::registry::{WatchHandle, WatchRegistry};

/// Default time a single poll may block.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(1);

/// Default size of one bounded read from the kernel.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Smallest read buffer that fits one event with a maximal name.
pub const MIN_READ_BUFFER_SIZE: usize = HEADER_SIZE + libc::NAME_MAX as usize + 1;

/// How long each poll cycle may block.
pub enum BlockDuration {
    Fixed(Duration),
    /// Asked once per poll cycle.
    Supplier(Box<dyn FnMut() -> Duration + Send>),
}

impl BlockDuration {
    pub fn supplier<F>(f: F) -> Self
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        BlockDuration::Supplier(Box::new(f))
    }

    /// Duration for the upcoming poll.
    pub fn next_timeout(&mut self) -> Duration {
        match self {
            BlockDuration::Fixed(duration) => *duration,
            BlockDuration::Supplier(supplier) => supplier(),
        }
    }
}

impl Default for BlockDuration {
    fn default() -> Self {
        BlockDuration::Fixed(DEFAULT_BLOCK_DURATION)
    }
}

impl From<Duration> for BlockDuration {
    fn from(duration: Duration) -> Self {
        BlockDuration::Fixed(duration)
    }
}

impl fmt::Debug for BlockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockDuration::Fixed(duration) => f.debug_tuple("Fixed").field(duration).finish(),
            BlockDuration::Supplier(_) => f.write_str("Supplier(..)"),
        }
    }
}

/// Construction options shared by [`EventSource`] and the tree watcher.
#[derive(Debug)]
pub struct WatchOptions {
    /// Events to observe.
    pub mask: EventMask,
    pub block_duration: BlockDuration,
    /// Bytes requested per read.
    pub read_buffer_size: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            mask: EventMask::ALL_EVENTS,
            block_duration: BlockDuration::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// One item of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Event(Event),
    /// End of a poll cycle, emitted whether or not anything happened.
    Heartbeat,
}

impl Notice {
    pub fn event(&self) -> Option<&Event> {
        match self {
            Notice::Event(event) => Some(event),
            Notice::Heartbeat => None,
        }
    }

    pub fn into_event(self) -> Option<Event> {
        match self {
            Notice::Event(event) => Some(event),
            Notice::Heartbeat => None,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Notice::Heartbeat)
    }
}

/// Owns a notification handle and turns it into a stream of [`Notice`]s.
///
/// Single consumer: every method takes `&mut self`, and the watch set may be
/// changed between two pulls of the stream.
pub struct EventSource<B: NotifyBackend = Inotify> {
    backend: B,
    registry: WatchRegistry,
    framer: EventFramer,
    /// Mask for watches installed without an explicit one.
    mask: EventMask,
    block_duration: BlockDuration,
    read_buf: Vec<u8>,
    /// Readiness notifications of the current cycle not yet read.
    ready: usize,
    /// A poll happened and its heartbeat is still owed.
    in_cycle: bool,
}

impl EventSource<Inotify> {
    /// Open a new inotify handle.
    pub fn new(options: WatchOptions) -> WatchResult<Self> {
        Self::with_backend(Inotify::init()?, options)
    }

    /// Open a new inotify handle and watch each of `paths` with the
    /// configured mask.
    pub fn with_paths<I, P>(paths: I, options: WatchOptions) -> WatchResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut source = Self::new(options)?;
        for path in paths {
            source.watch(path)?;
        }
        Ok(source)
    }
}

impl<B: NotifyBackend> EventSource<B> {
    pub fn with_backend(backend: B, options: WatchOptions) -> WatchResult<Self> {
        if options.read_buffer_size < MIN_READ_BUFFER_SIZE {
            return Err(WatchError::ConfigError {
                reason: format!(
                    "read buffer of {} bytes cannot hold an event (minimum {MIN_READ_BUFFER_SIZE})",
                    options.read_buffer_size
                ),
            });
        }

        Ok(Self {
            backend,
            registry: WatchRegistry::new(),
            framer: EventFramer::new(),
            mask: options.mask,
            block_duration: options.block_duration,
            read_buf: vec![0; options.read_buffer_size],
            ready: 0,
            in_cycle: false,
        })
    }

    /// Watch `path` with the source's default mask.
    pub fn watch(&mut self, path: impl Into<PathBuf>) -> WatchResult<WatchHandle> {
        let mask = self.mask;
        self.add_watch(path, mask)
    }

    /// Ask the kernel to watch `path` and track the returned handle.
    ///
    /// On failure the registry is left as it was.
    pub fn add_watch(
        &mut self,
        path: impl Into<PathBuf>,
        mask: EventMask,
    ) -> WatchResult<WatchHandle> {
        let path = path.into();
        if self.registry.contains(&path) {
            return Err(WatchError::DuplicateWatch { path });
        }

        let handle = match self.backend.add_watch(&path, mask) {
            Ok(handle) => handle,
            Err(source) => return Err(WatchError::WatchInstall { path, source }),
        };

        crate::debug_event!("source", "watching", "({handle}) {}", path.display());
        self.registry.add(path, handle)?;
        Ok(handle)
    }

    /// Stop tracking `path`.
    ///
    /// With `superficial` set only the bookkeeping goes; use it when the
    /// kernel already retired the watch (the directory was deleted). Returns
    /// `None` if the path was not watched.
    pub fn remove_watch(
        &mut self,
        path: &Path,
        superficial: bool,
    ) -> WatchResult<Option<WatchHandle>> {
        let Some(handle) = self.registry.remove(path) else {
            return Ok(None);
        };

        if superficial {
            crate::debug_event!("source", "forgot", "({handle}) {}", path.display());
        } else {
            self.deregister(path, handle)?;
        }
        Ok(Some(handle))
    }

    /// Stop tracking `root` and everything watched beneath it.
    ///
    /// All bookkeeping is removed even if some deregistrations fail; the first
    /// failure is returned after the whole subtree was processed.
    pub fn remove_watch_subtree(
        &mut self,
        root: &Path,
        superficial: bool,
    ) -> WatchResult<Vec<(PathBuf, WatchHandle)>> {
        let removed = self.registry.remove_subtree(root);
        if superficial {
            crate::debug_event!(
                "source",
                "forgot subtree",
                "{} ({} watches)",
                root.display(),
                removed.len()
            );
            return Ok(removed);
        }

        let mut first_error = None;
        for (path, handle) in &removed {
            if let Err(e) = self.deregister(path, *handle) {
                crate::warn_event!("source", "deregistration failed", "{e}");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    fn deregister(&mut self, path: &Path, handle: WatchHandle) -> WatchResult<()> {
        crate::debug_event!("source", "removing watch", "({handle}) {}", path.display());
        self.backend
            .remove_watch(handle)
            .map_err(|source| WatchError::WatchRemove {
                path: path.to_path_buf(),
                handle,
                source,
            })
    }

    /// Pull the next event or heartbeat, blocking in the poll if needed.
    pub fn next_notice(&mut self) -> WatchResult<Notice> {
        loop {
            let registry = &self.registry;
            if let Some(result) = self
                .framer
                .next_event(|handle| registry.resolve(handle).map(Path::to_path_buf))
            {
                return result.map(Notice::Event);
            }

            if self.ready > 0 {
                self.ready -= 1;
                self.fill()?;
                continue;
            }

            if self.in_cycle {
                self.in_cycle = false;
                return Ok(Notice::Heartbeat);
            }

            self.ready = self.poll()?;
            self.in_cycle = true;
        }
    }

    /// Endless stream of events and heartbeats.
    ///
    /// The iterator ends after yielding a fatal error.
    pub fn events(&mut self) -> Events<'_, B> {
        Events {
            source: self,
            done: false,
        }
    }

    fn poll(&mut self) -> WatchResult<usize> {
        loop {
            let timeout = self.block_duration.next_timeout();
            match self.backend.wait(timeout) {
                Ok(ready) => return Ok(ready),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    crate::debug_event!("source", "poll interrupted, retrying");
                }
                Err(e) => return Err(WatchError::Poll(e)),
            }
        }
    }

    fn fill(&mut self) -> WatchResult<()> {
        let n = self.backend.read(&mut self.read_buf).map_err(WatchError::Read)?;
        if n == 0 {
            crate::debug_event!("source", "empty read");
            return Ok(());
        }
        self.framer.extend(&self.read_buf[..n]);
        Ok(())
    }

    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.registry.contains(path)
    }

    pub fn watch_count(&self) -> usize {
        self.registry.len()
    }
}

/// Iterator returned by [`EventSource::events`].
pub struct Events<'a, B: NotifyBackend> {
    source: &'a mut EventSource<B>,
    done: bool,
}

impl<B: NotifyBackend> Iterator for Events<'_, B> {
    type Item = WatchResult<Notice>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.source.next_notice();
        if let Err(e) = &result {
            self.done = e.is_fatal();
        }
        Some(result)
    }
}
