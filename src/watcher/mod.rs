//! Recursive inotify watcher.
//!
//! This module turns the raw inotify byte stream into decoded events and
//! keeps a whole directory tree under watch while it changes.
//!
//! # Architecture
//!
//! ```text
//! TreeWatcher
//!   - augmented mask (caller bits + structural bits)
//!   - maintains the watch set from the events it forwards
//!         |
//! EventSource
//!   - NotifyBackend (inotify fd + epoll)
//!   - WatchRegistry (path <-> handle, sorted index)
//!   - EventFramer (byte buffer -> Event)
//! ```

mod backend;
mod error;
mod framer;
mod mask;
mod registry;
mod source;
#[cfg(test)]
mod testing;
mod tree;

pub use backend::{Inotify, NotifyBackend};
pub use error::{WatchError, WatchResult};
pub use framer::{Event, EventFramer, EventHeader, Frames, HEADER_SIZE};
pub use mask::{EventMask, MASK_LOOKUP, decompose};
pub use registry::{WatchHandle, WatchRegistry};
pub use source::{
    BlockDuration, DEFAULT_BLOCK_DURATION, DEFAULT_READ_BUFFER_SIZE, EventSource, Events,
    MIN_READ_BUFFER_SIZE, Notice, WatchOptions,
};
pub use tree::{TreeEvents, TreeWatcher, TreeWatcherBuilder};
