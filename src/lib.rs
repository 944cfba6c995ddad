//! Recursive directory-tree watching on top of Linux inotify.
//!
//! ```no_run
//! use treewatch::{Notice, TreeWatcher};
//!
//! let mut watcher = TreeWatcher::new("/srv/incoming")?;
//! for notice in watcher.events() {
//!     if let Notice::Event(event) = notice? {
//!         println!("{event}");
//!     }
//! }
//! # Ok::<(), treewatch::WatchError>(())
//! ```
//!
//! Applications that keep their setup in a settings file can route the
//! watcher's diagnostics through [`logging`] with the same file:
//!
//! ```no_run
//! use treewatch::{Settings, TreeWatcher, logging};
//!
//! let settings = Settings::load_from("treewatch.toml")?;
//! logging::init_with_config(&settings.logging);
//!
//! let mut watcher = TreeWatcher::from_settings(&settings)?;
//! for notice in watcher.events().take(10) {
//!     let _ = notice?;
//! }
//! # Ok::<(), treewatch::WatchError>(())
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("treewatch requires Linux inotify");

pub mod config;
pub mod logging;
pub mod watcher;

pub use config::{LoggingConfig, Settings, WatchConfig};
pub use watcher::{
    BlockDuration, Event, EventMask, EventSource, Notice, TreeWatcher, TreeWatcherBuilder,
    WatchError, WatchHandle, WatchOptions, WatchRegistry, WatchResult,
};
