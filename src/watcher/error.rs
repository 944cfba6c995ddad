//! Error types for the tree watcher system.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::registry::WatchHandle;

/// Errors from watcher operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize inotify: {source}")]
    InitFailed {
        #[source]
        source: io::Error,
    },

    #[error("Cannot watch path {}: {source}", path.display())]
    WatchInstall {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Path {} is already watched", path.display())]
    DuplicateWatch { path: PathBuf },

    #[error("Could not resolve all event bits of mask {mask:#010x}: unknown {unknown:#010x}")]
    UnknownEventBits { mask: u32, unknown: u32 },

    #[error("Failed to remove watch {handle} for {}: {source}", path.display())]
    WatchRemove {
        path: PathBuf,
        handle: WatchHandle,
        #[source]
        source: io::Error,
    },

    #[error("Polling for events failed: {0}")]
    Poll(#[source] io::Error),

    #[error("Reading events failed: {0}")]
    Read(#[source] io::Error),

    #[error("Cannot traverse {}: {source}", path.display())]
    Traverse {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Invalid configuration: {reason}")]
    ConfigError { reason: String },
}

impl WatchError {
    /// Whether the error ends the event stream.
    ///
    /// Poll and read failures mean the notification handle is unusable; every
    /// other error concerns a single watch or event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WatchError::InitFailed { .. } | WatchError::Poll(_) | WatchError::Read(_)
        )
    }

    /// Whether the path was gone by the time it was watched or listed.
    pub fn is_vanished(&self) -> bool {
        let kind = match self {
            WatchError::WatchInstall { source, .. } => Some(source.kind()),
            WatchError::Traverse { source, .. } => source.io_error().map(io::Error::kind),
            _ => None,
        };
        kind == Some(io::ErrorKind::NotFound)
    }
}

impl From<figment::Error> for WatchError {
    fn from(e: figment::Error) -> Self {
        WatchError::ConfigError {
            reason: e.to_string(),
        }
    }
}

pub type WatchResult<T> = Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let poll = WatchError::Poll(io::Error::from_raw_os_error(libc::EBADF));
        assert!(poll.is_fatal());

        let dup = WatchError::DuplicateWatch {
            path: PathBuf::from("/a"),
        };
        assert!(!dup.is_fatal());

        let bits = WatchError::UnknownEventBits {
            mask: 0x1001,
            unknown: 0x1000,
        };
        assert!(!bits.is_fatal());
    }

    #[test]
    fn test_vanished_classification() {
        let gone = WatchError::WatchInstall {
            path: PathBuf::from("/gone"),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(gone.is_vanished());

        let denied = WatchError::WatchInstall {
            path: PathBuf::from("/secret"),
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        assert!(!denied.is_vanished());
        assert!(!WatchError::Read(io::Error::from_raw_os_error(libc::ENOENT)).is_vanished());
    }

    #[test]
    fn test_messages_name_the_path() {
        let err = WatchError::WatchInstall {
            path: PathBuf::from("/missing"),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(err.to_string().contains("/missing"));

        let err = WatchError::UnknownEventBits {
            mask: 0x1001,
            unknown: 0x1000,
        };
        assert!(err.to_string().contains("0x00001000"));
    }
}
