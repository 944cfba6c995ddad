//! Kernel notification service behind a small trait.
//!
//! [`Inotify`] is the real implementation: one inotify instance plus an epoll
//! instance used to wait for it to become readable.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use super::error::{WatchError, WatchResult};
use super::mask::EventMask;
use super::registry::WatchHandle;

/// Operations the event source needs from the notification facility.
pub trait NotifyBackend {
    /// Start watching `path`; the kernel returns the same handle for a path
    /// it already watches.
    fn add_watch(&mut self, path: &Path, mask: EventMask) -> io::Result<WatchHandle>;

    /// Stop watching by handle.
    fn remove_watch(&mut self, handle: WatchHandle) -> io::Result<()>;

    /// Block up to `timeout` for the handle to become readable.
    ///
    /// Returns how many readiness notifications arrived; zero on timeout.
    /// A signal interruption surfaces as [`io::ErrorKind::Interrupted`].
    fn wait(&mut self, timeout: Duration) -> io::Result<usize>;

    /// Read raw event bytes into `buf`. Zero means nothing was available.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Linux inotify instance with an epoll readiness poller.
///
/// Both descriptors are owned and closed when the value is dropped.
#[derive(Debug)]
pub struct Inotify {
    inotify: OwnedFd,
    epoll: OwnedFd,
}

/// Readiness notifications collected per `epoll_wait` call.
const MAX_READY: usize = 8;

impl Inotify {
    /// Create the inotify handle and register it with a fresh epoll instance.
    pub fn init() -> WatchResult<Self> {
        let fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        let inotify = owned_fd(fd).map_err(|source| WatchError::InitFailed { source })?;
        let epoll = owned_fd(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
            .map_err(|source| WatchError::InitFailed { source })?;

        let mut interest = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: inotify.as_raw_fd() as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(
                epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                inotify.as_raw_fd(),
                &mut interest,
            )
        };
        if rc < 0 {
            return Err(WatchError::InitFailed {
                source: io::Error::last_os_error(),
            });
        }

        crate::debug_event!(
            "inotify",
            "initialized",
            "fd={} epoll={}",
            inotify.as_raw_fd(),
            epoll.as_raw_fd()
        );

        Ok(Self { inotify, epoll })
    }
}

impl NotifyBackend for Inotify {
    fn add_watch(&mut self, path: &Path, mask: EventMask) -> io::Result<WatchHandle> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let wd = unsafe {
            libc::inotify_add_watch(self.inotify.as_raw_fd(), c_path.as_ptr(), mask.bits())
        };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WatchHandle(wd))
    }

    fn remove_watch(&mut self, handle: WatchHandle) -> io::Result<()> {
        let rc = unsafe { libc::inotify_rm_watch(self.inotify.as_raw_fd(), handle.0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        let mut ready = [libc::epoll_event { events: 0, u64: 0 }; MAX_READY];
        let timeout_ms = timeout_millis(timeout);

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                ready.as_mut_ptr(),
                MAX_READY as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        if let Some(event) = ready[..n]
            .iter()
            .find(|e| e.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0)
        {
            let events = event.events;
            return Err(io::Error::other(format!(
                "inotify handle reported epoll condition {events:#x}"
            )));
        }
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(
                self.inotify.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }
}

/// Whole milliseconds for `epoll_wait`, rounded up so short timeouts still block.
fn timeout_millis(timeout: Duration) -> i32 {
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    i32::try_from(millis).unwrap_or(i32::MAX)
}

fn owned_fd(fd: libc::c_int) -> io::Result<OwnedFd> {
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by the kernel and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
