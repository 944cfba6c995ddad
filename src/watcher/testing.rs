//! Test doubles for the notification backend.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::backend::NotifyBackend;
use super::framer::HEADER_SIZE;
use super::mask::EventMask;
use super::registry::WatchHandle;

/// Encode one `inotify_event` the way the kernel lays it out, with the name
/// NUL-terminated and padded to a 16-byte boundary.
pub fn encode_frame(wd: i32, mask: u32, cookie: u32, name: &[u8]) -> Vec<u8> {
    let padded = if name.is_empty() {
        0
    } else {
        (name.len() + 1).div_ceil(HEADER_SIZE) * HEADER_SIZE
    };

    let mut bytes = Vec::with_capacity(HEADER_SIZE + padded);
    bytes.extend_from_slice(&wd.to_ne_bytes());
    bytes.extend_from_slice(&mask.to_ne_bytes());
    bytes.extend_from_slice(&cookie.to_ne_bytes());
    bytes.extend_from_slice(&(padded as u32).to_ne_bytes());
    bytes.extend_from_slice(name);
    bytes.resize(HEADER_SIZE + padded, 0);
    bytes
}

/// What one poll cycle of [`ScriptedBackend`] does.
#[derive(Debug)]
pub enum Cycle {
    /// Signal interruption.
    Interrupt,
    /// Each entry is one readiness notification and the bytes its read returns.
    Ready(Vec<Vec<u8>>),
    /// Poll failure other than an interruption.
    Fail(io::ErrorKind),
}

/// Backend that replays scripted poll cycles and records watch calls.
///
/// Once the script runs out every poll times out with nothing ready.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    next_handle: i32,
    pub cycles: VecDeque<Cycle>,
    pending_reads: VecDeque<Vec<u8>>,
    pub added: Vec<(PathBuf, EventMask, WatchHandle)>,
    pub removed: Vec<WatchHandle>,
    pub reject: HashSet<PathBuf>,
    /// Handles whose deregistration fails with `EINVAL`.
    pub fail_remove: HashSet<WatchHandle>,
    pub waits: Vec<Duration>,
    pub read_sizes: Vec<usize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_cycle(&mut self, cycle: Cycle) {
        self.cycles.push_back(cycle);
    }

    /// One cycle with a single readiness notification carrying `bytes`.
    pub fn push_read(&mut self, bytes: Vec<u8>) {
        self.push_cycle(Cycle::Ready(vec![bytes]));
    }
}

impl NotifyBackend for ScriptedBackend {
    fn add_watch(&mut self, path: &Path, mask: EventMask) -> io::Result<WatchHandle> {
        if self.reject.contains(path) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        self.next_handle += 1;
        let handle = WatchHandle(self.next_handle);
        self.added.push((path.to_path_buf(), mask, handle));
        Ok(handle)
    }

    fn remove_watch(&mut self, handle: WatchHandle) -> io::Result<()> {
        self.removed.push(handle);
        if self.fail_remove.contains(&handle) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        self.waits.push(timeout);
        match self.cycles.pop_front() {
            None => Ok(0),
            Some(Cycle::Interrupt) => Err(io::Error::from_raw_os_error(libc::EINTR)),
            Some(Cycle::Fail(kind)) => Err(io::Error::from(kind)),
            Some(Cycle::Ready(reads)) => {
                let n = reads.len();
                self.pending_reads.extend(reads);
                Ok(n)
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_sizes.push(buf.len());
        let Some(mut chunk) = self.pending_reads.pop_front() else {
            return Ok(0);
        };
        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            self.pending_reads.push_front(rest);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}
