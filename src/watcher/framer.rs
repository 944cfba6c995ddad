//! Reassembly of raw inotify bytes into decoded events.
//!
//! The kernel delivers `struct inotify_event` records back to back: a 16-byte
//! header followed by `len` bytes of NUL-padded name. A single read may end in
//! the middle of a record, so bytes are buffered until a whole frame is
//! available.

use std::ffi::OsString;
use std::fmt;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use super::error::WatchResult;
use super::mask::{EventMask, decompose};
use super::registry::WatchHandle;

/// Size of the fixed `inotify_event` header.
pub const HEADER_SIZE: usize = 16;

/// Fixed part of one inotify record, in native byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub handle: WatchHandle,
    pub mask: u32,
    pub cookie: u32,
    pub name_len: u32,
}

impl EventHeader {
    /// Parse a header from the first [`HEADER_SIZE`] bytes, if present.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
        let word = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];

        Some(Self {
            handle: WatchHandle(i32::from_ne_bytes(word(0))),
            mask: u32::from_ne_bytes(word(4)),
            cookie: u32::from_ne_bytes(word(8)),
            name_len: u32::from_ne_bytes(word(12)),
        })
    }

    /// Header plus name bytes.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.name_len as usize
    }
}

/// One decoded filesystem event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub header: EventHeader,
    /// Symbolic names of the bits in `header.mask`.
    pub flags: Vec<&'static str>,
    /// Watched directory the event was reported on. `None` when the watch was
    /// already retired by the time the event was decoded.
    pub path: Option<PathBuf>,
    /// Entry name inside `path`; empty for events about the watched path itself.
    pub name: OsString,
}

impl Event {
    pub fn mask(&self) -> EventMask {
        EventMask::from_bits_retain(self.header.mask)
    }

    /// Whether the subject of the event is a directory.
    pub fn is_dir(&self) -> bool {
        self.mask().contains(EventMask::ISDIR)
    }

    /// `path` joined with `name`.
    pub fn full_path(&self) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        if self.name.is_empty() {
            Some(path.clone())
        } else {
            Some(path.join(&self.name))
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd={} [{}]", self.header.handle, self.flags.join("|"))?;
        match self.full_path() {
            Some(path) => write!(f, " {}", path.display()),
            None => write!(f, " <retired>/{}", self.name.to_string_lossy()),
        }
    }
}

/// Buffers raw bytes and cuts them into complete event frames.
#[derive(Debug, Default)]
pub struct EventFramer {
    buffer: Vec<u8>,
}

impl EventFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes from a read.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete frame, if the buffer holds one.
    ///
    /// `resolve` maps the frame's watch handle to its path at decode time. A
    /// frame whose mask has bits outside the lookup table is consumed and
    /// reported as an error.
    pub fn next_event<F>(&mut self, resolve: F) -> Option<WatchResult<Event>>
    where
        F: FnOnce(WatchHandle) -> Option<PathBuf>,
    {
        let header = EventHeader::parse(&self.buffer)?;
        let frame_len = header.frame_len();
        if self.buffer.len() < frame_len {
            crate::debug_event!(
                "framer",
                "partial frame",
                "{} of {frame_len} bytes",
                self.buffer.len()
            );
            return None;
        }

        let frame: Vec<u8> = self.buffer.drain(..frame_len).collect();

        let flags = match decompose(header.mask) {
            Ok(flags) => flags,
            Err(e) => return Some(Err(e)),
        };

        let raw_name = &frame[HEADER_SIZE..];
        let name_end = raw_name.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let name = OsString::from_vec(raw_name[..name_end].to_vec());

        Some(Ok(Event {
            header,
            flags,
            path: resolve(header.handle),
            name,
        }))
    }

    /// Iterate over every complete frame currently buffered.
    pub fn frames<F>(&mut self, resolve: F) -> Frames<'_, F>
    where
        F: FnMut(WatchHandle) -> Option<PathBuf>,
    {
        Frames {
            framer: self,
            resolve,
        }
    }
}

/// Iterator returned by [`EventFramer::frames`].
pub struct Frames<'a, F> {
    framer: &'a mut EventFramer,
    resolve: F,
}

impl<F> Iterator for Frames<'_, F>
where
    F: FnMut(WatchHandle) -> Option<PathBuf>,
{
    type Item = WatchResult<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        let resolve = &mut self.resolve;
        self.framer.next_event(|handle| resolve(handle))
    }
}
