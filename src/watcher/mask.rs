//! Inotify event bits and their symbolic names.

use bitflags::bitflags;

use super::error::{WatchError, WatchResult};

bitflags! {
    /// Bitset of inotify event categories.
    ///
    /// Values match `<sys/inotify.h>`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventMask: u32 {
        const ACCESS = 0x0000_0001;
        const MODIFY = 0x0000_0002;
        const ATTRIB = 0x0000_0004;
        const CLOSE_WRITE = 0x0000_0008;
        const CLOSE_NOWRITE = 0x0000_0010;
        const OPEN = 0x0000_0020;
        const MOVED_FROM = 0x0000_0040;
        const MOVED_TO = 0x0000_0080;
        const CREATE = 0x0000_0100;
        const DELETE = 0x0000_0200;
        const DELETE_SELF = 0x0000_0400;
        const MOVE_SELF = 0x0000_0800;
        const UNMOUNT = 0x0000_2000;
        const Q_OVERFLOW = 0x0000_4000;
        const IGNORED = 0x0000_8000;
        const ONLYDIR = 0x0100_0000;
        const DONT_FOLLOW = 0x0200_0000;
        const EXCL_UNLINK = 0x0400_0000;
        const MASK_ADD = 0x2000_0000;
        const ISDIR = 0x4000_0000;
        const ONESHOT = 0x8000_0000;

        const CLOSE = Self::CLOSE_WRITE.bits() | Self::CLOSE_NOWRITE.bits();
        const MOVE = Self::MOVED_FROM.bits() | Self::MOVED_TO.bits();
        const ALL_EVENTS = 0x0000_0fff;
    }
}

/// Single event bits in lookup order, paired with their symbolic names.
pub const MASK_LOOKUP: &[(u32, &str)] = &[
    (0x0000_0001, "IN_ACCESS"),
    (0x0000_0002, "IN_MODIFY"),
    (0x0000_0004, "IN_ATTRIB"),
    (0x0000_0008, "IN_CLOSE_WRITE"),
    (0x0000_0010, "IN_CLOSE_NOWRITE"),
    (0x0000_0020, "IN_OPEN"),
    (0x0000_0040, "IN_MOVED_FROM"),
    (0x0000_0080, "IN_MOVED_TO"),
    (0x0000_0100, "IN_CREATE"),
    (0x0000_0200, "IN_DELETE"),
    (0x0000_0400, "IN_DELETE_SELF"),
    (0x0000_0800, "IN_MOVE_SELF"),
    (0x0000_2000, "IN_UNMOUNT"),
    (0x0000_4000, "IN_Q_OVERFLOW"),
    (0x0000_8000, "IN_IGNORED"),
    (0x0100_0000, "IN_ONLYDIR"),
    (0x0200_0000, "IN_DONT_FOLLOW"),
    (0x0400_0000, "IN_EXCL_UNLINK"),
    (0x2000_0000, "IN_MASK_ADD"),
    (0x4000_0000, "IN_ISDIR"),
    (0x8000_0000, "IN_ONESHOT"),
];

/// Names accepted in configuration that cover several bits.
const COMPOSITES: &[(EventMask, &str)] = &[
    (EventMask::ALL_EVENTS, "IN_ALL_EVENTS"),
    (EventMask::MOVE, "IN_MOVE"),
    (EventMask::CLOSE, "IN_CLOSE"),
];

/// Split a raw mask into the symbolic names of its bits.
///
/// Every bit must be covered by [`MASK_LOOKUP`]; anything left over means the
/// table is out of date with respect to the kernel.
pub fn decompose(mask: u32) -> WatchResult<Vec<&'static str>> {
    let mut remaining = mask;
    let mut names = Vec::new();

    for &(bit, name) in MASK_LOOKUP {
        if remaining == 0 {
            break;
        }
        if remaining & bit != 0 {
            names.push(name);
            remaining &= !bit;
        }
    }

    if remaining != 0 {
        return Err(WatchError::UnknownEventBits {
            mask,
            unknown: remaining,
        });
    }

    Ok(names)
}

impl EventMask {
    /// Bits the tree watcher needs on every directory watch.
    pub const STRUCTURAL: EventMask = EventMask::ISDIR
        .union(EventMask::CREATE)
        .union(EventMask::DELETE)
        .union(EventMask::MOVED_FROM)
        .union(EventMask::MOVED_TO);

    /// Parse a symbolic name such as `IN_CREATE` or `IN_ALL_EVENTS`.
    pub fn from_symbol(name: &str) -> Option<EventMask> {
        let name = name.trim();
        MASK_LOOKUP
            .iter()
            .find(|(_, n)| *n == name)
            .map(|&(bit, _)| EventMask::from_bits_retain(bit))
            .or_else(|| {
                COMPOSITES
                    .iter()
                    .find(|(_, n)| *n == name)
                    .map(|&(mask, _)| mask)
            })
    }

    /// Combine a list of symbolic names into one mask.
    pub fn from_symbols<S: AsRef<str>>(names: &[S]) -> WatchResult<EventMask> {
        names.iter().try_fold(EventMask::empty(), |acc, name| {
            EventMask::from_symbol(name.as_ref())
                .map(|bits| acc | bits)
                .ok_or_else(|| WatchError::ConfigError {
                    reason: format!("unknown event name '{}'", name.as_ref()),
                })
        })
    }
}

impl Default for EventMask {
    fn default() -> Self {
        EventMask::ALL_EVENTS
    }
}
