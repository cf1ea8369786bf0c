//! Marshaling protocol for byte strings crossing the linear-memory boundary.
//!
//! A [`Handle`] packs a guest pointer and a byte length into one `u64`:
//! the offset lives in the high 32 bits and the length in the low 32 bits.
//! The zero handle means "absent" (or "failed") and is never produced for a
//! successfully placed payload, since framed payloads are at least one byte.
//!
//! Payloads handed *to* the guest are framed with a single trailing
//! [`TERMINATOR`] byte so C-style consumers can find the end without asking
//! for the length again. Payloads coming *from* the guest are opaque.

use std::fmt;
use std::ops::Range;

/// Byte appended to every payload exposed to the guest.
pub const TERMINATOR: u8 = 0;

/// A packed `(offset, length)` reference into guest linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(u64);

impl Handle {
    /// The zero handle: no payload.
    pub const NULL: Handle = Handle(0);

    /// Pack an offset and a length.
    pub const fn new(offset: u32, len: u32) -> Self {
        Handle(((offset as u64) << 32) | len as u64)
    }

    /// Reinterpret a raw value received from or sent to the guest.
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// The raw value as it crosses the boundary.
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    /// Byte offset into linear memory.
    pub const fn offset(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Length of the referenced range in bytes.
    pub const fn len(self) -> u32 {
        self.0 as u32
    }

    /// Whether this is the zero handle.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Split into `(offset, length)`.
    pub const fn parts(self) -> (u32, u32) {
        (self.offset(), self.len())
    }
}

impl From<Handle> for u64 {
    fn from(handle: Handle) -> u64 {
        handle.into_raw()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{}", self.offset(), self.len())
    }
}

/// Pack `(offset, length)` into the wire representation.
pub fn encode(offset: u32, len: u32) -> u64 {
    Handle::new(offset, len).into_raw()
}

/// Unpack the wire representation into `(offset, length)`.
pub fn decode(raw: u64) -> (u32, u32) {
    Handle::from_raw(raw).parts()
}

/// Copy `payload` and append the terminator byte.
///
/// The result is exactly `payload.len() + 1` bytes long.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + 1);
    framed.extend_from_slice(payload);
    framed.push(TERMINATOR);
    framed
}

/// Resolve a guest-supplied `(ptr, len)` pair against a memory of
/// `memory_size` bytes.
///
/// Returns `None` when the range overflows or ends past the memory.
pub fn guest_range(ptr: u32, len: u32, memory_size: usize) -> Option<Range<usize>> {
    let start = usize::try_from(ptr).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    (end <= memory_size).then_some(start..end)
}
