//! Target Channel Trait
//!
//! The two primitives the Target Control collaborator exposes: expensive
//! expression evaluation inside the debuggee and cheap bulk memory reads
//! out of its address space. Pure delegation with error normalization;
//! retry policy belongs to callers.

use byteorder::{ByteOrder, BE, LE};
use thiserror::Error;

use crate::types::ProcessSession;

/// Errors surfaced at the channel boundary.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The target is not in a stopped, debuggable state.
    #[error("target process is not in a stopped, debuggable state")]
    Unavailable,

    #[error("expression evaluation failed: {0}")]
    Evaluation(String),

    #[error("failed to read {length} bytes at {address:#x}: {reason}")]
    Read {
        address: u64,
        length: usize,
        reason: String,
    },
}

/// Result of an expression evaluation in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A pointer-sized scalar (`(void *)`, `(Class)` casts). Zero is null.
    Pointer(u64),
    /// A C string summary (`(const char *)` casts).
    Str(String),
}

impl Value {
    pub fn as_pointer(&self) -> Option<u64> {
        match self {
            Value::Pointer(p) => Some(*p),
            Value::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Pointer(_) => None,
        }
    }
}

/// Byte order of the target architecture, used to decode pointer arrays
/// and offset tables copied out of its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrdering {
    Little,
    Big,
}

impl ByteOrdering {
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrdering::Little => LE::read_u32(bytes),
            ByteOrdering::Big => BE::read_u32(bytes),
        }
    }

    pub fn read_u64(self, bytes: &[u8]) -> u64 {
        match self {
            ByteOrdering::Little => LE::read_u64(bytes),
            ByteOrdering::Big => BE::read_u64(bytes),
        }
    }

    /// Decode one pointer of the given width (4 or 8 bytes).
    pub fn read_ptr(self, bytes: &[u8], width: usize) -> u64 {
        match width {
            4 => u64::from(self.read_u32(bytes)),
            _ => self.read_u64(bytes),
        }
    }
}

/// Access to a paused target process.
///
/// `evaluate` is the expensive channel: it can run arbitrary logic in the
/// target (including compound block expressions that write into scratch
/// memory) but costs tens of milliseconds per call. `read_bytes` is the
/// cheap channel: a raw copy out of the target's address space that may
/// return fewer bytes than requested.
pub trait TargetChannel {
    fn evaluate(&self, expr: &str) -> Result<Value, ChannelError>;

    fn read_bytes(&self, address: u64, length: usize) -> Result<Vec<u8>, ChannelError>;

    /// Pointer width of the target architecture: 4 or 8.
    fn pointer_width(&self) -> usize;

    fn byte_order(&self) -> ByteOrdering {
        ByteOrdering::Little
    }

    /// Stable identity of the attached process instance.
    fn session(&self) -> ProcessSession;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Pointer(0x10).as_pointer(), Some(0x10));
        assert_eq!(Value::Pointer(0x10).as_str(), None);
        assert_eq!(Value::Str("NSObject".into()).as_str(), Some("NSObject"));
        assert_eq!(Value::Str("NSObject".into()).as_pointer(), None);
    }

    #[test]
    fn test_byte_ordering_read_ptr() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(
            ByteOrdering::Little.read_ptr(&bytes, 8),
            0x0807060504030201
        );
        assert_eq!(ByteOrdering::Little.read_ptr(&bytes, 4), 0x04030201);
        assert_eq!(ByteOrdering::Big.read_ptr(&bytes, 4), 0x01020304);
    }
}
