use super::Value;
use crate::notify::ConnectionId;
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Entry flag bits; `from_bits` rejects unknown bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: u8 {
        const PERSISTENT = 0x01;
        const RETAINED = 0x02;
    }
}

impl EntryFlags {
    pub const NONE: EntryFlags = EntryFlags::empty();

    pub fn is_persistent(self) -> bool {
        self.contains(Self::PERSISTENT)
    }
}

/// Who performed the last accepted mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    Local,
    Remote(ConnectionId),
}

impl fmt::Display for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Writer::Local => f.write_str("local"),
            Writer::Remote(id) => write!(f, "conn-{}", id),
        }
    }
}

/// A named, typed, versioned value
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub flags: EntryFlags,
    pub sequence: u64,
    pub last_writer: Writer,
}
