use crate::notify::{Event, EventKind, EventKinds, Pattern};
use crate::store::{EntryFlags, Value};

/// Highest protocol revision this server speaks
pub const PROTOCOL_VERSION: u16 = 0x0301;

/// Oldest client revision still accepted
pub const MIN_PROTOCOL_VERSION: u16 = 0x0300;

pub mod tag {
    pub const HELLO: u8 = 0x01;
    pub const PROTOCOL_UNSUPPORTED: u8 = 0x02;
    pub const HELLO_COMPLETE: u8 = 0x03;
    pub const KEEP_ALIVE: u8 = 0x04;
    pub const ENTRY_ASSIGN: u8 = 0x10;
    pub const ENTRY_UPDATE: u8 = 0x11;
    pub const ENTRY_FLAGS_UPDATE: u8 = 0x12;
    pub const ENTRY_DELETE: u8 = 0x13;
    pub const CLEAR_ALL: u8 = 0x14;
    pub const SUBSCRIBE: u8 = 0x20;
    pub const UNSUBSCRIBE: u8 = 0x21;
    pub const SNAPSHOT_REQUEST: u8 = 0x22;
    pub const RESYNC_REQUIRED: u8 = 0x23;
}

/// A protocol message, either direction
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Opens a session; `selective` clients get no default subscription
    Hello {
        max_version: u16,
        selective: bool,
        client_name: String,
    },
    ProtocolUnsupported {
        server_version: u16,
    },
    /// Negotiated version; also marks the end of a snapshot burst
    HelloComplete {
        version: u16,
    },
    KeepAlive,
    EntryAssign {
        name: String,
        sequence: u64,
        flags: EntryFlags,
        value: Value,
    },
    EntryUpdate {
        name: String,
        sequence: u64,
        value: Value,
    },
    EntryFlagsUpdate {
        name: String,
        sequence: u64,
        flags: EntryFlags,
    },
    EntryDelete {
        name: String,
    },
    ClearAll,
    Subscribe {
        id: u32,
        pattern: Pattern,
        kinds: EventKinds,
        immediate: bool,
    },
    Unsubscribe {
        id: u32,
    },
    SnapshotRequest,
    ResyncRequired,
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Hello { .. } => tag::HELLO,
            Message::ProtocolUnsupported { .. } => tag::PROTOCOL_UNSUPPORTED,
            Message::HelloComplete { .. } => tag::HELLO_COMPLETE,
            Message::KeepAlive => tag::KEEP_ALIVE,
            Message::EntryAssign { .. } => tag::ENTRY_ASSIGN,
            Message::EntryUpdate { .. } => tag::ENTRY_UPDATE,
            Message::EntryFlagsUpdate { .. } => tag::ENTRY_FLAGS_UPDATE,
            Message::EntryDelete { .. } => tag::ENTRY_DELETE,
            Message::ClearAll => tag::CLEAR_ALL,
            Message::Subscribe { .. } => tag::SUBSCRIBE,
            Message::Unsubscribe { .. } => tag::UNSUBSCRIBE,
            Message::SnapshotRequest => tag::SNAPSHOT_REQUEST,
            Message::ResyncRequired => tag::RESYNC_REQUIRED,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "Hello",
            Message::ProtocolUnsupported { .. } => "ProtocolUnsupported",
            Message::HelloComplete { .. } => "HelloComplete",
            Message::KeepAlive => "KeepAlive",
            Message::EntryAssign { .. } => "EntryAssign",
            Message::EntryUpdate { .. } => "EntryUpdate",
            Message::EntryFlagsUpdate { .. } => "EntryFlagsUpdate",
            Message::EntryDelete { .. } => "EntryDelete",
            Message::ClearAll => "ClearAll",
            Message::Subscribe { .. } => "Subscribe",
            Message::Unsubscribe { .. } => "Unsubscribe",
            Message::SnapshotRequest => "SnapshotRequest",
            Message::ResyncRequired => "ResyncRequired",
        }
    }

    /// Wire form of a notification
    pub fn from_event(event: &Event) -> Self {
        match event.kind {
            EventKind::Immediate | EventKind::Created => Message::EntryAssign {
                name: event.name.clone(),
                sequence: event.sequence,
                flags: event.flags,
                value: event.value.clone(),
            },
            EventKind::ValueChanged if event.type_changed => Message::EntryAssign {
                name: event.name.clone(),
                sequence: event.sequence,
                flags: event.flags,
                value: event.value.clone(),
            },
            EventKind::ValueChanged => Message::EntryUpdate {
                name: event.name.clone(),
                sequence: event.sequence,
                value: event.value.clone(),
            },
            EventKind::FlagsChanged => Message::EntryFlagsUpdate {
                name: event.name.clone(),
                sequence: event.sequence,
                flags: event.flags,
            },
            EventKind::Deleted => Message::EntryDelete {
                name: event.name.clone(),
            },
        }
    }
}

/// Negotiate against a client's maximum; None if it is too old
pub fn negotiate_version(client_max: u16) -> Option<u16> {
    if client_max < MIN_PROTOCOL_VERSION {
        None
    } else {
        Some(client_max.min(PROTOCOL_VERSION))
    }
}
