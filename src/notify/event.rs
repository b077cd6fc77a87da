use crate::store::{Entry, EntryFlags, Value, Writer};
use bitflags::bitflags;

/// What a mutation did to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    ValueChanged,
    FlagsChanged,
    Deleted,
}

/// Emitted by the entry store for every accepted mutation
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    /// Global change counter, strictly increasing across all entries
    pub change: u64,
    pub kind: ChangeKind,
    pub name: String,
    /// Value after the change; the last value for deletions
    pub value: Value,
    pub flags: EntryFlags,
    pub sequence: u64,
    pub writer: Writer,
    pub type_changed: bool,
    /// Persistent flag before the change
    pub was_persistent: bool,
}

impl ChangeRecord {
    pub fn touches_persistence(&self) -> bool {
        self.was_persistent || self.flags.is_persistent()
    }
}

/// Kind of event delivered to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Immediate,
    Created,
    ValueChanged,
    FlagsChanged,
    Deleted,
}

impl From<ChangeKind> for EventKind {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Created => EventKind::Created,
            ChangeKind::ValueChanged => EventKind::ValueChanged,
            ChangeKind::FlagsChanged => EventKind::FlagsChanged,
            ChangeKind::Deleted => EventKind::Deleted,
        }
    }
}

bitflags! {
    /// Set of event kinds a subscription wants
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventKinds: u8 {
        const CREATED = 0x01;
        const VALUE_CHANGED = 0x02;
        const FLAGS_CHANGED = 0x04;
        const DELETED = 0x08;
        const IMMEDIATE = 0x10;

        /// Created, value changes, flag changes and deletions
        const ALL_CHANGES = 0x0f;
        /// Value-carrying events, like a `kValueAll` listener
        const VALUE_ALL = 0x13;
    }
}

impl EventKinds {
    pub fn accepts(self, kind: EventKind) -> bool {
        let bit = match kind {
            EventKind::Immediate => Self::IMMEDIATE,
            EventKind::Created => Self::CREATED,
            EventKind::ValueChanged => Self::VALUE_CHANGED,
            EventKind::FlagsChanged => Self::FLAGS_CHANGED,
            EventKind::Deleted => Self::DELETED,
        };
        self.contains(bit)
    }
}

/// One notification queued for one subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub change: u64,
    pub kind: EventKind,
    pub name: String,
    pub value: Value,
    pub flags: EntryFlags,
    pub sequence: u64,
    pub type_changed: bool,
}

impl Event {
    pub fn from_record(record: &ChangeRecord) -> Self {
        Self {
            change: record.change,
            kind: record.kind.into(),
            name: record.name.clone(),
            value: record.value.clone(),
            flags: record.flags,
            sequence: record.sequence,
            type_changed: record.type_changed,
        }
    }

    /// Current state of an entry, delivered at subscribe or resync time
    pub fn immediate(change: u64, name: &str, entry: &Entry) -> Self {
        Self {
            change,
            kind: EventKind::Immediate,
            name: name.to_string(),
            value: entry.value.clone(),
            flags: entry.flags,
            sequence: entry.sequence,
            type_changed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_accept() {
        assert!(EventKinds::ALL_CHANGES.accepts(EventKind::Deleted));
        assert!(!EventKinds::ALL_CHANGES.accepts(EventKind::Immediate));
        assert!(EventKinds::VALUE_ALL.accepts(EventKind::Immediate));
        assert!(!EventKinds::VALUE_ALL.accepts(EventKind::FlagsChanged));
        assert_eq!(EventKinds::from_bits(0x20), None);
        assert_eq!((EventKinds::CREATED | EventKinds::DELETED).bits(), 0x09);
    }
}
