use super::{Entry, EntryFlags, Table, Value, ValueType, Writer};
use crate::notify::{
    ChangeKind, ChangeRecord, ConnectionId, Event, EventKinds, NotificationEngine, NotifyStats,
    Outbox, Pattern, PushOutcome, SubscriptionId,
};
use crate::persist::{FlushHandle, PersistedEntry};
use crate::protocol::Message;
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Why an update was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Proposed sequence is not newer than the stored one
    Stale { current: u64 },
    Missing,
    TypeMismatch { current: ValueType },
}

struct MutationState {
    change: u64,
    engine: NotificationEngine,
    flush: Option<FlushHandle>,
}

/// Shared, versioned entry map
///
/// Reads go straight to the sharded map. Every mutation takes the single
/// mutation lock, bumps the global change counter and hands the change to
/// the notification engine before the lock is released, so subscribers
/// see changes in commit order.
pub struct EntryStore {
    entries: DashMap<String, Entry>,
    state: Mutex<MutationState>,
    reorder_tolerance: u64,
}

impl Default for EntryStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl EntryStore {
    pub fn new(reorder_tolerance: u64) -> Self {
        Self {
            entries: DashMap::new(),
            state: Mutex::new(MutationState {
                change: 0,
                engine: NotificationEngine::new(),
                flush: None,
            }),
            reorder_tolerance,
        }
    }

    /// Load entries read from the durable store, before serving
    ///
    /// Restored entries are persistent and start over at sequence 0.
    pub fn restore(&self, records: Vec<PersistedEntry>) -> usize {
        let _state = self.state.lock();
        let count = records.len();
        for record in records {
            self.entries.insert(
                record.name,
                Entry {
                    value: record.value,
                    flags: record.flags | EntryFlags::PERSISTENT,
                    sequence: 0,
                    last_writer: Writer::Local,
                },
            );
        }
        count
    }

    /// Schedule a flush whenever a persistent entry changes
    pub fn attach_flush(&self, handle: FlushHandle) {
        self.state.lock().flush = Some(handle);
    }

    // ===== Mutations =====

    /// Create or overwrite an entry; the value type may change
    pub fn assign(&self, name: &str, value: Value, flags: EntryFlags, writer: Writer) -> u64 {
        self.write(name, value, Some(flags), writer)
    }

    /// Apply `value` if `sequence` is newer than the stored sequence
    ///
    /// `sequence` is the writer's proposed sequence, i.e. the last one it
    /// observed plus one. An accepted update advances the stored sequence by
    /// exactly one whatever was proposed, so the sequence never decreases
    /// and a proposal far ahead cannot lock other writers out.
    pub fn update(
        &self,
        name: &str,
        value: Value,
        sequence: u64,
        writer: Writer,
    ) -> Result<u64, Rejection> {
        let mut state = self.state.lock();

        let (applied, flags, was_persistent) = {
            let mut entry = self.entries.get_mut(name).ok_or(Rejection::Missing)?;
            let current_type = entry.value.value_type();
            if current_type != value.value_type() {
                return Err(Rejection::TypeMismatch {
                    current: current_type,
                });
            }
            if sequence.saturating_add(self.reorder_tolerance) <= entry.sequence {
                return Err(Rejection::Stale {
                    current: entry.sequence,
                });
            }

            let next = entry.sequence.checked_add(1).ok_or(Rejection::Stale {
                current: entry.sequence,
            })?;
            entry.sequence = next;
            entry.value = value.clone();
            entry.last_writer = writer;
            (entry.sequence, entry.flags, entry.flags.is_persistent())
        };

        self.commit(
            &mut state,
            ChangeKind::ValueChanged,
            name,
            value,
            flags,
            applied,
            writer,
            false,
            was_persistent,
        );
        Ok(applied)
    }

    /// Returns false if the entry did not exist
    pub fn delete(&self, name: &str, writer: Writer) -> bool {
        let mut state = self.state.lock();
        let entry = match self.entries.remove(name) {
            Some((_, entry)) => entry,
            None => return false,
        };

        self.commit(
            &mut state,
            ChangeKind::Deleted,
            name,
            entry.value,
            entry.flags,
            entry.sequence,
            writer,
            false,
            entry.flags.is_persistent(),
        );
        true
    }

    /// Returns false if the entry did not exist
    pub fn set_flags(&self, name: &str, flags: EntryFlags, writer: Writer) -> bool {
        let mut state = self.state.lock();

        let (value, sequence, was_persistent) = {
            let mut entry = match self.entries.get_mut(name) {
                Some(entry) => entry,
                None => return false,
            };
            if entry.flags == flags {
                return true;
            }
            let was_persistent = entry.flags.is_persistent();
            entry.flags = flags;
            entry.sequence = entry.sequence.saturating_add(1);
            entry.last_writer = writer;
            (entry.value.clone(), entry.sequence, was_persistent)
        };

        self.commit(
            &mut state,
            ChangeKind::FlagsChanged,
            name,
            value,
            flags,
            sequence,
            writer,
            false,
            was_persistent,
        );
        true
    }

    /// Delete every non-persistent entry
    pub fn clear_all(&self, writer: Writer) -> usize {
        let mut state = self.state.lock();

        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().flags.is_persistent())
            .map(|e| e.key().clone())
            .collect();
        names.sort();

        let mut removed = 0;
        for name in names {
            if let Some((_, entry)) = self.entries.remove(&name) {
                self.commit(
                    &mut state,
                    ChangeKind::Deleted,
                    &name,
                    entry.value,
                    entry.flags,
                    entry.sequence,
                    writer,
                    false,
                    false,
                );
                removed += 1;
            }
        }
        removed
    }

    /// Local write: always wins, keeps existing flags
    pub fn set_value(&self, name: &str, value: impl Into<Value>) -> u64 {
        self.write(name, value.into(), None, Writer::Local)
    }

    /// Local write that only creates; returns false if the entry existed
    pub fn set_default(&self, name: &str, value: impl Into<Value>) -> bool {
        let mut state = self.state.lock();
        let value = value.into();

        match self.entries.entry(name.to_string()) {
            Slot::Occupied(_) => return false,
            Slot::Vacant(slot) => {
                slot.insert(Entry {
                    value: value.clone(),
                    flags: EntryFlags::NONE,
                    sequence: 0,
                    last_writer: Writer::Local,
                });
            }
        }

        self.commit(
            &mut state,
            ChangeKind::Created,
            name,
            value,
            EntryFlags::NONE,
            0,
            Writer::Local,
            false,
            false,
        );
        true
    }

    pub fn set_persistent(&self, name: &str) -> bool {
        match self.get(name) {
            Some(entry) => self.set_flags(
                name,
                entry.flags | EntryFlags::PERSISTENT,
                Writer::Local,
            ),
            None => false,
        }
    }

    pub fn clear_persistent(&self, name: &str) -> bool {
        match self.get(name) {
            Some(entry) => self.set_flags(
                name,
                entry.flags - EntryFlags::PERSISTENT,
                Writer::Local,
            ),
            None => false,
        }
    }

    fn write(&self, name: &str, value: Value, flags: Option<EntryFlags>, writer: Writer) -> u64 {
        let mut state = self.state.lock();

        let (kind, flags, sequence, type_changed, was_persistent) =
            match self.entries.entry(name.to_string()) {
                Slot::Occupied(mut slot) => {
                    let entry = slot.get_mut();
                    let type_changed = entry.value.value_type() != value.value_type();
                    let was_persistent = entry.flags.is_persistent();
                    entry.sequence = entry.sequence.saturating_add(1);
                    entry.value = value.clone();
                    entry.flags = flags.unwrap_or(entry.flags);
                    entry.last_writer = writer;
                    (
                        ChangeKind::ValueChanged,
                        entry.flags,
                        entry.sequence,
                        type_changed,
                        was_persistent,
                    )
                }
                Slot::Vacant(slot) => {
                    let flags = flags.unwrap_or_default();
                    slot.insert(Entry {
                        value: value.clone(),
                        flags,
                        sequence: 0,
                        last_writer: writer,
                    });
                    (ChangeKind::Created, flags, 0, false, false)
                }
            };

        self.commit(
            &mut state,
            kind,
            name,
            value,
            flags,
            sequence,
            writer,
            type_changed,
            was_persistent,
        );
        sequence
    }

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        state: &mut MutationState,
        kind: ChangeKind,
        name: &str,
        value: Value,
        flags: EntryFlags,
        sequence: u64,
        writer: Writer,
        type_changed: bool,
        was_persistent: bool,
    ) {
        state.change += 1;
        let record = ChangeRecord {
            change: state.change,
            kind,
            name: name.to_string(),
            value,
            flags,
            sequence,
            writer,
            type_changed,
            was_persistent,
        };

        state.engine.publish(&record);

        if record.touches_persistence() {
            if let Some(flush) = &state.flush {
                flush.schedule();
            }
        }
    }

    // ===== Reads =====

    pub fn get(&self, name: &str) -> Option<Entry> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    pub fn get_value(&self, name: &str) -> Option<Value> {
        self.entries.get(name).map(|e| e.value().value.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All entry names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn table(&self, path: &str) -> Table<'_> {
        Table::new(self, path)
    }

    /// Consistent copy of the persistent entries, sorted by name
    ///
    /// The mutation lock is held only while copying.
    pub fn persistent_snapshot(&self) -> Vec<PersistedEntry> {
        let _state = self.state.lock();
        let mut snapshot: Vec<PersistedEntry> = self
            .entries
            .iter()
            .filter(|e| e.value().flags.is_persistent())
            .map(|e| PersistedEntry {
                name: e.key().clone(),
                value: e.value().value.clone(),
                flags: e.value().flags,
            })
            .collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    /// Global change counter (number of committed mutations)
    pub fn change_counter(&self) -> u64 {
        self.state.lock().change
    }

    // ===== Subscriptions =====

    pub fn attach_outbox(&self, outbox: Arc<Outbox>) {
        self.state.lock().engine.attach(outbox);
    }

    /// Drop every subscription of `owner` and close its outbox
    pub fn detach(&self, owner: ConnectionId) -> usize {
        self.state.lock().engine.detach(owner)
    }

    /// Register interest; with `immediate` the current value of every
    /// matching entry is queued before any later change
    pub fn subscribe(
        &self,
        owner: ConnectionId,
        pattern: Pattern,
        kinds: EventKinds,
        immediate: bool,
    ) -> SubscriptionId {
        let mut state = self.state.lock();
        let immediate = immediate || kinds.contains(EventKinds::IMMEDIATE);

        let id = state.engine.subscribe(owner, pattern.clone(), kinds);
        if immediate {
            let events = self.snapshot_events(&[pattern], state.change);
            state.engine.enqueue_snapshot(owner, events);
        }
        id
    }

    /// Returns false if `id` is unknown or belongs to another owner
    pub fn unsubscribe(&self, id: SubscriptionId, owner: ConnectionId) -> bool {
        let mut state = self.state.lock();
        match state.engine.subscription(id) {
            Some(sub) if sub.owner == owner => state.engine.unsubscribe(id).is_some(),
            _ => false,
        }
    }

    /// Queue a protocol message in order with change events
    pub fn push_message(&self, owner: ConnectionId, message: Message) -> PushOutcome {
        self.state.lock().engine.push_message(owner, message)
    }

    /// Replace whatever `owner` has queued with a fresh snapshot of all
    /// entries its subscriptions match
    pub fn resync(
        &self,
        owner: ConnectionId,
        prelude: Option<Message>,
        trailer: Option<Message>,
    ) -> usize {
        let mut state = self.state.lock();

        let patterns: Vec<Pattern> = state
            .engine
            .subscriptions_of(owner)
            .into_iter()
            .map(|sub| sub.pattern.clone())
            .collect();

        let events = self.snapshot_events(&patterns, state.change);
        let count = events.len();
        if !state.engine.replace_queue(owner, prelude, events, trailer) {
            return 0;
        }
        count
    }

    pub fn notify_stats(&self) -> NotifyStats {
        self.state.lock().engine.stats()
    }

    /// Current state of every entry matched by any of `patterns`, each once
    fn snapshot_events(&self, patterns: &[Pattern], change: u64) -> Vec<Event> {
        let mut matched: BTreeMap<String, Event> = BTreeMap::new();
        for item in self.entries.iter() {
            if patterns.iter().any(|p| p.matches(item.key())) {
                matched.insert(
                    item.key().clone(),
                    Event::immediate(change, item.key(), item.value()),
                );
            }
        }
        matched.into_values().collect()
    }
}
