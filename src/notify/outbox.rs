use super::{ConnectionId, Event};
use crate::protocol::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Wakes whoever drains an outbox
pub trait Notify: Send + Sync {
    fn notify(&self, owner: ConnectionId);
}

/// An item waiting to be written to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(Event),
    Message(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the oldest change event became a resync marker
    Overflowed,
    /// Covered by the next snapshot, or a duplicate keep-alive
    Dropped,
    Closed,
}

// Total items an outbox may hold, as a multiple of its change capacity
const LIMIT_FACTOR: usize = 16;

struct Slot {
    item: Outbound,
    critical: bool,
}

struct OutboxState {
    items: VecDeque<Slot>,
    queued_changes: usize,
    keep_alive_queued: bool,
    resync_pending: bool,
    dropped: u64,
    closed: bool,
}

impl OutboxState {
    /// Throw everything away and leave a single resync marker
    fn collapse(&mut self) {
        self.dropped += self.items.len() as u64;
        self.items.clear();
        self.items.push_back(Slot {
            item: Outbound::Message(Message::ResyncRequired),
            critical: true,
        });
        self.queued_changes = 0;
        self.keep_alive_queued = false;
        self.resync_pending = true;
    }
}

/// Bounded, ordered queue of outbound items for one subscriber
///
/// Change events count against the capacity; when it is reached the oldest
/// change becomes a resync marker. Snapshot events and protocol messages
/// skip that policy, but the queue never grows past `limit` items: reaching
/// it collapses the queue to a single resync marker. A full snapshot
/// installed with [`Outbox::replace`] is exempt, so a resync always fits.
/// Pushing never blocks.
pub struct Outbox {
    owner: ConnectionId,
    capacity: usize,
    limit: usize,
    state: Mutex<OutboxState>,
    notifier: Arc<dyn Notify>,
}

impl Outbox {
    pub fn new(owner: ConnectionId, capacity: usize, notifier: Arc<dyn Notify>) -> Self {
        Self {
            owner,
            capacity,
            limit: capacity.saturating_mul(LIMIT_FACTOR),
            state: Mutex::new(OutboxState {
                items: VecDeque::new(),
                queued_changes: 0,
                keep_alive_queued: false,
                resync_pending: false,
                dropped: 0,
                closed: false,
            }),
            notifier,
        }
    }

    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Queue a change event, applying the overflow policy
    pub fn push_change(&self, event: Event) -> PushOutcome {
        let (outcome, was_empty) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.resync_pending {
                state.dropped += 1;
                return PushOutcome::Dropped;
            }

            let was_empty = state.items.is_empty();
            if state.items.len() >= self.limit {
                state.collapse();
                (PushOutcome::Overflowed, was_empty)
            } else if state.queued_changes >= self.capacity {
                match state.items.iter().position(|slot| !slot.critical) {
                    Some(oldest) => {
                        state.items[oldest] = Slot {
                            item: Outbound::Message(Message::ResyncRequired),
                            critical: true,
                        };
                        state.queued_changes -= 1;
                        state.dropped += 2;
                    }
                    None => {
                        state.items.push_back(Slot {
                            item: Outbound::Message(Message::ResyncRequired),
                            critical: true,
                        });
                        state.dropped += 1;
                    }
                }
                state.resync_pending = true;
                (PushOutcome::Overflowed, was_empty)
            } else {
                state.items.push_back(Slot {
                    item: Outbound::Event(event),
                    critical: false,
                });
                state.queued_changes += 1;
                (PushOutcome::Queued, was_empty)
            }
        };

        if was_empty {
            self.notifier.notify(self.owner);
        }
        outcome
    }

    /// Queue a snapshot event; dropped only while a resync is pending
    pub fn push_snapshot(&self, event: Event) -> PushOutcome {
        self.push_critical(Outbound::Event(event))
    }

    /// Queue a protocol message; at most one keep-alive waits at a time
    pub fn push_message(&self, message: Message) -> PushOutcome {
        self.push_critical(Outbound::Message(message))
    }

    fn push_critical(&self, item: Outbound) -> PushOutcome {
        let keep_alive = item == Outbound::Message(Message::KeepAlive);
        let (outcome, was_empty) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.closed {
                return PushOutcome::Closed;
            }
            if keep_alive && state.keep_alive_queued {
                return PushOutcome::Dropped;
            }
            if state.resync_pending && matches!(item, Outbound::Event(_)) {
                state.dropped += 1;
                return PushOutcome::Dropped;
            }

            let was_empty = state.items.is_empty();
            if state.items.len() >= self.limit {
                if state.resync_pending {
                    state.dropped += 1;
                    return PushOutcome::Dropped;
                }
                state.collapse();
                (PushOutcome::Overflowed, was_empty)
            } else {
                state.items.push_back(Slot {
                    item,
                    critical: true,
                });
                state.keep_alive_queued |= keep_alive;
                (PushOutcome::Queued, was_empty)
            }
        };

        if was_empty {
            self.notifier.notify(self.owner);
        }
        outcome
    }

    /// Discard everything queued, clear a pending resync and queue `items`
    ///
    /// `items` is not held to the limit: it is a complete snapshot, bounded
    /// by the size of the store.
    pub fn replace(&self, items: Vec<Outbound>) -> PushOutcome {
        let notify = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            state.keep_alive_queued = items.contains(&Outbound::Message(Message::KeepAlive));
            state.items = items
                .into_iter()
                .map(|item| Slot {
                    item,
                    critical: true,
                })
                .collect();
            state.queued_changes = 0;
            state.resync_pending = false;
            !state.items.is_empty()
        };

        if notify {
            self.notifier.notify(self.owner);
        }
        PushOutcome::Queued
    }

    pub fn pop(&self) -> Option<Outbound> {
        let mut state = self.state.lock();
        let slot = state.items.pop_front()?;
        if !slot.critical {
            state.queued_changes -= 1;
        }
        if slot.item == Outbound::Message(Message::KeepAlive) {
            state.keep_alive_queued = false;
        }
        Some(slot.item)
    }

    pub fn drain(&self) -> Vec<Outbound> {
        let mut state = self.state.lock();
        state.queued_changes = 0;
        state.keep_alive_queued = false;
        state.items.drain(..).map(|slot| slot.item).collect()
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.items.clear();
        state.queued_changes = 0;
        state.keep_alive_queued = false;
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resync_pending(&self) -> bool {
        self.state.lock().resync_pending
    }

    /// Items discarded by the overflow policy
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::notify::EventKind;
    use crate::store::{EntryFlags, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct CountingNotify(pub AtomicUsize);

    impl Notify for CountingNotify {
        fn notify(&self, _owner: ConnectionId) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn change(n: u64) -> Event {
        Event {
            change: n,
            kind: EventKind::ValueChanged,
            name: "/x".into(),
            value: Value::Double(n as f64),
            flags: EntryFlags::NONE,
            sequence: n,
            type_changed: false,
        }
    }

    #[test]
    fn notifies_on_empty_to_nonempty() {
        let notify = Arc::new(CountingNotify::default());
        let outbox = Outbox::new(1, 16, notify.clone());

        outbox.push_change(change(1));
        outbox.push_change(change(2));
        assert_eq!(notify.0.load(Ordering::Relaxed), 1);

        assert_eq!(outbox.drain().len(), 2);
        outbox.push_message(Message::KeepAlive);
        assert_eq!(notify.0.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn overflow_replaces_oldest_change_with_marker() {
        let outbox = Outbox::new(1, 4, Arc::new(CountingNotify::default()));
        outbox.push_message(Message::HelloComplete { version: 0x0301 });
        for n in 1..=4 {
            assert_eq!(outbox.push_change(change(n)), PushOutcome::Queued);
        }

        assert_eq!(outbox.push_change(change(5)), PushOutcome::Overflowed);
        assert_eq!(outbox.push_change(change(6)), PushOutcome::Dropped);
        assert!(outbox.resync_pending());

        let items = outbox.drain();
        assert_eq!(items.len(), 5);
        assert_eq!(
            items[0],
            Outbound::Message(Message::HelloComplete { version: 0x0301 })
        );
        assert_eq!(items[1], Outbound::Message(Message::ResyncRequired));
        assert_eq!(items[2], Outbound::Event(change(2)));
        let markers = items
            .iter()
            .filter(|i| **i == Outbound::Message(Message::ResyncRequired))
            .count();
        assert_eq!(markers, 1);
    }

    #[test]
    fn snapshot_items_do_not_count_against_capacity() {
        let outbox = Outbox::new(1, 2, Arc::new(CountingNotify::default()));
        for n in 0..10 {
            outbox.push_snapshot(change(n));
        }
        assert_eq!(outbox.push_change(change(11)), PushOutcome::Queued);
        assert_eq!(outbox.push_change(change(12)), PushOutcome::Queued);
        assert_eq!(outbox.len(), 12);
        assert!(!outbox.resync_pending());
    }

    #[test]
    fn replace_clears_pending_resync() {
        let outbox = Outbox::new(1, 1, Arc::new(CountingNotify::default()));
        outbox.push_change(change(1));
        outbox.push_change(change(2));
        assert!(outbox.resync_pending());

        outbox.replace(vec![Outbound::Event(change(7))]);
        assert!(!outbox.resync_pending());
        assert_eq!(outbox.push_change(change(3)), PushOutcome::Queued);
        assert_eq!(outbox.pop(), Some(Outbound::Event(change(7))));
        assert_eq!(outbox.pop(), Some(Outbound::Event(change(3))));
    }

    #[test]
    fn repeated_snapshots_collapse_at_the_limit() {
        let outbox = Outbox::new(1, 16, Arc::new(CountingNotify::default()));
        assert_eq!(outbox.limit(), 256);

        // a reader that never drains while snapshots keep coming
        for _ in 0..50 {
            for n in 0..100 {
                outbox.push_snapshot(change(n));
            }
        }
        assert!(outbox.len() <= outbox.limit());
        assert!(outbox.resync_pending());
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.pop(), Some(Outbound::Message(Message::ResyncRequired)));

        // a full snapshot larger than the limit still goes in whole
        let snapshot: Vec<Outbound> = (0..1000).map(|n| Outbound::Event(change(n))).collect();
        outbox.replace(snapshot);
        assert_eq!(outbox.len(), 1000);
        assert!(!outbox.resync_pending());
    }

    #[test]
    fn messages_are_bounded_and_keep_alives_coalesce() {
        let outbox = Outbox::new(1, 16, Arc::new(CountingNotify::default()));
        for _ in 0..10 {
            outbox.push_message(Message::KeepAlive);
        }
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.pop(), Some(Outbound::Message(Message::KeepAlive)));
        assert_eq!(outbox.push_message(Message::KeepAlive), PushOutcome::Queued);

        for _ in 0..1000 {
            outbox.push_message(Message::ClearAll);
        }
        assert!(outbox.len() <= outbox.limit());
        assert!(outbox.resync_pending());
    }

    #[test]
    fn closed_outbox_rejects() {
        let outbox = Outbox::new(1, 4, Arc::new(CountingNotify::default()));
        outbox.close();
        assert_eq!(outbox.push_change(change(1)), PushOutcome::Closed);
        assert_eq!(outbox.push_message(Message::KeepAlive), PushOutcome::Closed);
    }
}
