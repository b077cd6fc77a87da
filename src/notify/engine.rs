use super::{
    ChangeRecord, ConnectionId, Event, EventKind, EventKinds, Outbound, Outbox, Pattern,
    PatternTrie, PushOutcome, Subscription, SubscriptionId,
};
use crate::protocol::Message;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyStats {
    pub published: u64,
    pub delivered: u64,
    pub overflows: u64,
    pub dropped: u64,
}

/// Subscription registry and change fan-out
///
/// Lives behind the entry store's mutation lock, so every `publish` for
/// change N completes before change N+1 is published. Delivery is
/// enqueue-only.
pub struct NotificationEngine {
    next_id: SubscriptionId,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    trie: PatternTrie,
    owner_subscriptions: HashMap<ConnectionId, Vec<SubscriptionId>>,
    outboxes: HashMap<ConnectionId, Arc<Outbox>>,
    stats: NotifyStats,
}

impl Default for NotificationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationEngine {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            subscriptions: HashMap::new(),
            trie: PatternTrie::new(),
            owner_subscriptions: HashMap::new(),
            outboxes: HashMap::new(),
            stats: NotifyStats::default(),
        }
    }

    /// Register the queue events for `outbox.owner()` are delivered to
    pub fn attach(&mut self, outbox: Arc<Outbox>) {
        self.outboxes.insert(outbox.owner(), outbox);
    }

    /// Release every subscription and the outbox of a subscriber
    pub fn detach(&mut self, owner: ConnectionId) -> usize {
        let ids = self.owner_subscriptions.remove(&owner).unwrap_or_default();
        for id in &ids {
            if let Some(sub) = self.subscriptions.remove(id) {
                self.trie.remove(&sub.pattern, sub.id);
            }
        }

        if let Some(outbox) = self.outboxes.remove(&owner) {
            outbox.close();
        }

        ids.len()
    }

    pub fn subscribe(
        &mut self,
        owner: ConnectionId,
        pattern: Pattern,
        kinds: EventKinds,
    ) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;

        self.trie.insert(&pattern, id);
        self.owner_subscriptions.entry(owner).or_default().push(id);
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                owner,
                pattern,
                kinds,
            },
        );

        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<Subscription> {
        let sub = self.subscriptions.remove(&id)?;
        self.trie.remove(&sub.pattern, id);

        if let Some(ids) = self.owner_subscriptions.get_mut(&sub.owner) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.owner_subscriptions.remove(&sub.owner);
            }
        }

        Some(sub)
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    pub fn subscriptions_of(&self, owner: ConnectionId) -> Vec<&Subscription> {
        self.owner_subscriptions
            .get(&owner)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.subscriptions.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Queue snapshot events ahead of any later change for this owner
    pub fn enqueue_snapshot(&mut self, owner: ConnectionId, events: Vec<Event>) {
        let Some(outbox) = self.outboxes.get(&owner) else {
            return;
        };
        for event in events {
            match outbox.push_snapshot(event) {
                PushOutcome::Queued => self.stats.delivered += 1,
                PushOutcome::Overflowed => {
                    self.stats.overflows += 1;
                    warn!(
                        "Outbound queue of subscriber {} hit its limit of {} items, resync required",
                        owner,
                        outbox.limit()
                    );
                }
                PushOutcome::Dropped => self.stats.dropped += 1,
                PushOutcome::Closed => return,
            }
        }
    }

    /// Replace whatever `owner` has queued with a complete snapshot
    ///
    /// Returns false if the owner has no outbox.
    pub fn replace_queue(
        &mut self,
        owner: ConnectionId,
        prelude: Option<Message>,
        events: Vec<Event>,
        trailer: Option<Message>,
    ) -> bool {
        let Some(outbox) = self.outboxes.get(&owner) else {
            return false;
        };

        let snapshot = events.len() as u64;
        let mut items = Vec::with_capacity(events.len() + 2);
        items.extend(prelude.map(Outbound::Message));
        items.extend(events.into_iter().map(Outbound::Event));
        items.extend(trailer.map(Outbound::Message));

        if outbox.replace(items) == PushOutcome::Queued {
            self.stats.delivered += snapshot;
        }
        true
    }

    pub fn push_message(&self, owner: ConnectionId, message: Message) -> PushOutcome {
        match self.outboxes.get(&owner) {
            Some(outbox) => outbox.push_message(message),
            None => PushOutcome::Closed,
        }
    }

    /// Fan a change out to every interested subscriber, once per owner
    pub fn publish(&mut self, record: &ChangeRecord) -> usize {
        self.stats.published += 1;

        let kind = EventKind::from(record.kind);
        let mut seen: HashSet<ConnectionId> = HashSet::new();
        let mut delivered = 0;

        for id in self.trie.find_matches(&record.name) {
            let sub = match self.subscriptions.get(&id) {
                Some(sub) => sub,
                None => continue,
            };
            if !sub.kinds.accepts(kind) || !seen.insert(sub.owner) {
                continue;
            }

            let outbox = match self.outboxes.get(&sub.owner) {
                Some(outbox) => outbox,
                None => continue,
            };

            match outbox.push_change(Event::from_record(record)) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::Overflowed => {
                    self.stats.overflows += 1;
                    warn!(
                        "Outbound queue of subscriber {} overflowed, resync required",
                        sub.owner
                    );
                }
                PushOutcome::Dropped => self.stats.dropped += 1,
                PushOutcome::Closed => {
                    debug!("Subscriber {} outbox closed, skipping", sub.owner);
                }
            }
        }

        self.stats.delivered += delivered as u64;
        delivered
    }

    pub fn stats(&self) -> NotifyStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::outbox::tests::CountingNotify;
    use crate::notify::{ChangeKind, Outbound};
    use crate::store::{EntryFlags, Value, Writer};

    fn record(change: u64, kind: ChangeKind, name: &str) -> ChangeRecord {
        ChangeRecord {
            change,
            kind,
            name: name.to_string(),
            value: Value::Double(change as f64),
            flags: EntryFlags::NONE,
            sequence: change,
            writer: Writer::Local,
            type_changed: false,
            was_persistent: false,
        }
    }

    fn attach(engine: &mut NotificationEngine, owner: ConnectionId) -> Arc<Outbox> {
        let outbox = Arc::new(Outbox::new(owner, 64, Arc::new(CountingNotify::default())));
        engine.attach(outbox.clone());
        outbox
    }

    #[test]
    fn overlapping_patterns_deliver_once_per_owner() {
        let mut engine = NotificationEngine::new();
        let a = attach(&mut engine, 1);
        let b = attach(&mut engine, 2);

        engine.subscribe(1, Pattern::all(), EventKinds::ALL_CHANGES);
        engine.subscribe(1, Pattern::Prefix("/datatable/".into()), EventKinds::ALL_CHANGES);
        engine.subscribe(1, Pattern::Exact("/datatable/x".into()), EventKinds::ALL_CHANGES);
        engine.subscribe(2, Pattern::Exact("/datatable/y".into()), EventKinds::ALL_CHANGES);

        let delivered = engine.publish(&record(1, ChangeKind::ValueChanged, "/datatable/x"));
        assert_eq!(delivered, 1);
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn kinds_filter_events() {
        let mut engine = NotificationEngine::new();
        let outbox = attach(&mut engine, 1);
        engine.subscribe(1, Pattern::all(), EventKinds::DELETED);

        engine.publish(&record(1, ChangeKind::Created, "/a"));
        engine.publish(&record(2, ChangeKind::ValueChanged, "/a"));
        engine.publish(&record(3, ChangeKind::Deleted, "/a"));

        match outbox.drain().as_slice() {
            [Outbound::Event(event)] => {
                assert_eq!(event.kind, EventKind::Deleted);
                assert_eq!(event.change, 3);
            }
            other => panic!("unexpected outbox contents: {:?}", other),
        }
    }

    #[test]
    fn per_owner_order_follows_change_counter() {
        let mut engine = NotificationEngine::new();
        let outbox = attach(&mut engine, 1);
        engine.subscribe(1, Pattern::all(), EventKinds::ALL_CHANGES);

        for change in 1..=20 {
            let name = if change % 2 == 0 { "/a" } else { "/b" };
            engine.publish(&record(change, ChangeKind::ValueChanged, name));
        }

        let changes: Vec<u64> = outbox
            .drain()
            .into_iter()
            .filter_map(|item| match item {
                Outbound::Event(event) => Some(event.change),
                _ => None,
            })
            .collect();
        assert_eq!(changes, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn unsubscribe_and_detach_release_state() {
        let mut engine = NotificationEngine::new();
        let outbox = attach(&mut engine, 1);
        let first = engine.subscribe(1, Pattern::all(), EventKinds::ALL_CHANGES);
        engine.subscribe(1, Pattern::Exact("/x".into()), EventKinds::ALL_CHANGES);

        assert!(engine.unsubscribe(first).is_some());
        assert!(engine.unsubscribe(first).is_none());
        assert_eq!(engine.subscriptions_of(1).len(), 1);

        assert_eq!(engine.detach(1), 1);
        assert_eq!(engine.subscription_count(), 0);
        assert_eq!(engine.publish(&record(1, ChangeKind::Created, "/x")), 0);
        assert_eq!(outbox.push_message(Message::KeepAlive), PushOutcome::Closed);
    }

    #[test]
    fn overflow_is_counted() {
        let mut engine = NotificationEngine::new();
        let outbox = Arc::new(Outbox::new(1, 2, Arc::new(CountingNotify::default())));
        engine.attach(outbox.clone());
        engine.subscribe(1, Pattern::all(), EventKinds::ALL_CHANGES);

        for change in 1..=5 {
            engine.publish(&record(change, ChangeKind::ValueChanged, "/x"));
        }

        let stats = engine.stats();
        assert_eq!(stats.published, 5);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.overflows, 1);
        assert_eq!(stats.dropped, 2);
        assert!(outbox.resync_pending());
    }
}
