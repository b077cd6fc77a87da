mod engine;
mod event;
mod listener;
pub(crate) mod outbox;
mod pattern;

pub use engine::{NotificationEngine, NotifyStats};
pub use event::{ChangeKind, ChangeRecord, Event, EventKind, EventKinds};
pub use listener::{Handler, ListenerDispatcher};
pub use outbox::{Notify, Outbound, Outbox, PushOutcome};
pub use pattern::{Pattern, PatternTrie};

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a subscriber: a network connection or a local listener
pub type ConnectionId = u64;

/// Server-assigned subscription handle
pub type SubscriptionId = u64;

/// Allocate an id that is unique across connections and local listeners
pub fn allocate_owner_id() -> ConnectionId {
    static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

/// A registered interest in a set of entry names
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub owner: ConnectionId,
    pub pattern: Pattern,
    pub kinds: EventKinds,
}
