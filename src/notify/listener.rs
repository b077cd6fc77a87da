use super::{allocate_owner_id, ConnectionId, Event, EventKinds, Notify, Outbound, Outbox, Pattern, SubscriptionId};
use crate::protocol::Message;
use crate::store::EntryStore;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Callback invoked for every event a local listener receives
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

enum DispatchSignal {
    Ready(ConnectionId),
    Stop,
}

struct ChannelNotifier {
    tx: Sender<DispatchSignal>,
}

impl Notify for ChannelNotifier {
    fn notify(&self, owner: ConnectionId) {
        let _ = self.tx.send(DispatchSignal::Ready(owner));
    }
}

struct Listener {
    subscription: SubscriptionId,
    outbox: Arc<Outbox>,
    handler: Handler,
}

type ListenerMap = Arc<Mutex<HashMap<ConnectionId, Listener>>>;

/// Runs in-process listeners on a single dispatch thread
///
/// Each listener is an ordinary subscriber with its own outbox, so it gets
/// the same ordering and overflow behaviour as a network connection.
/// Handlers run without any store lock held and may write to the store.
pub struct ListenerDispatcher {
    store: Arc<EntryStore>,
    listeners: ListenerMap,
    notifier: Arc<ChannelNotifier>,
    capacity: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerDispatcher {
    pub fn start(store: Arc<EntryStore>, capacity: usize) -> Self {
        let (tx, rx) = unbounded();
        let listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));

        let worker_store = Arc::clone(&store);
        let worker_listeners = Arc::clone(&listeners);
        let worker = thread::Builder::new()
            .name("listener-dispatch".to_string())
            .spawn(move || dispatch_loop(worker_store, worker_listeners, rx));

        let worker = match worker {
            Ok(worker) => Some(worker),
            Err(e) => {
                error!("Failed to spawn listener dispatcher: {}", e);
                None
            }
        };

        Self {
            store,
            listeners,
            notifier: Arc::new(ChannelNotifier { tx }),
            capacity,
            worker: Mutex::new(worker),
        }
    }

    /// Register `handler` for changes to entries matching `pattern`
    pub fn add_listener(
        &self,
        pattern: Pattern,
        kinds: EventKinds,
        immediate: bool,
        handler: Handler,
    ) -> SubscriptionId {
        let owner = allocate_owner_id();
        let notifier: Arc<dyn Notify> = Arc::clone(&self.notifier) as Arc<dyn Notify>;
        let outbox = Arc::new(Outbox::new(owner, self.capacity, notifier));

        // registered before subscribing so immediate events find a handler
        self.listeners.lock().insert(
            owner,
            Listener {
                subscription: 0,
                outbox: Arc::clone(&outbox),
                handler,
            },
        );
        self.store.attach_outbox(outbox);

        let subscription = self.store.subscribe(owner, pattern.clone(), kinds, immediate);
        if let Some(listener) = self.listeners.lock().get_mut(&owner) {
            listener.subscription = subscription;
        }

        debug!(
            "Local listener {} subscribed to '{}' (kinds {:#04x})",
            subscription,
            pattern.as_str(),
            kinds.bits()
        );
        subscription
    }

    /// Returns false if no listener has that id
    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        let owner = {
            let mut listeners = self.listeners.lock();
            let owner = listeners
                .iter()
                .find(|(_, l)| l.subscription == id)
                .map(|(owner, _)| *owner);
            match owner {
                Some(owner) => {
                    listeners.remove(&owner);
                    owner
                }
                None => return false,
            }
        };
        self.store.detach(owner);
        true
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Detach every listener and join the dispatch thread
    pub fn stop(&self) {
        let owners: Vec<ConnectionId> = self.listeners.lock().drain().map(|(o, _)| o).collect();
        for owner in owners {
            self.store.detach(owner);
        }

        if let Some(worker) = self.worker.lock().take() {
            let _ = self.notifier.tx.send(DispatchSignal::Stop);
            if worker.join().is_err() {
                error!("Listener dispatcher panicked");
            }
        }
    }
}

impl Drop for ListenerDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(store: Arc<EntryStore>, listeners: ListenerMap, rx: Receiver<DispatchSignal>) {
    while let Ok(signal) = rx.recv() {
        let owner = match signal {
            DispatchSignal::Ready(owner) => owner,
            DispatchSignal::Stop => break,
        };

        let target = listeners
            .lock()
            .get(&owner)
            .map(|l| (Arc::clone(&l.outbox), Arc::clone(&l.handler)));
        let Some((outbox, handler)) = target else {
            continue;
        };

        while let Some(item) = outbox.pop() {
            match item {
                Outbound::Event(event) => {
                    if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                        error!("Listener handler panicked on '{}'", event.name);
                    }
                }
                Outbound::Message(Message::ResyncRequired) => {
                    warn!("Local listener {} fell behind, resynchronizing", owner);
                    store.resync(owner, None, None);
                }
                Outbound::Message(_) => {}
            }
        }
    }
    debug!("Listener dispatcher stopped");
}
