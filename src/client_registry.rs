use crate::network::{Connection, ConnectionState};
use crate::notify::ConnectionId;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ConnectionId,
    pub name: Option<String>,
    pub addr: Option<SocketAddr>,
    pub state: ConnectionState,
    pub version: Option<u16>,
    pub connected_at: u64,
    pub messages_processed: u64,
    pub worker: usize,
}

/// Global registry for all client connections
pub struct ClientRegistry {
    clients: Arc<DashMap<ConnectionId, ClientInfo>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
        }
    }

    /// Register a new client connection
    pub fn register(&self, conn: &Connection, worker: usize) {
        let info = ClientInfo {
            id: conn.connection_id,
            name: conn.client_name.clone(),
            addr: conn.client_addr,
            state: conn.state(),
            version: conn.version(),
            connected_at: conn.connected_at,
            messages_processed: conn.messages_processed,
            worker,
        };
        self.clients.insert(conn.connection_id, info);
    }

    /// Update client info
    pub fn update(&self, conn: &Connection) {
        if let Some(mut entry) = self.clients.get_mut(&conn.connection_id) {
            entry.name = conn.client_name.clone();
            entry.state = conn.state();
            entry.version = conn.version();
            entry.messages_processed = conn.messages_processed;
        }
    }

    /// Unregister a client connection
    pub fn unregister(&self, connection_id: ConnectionId) {
        self.clients.remove(&connection_id);
    }

    /// Get all client information, ordered by id
    pub fn get_all_clients(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = self
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        clients.sort_by_key(|c| c.id);
        clients
    }

    /// Get client by ID
    pub fn get_client(&self, connection_id: ConnectionId) -> Option<ClientInfo> {
        self.clients.get(&connection_id).map(|e| e.clone())
    }

    /// Clients that finished the handshake
    pub fn synchronized_count(&self) -> usize {
        self.clients
            .iter()
            .filter(|e| {
                matches!(
                    e.value().state,
                    ConnectionState::Synchronizing | ConnectionState::Steady
                )
            })
            .count()
    }

    /// Count total clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::notify::outbox::tests::CountingNotify;
    use crate::notify::Outbox;
    use crate::protocol::{encode_to_vec, Message, PROTOCOL_VERSION};
    use crate::store::EntryStore;
    use std::time::Instant;

    #[test]
    fn tracks_connection_metadata() {
        let store = EntryStore::new(0);
        let registry = ClientRegistry::new();
        let now = Instant::now();

        let outbox = Arc::new(Outbox::new(7, 16, Arc::new(CountingNotify::default())));
        store.attach_outbox(Arc::clone(&outbox));
        let mut conn = Connection::new(7, None, outbox, &Config::default(), now);
        conn.start(now);
        registry.register(&conn, 2);

        assert_eq!(registry.client_count(), 1);
        assert_eq!(registry.synchronized_count(), 0);
        assert_eq!(registry.get_client(7).map(|c| c.worker), Some(2));

        let hello = Message::Hello {
            max_version: PROTOCOL_VERSION,
            selective: true,
            client_name: "dash".into(),
        };
        conn.process_read(&encode_to_vec(&hello), &store, now).unwrap();
        registry.update(&conn);

        let info = registry.get_client(7).unwrap();
        assert_eq!(info.name.as_deref(), Some("dash"));
        assert_eq!(info.version, Some(PROTOCOL_VERSION));
        assert_eq!(info.messages_processed, 1);
        assert_eq!(registry.synchronized_count(), 1);

        registry.unregister(7);
        assert!(registry.get_all_clients().is_empty());
    }
}
