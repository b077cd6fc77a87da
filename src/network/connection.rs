use crate::config::Config;
use crate::error::{Error, Result};
use crate::notify::{ConnectionId, EventKinds, Outbound, Outbox, Pattern, SubscriptionId};
use crate::protocol::{encode, negotiate_version, FrameDecoder, Message, PROTOCOL_VERSION};
use crate::store::{EntryStore, Rejection, Writer};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

// How long a closing connection may take to flush its last bytes
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Lifecycle of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    /// Snapshot queued, HelloComplete not yet written
    Synchronizing,
    Steady,
    /// Flushing what is left in the write buffer
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Synchronizing => "synchronizing",
            ConnectionState::Steady => "steady",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Protocol state of a client connection
///
/// Owns no socket: the worker loop feeds it received bytes and writes out
/// whatever it leaves in the write buffer.
pub struct Connection {
    pub connection_id: ConnectionId,
    pub client_addr: Option<SocketAddr>,
    pub client_name: Option<String>,

    state: ConnectionState,
    version: Option<u16>,

    // Frame reassembly
    decoder: FrameDecoder,

    // Encoded frames waiting for the socket
    pub write_buffer: Vec<u8>,
    write_position: usize,
    buffer_limit: usize,

    outbox: Arc<Outbox>,

    // Client-chosen subscription ids
    subscriptions: HashMap<u32, SubscriptionId>,
    default_subscription: Option<SubscriptionId>,

    // Timers
    accepted_at: Instant,
    last_received: Instant,
    last_ping: Instant,
    keep_alive_interval: Duration,
    liveness_timeout: Duration,
    handshake_timeout: Duration,

    close_reason: Option<String>,
    closing_since: Option<Instant>,

    // Client metadata
    pub connected_at: u64, // Unix timestamp in seconds
    pub messages_processed: u64,
}

impl Connection {
    pub fn new(
        connection_id: ConnectionId,
        addr: Option<SocketAddr>,
        outbox: Arc<Outbox>,
        config: &Config,
        now: Instant,
    ) -> Self {
        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            connection_id,
            client_addr: addr,
            client_name: None,
            state: ConnectionState::Connecting,
            version: None,
            decoder: FrameDecoder::new(config.max_message_size),
            write_buffer: Vec::with_capacity(config.connection_buffer_size),
            write_position: 0,
            buffer_limit: config.connection_buffer_size,
            outbox,
            subscriptions: HashMap::new(),
            default_subscription: None,
            accepted_at: now,
            last_received: now,
            last_ping: now,
            keep_alive_interval: config.keep_alive_interval(),
            liveness_timeout: config.liveness_timeout(),
            handshake_timeout: config.handshake_timeout(),
            close_reason: None,
            closing_since: None,
            connected_at,
            messages_processed: 0,
        }
    }

    /// Socket is registered; wait for the client Hello
    pub fn start(&mut self, now: Instant) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Handshaking;
            self.accepted_at = now;
            self.last_received = now;
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Negotiated protocol version, once the handshake succeeded
    pub fn version(&self) -> Option<u16> {
        self.version
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn is_closing(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Closing and nothing left to write
    pub fn ready_to_close(&mut self) -> bool {
        self.state == ConnectionState::Closing && self.pending_writes().is_none()
    }

    /// Whether the worker can drop this connection now
    ///
    /// A closing connection is kept until its write buffer drains or it has
    /// lingered for [`CLOSE_LINGER`].
    pub fn should_release(&mut self, now: Instant) -> bool {
        match self.state {
            ConnectionState::Closed => true,
            ConnectionState::Closing => {
                let since = *self.closing_since.get_or_insert(now);
                self.ready_to_close() || now.duration_since(since) >= CLOSE_LINGER
            }
            _ => false,
        }
    }

    /// Move to Closing; the first reason sticks
    pub fn begin_close(&mut self, reason: impl Into<String>) {
        if !self.is_closing() {
            self.state = ConnectionState::Closing;
            self.close_reason = Some(reason.into());
        }
    }

    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            self.outbox.close();
        }
    }

    /// Decode and apply every complete message in `data`
    pub fn process_read(&mut self, data: &[u8], store: &EntryStore, now: Instant) -> Result<()> {
        if self.is_closing() {
            return Ok(());
        }

        self.decoder.feed(data);
        self.last_received = now;

        while let Some(message) = self.decoder.next_message()? {
            self.messages_processed += 1;
            self.handle_message(message, store)?;
            if self.is_closing() {
                break;
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, message: Message, store: &EntryStore) -> Result<()> {
        if self.state == ConnectionState::Handshaking {
            return match message {
                Message::Hello {
                    max_version,
                    selective,
                    client_name,
                } => self.handle_hello(max_version, selective, client_name, store),
                other => Err(Error::Protocol(format!(
                    "expected Hello, got {}",
                    other.name()
                ))),
            };
        }

        let writer = Writer::Remote(self.connection_id);
        match message {
            Message::KeepAlive => {}
            Message::EntryAssign {
                name, flags, value, ..
            } => {
                store.assign(&name, value, flags, writer);
            }
            Message::EntryUpdate {
                name,
                sequence,
                value,
            } => {
                if let Err(rejection) = store.update(&name, value, sequence, writer) {
                    self.answer_rejected_update(&name, sequence, rejection, store);
                }
            }
            Message::EntryFlagsUpdate { name, flags, .. } => {
                store.set_flags(&name, flags, writer);
            }
            Message::EntryDelete { name } => {
                store.delete(&name, writer);
            }
            Message::ClearAll => {
                store.clear_all(writer);
            }
            Message::Subscribe {
                id,
                pattern,
                kinds,
                immediate,
            } => {
                if let Some(previous) = self.subscriptions.remove(&id) {
                    store.unsubscribe(previous, self.connection_id);
                }
                let sub = store.subscribe(self.connection_id, pattern, kinds, immediate);
                self.subscriptions.insert(id, sub);
            }
            Message::Unsubscribe { id } => {
                if let Some(sub) = self.subscriptions.remove(&id) {
                    store.unsubscribe(sub, self.connection_id);
                }
            }
            Message::SnapshotRequest => {
                let version = self.version.unwrap_or(PROTOCOL_VERSION);
                let count = store.resync(
                    self.connection_id,
                    Some(Message::ClearAll),
                    Some(Message::HelloComplete { version }),
                );
                self.state = ConnectionState::Synchronizing;
                debug!(
                    "Connection {} requested a snapshot ({} entries)",
                    self.connection_id, count
                );
            }
            Message::Hello { .. } => {
                return Err(Error::Protocol("duplicate Hello".to_string()));
            }
            Message::ProtocolUnsupported { .. }
            | Message::HelloComplete { .. }
            | Message::ResyncRequired => {
                return Err(Error::Protocol(format!(
                    "{} is server-to-client only",
                    message.name()
                )));
            }
        }
        Ok(())
    }

    fn handle_hello(
        &mut self,
        max_version: u16,
        selective: bool,
        client_name: String,
        store: &EntryStore,
    ) -> Result<()> {
        let version = match negotiate_version(max_version) {
            Some(version) => version,
            None => {
                // written directly so it survives the close
                encode(
                    &Message::ProtocolUnsupported {
                        server_version: PROTOCOL_VERSION,
                    },
                    &mut self.write_buffer,
                );
                return Err(Error::UnsupportedVersion {
                    client: max_version,
                    server: PROTOCOL_VERSION,
                });
            }
        };

        self.version = Some(version);
        self.client_name = (!client_name.is_empty()).then_some(client_name);
        self.state = ConnectionState::Synchronizing;

        if !selective {
            let sub = store.subscribe(
                self.connection_id,
                Pattern::all(),
                EventKinds::ALL_CHANGES,
                true,
            );
            self.default_subscription = Some(sub);
        }
        store.push_message(self.connection_id, Message::HelloComplete { version });

        info!(
            "Connection {} ({}) negotiated protocol {:#06x}",
            self.connection_id,
            self.client_name.as_deref().unwrap_or("unnamed"),
            version
        );
        Ok(())
    }

    /// Tell the writer what the store actually holds so it converges
    fn answer_rejected_update(
        &self,
        name: &str,
        sequence: u64,
        rejection: Rejection,
        store: &EntryStore,
    ) {
        match rejection {
            Rejection::Stale { current } => {
                let err = Error::StaleWrite {
                    name: name.to_string(),
                    incoming: sequence,
                    current,
                };
                debug!("Connection {}: {}", self.connection_id, err);
            }
            other => debug!(
                "Rejected update to '{}' from connection {}: {:?}",
                name, self.connection_id, other
            ),
        }

        let reply = match store.get(name) {
            Some(entry) => Message::EntryAssign {
                name: name.to_string(),
                sequence: entry.sequence,
                flags: entry.flags,
                value: entry.value,
            },
            None => Message::EntryDelete {
                name: name.to_string(),
            },
        };
        store.push_message(self.connection_id, reply);
    }

    /// Encode queued outbox items until the write buffer reaches its limit
    ///
    /// Returns the number of messages encoded.
    pub fn fill_write_buffer(&mut self) -> usize {
        if self.state == ConnectionState::Closed {
            return 0;
        }

        self.compact_write_buffer();

        let mut written = 0;
        while self.write_buffer.len() - self.write_position < self.buffer_limit {
            let message = match self.outbox.pop() {
                Some(Outbound::Event(event)) => Message::from_event(&event),
                Some(Outbound::Message(message)) => message,
                None => break,
            };

            match &message {
                Message::HelloComplete { .. } if self.state == ConnectionState::Synchronizing => {
                    self.state = ConnectionState::Steady;
                    debug!("Connection {} synchronized", self.connection_id);
                }
                Message::ResyncRequired => {
                    warn!(
                        "Connection {} fell behind, {} changes dropped; resync required",
                        self.connection_id,
                        self.outbox.dropped()
                    );
                }
                _ => {}
            }

            encode(&message, &mut self.write_buffer);
            written += 1;
        }
        written
    }

    fn compact_write_buffer(&mut self) {
        if self.write_position >= self.write_buffer.len() {
            self.write_buffer.clear();
            self.write_position = 0;
        } else if self.write_position > self.buffer_limit {
            self.write_buffer.drain(..self.write_position);
            self.write_position = 0;
        }
    }

    /// Get pending write data as a single buffer slice
    pub fn pending_writes(&mut self) -> Option<&[u8]> {
        if self.write_position < self.write_buffer.len() {
            Some(&self.write_buffer[self.write_position..])
        } else {
            None
        }
    }

    /// Mark bytes as written
    pub fn consume_writes(&mut self, n: usize) {
        self.write_position = (self.write_position + n).min(self.write_buffer.len());
    }

    /// Whether the outbox has items the write buffer has not taken yet
    pub fn has_queued(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Check timers; queues a keep-alive when one is due
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        match self.state {
            ConnectionState::Handshaking => {
                if now.duration_since(self.accepted_at) > self.handshake_timeout {
                    return Err(Error::HandshakeTimeout(self.handshake_timeout));
                }
            }
            ConnectionState::Synchronizing | ConnectionState::Steady => {
                if now.duration_since(self.last_received) > self.liveness_timeout {
                    return Err(Error::LivenessTimeout(self.liveness_timeout));
                }
                if self.state == ConnectionState::Steady
                    && now.duration_since(self.last_ping) >= self.keep_alive_interval
                {
                    self.outbox.push_message(Message::KeepAlive);
                    self.last_ping = now;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
