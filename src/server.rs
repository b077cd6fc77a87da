use crate::client_registry::{ClientInfo, ClientRegistry};
use crate::notify::{
    allocate_owner_id, ConnectionId, EventKinds, Handler, ListenerDispatcher, Notify, Outbox,
    Pattern, SubscriptionId,
};
use crate::persist::{self, PersistenceEngine};
use crate::store::EntryStore;
use crate::{
    config::Config,
    error::{Error, Result},
    network::Connection,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);

// Poll timeout, and how often connection timers are checked
const TICK: Duration = Duration::from_millis(100);

/// Wakes a worker when an outbox it drains becomes non-empty
struct WorkerNotifier {
    waker: Waker,
    ready: Sender<ConnectionId>,
}

impl Notify for WorkerNotifier {
    fn notify(&self, owner: ConnectionId) {
        if self.ready.send(owner).is_ok() {
            if let Err(e) = self.waker.wake() {
                debug!("Failed to wake worker for connection {}: {}", owner, e);
            }
        }
    }
}

/// Entry synchronization server
pub struct Server {
    config: Config,
    store: Arc<EntryStore>,
    persistence: Option<PersistenceEngine>,
    listeners: ListenerDispatcher,
    shutdown: AtomicBool,
    active_connections: AtomicUsize,
    client_registry: Arc<ClientRegistry>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Create a new server with the given configuration
    ///
    /// Restores persistent entries from the durable store file, if any.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(EntryStore::new(config.reorder_tolerance));

        let persistence = config.persist_path.as_ref().map(|path| {
            let path = Path::new(path);
            let restored = store.restore(persist::load_or_empty(path));
            debug!("Restored {} persistent entries", restored);
            PersistenceEngine::start(Arc::clone(&store), path, config.flush_interval())
        });

        let listeners =
            ListenerDispatcher::start(Arc::clone(&store), config.outbound_queue_capacity);

        Ok(Self {
            config,
            store,
            persistence,
            listeners,
            shutdown: AtomicBool::new(false),
            active_connections: AtomicUsize::new(0),
            client_registry: Arc::new(ClientRegistry::new()),
            local_addr: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared entry store, for in-process reads and writes
    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    /// Run the server, spawning worker threads
    ///
    /// This method blocks until the server is shut down.
    pub fn run(self: Arc<Self>) -> Result<()> {
        let listener =
            TcpListener::bind(format!("{}:{}", self.config.bind_addr, self.config.port))?;
        self.run_with_listener(listener)
    }

    /// Serve on an already bound listener
    pub fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);

        info!(
            "{} listening on {} with {} workers",
            self.config.server_name, addr, self.config.threads
        );

        let mut handles = Vec::new();
        for worker_id in 0..self.config.threads {
            let server = Arc::clone(&self);
            let worker_listener = listener.try_clone()?;

            let handle = thread::Builder::new()
                .name(format!("worker-{}", worker_id))
                .spawn(move || {
                    if let Err(e) = server.run_worker(worker_id, worker_listener) {
                        error!("Worker {} failed: {}", worker_id, e);
                    }
                })?;
            handles.push(handle);
        }

        // Wait for all workers to finish
        for handle in handles {
            let _ = handle.join();
        }

        self.finish();
        Ok(())
    }

    /// Signal the server to shut down gracefully
    pub fn shutdown(&self) {
        info!("Initiating server shutdown");
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Address the server is listening on, once running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Get the number of active client connections
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.client_registry.get_all_clients()
    }

    pub fn client(&self, id: ConnectionId) -> Option<ClientInfo> {
        self.client_registry.get_client(id)
    }

    /// Register an in-process change handler
    pub fn add_listener(
        &self,
        pattern: Pattern,
        kinds: EventKinds,
        immediate: bool,
        handler: Handler,
    ) -> SubscriptionId {
        self.listeners.add_listener(pattern, kinds, immediate, handler)
    }

    pub fn remove_listener(&self, id: SubscriptionId) -> bool {
        self.listeners.remove_listener(id)
    }

    /// Write persistent entries to disk now; 0 when running memory-only
    pub fn flush_now(&self) -> Result<usize> {
        match &self.persistence {
            Some(persistence) => persistence.flush_now(),
            None => Ok(0),
        }
    }

    fn finish(&self) {
        self.listeners.stop();
        if let Some(persistence) = &self.persistence {
            match persistence.shutdown() {
                Ok(count) => info!(
                    "Saved {} persistent entries to {}",
                    count,
                    persistence.path().display()
                ),
                Err(e) => error!("Final persistence flush failed: {}", e),
            }
        }
        info!("Server stopped");
    }

    fn run_worker(self: &Arc<Self>, worker_id: usize, std_listener: TcpListener) -> Result<()> {
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(1024);

        let mut listener = MioTcpListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let (ready_tx, ready_rx) = unbounded();
        let notifier: Arc<dyn Notify> = Arc::new(WorkerNotifier {
            waker: Waker::new(poll.registry(), WAKER)?,
            ready: ready_tx,
        });

        let mut worker = Worker {
            id: worker_id,
            server: Arc::clone(self),
            notifier,
            ready_rx,
            connections: HashMap::new(),
            read_buffer: vec![0u8; self.config.connection_buffer_size],
        };

        info!("Worker {} started", worker_id);

        let mut last_tick = Instant::now();
        let mut dirty: HashSet<Token> = HashSet::new();

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = poll.poll(&mut events, Some(TICK)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => worker.accept_all(&mut listener, &poll),
                    WAKER => {}
                    token => {
                        if event.is_readable() {
                            worker.read(token);
                        }
                        dirty.insert(token);
                    }
                }
            }

            for owner in worker.ready_rx.try_iter() {
                dirty.insert(Token(owner as usize));
            }

            let now = Instant::now();
            if now.duration_since(last_tick) >= TICK {
                last_tick = now;
                worker.tick(now);
                dirty.extend(worker.connections.keys().copied());
            }

            for token in dirty.drain() {
                worker.flush(token);
            }
            worker.reap(&poll, now);
        }

        worker.close_all(&poll);
        info!("Worker {} shutting down", worker_id);
        Ok(())
    }
}

struct Worker {
    id: usize,
    server: Arc<Server>,
    notifier: Arc<dyn Notify>,
    ready_rx: Receiver<ConnectionId>,
    connections: HashMap<Token, (MioTcpStream, Connection)>,
    read_buffer: Vec<u8>,
}

impl Worker {
    fn accept_all(&mut self, listener: &mut MioTcpListener, poll: &Poll) {
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.accept(stream, addr, poll) {
                        error!("Failed to set up connection from {}: {}", addr, e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    break;
                }
            }
        }
    }

    fn accept(&mut self, mut stream: MioTcpStream, addr: SocketAddr, poll: &Poll) -> Result<()> {
        let config = &self.server.config;
        stream.set_nodelay(config.tcp_nodelay)?;

        let id = allocate_owner_id();
        let token = Token(id as usize);
        poll.registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;

        let outbox = Arc::new(Outbox::new(
            id,
            config.outbound_queue_capacity,
            Arc::clone(&self.notifier),
        ));
        self.server.store.attach_outbox(Arc::clone(&outbox));

        let now = Instant::now();
        let mut connection = Connection::new(id, Some(addr), outbox, config, now);
        connection.start(now);

        self.server.client_registry.register(&connection, self.id);
        self.server.active_connections.fetch_add(1, Ordering::Relaxed);
        debug!("Worker {} accepted connection {} from {}", self.id, id, addr);

        self.connections.insert(token, (stream, connection));
        Ok(())
    }

    /// Drain the socket; mio readiness is edge-triggered
    fn read(&mut self, token: Token) {
        let Some((stream, connection)) = self.connections.get_mut(&token) else {
            return;
        };
        let store = &self.server.store;

        loop {
            match stream.read(&mut self.read_buffer) {
                Ok(0) => {
                    connection.begin_close("peer closed the connection");
                    connection.close();
                    break;
                }
                Ok(n) => {
                    if let Err(e) = connection.process_read(&self.read_buffer[..n], store, Instant::now()) {
                        log_connection_error(connection.connection_id, &e);
                        connection.begin_close(e.to_string());
                        break;
                    }
                    if connection.is_closing() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() != ErrorKind::ConnectionReset {
                        warn!("Error reading from connection {}: {}", connection.connection_id, e);
                    }
                    connection.begin_close(format!("read failed: {}", e));
                    connection.close();
                    break;
                }
            }
        }

        self.server.client_registry.update(connection);
    }

    fn flush(&mut self, token: Token) {
        let Some((stream, connection)) = self.connections.get_mut(&token) else {
            return;
        };
        if connection.is_closed() {
            return;
        }

        if let Err(e) = write_pending(stream, connection) {
            if e.kind() != ErrorKind::BrokenPipe && e.kind() != ErrorKind::ConnectionReset {
                warn!("Error writing to connection {}: {}", connection.connection_id, e);
            }
            connection.begin_close(format!("write failed: {}", e));
            connection.close();
        }
        self.server.client_registry.update(connection);
    }

    fn tick(&mut self, now: Instant) {
        for (_, connection) in self.connections.values_mut() {
            if let Err(e) = connection.tick(now) {
                log_connection_error(connection.connection_id, &e);
                connection.begin_close(e.to_string());
            }
        }
    }

    /// Remove closing connections whose last bytes are written, or that
    /// have lingered too long; the rest keep flushing on writable events
    fn reap(&mut self, poll: &Poll, now: Instant) {
        let finished: Vec<Token> = self
            .connections
            .iter_mut()
            .filter_map(|(token, (_, conn))| conn.should_release(now).then_some(*token))
            .collect();

        for token in finished {
            if let Some((stream, connection)) = self.connections.remove(&token) {
                self.release(poll, stream, connection);
            }
        }
    }

    fn release(&self, poll: &Poll, mut stream: MioTcpStream, mut connection: Connection) {
        let _ = poll.registry().deregister(&mut stream);
        let id = connection.connection_id;

        // already-committed writes from this connection stay in the store
        let released = self.server.store.detach(id);
        self.server.client_registry.unregister(id);
        connection.close();
        self.server
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);

        info!(
            "Connection {} ({}) closed: {} ({} subscriptions released)",
            id,
            connection
                .client_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            connection.close_reason().unwrap_or("closed"),
            released
        );
        debug!(
            "{} clients connected, {} synchronized",
            self.server.client_registry.client_count(),
            self.server.client_registry.synchronized_count()
        );
    }

    fn close_all(&mut self, poll: &Poll) {
        let connections: Vec<_> = self.connections.drain().map(|(_, c)| c).collect();
        for (stream, mut connection) in connections {
            connection.begin_close("server shutting down");
            self.release(poll, stream, connection);
        }
    }
}

/// Write until the socket would block or nothing is queued
fn write_pending(stream: &mut MioTcpStream, connection: &mut Connection) -> io::Result<()> {
    loop {
        if !connection.is_closing() {
            connection.fill_write_buffer();
        }

        while let Some(data) = connection.pending_writes() {
            match stream.write(data) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "socket closed")),
                Ok(n) => connection.consume_writes(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if connection.is_closing() || !connection.has_queued() {
            return Ok(());
        }
    }
}

fn log_connection_error(id: ConnectionId, error: &Error) {
    match error {
        Error::UnsupportedVersion { .. }
        | Error::HandshakeTimeout(_)
        | Error::LivenessTimeout(_) => info!("Connection {}: {}", id, error),
        _ if error.is_connection_scoped() => warn!("Connection {}: {}", id, error),
        _ => error!("Connection {} hit a server-side failure: {}", id, error),
    }
}
