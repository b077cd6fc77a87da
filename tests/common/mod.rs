#![allow(dead_code)]

use anyhow::{anyhow, Context, Result};
use ntsync_server::protocol::Message;
use ntsync_server::{Client, Config, Server};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A server running on an ephemeral loopback port
pub struct TestServer {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    handle: Option<JoinHandle<ntsync_server::Result<()>>>,
}

impl TestServer {
    pub fn start(config: Config) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").context("bind ephemeral port")?;
        let addr = listener.local_addr()?;
        let server = Arc::new(Server::new(config)?);

        let running = Arc::clone(&server);
        let handle = thread::spawn(move || running.run_with_listener(listener));

        Ok(Self {
            server,
            addr,
            handle: Some(handle),
        })
    }

    pub fn memory_only() -> Result<Self> {
        Self::start(test_config())
    }

    pub fn connect(&self, name: &str) -> Result<Client> {
        Client::connect_and_sync(self.addr, name).with_context(|| format!("connect {}", name))
    }

    /// Shut down and wait for the final persistence flush
    pub fn stop(mut self) -> Result<()> {
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        self.server.shutdown();
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("server thread panicked"))??;
        }
        Ok(())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.join();
    }
}

pub fn test_config() -> Config {
    Config {
        threads: 2,
        persist_path: None,
        ..Default::default()
    }
}

/// Read messages until one matches, skipping keep-alives and the rest
pub fn recv_until(client: &mut Client, mut pred: impl FnMut(&Message) -> bool) -> Result<Message> {
    loop {
        let message = client.recv().context("waiting for message")?;
        if pred(&message) {
            return Ok(message);
        }
    }
}

pub fn assign_for(name: &'static str) -> impl FnMut(&Message) -> bool {
    move |m| matches!(m, Message::EntryAssign { name: n, .. } if n == name)
}

pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
