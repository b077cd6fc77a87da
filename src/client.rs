//! Minimal blocking client.
//!
//! Keeps a local mirror of every entry the server sends and answers
//! keep-alive pings. One message is read at a time with [`Client::recv`];
//! nothing runs in the background.

use crate::error::{Error, Result};
use crate::notify::{EventKinds, Pattern};
use crate::protocol::{encode, FrameDecoder, Message, PROTOCOL_VERSION};
use crate::store::{Entry, EntryFlags, Value, Writer};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    // highest version offered in our last Hello
    offered_version: u16,
    version: Option<u16>,
    entries: BTreeMap<String, Entry>,
    next_subscription: u32,
}

impl Client {
    /// Open a TCP connection; no handshake yet
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(DEFAULT_TIMEOUT))?;

        Ok(Self {
            stream,
            decoder: FrameDecoder::new(16 * 1024 * 1024),
            read_buffer: vec![0u8; 16 * 1024],
            write_buffer: Vec::new(),
            offered_version: PROTOCOL_VERSION,
            version: None,
            entries: BTreeMap::new(),
            next_subscription: 1,
        })
    }

    /// Connect, say Hello and wait for the initial snapshot
    pub fn connect_and_sync(addr: impl ToSocketAddrs, name: &str) -> Result<Self> {
        let mut client = Self::connect(addr)?;
        client.hello(name, false)?;
        Ok(client)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Handshake; returns the negotiated version once the snapshot is in
    pub fn hello(&mut self, name: &str, selective: bool) -> Result<u16> {
        self.hello_with_version(PROTOCOL_VERSION, name, selective)
    }

    pub fn hello_with_version(&mut self, max_version: u16, name: &str, selective: bool) -> Result<u16> {
        self.offered_version = max_version;
        self.send(&Message::Hello {
            max_version,
            selective,
            client_name: name.to_string(),
        })?;
        self.sync()
    }

    pub fn version(&self) -> Option<u16> {
        self.version
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.write_buffer.clear();
        encode(message, &mut self.write_buffer);
        self.stream.write_all(&self.write_buffer)?;
        Ok(())
    }

    /// Send raw bytes, bypassing the encoder
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    /// Next message from the server, applied to the mirror
    ///
    /// Keep-alive pings are acknowledged before being returned.
    pub fn recv(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = self.decoder.next_message()? {
                self.apply(&message);
                if message == Message::KeepAlive {
                    self.send(&Message::KeepAlive)?;
                }
                return Ok(message);
            }

            match self.stream.read(&mut self.read_buffer) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => self.decoder.feed(&self.read_buffer[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read until `HelloComplete`, returning the version it carries
    ///
    /// A resync marker on the way is answered with a snapshot request.
    pub fn sync(&mut self) -> Result<u16> {
        loop {
            match self.recv()? {
                Message::HelloComplete { version } => {
                    self.version = Some(version);
                    return Ok(version);
                }
                Message::ProtocolUnsupported { server_version } => {
                    return Err(Error::UnsupportedVersion {
                        client: self.offered_version,
                        server: server_version,
                    });
                }
                Message::ResyncRequired => self.send(&Message::SnapshotRequest)?,
                _ => {}
            }
        }
    }

    fn apply(&mut self, message: &Message) {
        match message {
            Message::EntryAssign {
                name,
                sequence,
                flags,
                value,
            } => {
                self.entries.insert(
                    name.clone(),
                    Entry {
                        value: value.clone(),
                        flags: *flags,
                        sequence: *sequence,
                        last_writer: Writer::Local,
                    },
                );
            }
            Message::EntryUpdate {
                name,
                sequence,
                value,
            } => match self.entries.get_mut(name) {
                Some(entry) => {
                    entry.value = value.clone();
                    entry.sequence = *sequence;
                }
                None => debug!("Update for unknown entry '{}'", name),
            },
            Message::EntryFlagsUpdate {
                name,
                sequence,
                flags,
            } => {
                if let Some(entry) = self.entries.get_mut(name) {
                    entry.flags = *flags;
                    entry.sequence = *sequence;
                }
            }
            Message::EntryDelete { name } => {
                self.entries.remove(name);
            }
            Message::ClearAll => self.entries.clear(),
            _ => {}
        }
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|e| &e.value)
    }

    /// Names in the mirror, sorted
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Write a value; an update when the type matches the mirror, otherwise an assign
    pub fn set_value(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let message = match self.entries.get(name) {
            Some(entry) if entry.value.value_type() == value.value_type() => Message::EntryUpdate {
                name: name.to_string(),
                sequence: entry.sequence + 1,
                value,
            },
            Some(entry) => Message::EntryAssign {
                name: name.to_string(),
                sequence: entry.sequence + 1,
                flags: entry.flags,
                value,
            },
            None => Message::EntryAssign {
                name: name.to_string(),
                sequence: 0,
                flags: EntryFlags::NONE,
                value,
            },
        };
        self.send(&message)
    }

    pub fn set_flags(&mut self, name: &str, flags: EntryFlags) -> Result<()> {
        let sequence = self.entries.get(name).map(|e| e.sequence + 1).unwrap_or(0);
        self.send(&Message::EntryFlagsUpdate {
            name: name.to_string(),
            sequence,
            flags,
        })
    }

    pub fn set_persistent(&mut self, name: &str) -> Result<()> {
        let flags = self
            .entries
            .get(name)
            .map(|e| e.flags)
            .unwrap_or_default()
            | EntryFlags::PERSISTENT;
        self.set_flags(name, flags)
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        self.send(&Message::EntryDelete {
            name: name.to_string(),
        })
    }

    /// Returns the subscription id chosen for this connection
    pub fn subscribe(&mut self, pattern: Pattern, kinds: EventKinds, immediate: bool) -> Result<u32> {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.send(&Message::Subscribe {
            id,
            pattern,
            kinds,
            immediate,
        })?;
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: u32) -> Result<()> {
        self.send(&Message::Unsubscribe { id })
    }

    /// Ask for a full snapshot and wait until it has arrived
    pub fn request_snapshot(&mut self) -> Result<usize> {
        self.send(&Message::SnapshotRequest)?;
        self.sync()?;
        Ok(self.entries.len())
    }

    pub fn close(self) -> Result<()> {
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}
