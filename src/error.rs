use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported protocol version {client:#06x} (server speaks {server:#06x})")]
    UnsupportedVersion { client: u16, server: u16 },

    #[error("Stale write to '{name}': sequence {incoming} <= current {current}")]
    StaleWrite {
        name: String,
        incoming: u64,
        current: u64,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Corrupt persisted state: {0}")]
    CorruptState(String),

    #[error("Handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("No traffic for {0:?}")]
    LivenessTimeout(Duration),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error should only tear down the connection it came from
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Protocol(_)
                | Error::UnsupportedVersion { .. }
                | Error::HandshakeTimeout(_)
                | Error::LivenessTimeout(_)
                | Error::ConnectionClosed
        )
    }
}
