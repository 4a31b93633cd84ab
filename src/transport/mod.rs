//! Peer link
//!
//! A [`Transport`] carries [`ProtocolMessage`]s between the two devices. Link
//! changes and inbound messages come back as [`TransportEvent`]s on the
//! channel the transport was built with.

mod tcp;

#[cfg(test)]
pub mod memory;

pub use tcp::{TcpTransport, TcpTransportSettings};

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::race::ProtocolMessage;

/// Address another device uses to reach this one
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Local endpoint is listening under this id
    Opened(PeerId),
    Connecting,
    ConnectionEstablished(PeerId),
    ConnectionClosed,
    ConnectionErrored(String),
    Message(ProtocolMessage),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,

    #[error("Not connected. Reconnect required.")]
    NotConnected,

    #[error("timed out connecting to {0}")]
    Timeout(PeerId),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Transport: Send {
    /// Start accepting connections. Returns the id peers should dial.
    async fn open(&mut self) -> Result<PeerId, TransportError>;

    /// Start dialing `peer` and return without waiting for it. The outcome is
    /// reported as `ConnectionEstablished` or `ConnectionErrored`; a new
    /// connection replaces the current one.
    async fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError>;

    /// Queue `message` on the current connection. Fails at once when there is
    /// none; a later write failure is reported as `ConnectionErrored`.
    async fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError>;

    /// Drop the connection and stop listening.
    async fn close(&mut self);
}
