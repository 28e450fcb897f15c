//! Client transports.
//!
//! A session talks to its client through a [`ClientSink`] / [`ClientStream`] pair.
//! The WebSocket server in [`ws`] is the production transport; [`memory`] provides
//! the same contract over channels for embedding and tests.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use bytes::Bytes;

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    Binary(Bytes),
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

/// Client → server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Text(String),
    Binary(Bytes),
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

/// Write half of a client connection.
#[async_trait]
pub trait ClientSink: Send + 'static {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a client connection. `None` means end of stream.
#[async_trait]
pub trait ClientStream: Send + 'static {
    async fn recv(&mut self) -> Option<Result<InboundMessage, TransportError>>;
}
