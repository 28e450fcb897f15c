//! In-memory transport: a session connection backed by unbounded channels.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ClientSink, ClientStream, InboundMessage, OutboundMessage, TransportError};

/// Server-side write half.
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<OutboundMessage>>,
}

/// Server-side read half.
pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

/// The client end of an in-memory connection.
pub struct MemoryClient {
    tx: Option<mpsc::UnboundedSender<InboundMessage>>,
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

/// Create a connected `(sink, stream, client)` triple.
pub fn connection() -> (MemorySink, MemoryStream, MemoryClient) {
    let (to_client, from_server) = mpsc::unbounded_channel();
    let (to_server, from_client) = mpsc::unbounded_channel();
    (
        MemorySink {
            tx: Some(to_client),
        },
        MemoryStream { rx: from_client },
        MemoryClient {
            tx: Some(to_server),
            rx: from_server,
        },
    )
}

#[async_trait]
impl ClientSink for MemorySink {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl ClientStream for MemoryStream {
    async fn recv(&mut self) -> Option<Result<InboundMessage, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

impl MemoryClient {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(InboundMessage::Text(text.into()))
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn send(&self, message: InboundMessage) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Send a close frame and stop sending.
    pub fn close(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(InboundMessage::Close);
        }
    }

    /// Next server message, `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.rx.recv().await
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`, returning `None`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<OutboundMessage> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive until the server closes, returning everything sent.
    pub async fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.rx.recv().await {
            messages.push(message);
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_flow_both_ways() {
        let (mut sink, mut stream, mut client) = connection();

        assert!(client.send_text("GET 2"));
        assert_eq!(
            stream.recv().await.unwrap().unwrap(),
            InboundMessage::Text("GET 2".to_string())
        );

        sink.send(OutboundMessage::text("ACK")).await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(client.drain().await, vec![OutboundMessage::text("ACK")]);
    }

    #[tokio::test]
    async fn dropped_client_fails_sends_and_ends_stream() {
        let (mut sink, mut stream, client) = connection();
        drop(client);

        assert!(matches!(
            sink.send(OutboundMessage::text("END")).await,
            Err(TransportError::Closed)
        ));
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn client_close_sends_close_frame_once() {
        let (_sink, mut stream, mut client) = connection();
        client.close();
        client.close();
        assert!(!client.send_text("late"));

        assert_eq!(stream.recv().await.unwrap().unwrap(), InboundMessage::Close);
        assert!(stream.recv().await.is_none());
    }
}
