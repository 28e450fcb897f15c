//! WebSocket transport via axum.

mod routes;
mod server;

pub use routes::{HealthCheckResponse, routes};
pub use server::{ServerConfig, serve, serve_on};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use super::{ClientSink, ClientStream, InboundMessage, OutboundMessage, TransportError};

pub struct WsSink(SplitSink<WebSocket, Message>);

pub struct WsStream(SplitStream<WebSocket>);

/// Split an upgraded socket into session halves.
pub fn split(socket: WebSocket) -> (WsSink, WsStream) {
    let (sink, stream) = socket.split();
    (WsSink(sink), WsStream(stream))
}

#[async_trait]
impl ClientSink for WsSink {
    async fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        let message = match message {
            OutboundMessage::Text(text) => Message::Text(text.into()),
            OutboundMessage::Binary(bytes) => Message::Binary(bytes),
        };
        self.0
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Closing an already closed socket reports an error; nothing is left to do.
        match self.0.close().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::trace!(error = %e, "WebSocket already closed");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ClientStream for WsStream {
    async fn recv(&mut self) -> Option<Result<InboundMessage, TransportError>> {
        loop {
            let message = match self.0.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            };
            return Some(Ok(match message {
                Message::Text(text) => InboundMessage::Text(text.as_str().to_owned()),
                Message::Binary(bytes) => InboundMessage::Binary(bytes),
                Message::Close(_) => InboundMessage::Close,
                // axum answers pings itself
                Message::Ping(_) | Message::Pong(_) => continue,
            }));
        }
    }
}
