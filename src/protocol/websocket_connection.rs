/// WebSocket transport for terminal clients, on top of axum's upgrade
use std::fmt::Debug;

use axum::extract::ws::Message::{Binary, Close, Ping, Pong, Text};
use axum::extract::ws::WebSocket;
use futures_util::StreamExt;
use tracing::{debug, error, trace};

use crate::protocol::{
    ConnectionError, ConnectionResult, ConnectionType, TerminalConnection, TerminalMessage,
};

/// An upgraded WebSocket speaking the terminal protocol.
pub struct WebSocketConnection {
    socket: WebSocket,
    id: String,
    closed: bool,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, id: impl Into<String>) -> Self {
        Self {
            socket,
            id: id.into(),
            closed: false,
        }
    }

    fn send_failed(&mut self, e: axum::Error) -> ConnectionError {
        error!("WebSocket {} send failed: {}", self.id, e);
        self.closed = true;
        ConnectionError::WebSocket(e.to_string())
    }
}

impl Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait::async_trait]
impl TerminalConnection for WebSocketConnection {
    async fn send_text(&mut self, message: &str) -> ConnectionResult<()> {
        if self.closed {
            return Err(ConnectionError::ConnectionClosed);
        }
        match self.socket.send(Text(message.to_string())).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.send_failed(e)),
        }
    }

    async fn send_binary(&mut self, data: &[u8]) -> ConnectionResult<()> {
        if self.closed {
            return Err(ConnectionError::ConnectionClosed);
        }
        trace!("Sending {} binary bytes to {}", data.len(), self.id);
        match self.socket.send(Binary(data.to_vec())).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.send_failed(e)),
        }
    }

    async fn receive(&mut self) -> Option<ConnectionResult<TerminalMessage>> {
        match self.socket.next().await {
            Some(Ok(Text(text))) => {
                trace!("WebSocket {} received text: {:?}", self.id, text);
                Some(Ok(TerminalMessage::Text(text)))
            }
            Some(Ok(Binary(bin))) => {
                trace!("WebSocket {} received {} binary bytes", self.id, bin.len());
                Some(Ok(TerminalMessage::Binary(bin)))
            }
            Some(Ok(Ping(ping))) => Some(Ok(TerminalMessage::Ping(ping))),
            Some(Ok(Pong(pong))) => Some(Ok(TerminalMessage::Pong(pong))),
            Some(Ok(Close(frame))) => {
                debug!("WebSocket {} received close: {:?}", self.id, frame);
                self.closed = true;
                Some(Ok(TerminalMessage::Close))
            }
            Some(Err(e)) => {
                error!("WebSocket {} receive error: {}", self.id, e);
                self.closed = true;
                Some(Err(ConnectionError::WebSocket(e.to_string())))
            }
            None => {
                debug!("WebSocket {} stream ended", self.id);
                self.closed = true;
                None
            }
        }
    }

    async fn close(&mut self) -> ConnectionResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.socket
            .send(Close(None))
            .await
            .map_err(|e| ConnectionError::WebSocket(e.to_string()))
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::WebSocket
    }

    fn is_alive(&self) -> bool {
        !self.closed
    }
}
