/// In-process transport: a pair of channels standing in for a socket.
use std::fmt::Debug;

use tokio::sync::mpsc;

use crate::protocol::{
    ConnectionError, ConnectionResult, ConnectionType, TerminalConnection, TerminalMessage,
};

/// Server side of an in-process connection.
pub struct ChannelConnection {
    id: String,
    incoming: mpsc::UnboundedReceiver<TerminalMessage>,
    outgoing: mpsc::UnboundedSender<TerminalMessage>,
    closed: bool,
}

/// Client side of an in-process connection.
pub struct ChannelPeer {
    outgoing: mpsc::UnboundedSender<TerminalMessage>,
    incoming: mpsc::UnboundedReceiver<TerminalMessage>,
}

impl ChannelConnection {
    pub fn pair(id: impl Into<String>) -> (ChannelConnection, ChannelPeer) {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let connection = ChannelConnection {
            id: id.into(),
            incoming: server_rx,
            outgoing: server_tx,
            closed: false,
        };
        let peer = ChannelPeer {
            outgoing: client_tx,
            incoming: client_rx,
        };
        (connection, peer)
    }

    fn push(&mut self, message: TerminalMessage) -> ConnectionResult<()> {
        if self.closed {
            return Err(ConnectionError::ConnectionClosed);
        }
        self.outgoing.send(message).map_err(|_| {
            self.closed = true;
            ConnectionError::ConnectionClosed
        })
    }
}

impl Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait::async_trait]
impl TerminalConnection for ChannelConnection {
    async fn send_text(&mut self, message: &str) -> ConnectionResult<()> {
        self.push(TerminalMessage::Text(message.to_string()))
    }

    async fn send_binary(&mut self, data: &[u8]) -> ConnectionResult<()> {
        self.push(TerminalMessage::Binary(data.to_vec()))
    }

    async fn receive(&mut self) -> Option<ConnectionResult<TerminalMessage>> {
        let message = self.incoming.recv().await;
        if message.is_none() {
            self.closed = true;
        }
        message.map(Ok)
    }

    async fn close(&mut self) -> ConnectionResult<()> {
        if !self.closed {
            let _ = self.outgoing.send(TerminalMessage::Close);
            self.closed = true;
        }
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Channel
    }

    fn is_alive(&self) -> bool {
        !self.closed && !self.outgoing.is_closed()
    }
}

impl ChannelPeer {
    /// Send a text frame to the server. Returns false once the server side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing.send(TerminalMessage::Text(text.into())).is_ok()
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> bool {
        self.outgoing.send(TerminalMessage::Binary(data.into())).is_ok()
    }

    /// Next frame from the server; `None` once the server side is dropped.
    pub async fn recv(&mut self) -> Option<TerminalMessage> {
        self.incoming.recv().await
    }

    /// Hang up, as a client closing its socket would.
    pub fn close(self) {}
}
