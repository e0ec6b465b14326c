/// Transport abstraction between a terminal client and its bridge
use std::fmt::Debug;

use thiserror::Error;

/// 连接错误类型
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The peer went away
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Message serialization error: {0}")]
    Serialization(String),

    /// A client message that could not be understood
    #[error("Message deserialization error: {0}")]
    Deserialization(String),

    #[error("Connection error: {0}")]
    Other(String),
}

/// 连接结果类型
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// A bidirectional message stream to one terminal client.
///
/// Implementations only move frames; the terminal protocol spoken over
/// them lives in [`crate::protocol::ClientMessage`] and
/// [`crate::protocol::ServerMessage`].
#[async_trait::async_trait]
pub trait TerminalConnection: Send + Debug {
    /// Send a text frame
    async fn send_text(&mut self, message: &str) -> ConnectionResult<()>;

    /// Send a binary frame
    async fn send_binary(&mut self, data: &[u8]) -> ConnectionResult<()>;

    /// Next frame from the client; `None` once the transport has closed.
    async fn receive(&mut self) -> Option<ConnectionResult<TerminalMessage>>;

    /// Close the transport. Closing twice is not an error.
    async fn close(&mut self) -> ConnectionResult<()>;

    fn id(&self) -> &str;

    fn connection_type(&self) -> ConnectionType;

    /// Whether frames can still be sent.
    fn is_alive(&self) -> bool;
}

/// Frames as seen by the bridge, independent of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    WebSocket,
    /// In-process channel pair
    Channel,
}
