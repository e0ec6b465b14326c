/// Client-facing protocol: transports and the messages spoken over them
mod channel_connection;
mod connection;
mod message;
mod websocket_connection;

pub use channel_connection::{ChannelConnection, ChannelPeer};
pub use connection::{
    ConnectionError, ConnectionResult, ConnectionType, TerminalConnection, TerminalMessage,
};
pub use message::{ClientMessage, OutboundFrame, OutputEncoder, ServerMessage};
pub use websocket_connection::WebSocketConnection;
