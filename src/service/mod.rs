/// Service layer: terminal sessions, the registry that owns them and the
/// bridges that connect clients to them
mod bridge;
mod error;
mod history;
mod message_handler;
mod outbound;
mod registry;
mod session;

pub use bridge::{BridgePolicy, BridgeState, ConnectionBridge};
pub use error::TerminalError;
pub use outbound::OutboundReceiver;
pub use registry::{RegistrySettings, SessionRegistry};
pub use session::{ConnectionId, SessionEvent, SessionOptions, SessionState, TerminalSession};
