//! Terminal session manager.
//!
//! Spawns shells on pseudo-terminals, shares each terminal between any
//! number of client connections and relays bytes both ways. Clients that
//! fall behind lose their oldest output instead of slowing anyone down;
//! terminals nobody is connected to are culled after a configurable time.
//!
//! The crate does not own an HTTP server. A host application wires
//! [`api::TerminalsApi`] into its routes and hands upgraded WebSockets to
//! [`api::TerminalsApi::connect`] (wrapped in
//! [`protocol::WebSocketConnection`]).
pub mod api;
pub mod config;
pub mod protocol;
pub mod pty;
pub mod service;

pub use crate::api::{CreateSessionRequest, SessionSummary, TerminalsApi};
pub use crate::config::{ConfigLoader, TerminalConfig, init_logging};
pub use crate::service::{SessionRegistry, TerminalError, TerminalSession};
