/// Error types for the service layer
use thiserror::Error;

use crate::protocol::ConnectionError;
use crate::pty::PtyError;

/// Service layer error type
#[derive(Error, Debug)]
pub enum TerminalError {
    /// Creating the pty or its child failed; nothing was registered
    #[error("Failed to spawn terminal: {0}")]
    Spawn(#[source] PtyError),

    /// PTY I/O failed after the session started
    #[error("Terminal I/O error: {0}")]
    Io(#[source] PtyError),

    /// The registry already holds `max` sessions
    #[error("Too many terminal sessions (max {max})")]
    Capacity { max: usize },

    /// No session with this name
    #[error("Terminal session not found: {0}")]
    NotFound(String),

    /// The session has already exited or been killed
    #[error("Terminal session closed: {0}")]
    SessionClosed(String),

    /// Client transport error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl TerminalError {
    /// Whether the caller asked for something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TerminalError::NotFound(_))
    }
}
