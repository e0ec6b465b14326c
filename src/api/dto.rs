/// Data Transfer Objects (DTOs) for the terminals API
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::pty::TerminalSize;
use crate::service::TerminalError;

/// Request DTO for creating a new terminal session
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CreateSessionRequest {
    /// Working directory; relative paths are taken from the configured root
    pub cwd: Option<PathBuf>,

    /// Entry of `shells` to launch
    pub shell_type: Option<String>,

    pub rows: Option<u16>,

    pub cols: Option<u16>,
}

/// Response DTO for a terminal session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionSummary {
    pub name: String,

    /// Creation time, UNIX seconds
    pub created_at: u64,

    /// Last input or output, UNIX seconds
    pub last_activity: u64,

    /// Attached connections
    pub connections: usize,

    pub rows: u16,

    pub cols: u16,
}

impl SessionSummary {
    pub(crate) fn new(
        name: &str,
        created_at: SystemTime,
        last_activity: SystemTime,
        connections: usize,
        size: TerminalSize,
    ) -> Self {
        Self {
            name: name.to_string(),
            created_at: unix_seconds(created_at),
            last_activity: unix_seconds(last_activity),
            connections,
            rows: size.rows,
            cols: size.cols,
        }
    }
}

/// Generic error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error: bool,

    pub message: String,

    /// HTTP status a routing layer should answer with
    pub code: Option<u16>,
}

impl From<&TerminalError> for ErrorResponse {
    fn from(error: &TerminalError) -> Self {
        let code = match error {
            TerminalError::NotFound(_) => 404,
            TerminalError::SessionClosed(_) => 410,
            TerminalError::Capacity { .. } => 503,
            TerminalError::Spawn(_) | TerminalError::Io(_) | TerminalError::Connection(_) => 500,
        };
        Self {
            error: true,
            message: error.to_string(),
            code: Some(code),
        }
    }
}

/// Seconds since the UNIX epoch; 0 for times before it.
pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
