use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

// ================ 配置与错误类型 ================

/// Everything needed to start a child process on a fresh pseudo-terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
    pub cwd: Option<std::path::PathBuf>,
}

impl PtyConfig {
    /// A config running `command` with no arguments at 80x24.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cols: 80,
            rows: 24,
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Process spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Process already terminated")]
    ProcessTerminated,
    #[error("Resize failed: {0}")]
    ResizeFailed(String),
    #[error("PTY output reader already taken")]
    ReaderTaken,
    #[error("Background task error: {0}")]
    BackgroundTask(String),
    #[error("Other error: {0}")]
    Other(String),
}

// portable-pty reports its failures as anyhow errors
impl From<anyhow::Error> for PtyError {
    fn from(error: anyhow::Error) -> Self {
        PtyError::Other(error.to_string())
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

/// How the child process ended. `code` is `None` when it was killed by a
/// signal or its status could not be collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyExit {
    pub code: Option<i32>,
}

impl PtyExit {
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    pub fn killed() -> Self {
        Self { code: None }
    }
}

/// Receiver side of a pty's exit notification; holds `None` while the child runs.
pub type ExitWatch = watch::Receiver<Option<PtyExit>>;

/// Lazy sequence of output chunks read from the pty master.
///
/// Yields until the pty closes, then ends for good.
pub struct PtyReader {
    rx: mpsc::Receiver<Bytes>,
}

impl PtyReader {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Next chunk of output, or `None` once the pty has closed.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for PtyReader {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.rx.poll_recv(cx)
    }
}

// ================ 核心Trait定义 ================

/// A running child process attached to a pseudo-terminal.
///
/// Writes go through `&mut self`, so a single owner serializes them.
#[async_trait]
pub trait AsyncPty: Send + Sync {
    /// Queue input bytes for the terminal. Returns without waiting for the
    /// child to read them; queued input is delivered in order.
    async fn write(&mut self, data: &[u8]) -> Result<(), PtyError>;

    /// Change the terminal size; the child sees SIGWINCH.
    async fn resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError>;

    /// Current terminal size.
    fn size(&self) -> TerminalSize;

    /// Child process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Whether the child is still running.
    fn is_alive(&self) -> bool;

    /// Take the output stream. Only the first call succeeds.
    fn take_reader(&mut self) -> Result<PtyReader, PtyError>;

    /// Subscribe to the child's exit.
    fn exit_watch(&self) -> ExitWatch;

    /// Ask the child to exit, force-killing it once `grace` has elapsed.
    async fn terminate(&mut self, grace: Duration) -> Result<(), PtyError>;
}

/// Creates ptys. The registry spawns every session through one of these.
#[async_trait]
pub trait PtyFactory: Send + Sync {
    async fn create(&self, config: &PtyConfig) -> Result<Box<dyn AsyncPty>, PtyError>;

    fn name(&self) -> &'static str;
}
