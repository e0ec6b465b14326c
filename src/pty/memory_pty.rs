/// In-process PTY that echoes input back as output.
///
/// Useful wherever a real pseudo-terminal is unavailable or unwanted (tests,
/// embedding). Every instance comes with a [`MemoryPtyControl`] that can inject
/// output, end the "process" and inspect what was written to it.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::pty::pty_trait::{
    AsyncPty, ExitWatch, PtyConfig, PtyError, PtyExit, PtyFactory, PtyReader, TerminalSize,
};

struct MemoryPtyShared {
    output_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    exit_tx: watch::Sender<Option<PtyExit>>,
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<TerminalSize>>,
    terminated: AtomicBool,
    echo: bool,
}

impl MemoryPtyShared {
    fn emit(&self, data: Bytes) -> bool {
        match self.output_tx.lock().as_ref() {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    fn finish(&self, exit: PtyExit) {
        // closing the output channel ends the reader, like EOF on a real master
        self.output_tx.lock().take();
        self.exit_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(exit);
                true
            } else {
                false
            }
        });
    }
}

/// Test-side handle onto a [`MemoryPty`].
#[derive(Clone)]
pub struct MemoryPtyControl {
    config: PtyConfig,
    shared: Arc<MemoryPtyShared>,
}

impl MemoryPtyControl {
    /// The config this pty was created with.
    pub fn config(&self) -> &PtyConfig {
        &self.config
    }

    /// Make the "child" print `data`. Returns false once the pty has closed.
    pub fn emit(&self, data: impl Into<Bytes>) -> bool {
        self.shared.emit(data.into())
    }

    /// End the "child" with the given exit code.
    pub fn exit(&self, code: i32) {
        self.shared.finish(PtyExit::with_code(code));
    }

    /// Everything written to the pty so far.
    pub fn written(&self) -> Vec<u8> {
        self.shared.written.lock().clone()
    }

    /// Sizes passed to `resize`, in order.
    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.shared.resizes.lock().clone()
    }

    /// Whether `terminate` was called.
    pub fn was_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.shared.exit_tx.borrow().is_none()
    }
}

pub struct MemoryPty {
    size: TerminalSize,
    shared: Arc<MemoryPtyShared>,
    reader: Option<PtyReader>,
    exit_rx: ExitWatch,
}

impl MemoryPty {
    /// Create a pty that echoes writes back as output.
    pub fn new(config: &PtyConfig) -> (Self, MemoryPtyControl) {
        Self::build(config, true)
    }

    /// Create a pty that keeps writes to itself.
    pub fn silent(config: &PtyConfig) -> (Self, MemoryPtyControl) {
        Self::build(config, false)
    }

    fn build(config: &PtyConfig, echo: bool) -> (Self, MemoryPtyControl) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let shared = Arc::new(MemoryPtyShared {
            output_tx: Mutex::new(Some(output_tx)),
            exit_tx,
            written: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
            echo,
        });

        // bridge the unbounded injector into the bounded reader type
        let (data_tx, data_rx) = mpsc::channel(64);
        tokio::spawn(forward_output(output_rx, data_tx));

        let pty = Self {
            size: TerminalSize::new(config.rows, config.cols),
            shared: shared.clone(),
            reader: Some(PtyReader::new(data_rx)),
            exit_rx,
        };
        let control = MemoryPtyControl {
            config: config.clone(),
            shared,
        };
        (pty, control)
    }
}

async fn forward_output(mut rx: mpsc::UnboundedReceiver<Bytes>, tx: mpsc::Sender<Bytes>) {
    while let Some(chunk) = rx.recv().await {
        if tx.send(chunk).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl AsyncPty for MemoryPty {
    async fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        if !self.is_alive() {
            return Err(PtyError::ProcessTerminated);
        }
        self.shared.written.lock().extend_from_slice(data);
        if self.shared.echo {
            self.shared.emit(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    async fn resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let size = TerminalSize::new(rows, cols);
        self.shared.resizes.lock().push(size);
        self.size = size;
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        self.size
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    fn take_reader(&mut self) -> Result<PtyReader, PtyError> {
        self.reader.take().ok_or(PtyError::ReaderTaken)
    }

    fn exit_watch(&self) -> ExitWatch {
        self.exit_rx.clone()
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<(), PtyError> {
        debug!("MemoryPty terminated");
        self.shared.terminated.store(true, Ordering::Release);
        self.shared.finish(PtyExit::killed());
        Ok(())
    }
}

/// Factory handing out [`MemoryPty`] instances and keeping their controls.
#[derive(Clone, Default)]
pub struct MemoryPtyFactory {
    controls: Arc<Mutex<Vec<MemoryPtyControl>>>,
    spawned: Arc<AtomicUsize>,
    spawn_delay: Option<Duration>,
    fail_spawns: Arc<AtomicBool>,
}

impl MemoryPtyFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `create` by `delay`, to widen races in tests.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = Some(delay);
        self
    }

    /// Make subsequent `create` calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail_spawns.store(failing, Ordering::Release);
    }

    /// Number of ptys created so far.
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::Acquire)
    }

    /// Controls of every pty created so far, in creation order.
    pub fn controls(&self) -> Vec<MemoryPtyControl> {
        self.controls.lock().clone()
    }

    /// Control of the most recently created pty.
    pub fn last(&self) -> Option<MemoryPtyControl> {
        self.controls.lock().last().cloned()
    }
}

#[async_trait]
impl PtyFactory for MemoryPtyFactory {
    async fn create(&self, config: &PtyConfig) -> Result<Box<dyn AsyncPty>, PtyError> {
        if let Some(delay) = self.spawn_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_spawns.load(Ordering::Acquire) {
            return Err(PtyError::SpawnFailed(format!(
                "{}: spawning disabled",
                config.command
            )));
        }
        let (pty, control) = MemoryPty::new(config);
        self.controls.lock().push(control);
        self.spawned.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(pty))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
