use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, trace, warn};

use crate::pty::pty_trait::{
    AsyncPty, ExitWatch, PtyConfig, PtyError, PtyExit, PtyFactory, PtyReader, TerminalSize,
};

/// Chunks buffered between the reader thread and the session before the
/// reader blocks and the kernel buffer pushes back on the child.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 4096;

/// A child process running on a native pseudo-terminal (portable-pty).
///
/// Three OS threads are attached: one drains the master side into the output
/// channel, one feeds queued input into the master, and one blocks in
/// `wait()` and publishes the exit status.
pub struct PtyProcess {
    id: String,
    size: TerminalSize,
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    input_tx: mpsc::UnboundedSender<Bytes>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    reader: Option<PtyReader>,
    exit_rx: ExitWatch,
}

impl PtyProcess {
    /// Open a pty pair and start `config.command` on its slave side.
    pub fn spawn(config: &PtyConfig) -> Result<Self, PtyError> {
        let id = uuid::Uuid::new_v4().to_string();
        info!(
            pty = %id,
            "Spawning PTY with command: {:?}, args: {:?}", config.command, config.args
        );

        let pty_system = portable_pty::native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &config.cwd {
            cmd.cwd(cwd);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!(pty = %id, "Failed to spawn {:?}: {}", config.command, e);
            PtyError::SpawnFailed(format!("{}: {e}", config.command))
        })?;
        // The parent must not keep the slave open, otherwise the master never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;

        let (data_tx, data_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        spawn_reader_thread(&id, reader, data_tx)?;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        spawn_writer_thread(&id, writer, input_rx)?;

        let (exit_tx, exit_rx) = watch::channel(None);
        let waiter_id = id.clone();
        std::thread::Builder::new()
            .name(format!("pty-wait-{}", &id[..8]))
            .spawn(move || {
                let exit = match child.wait() {
                    Ok(status) => {
                        let code = if status.signal().is_some() {
                            None
                        } else {
                            i32::try_from(status.exit_code()).ok()
                        };
                        PtyExit { code }
                    }
                    Err(e) => {
                        error!(pty = %waiter_id, "Failed to wait for child: {}", e);
                        PtyExit::killed()
                    }
                };
                debug!(pty = %waiter_id, ?exit, "Child process exited");
                exit_tx.send_replace(Some(exit));
            })?;

        info!(pty = %id, ?pid, "PTY spawned");

        Ok(Self {
            id,
            size: TerminalSize::new(config.rows, config.cols),
            pid,
            master: Mutex::new(pair.master),
            input_tx,
            killer,
            reader: Some(PtyReader::new(data_rx)),
            exit_rx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            if let Err(e) = self.killer.kill() {
                debug!(pty = %self.id, "Kill without pid failed: {}", e);
            }
            return;
        };
        // portable-pty makes the child a session leader, so its pid is also the group id.
        if let Err(e) = killpg(Pid::from_raw(pid), signal) {
            debug!(pty = %self.id, pid, "Failed to send {:?}: {}", signal, e);
        }
    }

    fn request_exit(&mut self) {
        #[cfg(unix)]
        self.signal(nix::sys::signal::Signal::SIGTERM);
        #[cfg(not(unix))]
        if let Err(e) = self.killer.kill() {
            debug!(pty = %self.id, "Kill failed: {}", e);
        }
    }

    fn force_kill(&mut self) {
        #[cfg(unix)]
        self.signal(nix::sys::signal::Signal::SIGKILL);
        #[cfg(not(unix))]
        if let Err(e) = self.killer.kill() {
            debug!(pty = %self.id, "Kill failed: {}", e);
        }
    }
}

fn spawn_reader_thread(
    id: &str,
    mut reader: Box<dyn Read + Send>,
    data_tx: mpsc::Sender<Bytes>,
) -> Result<(), PtyError> {
    let id = id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-read-{}", &id[..8]))
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!(pty = %id, "PTY EOF reached, stopping reader");
                        break;
                    }
                    Ok(n) => {
                        trace!(pty = %id, "PTY reader: read {} bytes", n);
                        if data_tx.blocking_send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                            debug!(pty = %id, "PTY reader: receiver dropped, stopping");
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO on the master once the slave side is gone.
                        debug!(pty = %id, "PTY reader stopped: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

/// Input is written in queue order. The thread stops on the first write
/// error or once the `PtyProcess` is dropped.
fn spawn_writer_thread(
    id: &str,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Bytes>,
) -> Result<(), PtyError> {
    let id = id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-write-{}", &id[..8]))
        .spawn(move || {
            while let Some(data) = input_rx.blocking_recv() {
                trace!(pty = %id, "PTY writer: writing {} bytes", data.len());
                if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                    debug!(pty = %id, "PTY writer stopped: {}", e);
                    break;
                }
            }
        })?;
    Ok(())
}

#[async_trait]
impl AsyncPty for PtyProcess {
    async fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        if !self.is_alive() {
            return Err(PtyError::ProcessTerminated);
        }
        trace!(pty = %self.id, "Queueing {} bytes for PTY", data.len());

        self.input_tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| {
                PtyError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "PTY writer has stopped",
                ))
            })
    }

    async fn resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        debug!(pty = %self.id, "Resizing PTY to {}x{}", cols, rows);
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        self.size = TerminalSize::new(rows, cols);
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        self.size
    }

    fn pid(&self) -> Option<u32> {
        self.pid
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

    async fn terminate(&mut self, grace: Duration) -> Result<(), PtyError> {
        if !self.is_alive() {
            return Ok(());
        }
        info!(pty = %self.id, pid = ?self.pid, "Terminating child process");
        self.request_exit();

        let mut exit_rx = self.exit_rx.clone();
        if tokio::time::timeout(grace, exit_rx.wait_for(Option::is_some))
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!(pty = %self.id, "Child did not exit within {:?}, killing", grace);
        self.force_kill();
        match tokio::time::timeout(Duration::from_secs(1), exit_rx.wait_for(Option::is_some)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(PtyError::Other(format!(
                "child of pty {} survived SIGKILL",
                self.id
            ))),
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            debug!(pty = %self.id, "PtyProcess dropped while child alive, killing");
            self.force_kill();
        }
    }
}

// ================ 工厂实现 ================

/// Spawns real pseudo-terminals.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyFactory;

#[async_trait]
impl PtyFactory for NativePtyFactory {
    async fn create(&self, config: &PtyConfig) -> Result<Box<dyn AsyncPty>, PtyError> {
        // openpty and fork/exec block; keep them off the async workers
        let config = config.clone();
        let pty = spawn_blocking(move || PtyProcess::spawn(&config))
            .await
            .map_err(|e| PtyError::BackgroundTask(format!("Failed to create PTY: {e:?}")))??;
        Ok(Box::new(pty))
    }

    fn name(&self) -> &'static str {
        "portable-pty"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn collect_output(reader: &mut PtyReader, needle: &str) -> String {
        let mut text = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !text.contains(needle) {
            match tokio::time::timeout_at(deadline, reader.next_chunk()).await {
                Ok(Some(chunk)) => text.push_str(&String::from_utf8_lossy(&chunk)),
                Ok(None) | Err(_) => break,
            }
        }
        text
    }

    #[tokio::test]
    async fn spawn_echo_reports_output_and_exit_code() {
        let config = PtyConfig::new("/bin/echo").with_args(["pty-hello"]);
        let mut pty = NativePtyFactory.create(&config).await.unwrap();
        let mut reader = pty.take_reader().unwrap();

        let text = collect_output(&mut reader, "pty-hello").await;
        assert!(text.contains("pty-hello"), "unexpected output: {text:?}");

        let mut exit = pty.exit_watch();
        let status = tokio::time::timeout(Duration::from_secs(5), exit.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(status, Some(PtyExit::with_code(0)));
        assert!(!pty.is_alive());
    }

    #[tokio::test]
    async fn write_reaches_child() {
        let mut pty = NativePtyFactory.create(&PtyConfig::new("/bin/cat")).await.unwrap();
        let mut reader = pty.take_reader().unwrap();

        pty.write(b"ping-through-pty\n").await.unwrap();
        let text = collect_output(&mut reader, "ping-through-pty").await;
        assert!(text.contains("ping-through-pty"));

        pty.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!pty.is_alive());
    }

    #[tokio::test]
    async fn large_write_returns_while_output_is_unread() {
        let mut pty = NativePtyFactory.create(&PtyConfig::new("/bin/cat")).await.unwrap();
        let _reader = pty.take_reader().unwrap();

        let line = [b'x'; 1023].iter().copied().chain([b'\n']).collect::<Vec<u8>>();
        let paste = line.repeat(4 * 1024);
        tokio::time::timeout(Duration::from_secs(1), pty.write(&paste))
            .await
            .expect("write waited for the child")
            .unwrap();

        pty.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!pty.is_alive());
    }

    #[tokio::test]
    async fn reader_can_only_be_taken_once() {
        let mut pty = NativePtyFactory.create(&PtyConfig::new("/bin/cat")).await.unwrap();
        assert!(pty.take_reader().is_ok());
        assert!(matches!(pty.take_reader(), Err(PtyError::ReaderTaken)));
        pty.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn resize_records_new_size() {
        let mut pty = NativePtyFactory.create(&PtyConfig::new("/bin/cat")).await.unwrap();
        pty.resize(40, 120).await.unwrap();
        assert_eq!(pty.size(), TerminalSize::new(40, 120));
        pty.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let config = PtyConfig::new("/bin/sleep").with_args(["30"]);
        let mut pty = NativePtyFactory.create(&config).await.unwrap();
        assert!(pty.is_alive());

        pty.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!pty.is_alive());
        pty.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(
            pty.write(b"late").await,
            Err(PtyError::ProcessTerminated)
        ));
    }

    #[tokio::test]
    async fn spawn_missing_command_fails() {
        let config = PtyConfig::new("/definitely/not/a/real/binary");
        let result = NativePtyFactory.create(&config).await;
        assert!(matches!(result, Err(PtyError::SpawnFailed(_))));
    }
}
