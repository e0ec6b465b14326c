/// Terminal session: one pty shared by any number of client connections.
///
/// A `TerminalSession` is a cheap handle. All state that changes while the
/// session runs (the attached connections, the output history, the pty
/// itself) belongs to a single actor task; handles talk to it through a
/// command queue and observe it through a `watch` snapshot.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::api::{SessionSummary, unix_seconds};
use crate::pty::{AsyncPty, ExitWatch, PtyError, PtyExit, PtyReader, TerminalSize};
use crate::service::error::TerminalError;
use crate::service::history::OutputHistory;
use crate::service::outbound::{OutboundReceiver, OutboundSender, outbound_channel};

/// Identifies one client connection within a session.
pub type ConnectionId = String;

/// What a session delivers to its connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Bytes produced by the child.
    Output(Bytes),
    /// Current terminal size, sent first to every new connection.
    Size(TerminalSize),
    /// The session is over; always the last event of a queue.
    Exited(PtyExit),
}

/// Tunables for a session's buffers and shutdown.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Events buffered per connection before the oldest are dropped.
    pub outbound_capacity: usize,
    /// Recent output kept for replay to newly attached connections.
    pub history_limit_bytes: usize,
    /// Time between SIGTERM and SIGKILL when terminating the child.
    pub kill_grace_period: Duration,
    /// How long to keep draining output after the child has exited.
    pub exit_drain_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            history_limit_bytes: 64 * 1024,
            kill_grace_period: Duration::from_secs(3),
            exit_drain_timeout: Duration::from_millis(500),
        }
    }
}

/// Snapshot of a session published by its actor.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub connections: usize,
    pub size: TerminalSize,
    pub last_activity: SystemTime,
    /// Set while no connection is attached.
    pub idle_since: Option<Instant>,
    pub exit: Option<PtyExit>,
    pub closed: bool,
}

enum SessionCommand {
    Attach {
        connection_id: ConnectionId,
        reply: oneshot::Sender<OutboundReceiver>,
    },
    Detach {
        connection_id: ConnectionId,
    },
    Input(Bytes),
    Resize(TerminalSize),
    ReapIfIdle {
        idle_timeout: Duration,
        reply: oneshot::Sender<bool>,
    },
    Kill {
        reply: oneshot::Sender<()>,
    },
    ListConnections {
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
}

struct SessionShared {
    id: Uuid,
    name: String,
    created_at: SystemTime,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

/// Handle to a running terminal session.
#[derive(Clone)]
pub struct TerminalSession {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("name", &self.shared.name)
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    /// Take ownership of `pty` and start relaying its output.
    pub fn start(
        name: impl Into<String>,
        mut pty: Box<dyn AsyncPty>,
        options: SessionOptions,
    ) -> Result<Self, TerminalError> {
        let name = name.into();
        let reader = pty.take_reader().map_err(TerminalError::Io)?;
        let exit_rx = pty.exit_watch();
        let size = pty.size();
        let now = Instant::now();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState {
            connections: 0,
            size,
            last_activity: SystemTime::now(),
            idle_since: Some(now),
            exit: None,
            closed: false,
        });

        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            name: name.clone(),
            created_at: SystemTime::now(),
            commands: commands_tx,
            state: state_rx,
        });

        let actor = SessionActor {
            history: OutputHistory::new(options.history_limit_bytes),
            name,
            pty,
            reader: Some(reader),
            exit_rx,
            commands: commands_rx,
            state: state_tx,
            connections: HashMap::new(),
            size,
            idle_since: Some(now),
            options,
        };
        tokio::spawn(actor.run());

        Ok(Self { shared })
    }

    /// Unique for the lifetime of the process, unlike the name.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn created_at(&self) -> SystemTime {
        self.shared.created_at
    }

    /// Attach a connection. Its queue starts with the current size followed
    /// by the recent output history as a single chunk.
    pub async fn attach(
        &self,
        connection_id: impl Into<ConnectionId>,
    ) -> Result<OutboundReceiver, TerminalError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Attach {
            connection_id: connection_id.into(),
            reply,
        })?;
        rx.await.map_err(|_| self.closed_error())
    }

    /// Detach a connection. Unknown ids are ignored.
    pub fn detach(&self, connection_id: &str) {
        let _ = self.send(SessionCommand::Detach {
            connection_id: connection_id.to_string(),
        });
    }

    /// Forward client input to the pty. Input sent after the child exited is dropped.
    pub fn input(&self, data: impl Into<Bytes>) {
        if self.send(SessionCommand::Input(data.into())).is_err() {
            debug!(session = %self.shared.name, "Dropping input for closed session");
        }
    }

    /// Resize the terminal; later attachers are told the new size.
    pub fn resize(&self, rows: u16, cols: u16) {
        if self
            .send(SessionCommand::Resize(TerminalSize::new(rows, cols)))
            .is_err()
        {
            debug!(session = %self.shared.name, "Ignoring resize for closed session");
        }
    }

    /// Notify every connection, terminate the child and wait until the session is closed.
    pub async fn kill(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(SessionCommand::Kill { reply }).is_ok() {
            let _ = rx.await;
        }
        self.closed().await;
    }

    /// Terminate the session if it has had no connection for at least
    /// `idle_timeout`. The check runs inside the session, so a connection
    /// that attached in the meantime keeps it alive. Returns whether the
    /// session is gone.
    pub(crate) async fn reap_if_idle(&self, idle_timeout: Duration) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .send(SessionCommand::ReapIfIdle {
                idle_timeout,
                reply,
            })
            .is_err()
        {
            return true;
        }
        // a dropped reply means the session closed on its own
        rx.await.unwrap_or(true)
    }

    /// Ids of the attached connections, sorted.
    pub async fn connection_ids(&self) -> Result<Vec<ConnectionId>, TerminalError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ListConnections { reply })?;
        rx.await.map_err(|_| self.closed_error())
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.borrow().closed
    }

    /// Follow state changes without holding the session open.
    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.clone()
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        let mut state = self.shared.state.clone();
        // an error means the actor is gone, which is closed as well
        let _ = state.wait_for(|s| s.closed).await;
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.shared.state.borrow();
        SessionSummary::new(
            &self.shared.name,
            self.shared.created_at,
            state.last_activity,
            state.connections,
            state.size,
        )
    }

    fn send(&self, command: SessionCommand) -> Result<(), TerminalError> {
        self.shared
            .commands
            .send(command)
            .map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> TerminalError {
        TerminalError::SessionClosed(self.shared.name.clone())
    }
}

struct SessionActor {
    name: String,
    pty: Box<dyn AsyncPty>,
    reader: Option<PtyReader>,
    exit_rx: ExitWatch,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: watch::Sender<SessionState>,
    connections: HashMap<ConnectionId, OutboundSender>,
    history: OutputHistory,
    size: TerminalSize,
    idle_since: Option<Instant>,
    options: SessionOptions,
}

impl SessionActor {
    async fn run(mut self) {
        info!(session = %self.name, pid = ?self.pty.pid(), "Session started");

        let mut pending_exit: Option<PtyExit> = None;
        let mut drain_deadline: Option<Instant> = None;

        let exit = loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!(session = %self.name, "All session handles dropped");
                        self.terminate().await;
                        break PtyExit::killed();
                    };
                    if let Some(exit) = self.handle_command(command).await {
                        break exit;
                    }
                }
                chunk = next_chunk(&mut self.reader) => match chunk {
                    Some(chunk) => self.broadcast_output(chunk),
                    None => {
                        debug!(session = %self.name, "PTY output closed");
                        self.reader = None;
                        if let Some(exit) = pending_exit {
                            break exit;
                        }
                    }
                },
                exit = wait_exit(&mut self.exit_rx, pending_exit.is_none()) => {
                    if self.reader.is_none() {
                        break exit;
                    }
                    // keep relaying whatever the child wrote before it exited
                    pending_exit = Some(exit);
                    drain_deadline = Some(Instant::now() + self.options.exit_drain_timeout);
                }
                _ = sleep_until(drain_deadline) => {
                    debug!(session = %self.name, "Gave up draining output after exit");
                    break pending_exit.unwrap_or_else(PtyExit::killed);
                }
            }
        };

        self.finish(exit);
    }

    /// Returns the exit to finish with when the command ends the session.
    async fn handle_command(&mut self, command: SessionCommand) -> Option<PtyExit> {
        match command {
            SessionCommand::Attach {
                connection_id,
                reply,
            } => {
                let receiver = self.attach(connection_id.clone());
                if reply.send(receiver).is_err() {
                    // the caller went away before the attach completed
                    self.detach(&connection_id);
                }
                None
            }
            SessionCommand::Detach { connection_id } => {
                self.detach(&connection_id);
                None
            }
            SessionCommand::Input(data) => self.write_input(data).await,
            SessionCommand::Resize(size) => {
                self.resize(size).await;
                None
            }
            SessionCommand::ReapIfIdle {
                idle_timeout,
                reply,
            } => {
                let idle = self.connections.is_empty()
                    && self
                        .idle_since
                        .is_some_and(|since| since.elapsed() >= idle_timeout);
                let _ = reply.send(idle);
                if !idle {
                    return None;
                }
                info!(session = %self.name, "Reaping idle session");
                self.terminate().await;
                Some(PtyExit::killed())
            }
            SessionCommand::Kill { reply } => {
                info!(session = %self.name, "Killing session");
                let exit = PtyExit::killed();
                self.close_connections(exit);
                self.terminate().await;
                let _ = reply.send(());
                Some(exit)
            }
            SessionCommand::ListConnections { reply } => {
                let mut ids: Vec<ConnectionId> = self.connections.keys().cloned().collect();
                ids.sort();
                let _ = reply.send(ids);
                None
            }
        }
    }

    fn attach(&mut self, connection_id: ConnectionId) -> OutboundReceiver {
        let (sender, receiver) = outbound_channel(self.options.outbound_capacity);
        sender.push(SessionEvent::Size(self.size));
        if let Some(history) = self.history.snapshot() {
            trace!(session = %self.name, "Replaying {} bytes of history", history.len());
            sender.push(SessionEvent::Output(history));
        }

        if self.connections.is_empty() {
            debug!(session = %self.name, "First connection attached, resuming relay");
        }
        if let Some(previous) = self.connections.insert(connection_id.clone(), sender) {
            warn!(session = %self.name, connection = %connection_id, "Connection re-attached, closing previous queue");
            previous.close();
        }
        info!(
            session = %self.name,
            connection = %connection_id,
            connections = self.connections.len(),
            "Connection attached"
        );
        self.idle_since = None;
        self.publish();
        receiver
    }

    fn detach(&mut self, connection_id: &str) {
        let Some(sender) = self.connections.remove(connection_id) else {
            return;
        };
        sender.close();
        info!(
            session = %self.name,
            connection = %connection_id,
            connections = self.connections.len(),
            "Connection detached"
        );
        if self.connections.is_empty() {
            self.idle_since = Some(Instant::now());
        }
        self.publish();
    }

    async fn write_input(&mut self, data: Bytes) -> Option<PtyExit> {
        if !self.pty.is_alive() {
            debug!(session = %self.name, "PTY exited, dropping {} bytes of input", data.len());
            return None;
        }
        match self.pty.write(&data).await {
            Ok(()) => {
                self.touch();
                None
            }
            Err(PtyError::ProcessTerminated) => {
                debug!(session = %self.name, "PTY exited, dropping {} bytes of input", data.len());
                None
            }
            Err(e) => {
                error!(session = %self.name, "Failed to write to PTY: {}", e);
                self.terminate().await;
                Some(PtyExit::killed())
            }
        }
    }

    async fn resize(&mut self, size: TerminalSize) {
        match self.pty.resize(size.rows, size.cols).await {
            Ok(()) => {
                debug!(session = %self.name, "Resized to {}x{}", size.cols, size.rows);
                self.size = size;
                self.publish();
            }
            Err(e) => warn!(session = %self.name, "Failed to resize PTY: {}", e),
        }
    }

    fn broadcast_output(&mut self, chunk: Bytes) {
        trace!(session = %self.name, "Relaying {} bytes", chunk.len());
        self.history.push(&chunk);
        self.broadcast(SessionEvent::Output(chunk));
        self.touch();
    }

    /// Push `event` to every connection without waiting on any of them.
    fn broadcast(&self, event: SessionEvent) {
        for (connection_id, sender) in &self.connections {
            let evicted = sender.push(event.clone());
            if evicted > 0 {
                debug!(
                    session = %self.name,
                    connection = %connection_id,
                    evicted,
                    "Connection is behind, dropped oldest output"
                );
            }
        }
    }

    fn close_connections(&mut self, exit: PtyExit) {
        for (_, sender) in self.connections.drain() {
            sender.close_with(SessionEvent::Exited(exit));
        }
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.pty.terminate(self.options.kill_grace_period).await {
            warn!(session = %self.name, "Failed to terminate PTY: {}", e);
        }
    }

    /// Record activity. Subscribers are only woken when the second changes.
    fn touch(&self) {
        let now = SystemTime::now();
        self.state.send_if_modified(|state| {
            if unix_seconds(state.last_activity) == unix_seconds(now) {
                return false;
            }
            state.last_activity = now;
            true
        });
    }

    fn publish(&self) {
        let connections = self.connections.len();
        let size = self.size;
        let idle_since = self.idle_since;
        self.state.send_modify(|state| {
            state.connections = connections;
            state.size = size;
            state.idle_since = idle_since;
        });
    }

    fn finish(mut self, exit: PtyExit) {
        info!(session = %self.name, code = ?exit.code, "Session closed");
        // dropping the reader stops the read loop
        self.reader = None;
        self.close_connections(exit);
        self.state.send_modify(|state| {
            state.connections = 0;
            state.exit = Some(exit);
            state.closed = true;
        });
    }
}

async fn next_chunk(reader: &mut Option<PtyReader>) -> Option<Bytes> {
    match reader {
        Some(reader) => reader.next_chunk().await,
        None => std::future::pending().await,
    }
}

async fn wait_exit(exit_rx: &mut ExitWatch, armed: bool) -> PtyExit {
    if !armed {
        return std::future::pending().await;
    }
    match exit_rx.wait_for(Option::is_some).await {
        Ok(exit) => (*exit).unwrap_or_else(PtyExit::killed),
        // the pty went away without reporting a status
        Err(_) => PtyExit::killed(),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
