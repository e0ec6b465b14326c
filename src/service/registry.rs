/// Session registry responsible for the process-wide table of named sessions
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::SessionSummary;
use crate::pty::{PtyConfig, PtyError, PtyFactory, create_pty_with_factory};
use crate::service::error::TerminalError;
use crate::service::session::{SessionOptions, TerminalSession};

/// Limits and timers of a [`SessionRegistry`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Sessions (including ones still spawning) the registry will hold.
    pub max_sessions: usize,
    /// Reap sessions that have had no connection for this long. `None` disables reaping.
    pub idle_timeout: Option<Duration>,
    /// Time between two reaper sweeps.
    pub cull_interval: Duration,
    /// Options every new session is started with.
    pub session: SessionOptions,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            idle_timeout: None,
            cull_interval: Duration::from_secs(300),
            session: SessionOptions::default(),
        }
    }
}

type SpawnResult = Option<Result<TerminalSession, String>>;

enum Slot {
    /// The pty is being spawned; resolves once with the outcome.
    Pending(watch::Receiver<SpawnResult>),
    Ready(TerminalSession),
}

struct RegistryInner {
    settings: RegistrySettings,
    factory: Arc<dyn PtyFactory>,
    sessions: Mutex<HashMap<String, Slot>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Registry of running terminal sessions, keyed by name.
///
/// Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn PtyFactory>, settings: RegistrySettings) -> Self {
        info!(
            factory = factory.name(),
            max_sessions = settings.max_sessions,
            "Created session registry"
        );
        Self {
            inner: Arc::new(RegistryInner {
                settings,
                factory,
                sessions: Mutex::new(HashMap::new()),
                reaper: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    /// Return the session called `name`, spawning it from `config` if there is none.
    ///
    /// Concurrent calls for the same new name spawn exactly one pty and all
    /// receive the same session.
    pub async fn get_or_create(
        &self,
        name: &str,
        config: &PtyConfig,
    ) -> Result<TerminalSession, TerminalError> {
        let pending = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get(name) {
                Some(Slot::Ready(session)) if !session.is_closed() => {
                    return Ok(session.clone());
                }
                Some(Slot::Pending(pending)) => pending.clone(),
                _ => {
                    sessions.remove(name);
                    self.inner.reserve(&mut sessions, name.to_string(), config)?
                }
            }
        };
        wait_for_spawn(name, pending).await
    }

    /// Spawn a session under the smallest unused numeric name ("1", "2", ...).
    pub async fn create(&self, config: &PtyConfig) -> Result<TerminalSession, TerminalError> {
        let (name, pending) = {
            let mut sessions = self.inner.sessions.lock();
            let name = (1..)
                .map(|n: u64| n.to_string())
                .find(|candidate| !sessions.contains_key(candidate))
                .unwrap_or_default();
            let pending = self.inner.reserve(&mut sessions, name.clone(), config)?;
            (name, pending)
        };
        wait_for_spawn(&name, pending).await
    }

    /// The running session called `name`.
    pub fn get(&self, name: &str) -> Result<TerminalSession, TerminalError> {
        match self.inner.sessions.lock().get(name) {
            Some(Slot::Ready(session)) if !session.is_closed() => Ok(session.clone()),
            _ => Err(TerminalError::NotFound(name.to_string())),
        }
    }

    /// Summaries of the running sessions, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<TerminalSession> = self.inner.ready_sessions();
        sessions.retain(|session| !session.is_closed());
        sessions.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.name().cmp(b.name()))
        });
        sessions.iter().map(TerminalSession::summary).collect()
    }

    /// Notify the connections of `name`, terminate its child and forget it.
    pub async fn kill(&self, name: &str) -> Result<(), TerminalError> {
        let session = self.get(name)?;
        session.kill().await;
        self.inner.remove_if_same(name, session.id());
        info!("Killed session: {}", name);
        Ok(())
    }

    /// One reaper sweep. Returns the names of the sessions removed.
    pub async fn reap_idle(&self) -> Vec<String> {
        self.inner.reap_idle().await
    }

    /// Start the background reaper. Does nothing when reaping is disabled
    /// or the reaper already runs.
    pub fn start(&self) {
        let Some(idle_timeout) = self.inner.settings.idle_timeout else {
            info!("Idle session reaping disabled");
            return;
        };
        let mut reaper = self.inner.reaper.lock();
        if reaper.is_some() || self.inner.shutdown.is_cancelled() {
            return;
        }
        let interval = self.inner.settings.cull_interval.max(Duration::from_millis(1));
        info!(
            "Reaping sessions idle for {:?}, checking every {:?}",
            idle_timeout, interval
        );
        *reaper = Some(tokio::spawn(run_reaper(
            Arc::downgrade(&self.inner),
            self.inner.shutdown.clone(),
            interval,
        )));
    }

    /// Stop the reaper, wait for spawns in flight, then kill every session
    /// and wait for them to close.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let reaper = self.inner.reaper.lock().take();
        if let Some(reaper) = reaper {
            if let Err(e) = reaper.await {
                warn!("Session reaper ended abnormally: {}", e);
            }
        }

        // a spawn that finishes after the cancel kills its own session
        let pending = self.inner.pending_spawns();
        if !pending.is_empty() {
            info!("Waiting for {} sessions still spawning", pending.len());
            join_all(pending.into_iter().map(|mut spawn| async move {
                let _ = spawn.wait_for(Option::is_some).await;
            }))
            .await;
        }

        let sessions = self.inner.ready_sessions();
        info!("Shutting down {} terminal sessions", sessions.len());
        join_all(sessions.iter().map(|session| session.kill())).await;
        for session in &sessions {
            self.inner.remove_if_same(session.name(), session.id());
        }
    }

    /// Number of sessions, including ones still spawning.
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegistryInner {
    /// Insert a pending slot for `name` and start spawning it.
    /// Must be called with the table locked and `name` absent.
    fn reserve(
        self: &Arc<Self>,
        sessions: &mut HashMap<String, Slot>,
        name: String,
        config: &PtyConfig,
    ) -> Result<watch::Receiver<SpawnResult>, TerminalError> {
        if self.shutdown.is_cancelled() {
            return Err(TerminalError::SessionClosed(name));
        }
        let max = self.settings.max_sessions;
        if sessions.len() >= max {
            warn!("Refusing to create session {}: {} sessions running", name, max);
            return Err(TerminalError::Capacity { max });
        }

        let (tx, rx) = watch::channel(None);
        sessions.insert(name.clone(), Slot::Pending(rx.clone()));
        // detached so a caller giving up cannot leave the slot pending
        tokio::spawn(spawn_session(self.clone(), name, config.clone(), tx));
        Ok(rx)
    }

    fn ready_sessions(&self) -> Vec<TerminalSession> {
        self.sessions
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(session) => Some(session.clone()),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    fn pending_spawns(&self) -> Vec<watch::Receiver<SpawnResult>> {
        self.sessions
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Pending(pending) => Some(pending.clone()),
                Slot::Ready(_) => None,
            })
            .collect()
    }

    /// Remove `name` only if it still refers to the session with `id`.
    fn remove_if_same(&self, name: &str, id: Uuid) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(name) {
            Some(Slot::Ready(session)) if session.id() == id => {
                sessions.remove(name);
                true
            }
            _ => false,
        }
    }

    async fn reap_idle(&self) -> Vec<String> {
        let mut reaped = Vec::new();
        for session in self.ready_sessions() {
            let gone = if session.is_closed() {
                true
            } else if let Some(idle_timeout) = self.settings.idle_timeout {
                let idle_long_enough = session
                    .state()
                    .idle_since
                    .is_some_and(|since| since.elapsed() >= idle_timeout);
                idle_long_enough && session.reap_if_idle(idle_timeout).await
            } else {
                false
            };
            if gone && self.remove_if_same(session.name(), session.id()) {
                reaped.push(session.name().to_string());
            }
        }
        if !reaped.is_empty() {
            info!("Reaped {} sessions: {:?}", reaped.len(), reaped);
        }
        reaped
    }
}

async fn spawn_session(
    inner: Arc<RegistryInner>,
    name: String,
    config: PtyConfig,
    result: watch::Sender<SpawnResult>,
) {
    debug!(
        "Spawning session {} with {} via {}",
        name,
        config.command,
        inner.factory.name()
    );
    let spawned = match create_pty_with_factory(inner.factory.as_ref(), &config).await {
        Ok(pty) => TerminalSession::start(name.clone(), pty, inner.settings.session.clone()),
        Err(e) => Err(TerminalError::Spawn(e)),
    };

    let outcome = match spawned {
        Ok(session) => {
            // shutdown either sees this session or it never lands in the table
            let registered = {
                let mut sessions = inner.sessions.lock();
                if inner.shutdown.is_cancelled() {
                    sessions.remove(&name);
                    false
                } else {
                    sessions.insert(name.clone(), Slot::Ready(session.clone()));
                    true
                }
            };
            if registered {
                watch_for_close(Arc::downgrade(&inner), &session);
                info!("Created session: {}", name);
                Ok(session)
            } else {
                session.kill().await;
                Err(format!("registry shut down while spawning {}", name))
            }
        }
        Err(e) => {
            error!("Failed to create session {}: {}", name, e);
            inner.sessions.lock().remove(&name);
            Err(e.to_string())
        }
    };
    result.send_replace(Some(outcome));
}

async fn wait_for_spawn(
    name: &str,
    mut pending: watch::Receiver<SpawnResult>,
) -> Result<TerminalSession, TerminalError> {
    let outcome = match pending.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => None,
    };
    match outcome {
        Some(Ok(session)) => Ok(session),
        Some(Err(message)) => Err(TerminalError::Spawn(PtyError::SpawnFailed(message))),
        None => Err(TerminalError::SessionClosed(name.to_string())),
    }
}

/// Drop the session from the table as soon as it closes.
fn watch_for_close(inner: Weak<RegistryInner>, session: &TerminalSession) {
    let name = session.name().to_string();
    let id = session.id();
    let mut state = session.subscribe();
    tokio::spawn(async move {
        let _ = state.wait_for(|state| state.closed).await;
        if let Some(inner) = inner.upgrade() {
            if inner.remove_if_same(&name, id) {
                info!("Removed closed session: {}", name);
            }
        }
    });
}

async fn run_reaper(inner: Weak<RegistryInner>, shutdown: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.reap_idle().await;
            }
        }
    }
    debug!("Session reaper stopped");
}
