/// Connection bridge: couples one client transport to one terminal session
use tracing::{debug, info, warn};

use crate::protocol::TerminalConnection;
use crate::pty::PtyConfig;
use crate::service::error::TerminalError;
use crate::service::message_handler::MessageHandler;
use crate::service::outbound::OutboundReceiver;
use crate::service::registry::SessionRegistry;
use crate::service::session::TerminalSession;

/// How a bridge finds its session.
#[derive(Debug, Clone)]
pub enum BridgePolicy {
    /// Spawn the session from this config if it does not exist yet.
    CreateOnConnect(PtyConfig),
    /// Only join a session that is already running.
    AttachExisting,
}

/// Lifecycle of a bridge. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Attached,
    Detached,
}

/// Detaches the connection exactly once, however the bridge ends.
struct AttachGuard {
    session: TerminalSession,
    connection_id: String,
    attached: bool,
}

impl AttachGuard {
    fn detach(&mut self) {
        if std::mem::take(&mut self.attached) {
            self.session.detach(&self.connection_id);
        }
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Relays between a [`TerminalConnection`] and a [`TerminalSession`].
///
/// The bridge only ever attaches and detaches; the session's lifetime is
/// owned by the registry.
pub struct ConnectionBridge<C: TerminalConnection> {
    connection: C,
    registry: SessionRegistry,
    state: BridgeState,
    attachment: Option<(AttachGuard, OutboundReceiver)>,
}

impl<C: TerminalConnection> ConnectionBridge<C> {
    pub fn new(connection: C, registry: SessionRegistry) -> Self {
        info!(
            "New terminal connection: {} (Type: {:?})",
            connection.id(),
            connection.connection_type()
        );
        Self {
            connection,
            registry,
            state: BridgeState::Connecting,
            attachment: None,
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Resolve the session called `name` and attach to it. On failure the
    /// transport is closed and the bridge is done.
    pub async fn connect(&mut self, name: &str, policy: BridgePolicy) -> Result<(), TerminalError> {
        if self.state != BridgeState::Connecting {
            return Err(TerminalError::SessionClosed(name.to_string()));
        }
        match self.attach(name, policy).await {
            Ok(()) => {
                self.state = BridgeState::Attached;
                Ok(())
            }
            Err(e) => {
                warn!("Connection {} could not join {}: {}", self.connection.id(), name, e);
                self.state = BridgeState::Detached;
                let _ = self.connection.close().await;
                Err(e)
            }
        }
    }

    async fn attach(&mut self, name: &str, policy: BridgePolicy) -> Result<(), TerminalError> {
        let session = match policy {
            BridgePolicy::CreateOnConnect(config) => {
                self.registry.get_or_create(name, &config).await?
            }
            BridgePolicy::AttachExisting => self.registry.get(name)?,
        };
        let connection_id = self.connection.id().to_string();
        let outbound = session.attach(connection_id.clone()).await?;
        let guard = AttachGuard {
            session,
            connection_id,
            attached: true,
        };
        self.attachment = Some((guard, outbound));
        Ok(())
    }

    /// Relay until either side ends: the client closes or fails, or the
    /// session exits (the transport is then closed by the bridge).
    pub async fn run(&mut self) -> Result<(), TerminalError> {
        let Some((mut guard, mut outbound)) = self.attachment.take() else {
            return Err(TerminalError::SessionClosed(self.connection.id().to_string()));
        };
        let mut handler = MessageHandler::new(self.connection.id());

        let result = loop {
            tokio::select! {
                frame = self.connection.receive() => match frame {
                    Some(Ok(message)) => {
                        if handler.handle_message(message, &guard.session) {
                            break Ok(());
                        }
                    }
                    Some(Err(e)) => break Err(TerminalError::from(e)),
                    None => {
                        debug!("Connection {} closed by client", self.connection.id());
                        break Ok(());
                    }
                },
                event = outbound.recv() => match event {
                    Some(event) => match handler.handle_event(event, &mut self.connection).await {
                        Ok(true) => break Ok(()),
                        Ok(false) => {}
                        Err(e) => break Err(e),
                    },
                    None => {
                        debug!("Outbound queue of {} closed", self.connection.id());
                        break Ok(());
                    }
                },
            }
        };

        guard.detach();
        self.state = BridgeState::Detached;
        if outbound.dropped() > 0 {
            info!(
                "Connection {} fell behind, {} events dropped",
                self.connection.id(),
                outbound.dropped()
            );
        }
        let _ = self.connection.close().await;
        match &result {
            Ok(()) => info!("Connection {} detached from {}", self.connection.id(), guard.session.name()),
            Err(e) => warn!("Connection {} ended with error: {}", self.connection.id(), e),
        }
        result
    }

    /// Connect and relay until the connection ends.
    pub async fn serve(mut self, name: &str, policy: BridgePolicy) -> Result<(), TerminalError> {
        self.connect(name, policy).await?;
        self.run().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::{ChannelConnection, ChannelPeer, ServerMessage, TerminalMessage};
    use crate::pty::MemoryPtyFactory;
    use crate::service::RegistrySettings;

    fn setup() -> (MemoryPtyFactory, SessionRegistry) {
        let factory = MemoryPtyFactory::new();
        let registry = SessionRegistry::new(Arc::new(factory.clone()), RegistrySettings::default());
        (factory, registry)
    }

    async fn next_message(peer: &mut ChannelPeer) -> ServerMessage {
        match peer.recv().await {
            Some(TerminalMessage::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    async fn spawn_bridge(
        registry: &SessionRegistry,
        id: &str,
        name: &str,
    ) -> (
        tokio::task::JoinHandle<(ConnectionBridge<ChannelConnection>, Result<(), TerminalError>)>,
        ChannelPeer,
    ) {
        let (connection, peer) = ChannelConnection::pair(id);
        let mut bridge = ConnectionBridge::new(connection, registry.clone());
        bridge
            .connect(name, BridgePolicy::CreateOnConnect(PtyConfig::new("sh")))
            .await
            .unwrap();
        assert_eq!(bridge.state(), BridgeState::Attached);
        let handle = tokio::spawn(async move {
            let result = bridge.run().await;
            (bridge, result)
        });
        (handle, peer)
    }

    #[tokio::test]
    async fn relays_input_and_output() {
        let (_factory, registry) = setup();
        let (handle, mut peer) = spawn_bridge(&registry, "c1", "term").await;

        assert_eq!(next_message(&mut peer).await, ServerMessage::Size { rows: 24, cols: 80 });
        peer.send_text(r#"{"type":"stdin","data":"hello"}"#);
        assert_eq!(
            next_message(&mut peer).await,
            ServerMessage::Output {
                data: "hello".to_string()
            }
        );

        peer.close();
        let (bridge, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(bridge.state(), BridgeState::Detached);

        let session = registry.get("term").unwrap();
        assert!(session.connection_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn binary_frames_and_resizes_reach_the_session() {
        let (factory, registry) = setup();
        let (_handle, mut peer) = spawn_bridge(&registry, "c1", "term").await;
        next_message(&mut peer).await;

        peer.send_text("definitely not json");
        peer.send_binary(b"raw".to_vec());
        assert_eq!(
            next_message(&mut peer).await,
            ServerMessage::Output {
                data: "raw".to_string()
            }
        );

        peer.send_text(r#"["set_size", 50, 160]"#);
        peer.send_text(r#"{"type":"ping"}"#);
        peer.send_binary(b"!".to_vec());
        next_message(&mut peer).await;

        let control = factory.last().unwrap();
        assert_eq!(control.written(), b"raw!");
        assert_eq!(control.resizes(), vec![crate::pty::TerminalSize::new(50, 160)]);
    }

    #[tokio::test]
    async fn session_exit_closes_the_transport() {
        let (factory, registry) = setup();
        let (handle, mut peer) = spawn_bridge(&registry, "c1", "term").await;
        next_message(&mut peer).await;

        factory.last().unwrap().exit(3);

        assert_eq!(next_message(&mut peer).await, ServerMessage::Exit { code: Some(3) });
        assert_eq!(peer.recv().await, Some(TerminalMessage::Close));
        let (bridge, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(bridge.state(), BridgeState::Detached);
    }

    #[tokio::test]
    async fn attaching_to_a_missing_session_fails() {
        let (factory, registry) = setup();
        let (connection, mut peer) = ChannelConnection::pair("c1");
        let mut bridge = ConnectionBridge::new(connection, registry.clone());

        let err = bridge
            .connect("nope", BridgePolicy::AttachExisting)
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(bridge.state(), BridgeState::Detached);
        assert_eq!(peer.recv().await, Some(TerminalMessage::Close));
        assert_eq!(factory.spawn_count(), 0);
    }

    #[tokio::test]
    async fn two_clients_share_one_session() {
        let (factory, registry) = setup();
        let (_h1, mut first) = spawn_bridge(&registry, "c1", "shared").await;
        let (_h2, mut second) = spawn_bridge(&registry, "c2", "shared").await;
        next_message(&mut first).await;
        next_message(&mut second).await;

        first.send_text(r#"{"type":"stdin","data":"x"}"#);

        let expected = ServerMessage::Output {
            data: "x".to_string(),
        };
        assert_eq!(next_message(&mut first).await, expected);
        assert_eq!(next_message(&mut second).await, expected);
        assert_eq!(factory.spawn_count(), 1);
    }
}
