/// Session lifecycle operations offered to a routing layer
use std::sync::Arc;

use tracing::info;

use crate::api::dto::{CreateSessionRequest, SessionSummary};
use crate::config::TerminalConfig;
use crate::protocol::TerminalConnection;
use crate::pty::{NativePtyFactory, PtyConfig, PtyError, PtyFactory};
use crate::service::{BridgePolicy, ConnectionBridge, SessionRegistry, TerminalError};

/// Create, list, look up and kill terminals, and connect clients to them.
#[derive(Clone)]
pub struct TerminalsApi {
    registry: SessionRegistry,
    config: Arc<TerminalConfig>,
}

impl TerminalsApi {
    /// Spawn sessions through `factory`, with limits taken from `config`.
    pub fn new(factory: Arc<dyn PtyFactory>, config: TerminalConfig) -> Self {
        let registry = SessionRegistry::new(factory, config.registry_settings());
        Self {
            registry,
            config: Arc::new(config),
        }
    }

    /// Spawn real pseudo-terminals.
    pub fn native(config: TerminalConfig) -> Self {
        Self::new(Arc::new(NativePtyFactory), config)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    /// Start background culling.
    pub fn start(&self) {
        self.registry.start();
    }

    /// New session with a generated name.
    pub async fn create(&self, request: &CreateSessionRequest) -> Result<SessionSummary, TerminalError> {
        let spawn = self.spawn_config(request)?;
        let session = self.registry.create(&spawn).await?;
        info!("Created terminal {} running {}", session.name(), spawn.command);
        Ok(session.summary())
    }

    /// The session called `name`, created from `request` if it does not exist.
    pub async fn create_or_get(
        &self,
        name: &str,
        request: &CreateSessionRequest,
    ) -> Result<SessionSummary, TerminalError> {
        let spawn = self.spawn_config(request)?;
        let session = self.registry.get_or_create(name, &spawn).await?;
        Ok(session.summary())
    }

    pub fn get(&self, name: &str) -> Result<SessionSummary, TerminalError> {
        Ok(self.registry.get(name)?.summary())
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        self.registry.list()
    }

    pub async fn kill(&self, name: &str) -> Result<(), TerminalError> {
        self.registry.kill(name).await
    }

    /// Relay `connection` to the existing session `name` until either ends.
    pub async fn connect<C: TerminalConnection>(
        &self,
        connection: C,
        name: &str,
    ) -> Result<(), TerminalError> {
        ConnectionBridge::new(connection, self.registry.clone())
            .serve(name, BridgePolicy::AttachExisting)
            .await
    }

    /// Stop culling and kill every session.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    fn spawn_config(&self, request: &CreateSessionRequest) -> Result<PtyConfig, TerminalError> {
        self.config
            .spawn_config(request)
            .map_err(|e| TerminalError::Spawn(PtyError::SpawnFailed(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use crate::protocol::{ChannelConnection, ServerMessage, TerminalMessage};
    use crate::pty::MemoryPtyFactory;

    fn api(factory: &MemoryPtyFactory) -> TerminalsApi {
        let mut config = TerminalConfig {
            max_sessions: 2,
            ..TerminalConfig::default()
        };
        config.shells.insert(
            "default".to_string(),
            ShellConfig {
                command: Some(vec!["/bin/sh".to_string(), "-i".to_string()]),
                ..ShellConfig::default()
            },
        );
        TerminalsApi::new(Arc::new(factory.clone()), config)
    }

    #[tokio::test]
    async fn create_list_kill() {
        let factory = MemoryPtyFactory::new();
        let api = api(&factory);

        let first = api.create(&CreateSessionRequest::default()).await.unwrap();
        let second = api
            .create(&CreateSessionRequest {
                rows: Some(10),
                cols: Some(40),
                ..CreateSessionRequest::default()
            })
            .await
            .unwrap();
        assert_eq!((first.name.as_str(), second.name.as_str()), ("1", "2"));
        assert_eq!((second.rows, second.cols), (10, 40));
        assert_eq!(factory.last().unwrap().config().args, vec!["-i".to_string()]);

        let names: Vec<String> = api.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["1".to_string(), "2".to_string()]);

        let err = api.create(&CreateSessionRequest::default()).await.unwrap_err();
        assert!(matches!(err, TerminalError::Capacity { max: 2 }));

        api.kill("1").await.unwrap();
        assert!(api.get("1").unwrap_err().is_not_found());
        assert_eq!(api.list().len(), 1);
    }

    #[tokio::test]
    async fn create_or_get_reuses_the_name() {
        let factory = MemoryPtyFactory::new();
        let api = api(&factory);
        let request = CreateSessionRequest::default();

        api.create_or_get("dev", &request).await.unwrap();
        api.create_or_get("dev", &request).await.unwrap();

        assert_eq!(factory.spawn_count(), 1);
        assert_eq!(api.get("dev").unwrap().name, "dev");
    }

    #[tokio::test]
    async fn unknown_shell_type_fails_without_spawning() {
        let factory = MemoryPtyFactory::new();
        let api = api(&factory);
        let request = CreateSessionRequest {
            shell_type: Some("fish".to_string()),
            ..CreateSessionRequest::default()
        };

        assert!(matches!(
            api.create(&request).await,
            Err(TerminalError::Spawn(_))
        ));
        assert_eq!(factory.spawn_count(), 0);
    }

    #[tokio::test]
    async fn connect_requires_an_existing_session() {
        let factory = MemoryPtyFactory::new();
        let api = api(&factory);

        let (connection, _peer) = ChannelConnection::pair("c1");
        assert!(api.connect(connection, "ghost").await.unwrap_err().is_not_found());

        api.create_or_get("live", &CreateSessionRequest::default())
            .await
            .unwrap();
        let (connection, mut peer) = ChannelConnection::pair("c2");
        let relay = tokio::spawn({
            let api = api.clone();
            async move { api.connect(connection, "live").await }
        });

        match peer.recv().await {
            Some(TerminalMessage::Text(text)) => assert_eq!(
                serde_json::from_str::<ServerMessage>(&text).unwrap(),
                ServerMessage::Size { rows: 24, cols: 80 }
            ),
            other => panic!("unexpected frame {:?}", other),
        }
        api.kill("live").await.unwrap();
        assert!(relay.await.unwrap().is_ok());
    }
}
