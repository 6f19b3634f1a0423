use std::sync::Arc;

use anyhow::{Context, Result};
use supportdesk_chats::{Sender, SessionManager, SessionSettings};
use supportdesk_config::AppConfig;
use supportdesk_transport::{Credentials, LoopbackTransport, Transport, WsTransport};
use tracing::info;

pub mod telemetry {
    use anyhow::Result;
    use tracing::Level;
    use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

    pub fn init_tracing() -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = SubscriberBuilder::default()
            .with_max_level(Level::TRACE)
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|error| anyhow::anyhow!("failed to set tracing subscriber: {error}"))
    }
}

/// Everything a client process needs to talk to the realtime backend
#[derive(Clone)]
pub struct ClientServices {
    pub config: AppConfig,
    pub transport: Arc<dyn Transport>,
    pub sessions: SessionManager,
}

impl ClientServices {
    /// Wire the session manager to the configured websocket backend
    pub fn initialise(config: &AppConfig, identity: Sender) -> Self {
        let transport = Arc::new(WsTransport::new(&config.transport));
        info!(url = %transport.url(), "websocket transport configured");
        Self::with_transport(config, transport, identity)
    }

    /// In-process backend that echoes messages, for demos and offline work
    pub fn offline(config: &AppConfig, identity: Sender) -> Self {
        let loopback = LoopbackTransport::new().with_echo();
        loopback.set_client_id(identity.id.clone());
        info!("using the in-process loopback backend");
        Self::with_transport(config, Arc::new(loopback), identity)
    }

    pub fn with_transport(
        config: &AppConfig,
        transport: Arc<dyn Transport>,
        identity: Sender,
    ) -> Self {
        let sessions = SessionManager::new(
            transport.clone(),
            SessionSettings::from_config(config),
            identity,
        );
        Self {
            config: config.clone(),
            transport,
            sessions,
        }
    }

    /// Credentials for the configured workspace
    pub fn credentials(&self, token: impl Into<String>) -> Credentials {
        Credentials::new(self.config.transport.workspace_id.clone(), token)
    }

    pub async fn start(&self, token: impl Into<String>) -> Result<()> {
        let credentials = self.credentials(token);
        self.sessions
            .connect(credentials)
            .await
            .context("failed to connect to the realtime backend")?;
        info!(state = %self.sessions.connection_state(), "client services ready");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}

pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(?error, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
