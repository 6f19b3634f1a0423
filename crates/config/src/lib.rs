use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "supportdesk.toml",
    "config/supportdesk.toml",
    "crates/config/supportdesk.toml",
    "../supportdesk.toml",
    "../config/supportdesk.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
}

/// Realtime link settings.
///
/// ```
/// use supportdesk_config::TransportConfig;
///
/// let transport = TransportConfig::default();
/// assert_eq!(transport.url, "ws://127.0.0.1:7070/realtime");
/// assert_eq!(transport.request_timeout().as_secs(), 10);
/// assert!(transport.reconnect.max_attempts.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub url: String,
    pub workspace_id: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7070/realtime".to_string(),
            workspace_id: "default".to_string(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            heartbeat_interval_ms: 15_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Exponential backoff applied after the link drops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "ReconnectConfig::default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "ReconnectConfig::default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "ReconnectConfig::default_jitter_ratio")]
    pub jitter_ratio: f64,
    #[serde(default = "ReconnectConfig::default_suspend_after")]
    pub suspend_after_attempts: u32,
    /// Unset means retry for as long as the client runs.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl ReconnectConfig {
    const fn default_base_delay() -> u64 {
        500
    }

    const fn default_max_delay() -> u64 {
        30_000
    }

    const fn default_jitter_ratio() -> f64 {
        0.2
    }

    const fn default_suspend_after() -> u32 {
        5
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: Self::default_base_delay(),
            max_delay_ms: Self::default_max_delay(),
            jitter_ratio: Self::default_jitter_ratio(),
            suspend_after_attempts: Self::default_suspend_after(),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub page_size: usize,
    pub send_timeout_ms: u64,
    pub echo_match_window_ms: u64,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            send_timeout_ms: 15_000,
            echo_match_window_ms: 10_000,
            event_buffer: 256,
        }
    }
}

impl SessionConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn echo_match_window(&self) -> Duration {
        Duration::from_millis(self.echo_match_window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub heartbeat_interval_ms: u64,
    /// Defaults to twice the heartbeat interval when unset.
    #[serde(default)]
    pub presence_ttl_ms: Option<u64>,
    pub typing_timeout_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            presence_ttl_ms: None,
            typing_timeout_ms: 2_000,
        }
    }
}

impl PresenceConfig {
    pub fn presence_ttl(&self) -> Duration {
        let millis = self
            .presence_ttl_ms
            .unwrap_or_else(|| self.heartbeat_interval_ms.saturating_mul(2));
        Duration::from_millis(millis)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Load the client configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use supportdesk_config::load;
///
/// std::env::remove_var("SUPPORTDESK_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.transport.url.is_empty());
/// ```
pub fn load() -> anyhow::Result<AppConfig> {
    let defaults = AppConfig::default();
    let transport = &defaults.transport;
    let session = &defaults.session;
    let presence = &defaults.presence;

    let mut builder = config::Config::builder()
        .set_default("transport.url", transport.url.clone())?
        .set_default("transport.workspace_id", transport.workspace_id.clone())?
        .set_default(
            "transport.connect_timeout_ms",
            clamp_i64(transport.connect_timeout_ms),
        )?
        .set_default(
            "transport.request_timeout_ms",
            clamp_i64(transport.request_timeout_ms),
        )?
        .set_default(
            "transport.heartbeat_interval_ms",
            clamp_i64(transport.heartbeat_interval_ms),
        )?
        .set_default("session.page_size", clamp_i64(session.page_size as u64))?
        .set_default("session.send_timeout_ms", clamp_i64(session.send_timeout_ms))?
        .set_default(
            "session.echo_match_window_ms",
            clamp_i64(session.echo_match_window_ms),
        )?
        .set_default("session.event_buffer", clamp_i64(session.event_buffer as u64))?
        .set_default(
            "presence.heartbeat_interval_ms",
            clamp_i64(presence.heartbeat_interval_ms),
        )?
        .set_default(
            "presence.typing_timeout_ms",
            clamp_i64(presence.typing_timeout_ms),
        )?;

    let environment_overrides =
        config::Environment::with_prefix("SUPPORTDESK").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("SUPPORTDESK_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via SUPPORTDESK_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let mut config = cfg
        .try_deserialize::<AppConfig>()
        .context("invalid configuration")?;

    if !(0.0..=1.0).contains(&config.transport.reconnect.jitter_ratio) {
        config.transport.reconnect.jitter_ratio =
            config.transport.reconnect.jitter_ratio.clamp(0.0, 1.0);
    }
    if config.session.page_size == 0 {
        anyhow::bail!("invalid configuration: session.page_size must be greater than zero");
    }

    debug!(?config, "loaded client configuration");
    Ok(config)
}
