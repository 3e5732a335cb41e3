//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`chorus.toml`, `/etc/chorus/chorus.toml`,
//!   `~/.config/chorus/chorus.toml`)
//! - Environment variables (`CHORUS_PORT`, `CHORUS_LIMITS__MAX_CONNECTIONS`, ...)

use anyhow::{Context, Result};
use chorus_core::hub::HubConfig;
use chorus_core::{Action, EngineConfig, RateLimitPolicy, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub moderation: ModerationConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of live rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Maximum rooms a connection may join.
    #[serde(default = "default_max_rooms_per_connection")]
    pub max_rooms_per_connection: usize,

    /// Maximum envelope size in bytes.
    #[serde(default = "default_max_envelope_size")]
    pub max_envelope_size: usize,

    /// Maximum message length in characters.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    /// Maximum mentions resolved per message.
    #[serde(default = "default_max_mentions")]
    pub max_mentions: usize,
}

/// One rate limit override.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub limit: usize,
    pub window_secs: u64,
}

impl From<PolicyConfig> for RateLimitPolicy {
    fn from(p: PolicyConfig) -> Self {
        RateLimitPolicy {
            limit: p.limit,
            window: Duration::from_secs(p.window_secs),
        }
    }
}

/// Rate limit overrides. Unset actions keep their built-in policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default)]
    pub send_message: Option<PolicyConfig>,
    #[serde(default)]
    pub upload_file: Option<PolicyConfig>,
    #[serde(default)]
    pub join_room: Option<PolicyConfig>,
    #[serde(default)]
    pub create_room: Option<PolicyConfig>,

    /// How often idle rate limit keys are dropped, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl RateLimitsConfig {
    fn overrides(&self) -> HashMap<Action, RateLimitPolicy> {
        [
            (Action::SendMessage, self.send_message),
            (Action::UploadFile, self.upload_file),
            (Action::JoinRoom, self.join_room),
            (Action::CreateRoom, self.create_room),
        ]
        .into_iter()
        .filter_map(|(action, policy)| policy.map(|p| (action, p.into())))
        .collect()
    }
}

/// Moderation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    #[serde(default = "default_blocked_keywords")]
    pub blocked_keywords: Vec<String>,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Typing indicator expiry in milliseconds.
    #[serde(default = "default_typing_timeout")]
    pub typing_timeout_ms: u64,

    /// Recent messages sent with a room-joined confirmation.
    #[serde(default = "default_recent_messages")]
    pub recent_messages: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_rooms() -> usize {
    10_000
}

fn default_max_rooms_per_connection() -> usize {
    100
}

fn default_max_envelope_size() -> usize {
    64 * 1024
}

fn default_max_content_length() -> usize {
    chorus_core::engine::DEFAULT_MAX_CONTENT_LENGTH
}

fn default_max_mentions() -> usize {
    chorus_core::engine::DEFAULT_MAX_MENTIONS
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_blocked_keywords() -> Vec<String> {
    chorus_core::moderation::DEFAULT_BLOCKED_KEYWORDS
        .iter()
        .map(|k| k.to_string())
        .collect()
}

fn default_typing_timeout() -> u64 {
    5_000
}

fn default_recent_messages() -> usize {
    chorus_core::hub::RECENT_MESSAGES_ON_JOIN
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_heartbeat_timeout() -> u64 {
    60_000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            moderation: ModerationConfig::default(),
            presence: PresenceConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_rooms: default_max_rooms(),
            max_rooms_per_connection: default_max_rooms_per_connection(),
            max_envelope_size: default_max_envelope_size(),
            max_content_length: default_max_content_length(),
            max_mentions: default_max_mentions(),
        }
    }
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            send_message: None,
            upload_file: None,
            join_room: None,
            create_room: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            blocked_keywords: default_blocked_keywords(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_timeout_ms: default_typing_timeout(),
            recent_messages: default_recent_messages(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// `CHORUS_*` environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or does not deserialize.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "chorus.toml",
            "/etc/chorus/chorus.toml",
            "~/.config/chorus/chorus.toml",
        ];

        let mut builder = ::config::Config::builder();
        if let Some(path) = config_paths
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists())
        {
            tracing::info!(path = %path, "Loading config file");
            builder = builder.add_source(::config::File::new(&path, ::config::FileFormat::Toml));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("CHORUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limits.sweep_interval_secs.max(1))
    }

    /// Core configuration derived from the server sections.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            registry: RegistryConfig {
                max_rooms: self.limits.max_rooms,
                max_rooms_per_connection: self.limits.max_rooms_per_connection,
            },
            engine: EngineConfig {
                max_content_length: self.limits.max_content_length,
                max_mentions: self.limits.max_mentions,
            },
            rate_limits: self.rate_limits.overrides(),
            blocked_keywords: self.moderation.blocked_keywords.clone(),
            typing_timeout: Duration::from_millis(self.presence.typing_timeout_ms),
            recent_messages: self.presence.recent_messages,
        }
    }
}
