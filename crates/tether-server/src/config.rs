//! Server configuration.
//!
//! Layered with figment: compiled defaults, then an optional JSON file, then
//! `TETHER_`-prefixed environment variables (`__` separates nested keys, e.g.
//! `TETHER_AUTH__JWT_SECRET`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use tether_telemetry::TelemetryConfig;

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Live sockets allowed per account before new ones are refused.
    pub max_connections_per_account: usize,
    /// Close a connection after this many seconds without an inbound frame.
    pub idle_timeout_secs: u64,
    pub idle_sweep_interval_secs: u64,
    /// Protocol ping interval on every socket.
    pub heartbeat_interval_secs: u64,
    /// Outbound frames buffered per socket.
    pub max_send_queue: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    pub shutdown_timeout_secs: u64,
    pub auth: AuthConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3005,
            max_connections_per_account: 100,
            idle_timeout_secs: 300,
            idle_sweep_interval_secs: 30,
            heartbeat_interval_secs: 30,
            max_send_queue: 256,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            shutdown_timeout_secs: 10,
            auth: AuthConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.idle_sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Reject values that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_connections_per_account", self.max_connections_per_account as u64),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("idle_sweep_interval_secs", self.idle_sweep_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("max_send_queue", self.max_send_queue as u64),
            ("max_message_size", self.max_message_size as u64),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
        }
        if self.auth.jwt_secret.is_none() && self.auth.static_tokens.is_empty() {
            return Err(ConfigError::Invalid(
                "auth requires a jwt_secret or at least one static token".into(),
            ));
        }
        Ok(())
    }
}

/// Token verification settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret for bearer JWTs.
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub jwt_secret: Option<SecretString>,
    /// Expected `iss` claim, checked when set.
    pub issuer: Option<String>,
    /// Fixed token -> account table for development.
    pub static_tokens: HashMap<String, String>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Build the layered figment. A missing file is skipped.
pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Json::file(path));
    }
    figment.merge(Env::prefixed("TETHER_").split("__"))
}

/// Load and validate configuration.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = figment(path).extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}
