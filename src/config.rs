//! Relay configuration loading.
//!
//! Configuration comes from a JSON file (optional), then environment
//! variable overrides, then [`RelayConfig::validate`]. Every field has a
//! default, so an empty file or no file at all yields a working single-node
//! relay on `localhost:8080`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    DEFAULT_DELIVERY_TIMEOUT, DEFAULT_FORWARD_ATTEMPTS, DEFAULT_FORWARD_RETRY_DELAY,
    DEFAULT_FORWARD_TIMEOUT, DEFAULT_HELLO_TIMEOUT, DEFAULT_HOST, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_PING_INTERVAL, DEFAULT_PONG_TIMEOUT, DEFAULT_PORT, DEFAULT_SHARD_PORT,
    DEFAULT_SHUTDOWN_GRACE, DEFAULT_UPDATE_QUEUE_CAPACITY,
};
use crate::push::PushSettings;
use crate::router::{ForwardSettings, NodeAddress, ShardMap};

/// File read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Invalid configuration. Fatal before anything is served.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment override did not parse.
    #[error("{var}={value:?} is not a valid {expected}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// What was expected.
        expected: &'static str,
    },
    /// A field is out of range.
    #[error("{field}: {reason}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong.
        reason: String,
    },
    /// Only one of the TLS certificate and key was configured.
    #[error("tls.cert_file and tls.key_file must be set together")]
    PartialTls,
}

/// Shard membership.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ShardConfig {
    /// Host peers use to reach this node's shard listener.
    pub current_host: String,
    /// Shard listener port (bound on all interfaces).
    pub port: u16,
    /// `host:port` of every node's shard listener, this one included or not.
    pub nodes: Vec<String>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            current_host: DEFAULT_HOST.to_string(),
            port: DEFAULT_SHARD_PORT,
            nodes: Vec::new(),
        }
    }
}

/// TLS for the public listeners.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM certificate chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,
    /// PEM private key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl TlsConfig {
    /// Certificate and key paths, when both are set.
    pub fn files(&self) -> Option<(&Path, &Path)> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Push connection handling.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PushConfig {
    /// Idle seconds before the server pings a client.
    pub ping_interval_secs: u64,
    /// Seconds a client has to answer a ping.
    pub pong_timeout_secs: u64,
    /// Seconds a client has to send `hello` after connecting.
    pub hello_timeout_secs: u64,
    /// Milliseconds allowed for writing one notification.
    pub delivery_timeout_ms: u64,
    /// Upper bound on concurrent push connections.
    pub max_connections: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: DEFAULT_PING_INTERVAL.as_secs(),
            pong_timeout_secs: DEFAULT_PONG_TIMEOUT.as_secs(),
            hello_timeout_secs: DEFAULT_HELLO_TIMEOUT.as_secs(),
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT.as_millis() as u64,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Peer forwarding and the update queue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RouterConfig {
    /// Milliseconds per forward attempt.
    pub forward_timeout_ms: u64,
    /// Attempts per forward.
    pub forward_attempts: u32,
    /// Milliseconds between attempts.
    pub retry_delay_ms: u64,
    /// Pending updates the queue holds before intake pushes back.
    pub queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            forward_timeout_ms: DEFAULT_FORWARD_TIMEOUT.as_millis() as u64,
            forward_attempts: DEFAULT_FORWARD_ATTEMPTS,
            retry_delay_ms: DEFAULT_FORWARD_RETRY_DELAY.as_millis() as u64,
            queue_capacity: DEFAULT_UPDATE_QUEUE_CAPACITY,
        }
    }
}

/// Complete relay configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Host of the main (REST, and by default push) listener.
    pub host: String,
    /// Port of the main listener.
    pub port: u16,
    /// Host of a separate push listener. Defaults to `host`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_host: Option<String>,
    /// Port of a separate push listener. When unset or equal to `port`,
    /// push is served by the main listener.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,
    /// Shard membership.
    pub shard: ShardConfig,
    /// TLS for main and push listeners.
    pub tls: TlsConfig,
    /// Push connection handling.
    pub push: PushConfig,
    /// Forwarding and queueing.
    pub router: RouterConfig,
    /// Seconds shutdown waits for workers before aborting them.
    pub shutdown_grace_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ws_host: None,
            ws_port: None,
            shard: ShardConfig::default(),
            tls: TlsConfig::default(),
            push: PushConfig::default(),
            router: RouterConfig::default(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs(),
        }
    }
}

impl RelayConfig {
    /// Load from `path` (or `config.json` if present), apply env overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `PUSHRELAY_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("PUSHRELAY_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PUSHRELAY_PORT") {
            self.port = parse_env("PUSHRELAY_PORT", port, "port")?;
        }
        if let Some(host) = lookup("PUSHRELAY_WS_HOST") {
            self.ws_host = Some(host);
        }
        if let Some(port) = lookup("PUSHRELAY_WS_PORT") {
            self.ws_port = Some(parse_env("PUSHRELAY_WS_PORT", port, "port")?);
        }
        if let Some(host) = lookup("PUSHRELAY_SHARD_HOST") {
            self.shard.current_host = host;
        }
        if let Some(port) = lookup("PUSHRELAY_SHARD_PORT") {
            self.shard.port = parse_env("PUSHRELAY_SHARD_PORT", port, "port")?;
        }
        if let Some(nodes) = lookup("PUSHRELAY_SHARD_NODES") {
            self.shard.nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(max) = lookup("PUSHRELAY_MAX_CONNECTIONS") {
            self.push.max_connections = parse_env("PUSHRELAY_MAX_CONNECTIONS", max, "count")?;
        }
        if let Some(cert) = lookup("PUSHRELAY_TLS_CERT") {
            self.tls.cert_file = Some(PathBuf::from(cert));
        }
        if let Some(key) = lookup("PUSHRELAY_TLS_KEY") {
            self.tls.key_file = Some(PathBuf::from(key));
        }
        Ok(())
    }

    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(invalid("host", "must not be empty"));
        }
        if self.shard.current_host.trim().is_empty() {
            return Err(invalid("shard.current_host", "must not be empty"));
        }
        if self.shard.port == 0 && !self.shard.nodes.is_empty() {
            return Err(invalid("shard.port", "must be set when shard.nodes lists peers"));
        }
        if self.shard.port != 0 && (self.shard.port == self.port || Some(self.shard.port) == self.ws_port) {
            return Err(invalid("shard.port", "must differ from the REST and push ports"));
        }
        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(ConfigError::PartialTls);
        }
        if self.push.max_connections == 0 {
            return Err(invalid("push.max_connections", "must be at least 1"));
        }
        if self.push.ping_interval_secs == 0 || self.push.pong_timeout_secs == 0 {
            return Err(invalid("push", "keepalive windows must be at least 1 second"));
        }
        if self.push.hello_timeout_secs == 0 {
            return Err(invalid("push.hello_timeout_secs", "must be at least 1"));
        }
        if self.push.delivery_timeout_ms == 0 {
            return Err(invalid("push.delivery_timeout_ms", "must be at least 1"));
        }
        if self.router.forward_attempts == 0 {
            return Err(invalid("router.forward_attempts", "must be at least 1"));
        }
        if self.router.forward_timeout_ms == 0 {
            return Err(invalid("router.forward_timeout_ms", "must be at least 1"));
        }
        if self.router.queue_capacity == 0 {
            return Err(invalid("router.queue_capacity", "must be at least 1"));
        }
        if let Some(bad) = self.shard.nodes.iter().find(|n| !n.contains(':')) {
            return Err(invalid("shard.nodes", format!("{bad:?} is not host:port")));
        }
        Ok(())
    }

    /// Whether push is served on its own listener.
    pub fn separate_push_listener(&self) -> bool {
        match self.ws_port {
            Some(port) => port != self.port || self.push_host() != self.host,
            None => false,
        }
    }

    /// Host of the push listener.
    pub fn push_host(&self) -> &str {
        self.ws_host.as_deref().unwrap_or(&self.host)
    }

    /// This node's identity in the shard map.
    pub fn local_node(&self) -> NodeAddress {
        NodeAddress::new(format!("{}:{}", self.shard.current_host, self.shard.port))
    }

    /// Shard map over the configured nodes.
    pub fn shard_map(&self) -> ShardMap {
        ShardMap::new(
            self.local_node(),
            self.shard.nodes.iter().map(|n| NodeAddress::new(n.as_str())),
        )
    }

    /// Push session timing.
    pub fn push_settings(&self) -> PushSettings {
        PushSettings {
            ping_interval: Duration::from_secs(self.push.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.push.pong_timeout_secs),
            hello_timeout: Duration::from_secs(self.push.hello_timeout_secs),
            delivery_timeout: Duration::from_millis(self.push.delivery_timeout_ms),
        }
    }

    /// Forwarding knobs.
    pub fn forward_settings(&self) -> ForwardSettings {
        ForwardSettings {
            timeout: Duration::from_millis(self.router.forward_timeout_ms),
            attempts: self.router.forward_attempts,
            retry_delay: Duration::from_millis(self.router.retry_delay_ms),
        }
    }

    /// Grace period for shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn parse_env<T: std::str::FromStr>(
    var: &'static str,
    value: String,
    expected: &'static str,
) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            value,
            expected,
        })
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
