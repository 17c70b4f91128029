use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::ConnectionOptions;
use notify::connection::{DEFAULT_IDENTITY, DEFAULT_QUEUE_CAPACITY, DEFAULT_RETRY_INTERVAL};
use proto::{ConfigError, Metadata, TransportErrorKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// File name looked up in the working directory.
const LOCAL_CONFIG_FILE: &str = "notifyd.toml";

/// Connection defaults shared by every peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Outbound queue capacity per peer.
    pub queue_capacity: usize,
    /// Delay between connect attempts, in milliseconds.
    pub retry_interval_ms: u64,
    /// Value sent under the `gid` metadata key.
    pub identity: String,
    /// Error kinds that do not drop the live stream.
    pub tolerated_errors: Vec<TransportErrorKind>,
    /// Re-send the connect envelope on every reopened stream.
    pub announce_on_reconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            identity: DEFAULT_IDENTITY.to_string(),
            tolerated_errors: Vec::new(),
            announce_on_reconnect: true,
        }
    }
}

impl ConnectionConfig {
    /// Options for a connection using these defaults.
    pub fn options(&self) -> ConnectionOptions {
        let mut options = ConnectionOptions::default()
            .with_queue_capacity(self.queue_capacity)
            .with_retry_interval(Duration::from_millis(self.retry_interval_ms))
            .with_identity(self.identity.clone());
        for kind in &self.tolerated_errors {
            options = options.tolerate(*kind);
        }
        options.announce_on_reconnect = self.announce_on_reconnect;
        options
    }
}

/// One downstream peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    /// Name producers use to address this peer.
    pub name: String,
    /// `host:port` of the peer's QUIC endpoint.
    pub addr: String,
    /// TLS server name to validate.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// PEM file with the certificate(s) to trust for this peer.
    pub ca_cert: PathBuf,
    /// Overrides `[connection].identity` for this peer.
    #[serde(default)]
    pub identity: Option<String>,
    /// Extra metadata sent when opening a stream.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

impl PeerConfig {
    /// Parses `addr` as a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr.parse().map_err(|e| ConfigError::InvalidValue {
            field: format!("peers.{}.addr", self.name),
            reason: format!("{e}"),
        })
    }

    /// Connection options for this peer, layered over `defaults`.
    pub fn options(&self, defaults: &ConnectionConfig) -> ConnectionOptions {
        let mut options = defaults
            .options()
            .with_metadata(Metadata::pairs(self.metadata.clone()));
        if let Some(identity) = &self.identity {
            options = options.with_identity(identity.clone());
        }
        options
    }
}

/// Peer-side demo server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the demo peer listens on.
    pub bind: String,
    /// PEM certificate; a self-signed one is generated when unset.
    pub cert: Option<PathBuf>,
    /// PEM private key matching `cert`.
    pub key: Option<PathBuf>,
    /// Where to write the generated certificate for clients to trust.
    pub cert_out: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4433".to_string(),
            cert: None,
            key: None,
            cert_out: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind.parse().map_err(|e| ConfigError::InvalidValue {
            field: "server.bind".to_string(),
            reason: format!("{e}"),
        })
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub peers: Vec<PeerConfig>,
    pub server: ServerConfig,
}

impl Config {
    /// Load config from an explicit path, the working directory or `~/.notifyd/`.
    ///
    /// Falls back to defaults when no file exists. Environment overrides are
    /// applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            let cwd = std::env::current_dir().ok()?.join(LOCAL_CONFIG_FILE);
            if cwd.exists() {
                return Some(cwd);
            }
            let home_config = Self::home_dir()?.join("config.toml");
            if home_config.exists() {
                return Some(home_config);
            }
            None
        });
        debug!(path = ?config_path, "Config file resolved");

        let mut config = match config_path {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;

        debug!(
            peers = config.peers.len(),
            identity = %config.connection.identity,
            queue_capacity = config.connection.queue_capacity,
            "Config loaded"
        );
        Ok(config)
    }

    /// Parses a TOML file without applying overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    /// `~/.notifyd`, if `HOME` is set.
    pub fn home_dir() -> Option<PathBuf> {
        let home = std::env::var("HOME").ok()?;
        Some(PathBuf::from(home).join(".notifyd"))
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(identity) = std::env::var("NOTIFYD_IDENTITY") {
            self.connection.identity = identity;
        }
        if let Ok(capacity) = std::env::var("NOTIFYD_QUEUE_CAPACITY") {
            self.connection.queue_capacity =
                capacity.parse().map_err(|e| ConfigError::InvalidValue {
                    field: "NOTIFYD_QUEUE_CAPACITY".to_string(),
                    reason: format!("{e}"),
                })?;
        }
        if let Ok(interval) = std::env::var("NOTIFYD_RETRY_INTERVAL_MS") {
            self.connection.retry_interval_ms =
                interval.parse().map_err(|e| ConfigError::InvalidValue {
                    field: "NOTIFYD_RETRY_INTERVAL_MS".to_string(),
                    reason: format!("{e}"),
                })?;
        }
        if let Ok(bind) = std::env::var("NOTIFYD_BIND") {
            self.server.bind = bind;
        }
        Ok(())
    }

    /// Rejects values no connection could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connection.queue_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.connection.identity.is_empty() {
            return Err(ConfigError::MissingField("connection.identity".to_string()));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.name.is_empty() {
                return Err(ConfigError::MissingField("peers.name".to_string()));
            }
            if !seen.insert(peer.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "peers.name".to_string(),
                    reason: format!("duplicate peer name {}", peer.name),
                });
            }
            peer.socket_addr()?;
        }
        Ok(())
    }
}
