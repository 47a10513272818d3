//! YAML settings for the daemon and its clients.
//!
//! Settings live in `homedb.yaml` inside the config directory. The file is
//! optional and every key has a default:
//!
//! ```yaml
//! server:
//!   endpoint: unix:/home/me/.config/homedb/homedb.sock
//!   max_frame_bytes: 16777216
//!   accept_poll_ms: 50
//! client:
//!   endpoint: tcp:hub.local:7411
//!   request_timeout_ms: 10000
//!   handshake_challenge: flimfniffle
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Endpoint;
use crate::wire::DEFAULT_MAX_FRAME_BYTES;


/// Environment variable overriding the config directory.
pub const CONFIG_DIR_ENV: &str = "HOMEDB_CONFIG_DIR";

pub const CONFIG_FILE: &str = "homedb.yaml";

pub const SOCKET_FILE: &str = "homedb.sock";

/// Default handshake challenge string.
pub const DEFAULT_CHALLENGE: &str = "flimfniffle";


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}


/// Daemon-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unset means the socket file inside the config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    pub max_frame_bytes: usize,
    /// How long one non-blocking accept poll waits before re-checking
    /// for shutdown.
    pub accept_poll_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            endpoint: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            accept_poll_ms: 50,
        }
    }
}

impl ServerConfig {
    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }
}


/// Client-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    pub max_frame_bytes: usize,
    /// Bound applied by the synchronous calls. `0` waits forever.
    pub request_timeout_ms: u64,
    pub handshake_challenge: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoint: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            request_timeout_ms: 10_000,
            handshake_challenge: DEFAULT_CHALLENGE.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.request_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}


/// Everything in `homedb.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Settings {
    /// Load `homedb.yaml` from `config_dir`, or defaults if it is absent.
    /// Unset endpoints are filled in with the directory's socket file.
    pub fn load(config_dir: &Path) -> Result<Settings, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            Settings::parse(&content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            Settings::default()
        };
        settings.resolve_endpoints(config_dir);
        Ok(settings)
    }

    pub fn parse(content: &str) -> Result<Settings, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }
        serde_yaml::from_str(content)
    }

    fn resolve_endpoints(&mut self, config_dir: &Path) {
        let socket = Endpoint::Unix(config_dir.join(SOCKET_FILE));
        if self.server.endpoint.is_none() {
            self.server.endpoint = Some(socket.clone());
        }
        if self.client.endpoint.is_none() {
            self.client.endpoint = self.server.endpoint.clone().or(Some(socket));
        }
    }

    pub fn server_endpoint(&self) -> Endpoint {
        self.server
            .endpoint
            .clone()
            .unwrap_or_else(|| Endpoint::Unix(PathBuf::from(SOCKET_FILE)))
    }

    pub fn client_endpoint(&self) -> Endpoint {
        self.client
            .endpoint
            .clone()
            .unwrap_or_else(|| self.server_endpoint())
    }
}


/// `$HOMEDB_CONFIG_DIR`, else `$HOME/.config/homedb`.
pub fn resolve_config_dir() -> PathBuf {
    config_dir_from(|key| std::env::var(key).ok())
}

fn config_dir_from(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(dir) = lookup(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let home = lookup("HOME").unwrap_or_else(|| "/tmp".into());
    PathBuf::from(home).join(".config").join("homedb")
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
