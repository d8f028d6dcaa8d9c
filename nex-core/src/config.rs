//! Configuration management for nex
//!
//! Config files are stored in platform-appropriate locations:
//! - Linux: ~/.config/nex/
//! - macOS: ~/Library/Application Support/nex/
//! - Windows: %APPDATA%\nex\
//!
//! `NEX_CONFIG` overrides the location.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::auth::{self, AuthError};

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV: &str = "NEX_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoDirFound,

    #[error("Invalid JWT secret (must be base64): {0}")]
    InvalidSecret(#[from] base64::DecodeError),

    #[error("Failed to hash default password: {0}")]
    Credentials(#[from] AuthError),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Verbose logging
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub server: ServerConfig,

    /// Single operator account
    #[serde(default)]
    pub user: UserConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// HTTP/WebSocket listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL handed to clients for the socket, e.g. `wss://host:9384`.
    /// Defaults to `ws://<listen_addr>:<port>`.
    pub public_socket_url: Option<String>,

    /// JWT secret (base64 encoded)
    /// If not set, a random secret is generated on startup
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default = "default_username")]
    pub username: String,

    /// Argon2 PHC string. Login is refused while unset.
    pub password_hash: Option<String>,
}

/// Hub and token lifetimes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_login_ttl")]
    pub login_ttl_secs: u64,

    /// Per-session outbound queue depth before the client counts as slow
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// How long before expiry the "session expiring" notice goes out
    #[serde(default = "default_expiry_warning")]
    pub expiry_warning_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,

    /// Route prefix used when rewriting local album-art paths
    #[serde(default = "default_art_route")]
    pub art_route_prefix: String,
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    crate::DEFAULT_PORT
}
fn default_username() -> String {
    "admin".to_string()
}
fn default_tick_interval() -> u64 {
    1000
}
fn default_session_ttl() -> u64 {
    auth::SESSION_TOKEN_TTL
}
fn default_login_ttl() -> u64 {
    auth::LOGIN_TOKEN_TTL
}
fn default_outbound_capacity() -> usize {
    256
}
fn default_expiry_warning() -> u64 {
    240 // 4 minutes
}
fn default_refresh_interval() -> u64 {
    1000
}
fn default_art_route() -> String {
    "/v1/img/tmp".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            public_socket_url: None,
            jwt_secret: None,
        }
    }
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password_hash: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            session_ttl_secs: default_session_ttl(),
            login_ttl_secs: default_login_ttl(),
            outbound_capacity: default_outbound_capacity(),
            expiry_warning_secs: default_expiry_warning(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval(),
            art_route_prefix: default_art_route(),
        }
    }
}

impl ServerConfig {
    /// Decoded signing secret, if one is configured
    pub fn secret_bytes(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.jwt_secret
            .as_deref()
            .map(|s| base64::engine::general_purpose::STANDARD.decode(s))
            .transpose()
            .map_err(ConfigError::from)
    }

    /// Base URL clients should dial for the socket
    pub fn socket_base_url(&self) -> String {
        match &self.public_socket_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("ws://{}:{}", self.listen_addr, self.port),
        }
    }
}

impl SessionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn expiry_warning(&self) -> Duration {
        Duration::from_secs(self.expiry_warning_secs)
    }
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join("nex"))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path, honouring `NEX_CONFIG`
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from default location, writing a fresh one on first run
    pub fn load_or_init() -> Result<Self, ConfigError> {
        Self::load_or_init_at(&Self::config_path()?)
    }

    /// Load config from `path`, writing a fresh one if it does not exist.
    ///
    /// A fresh config carries a random signing secret and the default
    /// `admin`/`admin` credentials.
    pub fn load_or_init_at(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load_from(path);
        }

        let config = Self::fresh()?;
        config.save_to(path)?;
        tracing::info!("Wrote default config to {}", path.display());
        Ok(config)
    }

    /// Default config with generated secret and default credentials
    pub fn fresh() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.server.jwt_secret =
            Some(base64::engine::general_purpose::STANDARD.encode(auth::generate_secret()));
        config.user.password_hash = Some(auth::hash_password("admin")?);
        Ok(config)
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
