//! Configuration module
//!
//! Handles loading and saving ChatRelay configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::NetworkConfig as NetConfig;
use crate::protocol::{DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, IDENTITY_SIZE};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Retransmission settings
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

/// General configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name used at login (defaults to the host name)
    pub identity: Option<String>,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
    /// Log file path (optional)
    pub log_file: Option<PathBuf>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Control channel port
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Datagram port
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_udp_port() -> u16 {
    DEFAULT_UDP_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host name or address
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

/// Retransmission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Age in ms after which an unacknowledged datagram is resent
    #[serde(default = "default_retransmit_timeout")]
    pub retransmit_timeout_ms: u64,
    /// Sweep period in ms
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    /// Resends before giving up (0 = never give up)
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,
}

fn default_retransmit_timeout() -> u64 {
    2000
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_max_retransmits() -> u32 {
    5
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout_ms: default_retransmit_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            max_retransmits: default_max_retransmits(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the network layer cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        let reliability = &self.reliability;
        if reliability.retransmit_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "reliability.retransmit_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if reliability.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reliability.sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        if reliability.sweep_interval_ms >= reliability.retransmit_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "reliability.sweep_interval_ms ({}) must be shorter than retransmit_timeout_ms ({})",
                reliability.sweep_interval_ms, reliability.retransmit_timeout_ms
            )));
        }
        Ok(())
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("chatrelay/config.toml")),
            Some(PathBuf::from("./chatrelay.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the login identity, falling back to the host name
    ///
    /// The host name is cut to the identity field width so it always encodes.
    pub fn identity(&self) -> String {
        if let Some(identity) = &self.general.identity {
            return identity.clone();
        }

        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        truncate_identity(&host)
    }

    /// Network settings for the server side
    pub fn server_network(&self) -> NetConfig {
        self.with_reliability(NetConfig::new(
            self.server.bind_address.clone(),
            self.server.tcp_port,
            self.server.udp_port,
        ))
    }

    /// Network settings for the client side
    pub fn client_network(&self) -> NetConfig {
        let mut config = NetConfig::new(
            self.client.server_host.clone(),
            self.client.tcp_port,
            self.client.udp_port,
        );
        config.connect_timeout_ms = self.client.connect_timeout_ms;
        self.with_reliability(config)
    }

    fn with_reliability(&self, config: NetConfig) -> NetConfig {
        config
            .with_retransmit(
                Duration::from_millis(self.reliability.retransmit_timeout_ms),
                Duration::from_millis(self.reliability.sweep_interval_ms),
            )
            .with_max_retransmits(self.reliability.max_retransmits)
    }
}

fn truncate_identity(name: &str) -> String {
    let mut end = name.len().min(IDENTITY_SIZE);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            identity: Some("alice".to_string()),
            verbose: false,
            log_file: None,
        },
        client: ClientConfig {
            server_host: "chat.example.org".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}
