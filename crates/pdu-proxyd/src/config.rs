use pdu_proxy::{HalfExchange, SessionConfig};
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub framing: FramingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
            session: SessionConfig::default(),
            handshake: HandshakeConfig::default(),
            framing: FramingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    #[serde(default = "default_upstream")]
    pub upstream_addr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            upstream_addr: default_upstream(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Where the key halves live in the first message of each side. Unset
/// fields accept anything.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default)]
    pub client_tag: Option<u16>,
    #[serde(default)]
    pub server_tag: Option<u16>,
    #[serde(default)]
    pub half_len: Option<usize>,
}

impl HandshakeConfig {
    pub fn exchange(&self) -> HalfExchange {
        let mut exchange = HalfExchange::new();
        if let Some(tag) = self.client_tag {
            exchange = exchange.client_tag(tag);
        }
        if let Some(tag) = self.server_tag {
            exchange = exchange.server_tag(tag);
        }
        if let Some(len) = self.half_len {
            exchange = exchange.half_len(len);
        }
        exchange
    }
}

#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "127.0.0.1:9339".to_string()
}

fn default_upstream() -> String {
    "127.0.0.1:9340".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_frame_len() -> usize {
    1 << 20
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned and a
/// warning is emitted.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}
