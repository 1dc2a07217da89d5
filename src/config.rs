//! Application configuration loaded from a TOML file
//!
//! The file lives at `<config dir>/loxone2mqtt/config.toml` unless
//! `LOXONE2MQTT_CONFIG` points somewhere else. A missing file falls back to
//! defaults so the bridge can start against a local broker; a file that
//! exists but does not parse is an error.

use crate::bus::{Topic, TopicError, TopicPattern};
use crate::mqtt::config::MqttConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};

const CONFIG_ENV: &str = "LOXONE2MQTT_CONFIG";
const CONFIG_DIR: &str = "loxone2mqtt";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("No MQTT broker configured")]
    MissingBroker,

    #[error("TLS is enabled, but no CA certificate file is configured")]
    MissingTlsCertificate,

    #[error("Failed to read TLS CA certificate {path}: {source}")]
    TlsCertificate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid topic in {field}: {source}")]
    InvalidTopic {
        field: &'static str,
        source: TopicError,
    },

    #[error("QoS must be 0, 1 or 2, got {0}")]
    InvalidQos(u8),

    #[error("Unknown log level '{0}'")]
    InvalidLogLevel(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Bus topics the bridge components meet on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Controller batches destined for the broker
    pub outbound_topic: String,
    /// Topic (inside a batch) carrying the controller structure document
    pub structure_topic: String,
    pub homeassistant_discovery: bool,
    pub discovery_topic: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            outbound_topic: "loxone2mqtt".to_string(),
            structure_topic: "loxone2mqtt/LoxAPP3".to_string(),
            homeassistant_discovery: false,
            discovery_topic: "mqttDiscovery".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        TopicPattern::parse(&self.outbound_topic).map_err(|source| ConfigError::InvalidTopic {
            field: "bridge.outbound_topic",
            source,
        })?;
        Topic::parse(&self.structure_topic).map_err(|source| ConfigError::InvalidTopic {
            field: "bridge.structure_topic",
            source,
        })?;
        Topic::parse(&self.discovery_topic).map_err(|source| ConfigError::InvalidTopic {
            field: "bridge.discovery_topic",
            source,
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub mqtt: MqttConfig,
    pub bridge: BridgeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            mqtt: MqttConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads from `$LOXONE2MQTT_CONFIG` or the default location.
    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    /// Fail-fast validation, run before any task starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log_level()?;
        self.mqtt.validate()?;
        self.bridge.validate()
    }
}

fn default_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}
