use crate::bus::TopicPattern;
use crate::config::ConfigError;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    /// CA certificate (PEM); required when `tls` is set
    pub tls_cert: Option<PathBuf>,
    /// Filters subscribed on every (re)connect
    #[serde(alias = "topics")]
    pub subbed_topics: Vec<String>,
    /// Prefix; every connection appends a unique suffix
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub qos: u8,
    pub retain: bool,
    pub reconnect_max_attempts: u32,
    pub reconnect_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            tls: false,
            tls_cert: None,
            subbed_topics: vec!["mqtt2loxone/#".to_string()],
            client_id: "loxone2mqtt".to_string(),
            keep_alive_secs: 30,
            qos: 0,
            retain: false,
            reconnect_max_attempts: 10,
            reconnect_delay_secs: 10,
        }
    }
}

impl MqttConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn qos(&self) -> Result<QoS, ConfigError> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ConfigError::InvalidQos(other)),
        }
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.trim().is_empty() {
            return Err(ConfigError::MissingBroker);
        }
        if self.tls && self.tls_cert.is_none() {
            return Err(ConfigError::MissingTlsCertificate);
        }
        if self.reconnect_max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "mqtt.reconnect_max_attempts must be at least 1".to_string(),
            ));
        }
        self.qos()?;
        for filter in &self.subbed_topics {
            TopicPattern::parse(filter).map_err(|source| ConfigError::InvalidTopic {
                field: "mqtt.subbed_topics",
                source,
            })?;
        }
        Ok(())
    }
}
