use crate::config::ConfigError;
use thiserror::Error;

/// Failures reported by a broker session.
///
/// `Publish` leaves the session usable; every other variant means the
/// session is gone and has to be re-established.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscription to '{topic}' rejected: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Broker closed the session")]
    Closed,
}

impl TransportError {
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, TransportError::Publish { .. })
    }
}

/// Errors surfaced by the MQTT adapter to its supervisor.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Max reconnect attempts ({attempts}) reached, giving up on the MQTT broker")]
    RetriesExhausted { attempts: u32 },

    #[error("Invalid outbound batch: {0}")]
    InvalidBatch(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl MqttError {
    /// Errors that must end the application instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MqttError::Config(_) | MqttError::RetriesExhausted { .. }
        )
    }
}
