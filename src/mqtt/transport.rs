//! Broker seam
//!
//! The adapter talks to the broker only through [`BrokerConnector`] and
//! [`BrokerSession`]. [`RumqttConnector`] is the production implementation
//! on top of `rumqttc`; tests use the scripted broker in `test_support`.

use super::config::MqttConfig;
use super::error::TransportError;
use super::message_manager::MQTTMessage;
use crate::config::ConfigError;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    TlsConfiguration, Transport,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Opens broker sessions. One session is one network connection.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Connects and subscribes to every filter before returning.
    async fn connect(&self, filters: &[String]) -> Result<Box<dyn BrokerSession>, TransportError>;
}

#[async_trait]
pub trait BrokerSession: Send {
    /// Sends one message and waits until the configured QoS is satisfied.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Next message on a subscribed topic.
    async fn next_message(&mut self) -> Result<MQTTMessage, TransportError>;

    async fn close(&mut self);
}

pub struct RumqttConnector {
    config: MqttConfig,
    qos: QoS,
    tls_ca: Option<Vec<u8>>,
}

impl RumqttConnector {
    /// Validates the configuration and loads the CA certificate up front, so
    /// TLS problems surface before the first connection attempt.
    pub async fn from_config(config: &MqttConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let tls_ca = if config.tls {
            let path = config
                .tls_cert
                .as_ref()
                .ok_or(ConfigError::MissingTlsCertificate)?;
            let ca = tokio::fs::read(path)
                .await
                .map_err(|source| ConfigError::TlsCertificate {
                    path: path.clone(),
                    source,
                })?;
            info!("Loaded TLS CA certificate from {}", path.display());
            Some(ca)
        } else {
            None
        };

        Ok(Self {
            qos: config.qos()?,
            config: config.clone(),
            tls_ca,
        })
    }

    fn options(&self) -> MqttOptions {
        let suffix = Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-{}", self.config.client_id, &suffix[..8]);

        let mut options = MqttOptions::new(client_id, self.config.broker.clone(), self.config.port);
        options.set_keep_alive(self.config.keep_alive());
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        if let Some(ca) = &self.tls_ca {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: None,
            }));
        }
        options
    }
}

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn connect(&self, filters: &[String]) -> Result<Box<dyn BrokerSession>, TransportError> {
        let (client, eventloop) = AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);
        let mut session = RumqttSession {
            client,
            eventloop,
            qos: self.qos,
            retain: self.config.retain,
            pending: VecDeque::new(),
        };

        session.await_connack().await?;
        debug!(
            "Connected to {}:{}",
            self.config.broker, self.config.port
        );
        for filter in filters {
            session.subscribe(filter).await?;
        }
        Ok(Box::new(session))
    }
}

struct RumqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    qos: QoS,
    retain: bool,
    /// Publishes that arrived while waiting for something else
    pending: VecDeque<MQTTMessage>,
}

impl RumqttSession {
    async fn poll(&mut self) -> Result<Event, TransportError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Disconnect)) => Err(TransportError::Closed),
            Ok(event) => Ok(event),
            Err(e) => Err(TransportError::Connection(e.to_string())),
        }
    }

    async fn await_connack(&mut self) -> Result<(), TransportError> {
        loop {
            if let Event::Incoming(Packet::ConnAck(_)) = self.poll().await? {
                return Ok(());
            }
        }
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, self.qos)
            .await
            .map_err(|e| TransportError::Subscription {
                topic: filter.to_string(),
                reason: e.to_string(),
            })?;

        loop {
            match self.poll().await? {
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(TransportError::Subscription {
                            topic: filter.to_string(),
                            reason: "rejected by broker".to_string(),
                        });
                    }
                    debug!("Subscribed to {}", filter);
                    return Ok(());
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    self.pending
                        .push_back(MQTTMessage::from_topic(publish.topic, publish.payload.to_vec()));
                }
                _ => {}
            }
        }
    }

    fn is_delivered(&self, event: &Event) -> bool {
        match (self.qos, event) {
            (QoS::AtMostOnce, Event::Outgoing(Outgoing::Publish(_))) => true,
            (QoS::AtLeastOnce, Event::Incoming(Packet::PubAck(_))) => true,
            (QoS::ExactlyOnce, Event::Incoming(Packet::PubComp(_))) => true,
            _ => false,
        }
    }
}

#[async_trait]
impl BrokerSession for RumqttSession {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(topic, self.qos, self.retain, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        loop {
            let event = self.poll().await?;
            if self.is_delivered(&event) {
                return Ok(());
            }
            if let Event::Incoming(Packet::Publish(publish)) = event {
                self.pending
                    .push_back(MQTTMessage::from_topic(publish.topic, publish.payload.to_vec()));
            }
        }
    }

    async fn next_message(&mut self) -> Result<MQTTMessage, TransportError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        loop {
            if let Event::Incoming(Packet::Publish(publish)) = self.poll().await? {
                return Ok(MQTTMessage::from_topic(publish.topic, publish.payload.to_vec()));
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request not accepted: {}", e);
            return;
        }
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("Broker did not acknowledge disconnect in time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_missing_ca_file_is_a_config_error() {
        let config = MqttConfig {
            tls: true,
            tls_cert: Some(PathBuf::from("/nonexistent/loxone2mqtt/ca.pem")),
            ..Default::default()
        };
        assert!(matches!(
            RumqttConnector::from_config(&config).await,
            Err(ConfigError::TlsCertificate { .. })
        ));
    }

    #[tokio::test]
    async fn test_tls_flag_without_path_fails_before_connecting() {
        let config = MqttConfig {
            tls: true,
            ..Default::default()
        };
        assert!(matches!(
            RumqttConnector::from_config(&config).await,
            Err(ConfigError::MissingTlsCertificate)
        ));
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_transport_error() {
        // Nothing listens on port 1 of the loopback interface.
        let config = MqttConfig {
            broker: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };
        let connector = RumqttConnector::from_config(&config).await.unwrap();
        let result = connector.connect(&config.subbed_topics).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn test_client_ids_are_unique_per_connection() {
        let connector = RumqttConnector::from_config(&MqttConfig::default())
            .await
            .unwrap();
        let first = connector.options().client_id();
        let second = connector.options().client_id();
        assert_ne!(first, second);
        assert!(first.starts_with("loxone2mqtt-"));
    }
}
