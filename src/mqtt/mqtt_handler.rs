//! Broker connection lifecycle with statum state machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!                     ▲   │           │
//!                     │   ▼           ▼
//!                  Reconnecting ◄─────┘
//!                        │
//!                        ▼
//!                     Failed (terminal)
//! ```
//!
//! Exactly one connection attempt is in flight at any time: the loop in
//! [`MQTTHandle::connect_and_listen`] owns the link and only moves it forward
//! one transition at a time. A successful handshake resets the attempt
//! counter; every failure increments it, and reaching the configured maximum
//! ends in `Failed`, which is reported as [`MqttError::RetriesExhausted`].

use super::config::MqttConfig;
use super::error::{MqttError, TransportError};
use super::message_manager::MQTTMessage;
use super::transport::{BrokerConnector, BrokerSession};
use crate::bus::EventBus;
use chrono::{DateTime, Local};
use serde_json::json;
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_ERROR_MESSAGES: usize = 50;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub reconnect_attempts: u32,
    /// Most recent transport errors, oldest first
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub publish_failures: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl MQTTStatus {
    pub(crate) fn push_error(&mut self, message: String) {
        if self.error_messages.len() == MAX_ERROR_MESSAGES {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }
}

/// Shared by the listening link and the outbound publisher.
pub type StatusSender = Arc<watch::Sender<MQTTStatus>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectSettings {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl From<&MqttConfig> for ReconnectSettings {
    fn from(config: &MqttConfig) -> Self {
        Self {
            max_attempts: config.reconnect_max_attempts,
            delay: config.reconnect_delay(),
        }
    }
}

/// Why the link left a healthy state.
#[derive(Debug, Clone)]
pub struct LinkFault {
    pub reason: String,
}

#[state]
#[derive(Debug, Clone)]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting(LinkFault),
    Failed(LinkFault),
}

#[machine]
pub struct MqttLink<S: LinkPhase> {
    connector: Arc<dyn BrokerConnector>,
    bus: EventBus,
    filters: Vec<String>,
    settings: ReconnectSettings,
    status: StatusSender,
    attempts: u32,
    session: Option<Box<dyn BrokerSession>>,
}

pub enum Handshake {
    Established(MqttLink<Connected>),
    Refused(MqttLink<Reconnecting>),
    Stopped(MqttLink<Disconnected>),
}

pub enum SessionEnd {
    Lost(MqttLink<Reconnecting>),
    Stopped(MqttLink<Disconnected>),
}

pub enum Backoff {
    Retry(MqttLink<Connecting>),
    Exhausted(MqttLink<Failed>),
    Stopped(MqttLink<Disconnected>),
}

impl<S: LinkPhase> MqttLink<S> {
    fn report(&self, state: ConnectionState) {
        debug!("MQTT link state: {:?}", state);
        let attempts = self.attempts;
        self.status.send_modify(|status| {
            status.connection_state = state;
            status.reconnect_attempts = attempts;
        });
    }

    fn record_fault(&mut self, error: &TransportError) -> LinkFault {
        self.attempts += 1;
        error!(
            "MQTT connection failed: {} (attempt {}/{})",
            error, self.attempts, self.settings.max_attempts
        );
        let attempts = self.attempts;
        self.status.send_modify(|status| {
            status.connection_state = ConnectionState::Reconnecting;
            status.reconnect_attempts = attempts;
            status.push_error(error.to_string());
        });
        LinkFault {
            reason: error.to_string(),
        }
    }
}

impl MqttLink<Disconnected> {
    pub fn create(
        connector: Arc<dyn BrokerConnector>,
        bus: EventBus,
        filters: Vec<String>,
        settings: ReconnectSettings,
        status: StatusSender,
    ) -> Self {
        Self::new(connector, bus, filters, settings, status, 0, None)
    }

    pub fn start(self) -> MqttLink<Connecting> {
        self.report(ConnectionState::Connecting);
        self.transition()
    }
}

impl MqttLink<Connecting> {
    /// Connects and subscribes. Any failure moves to `Reconnecting`.
    pub async fn establish(mut self, shutdown: &CancellationToken) -> Handshake {
        info!("Connecting to MQTT broker");
        let attempt = {
            let connector = self.connector.clone();
            let filters = self.filters.clone();
            tokio::select! {
                _ = shutdown.cancelled() => None,
                result = connector.connect(&filters) => Some(result),
            }
        };

        match attempt {
            None => Handshake::Stopped(self.stop()),
            Some(Ok(session)) => {
                self.session = Some(session);
                self.attempts = 0;
                self.report(ConnectionState::Connected);
                Handshake::Established(self.transition())
            }
            Some(Err(e)) => {
                let fault = self.record_fault(&e);
                Handshake::Refused(self.transition_with(fault))
            }
        }
    }

    fn stop(self) -> MqttLink<Disconnected> {
        self.report(ConnectionState::Disconnected);
        self.transition()
    }
}

impl MqttLink<Connected> {
    /// Forwards broker messages into the bus until the session breaks or
    /// shutdown is requested.
    pub async fn listen(mut self, shutdown: &CancellationToken) -> SessionEnd {
        let Some(mut session) = self.session.take() else {
            let fault = self.record_fault(&TransportError::Closed);
            return SessionEnd::Lost(self.transition_with(fault));
        };
        info!("Connected to MQTT broker, listening on {:?}", self.filters);

        let failure = loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = session.next_message() => Some(next),
            };
            match next {
                None => {
                    session.close().await;
                    return SessionEnd::Stopped(self.stop());
                }
                Some(Ok(message)) => self.forward(message),
                Some(Err(e)) => break e,
            }
        };

        let fault = self.record_fault(&failure);
        SessionEnd::Lost(self.transition_with(fault))
    }

    /// Inbound path: `{"payload": <decoded text>}` on the message's own topic.
    fn forward(&self, message: MQTTMessage) {
        let text = match message.decode_payload() {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    "Skipping message on {}: payload is not valid UTF-8 ({})",
                    message.topic, e
                );
                return;
            }
        };

        debug!("Received {}", message);
        if let Err(e) = self.bus.publish(&message.topic, json!({ "payload": text })) {
            warn!("Could not forward message on {} to bus: {}", message.topic, e);
            return;
        }

        self.status.send_modify(|status| {
            status.messages_received += 1;
            status.last_activity = Some(Local::now());
        });
    }

    fn stop(self) -> MqttLink<Disconnected> {
        self.report(ConnectionState::Disconnected);
        self.transition()
    }
}

impl MqttLink<Reconnecting> {
    /// Waits the fixed delay, or gives up once the attempt cap is reached.
    pub async fn backoff(self, shutdown: &CancellationToken) -> Backoff {
        if self.attempts >= self.settings.max_attempts {
            error!("Max reconnect attempts reached. Could not establish MQTT connection.");
            let fault = self.get_state_data().cloned().unwrap_or(LinkFault {
                reason: "unknown".to_string(),
            });
            self.report(ConnectionState::Failed);
            return Backoff::Exhausted(self.transition_with(fault));
        }

        let delay = self.settings.delay;
        warn!("Reconnecting in {} seconds...", delay.as_secs());
        tokio::select! {
            _ = shutdown.cancelled() => return Backoff::Stopped(self.stop()),
            _ = tokio::time::sleep(delay) => {}
        }

        self.report(ConnectionState::Connecting);
        Backoff::Retry(self.transition())
    }

    fn stop(self) -> MqttLink<Disconnected> {
        self.report(ConnectionState::Disconnected);
        self.transition()
    }
}

impl MqttLink<Failed> {
    pub fn into_error(self) -> MqttError {
        if let Some(fault) = self.get_state_data() {
            error!("Last MQTT error before giving up: {}", fault.reason);
        }
        MqttError::RetriesExhausted {
            attempts: self.attempts,
        }
    }
}

/// Owns the listening side of the adapter.
pub struct MQTTHandle {
    connector: Arc<dyn BrokerConnector>,
    bus: EventBus,
    filters: Vec<String>,
    settings: ReconnectSettings,
    status: StatusSender,
}

impl MQTTHandle {
    pub fn new(connector: Arc<dyn BrokerConnector>, bus: EventBus, config: &MqttConfig) -> Self {
        let (status, _) = watch::channel(MQTTStatus::default());
        Self {
            connector,
            bus,
            filters: config.subbed_topics.clone(),
            settings: ReconnectSettings::from(config),
            status: Arc::new(status),
        }
    }

    pub fn status(&self) -> watch::Receiver<MQTTStatus> {
        self.status.subscribe()
    }

    pub fn status_sender(&self) -> StatusSender {
        self.status.clone()
    }

    /// Runs the link until shutdown (`Ok`) or until retries are exhausted.
    pub async fn connect_and_listen(self, shutdown: CancellationToken) -> Result<(), MqttError> {
        let mut connecting = MqttLink::create(
            self.connector,
            self.bus,
            self.filters,
            self.settings,
            self.status,
        )
        .start();

        loop {
            let reconnecting = match connecting.establish(&shutdown).await {
                Handshake::Established(connected) => match connected.listen(&shutdown).await {
                    SessionEnd::Lost(reconnecting) => reconnecting,
                    SessionEnd::Stopped(_) => break,
                },
                Handshake::Refused(reconnecting) => reconnecting,
                Handshake::Stopped(_) => break,
            };

            connecting = match reconnecting.backoff(&shutdown).await {
                Backoff::Retry(next) => next,
                Backoff::Exhausted(failed) => return Err(failed.into_error()),
                Backoff::Stopped(_) => break,
            };
        }

        info!("MQTT listener stopped");
        Ok(())
    }
}
