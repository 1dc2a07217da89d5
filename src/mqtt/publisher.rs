use super::error::{MqttError, TransportError};
use super::message_manager::{OutboundBatch, OutboundMessage};
use super::mqtt_handler::{ConnectionState, StatusSender};
use super::transport::{BrokerConnector, BrokerSession};
use crate::bus::{BusSubscriber, Message};
use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub sent: usize,
    pub failed: usize,
}

/// Sends outbound batches, one broker connection per batch.
#[derive(Clone)]
pub struct MqttPublisher {
    connector: Arc<dyn BrokerConnector>,
    status: StatusSender,
}

impl MqttPublisher {
    pub fn new(connector: Arc<dyn BrokerConnector>, status: StatusSender) -> Self {
        Self { connector, status }
    }

    /// Publishes every message of the batch in order.
    ///
    /// A message the broker rejects is logged and counted as failed; the
    /// remaining messages are still sent. Whenever the connection itself
    /// breaks, a new one is opened for the rest; if that fails, the rest of
    /// the batch is reported failed. Only a failure to open the initial
    /// connection is returned as an error.
    pub async fn publish_batch(
        &self,
        batch: impl Into<OutboundBatch>,
    ) -> Result<BatchReport, MqttError> {
        let batch = batch.into();
        if batch.is_empty() {
            return Ok(BatchReport::default());
        }

        if self.status.borrow().connection_state == ConnectionState::Failed {
            warn!(
                "MQTT adapter has failed, dropping batch of {} message(s)",
                batch.len()
            );
            return Ok(BatchReport {
                sent: 0,
                failed: batch.len(),
            });
        }

        let mut session = match self.connector.connect(&[]).await {
            Ok(session) => Some(session),
            Err(e) => {
                error!("Could not open publish connection: {}", e);
                self.record_failure(&e.to_string());
                return Err(e.into());
            }
        };

        let mut report = BatchReport::default();
        for message in batch {
            let Some(active) = session.as_mut() else {
                warn!("No broker connection left, dropping message for {}", message.topic);
                report.failed += 1;
                continue;
            };

            match Self::send(&mut **active, &message).await {
                Ok(()) => {
                    debug!("Published to {}", message.topic);
                    report.sent += 1;
                    self.record_sent();
                }
                Err(e) => {
                    error!("Failed to publish to {}: {}", message.topic, e);
                    report.failed += 1;
                    self.record_failure(&e.to_string());

                    if e.is_session_fatal() {
                        session = self.reopen().await;
                    }
                }
            }
        }

        if let Some(mut session) = session {
            session.close().await;
        }

        info!(
            "Batch published: {} sent, {} failed",
            report.sent, report.failed
        );
        Ok(report)
    }

    async fn send(
        session: &mut dyn BrokerSession,
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        let payload = message
            .payload
            .to_bytes()
            .map_err(|e| TransportError::Publish {
                topic: message.topic.clone(),
                reason: format!("payload could not be encoded: {}", e),
            })?;
        session.publish(&message.topic, payload).await
    }

    async fn reopen(&self) -> Option<Box<dyn BrokerSession>> {
        info!("Publish connection lost, reconnecting for the rest of the batch");
        match self.connector.connect(&[]).await {
            Ok(session) => Some(session),
            Err(e) => {
                error!("Reconnect for batch failed: {}", e);
                self.record_failure(&e.to_string());
                None
            }
        }
    }

    fn record_sent(&self) {
        self.status.send_modify(|status| {
            status.messages_sent += 1;
            status.last_activity = Some(Local::now());
        });
    }

    fn record_failure(&self, reason: &str) {
        self.status.send_modify(|status| {
            status.publish_failures += 1;
            status.push_error(reason.to_string());
        });
    }
}

/// Bus subscriber that turns messages on the outbound topic into broker
/// publishes. The payload is one `{topic, payload}` object or an array.
pub struct MqttBridge {
    publisher: MqttPublisher,
}

impl MqttBridge {
    pub fn new(publisher: MqttPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl BusSubscriber for MqttBridge {
    async fn on_message(&self, message: Arc<Message>) -> color_eyre::Result<()> {
        let batch = OutboundBatch::from_payload(&message.payload)?;
        let report = self.publisher.publish_batch(batch).await?;
        if report.failed > 0 {
            warn!(
                "{} of {} message(s) from {} were not published",
                report.failed,
                report.failed + report.sent,
                message.topic
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mqtt-bridge"
    }
}
