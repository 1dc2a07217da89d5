//! # Addons
//!
//! Optional components that watch the controller's outbound batches and react
//! to them without touching the MQTT adapter.
//!
//! Every addon implements [`Addon`] and is attached to the bus through
//! [`AddonSubscriber`], subscribed on the same outbound topic as the MQTT
//! bridge. Addons only ever see whole batches, already decoded.
//!
//! ```text
//! addons/
//! ├── mod.rs            - Addon trait, AddonSubscriber, StructureRecorder
//! └── homeassistant.rs  - Home Assistant MQTT discovery announcements
//! ```

pub mod homeassistant;

use crate::bus::{topic_matches, BusSubscriber, Message};
use crate::mqtt::message_manager::{OutboundBatch, OutboundMessage};
use crate::structure::StructureCell;
use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait Addon: Send + Sync + 'static {
    async fn on_batch(&self, messages: &[OutboundMessage]) -> Result<()>;

    fn name(&self) -> &str;
}

/// Bus adapter for an [`Addon`].
pub struct AddonSubscriber<A: Addon> {
    addon: A,
}

impl<A: Addon> AddonSubscriber<A> {
    pub fn new(addon: A) -> Self {
        Self { addon }
    }
}

#[async_trait]
impl<A: Addon> BusSubscriber for AddonSubscriber<A> {
    async fn on_message(&self, message: Arc<Message>) -> Result<()> {
        let batch = OutboundBatch::from_payload(&message.payload)?;
        debug!(
            "Addon {} received {} message(s)",
            self.addon.name(),
            batch.len()
        );
        self.addon.on_batch(batch.messages()).await
    }

    fn name(&self) -> &str {
        self.addon.name()
    }
}

/// Keeps the [`StructureCell`] up to date with the structure document the
/// controller sends on `structure_topic`.
pub struct StructureRecorder {
    structure_topic: String,
    cell: Arc<StructureCell>,
}

impl StructureRecorder {
    pub fn new(structure_topic: impl Into<String>, cell: Arc<StructureCell>) -> Self {
        Self {
            structure_topic: structure_topic.into(),
            cell,
        }
    }
}

#[async_trait]
impl Addon for StructureRecorder {
    async fn on_batch(&self, messages: &[OutboundMessage]) -> Result<()> {
        for message in messages {
            if !topic_matches(&self.structure_topic, &message.topic) {
                continue;
            }
            match message.payload.parse_json() {
                Ok(document) if document.is_object() => {
                    self.cell.store(document);
                }
                Ok(_) => warn!("Structure document on {} is not an object", message.topic),
                Err(e) => warn!(
                    "Structure document on {} is not valid JSON: {}",
                    message.topic, e
                ),
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "structure-recorder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_recorder_stores_structure_from_batch() {
        let cell = Arc::new(StructureCell::new());
        let reader = cell.reader();
        let recorder = StructureRecorder::new("loxone2mqtt/LoxAPP3", cell.clone());

        recorder
            .on_batch(&[
                OutboundMessage::new("loxone2mqtt/0f1a/state", "1.0"),
                OutboundMessage::new(
                    "loxone2mqtt/LoxAPP3",
                    json!({"softwareVersion": [14, 2, 3], "controls": {}}),
                ),
            ])
            .await
            .unwrap();

        let snapshot = reader.latest().unwrap();
        assert_eq!(snapshot.software_version().as_deref(), Some("14.2.3"));
    }

    #[tokio::test]
    async fn test_recorder_ignores_non_object_documents() {
        let cell = Arc::new(StructureCell::new());
        let recorder = StructureRecorder::new("loxone2mqtt/LoxAPP3", cell.clone());

        recorder
            .on_batch(&[OutboundMessage::new("loxone2mqtt/LoxAPP3", "garbage")])
            .await
            .unwrap();

        assert!(cell.reader().latest().is_none());
    }

    #[tokio::test]
    async fn test_addon_subscriber_decodes_batches_from_bus() {
        let cell = Arc::new(StructureCell::new());
        let bus = EventBus::new();
        bus.subscribe(
            "loxone2mqtt",
            Arc::new(AddonSubscriber::new(StructureRecorder::new(
                "loxone2mqtt/LoxAPP3",
                cell.clone(),
            ))),
        )
        .unwrap();

        bus.publish(
            "loxone2mqtt",
            json!([{"topic": "loxone2mqtt/LoxAPP3", "payload": {"softwareVersion": [15, 0]}}]),
        )
        .unwrap();
        bus.publish("loxone2mqtt", "not json").unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        bus.run(shutdown).await.unwrap();

        assert_eq!(
            cell.reader().latest().unwrap().software_version().as_deref(),
            Some("15.0")
        );
        assert_eq!(bus.stats().handler_failures, 1);
    }
}
