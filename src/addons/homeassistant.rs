//! Home Assistant MQTT discovery
//!
//! Whenever the controller sends a new structure document, every control
//! with a known Home Assistant component gets a `{"uuid", "type"}` request
//! on the discovery topic.
//!
//! See <https://www.home-assistant.io/integrations/mqtt/>.

use super::Addon;
use crate::bus::{topic_matches, EventBus};
use crate::mqtt::message_manager::OutboundMessage;
use crate::structure::StructureSnapshot;
use async_trait::async_trait;
use color_eyre::Result;
use serde_json::json;
use tracing::{debug, info, warn};

/// Control types Home Assistant has a discovery component for.
const DISCOVERY_TYPES: &[&str] = &["Switch"];

pub fn supports_discovery(kind: &str) -> bool {
    DISCOVERY_TYPES.contains(&kind)
}

pub struct HomeAssistantDiscovery {
    bus: EventBus,
    structure_topic: String,
    discovery_topic: String,
}

impl HomeAssistantDiscovery {
    pub fn new(
        bus: EventBus,
        structure_topic: impl Into<String>,
        discovery_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            structure_topic: structure_topic.into(),
            discovery_topic: discovery_topic.into(),
        }
    }

    fn announce(&self, snapshot: &StructureSnapshot) -> Result<usize> {
        let mut announced = 0;
        for control in snapshot.controls() {
            if !supports_discovery(&control.kind) {
                continue;
            }
            debug!("Announcing {} ({}) for discovery", control.name, control.uuid);
            self.bus.publish(
                &self.discovery_topic,
                json!({"uuid": control.uuid, "type": control.kind}),
            )?;
            announced += 1;
        }
        Ok(announced)
    }
}

#[async_trait]
impl Addon for HomeAssistantDiscovery {
    async fn on_batch(&self, messages: &[OutboundMessage]) -> Result<()> {
        for message in messages {
            if !topic_matches(&self.structure_topic, &message.topic) {
                continue;
            }
            let document = match message.payload.parse_json() {
                Ok(document) => document,
                Err(e) => {
                    warn!("Cannot read structure document for discovery: {}", e);
                    continue;
                }
            };
            let announced = self.announce(&StructureSnapshot::new(document))?;
            info!(
                "Requested Home Assistant discovery for {} control(s)",
                announced
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "homeassistant-discovery"
    }
}
