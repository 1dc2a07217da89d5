//! Latest controller structure document
//!
//! The Miniserver describes itself in a large JSON document (`LoxAPP3.json`):
//! software version, rooms, categories and every control with its uuid and
//! type. The bridge keeps the most recent copy so other parts of the process
//! (dashboards, discovery) can read it without talking to the controller.
//!
//! There is exactly one writer. Readers always see a complete snapshot.

use chrono::{DateTime, Local};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct RawControl {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    room: Option<String>,
    cat: Option<String>,
}

/// One entry of the document's `controls` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub uuid: String,
    pub name: String,
    pub kind: String,
    pub room: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureSnapshot {
    pub received_at: DateTime<Local>,
    pub document: Value,
}

impl StructureSnapshot {
    pub fn new(document: Value) -> Self {
        Self {
            received_at: Local::now(),
            document,
        }
    }

    /// `softwareVersion: [14, 2, 3]` → `"14.2.3"`
    pub fn software_version(&self) -> Option<String> {
        let parts = self.document.get("softwareVersion")?.as_array()?;
        let parts: Vec<String> = parts
            .iter()
            .map(|part| match part {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        Some(parts.join("."))
    }

    /// Every control of the document. Entries missing a name or type are skipped.
    pub fn controls(&self) -> Vec<Control> {
        let Some(controls) = self.document.get("controls").and_then(Value::as_object) else {
            return Vec::new();
        };

        controls
            .iter()
            .filter_map(|(uuid, value)| {
                match serde_json::from_value::<RawControl>(value.clone()) {
                    Ok(raw) => Some(Control {
                        uuid: uuid.clone(),
                        name: raw.name,
                        kind: raw.kind,
                        room: raw.room,
                        category: raw.cat,
                    }),
                    Err(e) => {
                        debug!("Skipping control {}: {}", uuid, e);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn control(&self, uuid: &str) -> Option<Control> {
        self.controls().into_iter().find(|c| c.uuid == uuid)
    }
}

/// Single-writer cell holding the latest snapshot.
pub struct StructureCell {
    sender: watch::Sender<Option<Arc<StructureSnapshot>>>,
}

impl Default for StructureCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StructureCell {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    pub fn store(&self, document: Value) -> Arc<StructureSnapshot> {
        let snapshot = Arc::new(StructureSnapshot::new(document));
        info!(
            "Stored structure snapshot (software version {})",
            snapshot.software_version().as_deref().unwrap_or("unknown")
        );
        self.sender.send_replace(Some(snapshot.clone()));
        snapshot
    }

    pub fn reader(&self) -> StructureReader {
        StructureReader {
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Clone)]
pub struct StructureReader {
    receiver: watch::Receiver<Option<Arc<StructureSnapshot>>>,
}

impl StructureReader {
    pub fn latest(&self) -> Option<Arc<StructureSnapshot>> {
        self.receiver.borrow().clone()
    }
}
