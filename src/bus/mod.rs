//! # Event Bus
//!
//! The single integration point of the bridge. The controller client, the
//! MQTT adapter and the addons never call each other; they publish to and
//! subscribe on hierarchical bus topics.
//!
//! ```text
//! controller events ──► "loxone2mqtt" ──► MqttBridge ──► broker
//! broker messages   ──► <mqtt topic>  ──► controller client
//! ```
//!
//! - [`topic`] - literal topics, wildcard patterns and the matcher
//! - [`message`] - immutable message records and payload values
//! - [`event_bus`] - subscription table, FIFO queue and dispatch loop

pub mod event_bus;
pub mod message;
pub mod topic;

pub use event_bus::{BusError, BusStats, BusSubscriber, EventBus, SubscriptionId};
pub use message::{Message, Payload};
pub use topic::{topic_matches, Topic, TopicError, TopicPattern};
