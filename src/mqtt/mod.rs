//! # MQTT Transport Adapter
//!
//! Keeps a resilient connection to the MQTT broker and bridges it with the
//! event bus in both directions.
//!
//! ## Why This Module Exists
//!
//! The broker is the only way Loxone state leaves the process and the only
//! way commands come back in. Broker outages are routine (restarts, network
//! blips, certificate rotation), so the adapter has to:
//! - reconnect on its own, with a fixed delay and a hard attempt cap
//! - forward every inbound message on a subscribed topic into the bus
//! - publish outbound batches without letting one bad message sink the batch
//! - report a distinguishable fatal error once the attempt cap is reached
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - [mqtt] configuration section and validation
//! ├── error.rs            - TransportError / MqttError
//! ├── message_manager.rs  - inbound MQTTMessage, outbound messages and batches
//! ├── mqtt_handler.rs     - connection state machine and inbound listen loop
//! ├── publisher.rs        - batched outbound publishing and the bus bridge
//! └── transport.rs        - broker seam and the rumqttc implementation
//! ```
//!
//! ## Connections
//!
//! The listening side holds one long-lived session. Every outbound batch
//! opens its own short-lived session with a distinct client id, so a
//! publish never disturbs the subscription.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod publisher;
pub mod transport;

#[cfg(test)]
pub mod test_support;
