use super::error::MqttError;
use crate::bus::Payload;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::string::FromUtf8Error;

/// A message as it arrived from the broker, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MQTTMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MQTTMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {} ({} bytes)",
            self.timestamp,
            self.topic,
            self.payload.len()
        )
    }
}

impl MQTTMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        MQTTMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn decode_payload(&self) -> Result<String, FromUtf8Error> {
        String::from_utf8(self.payload.clone())
    }
}

/// One `{topic, payload}` entry of an outbound batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Payload,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(OutboundMessage),
    Many(Vec<OutboundMessage>),
}

/// Ordered group of messages sent over a single broker connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundBatch(Vec<OutboundMessage>);

impl OutboundBatch {
    pub fn new(messages: Vec<OutboundMessage>) -> Self {
        Self(messages)
    }

    pub fn single(message: OutboundMessage) -> Self {
        Self(vec![message])
    }

    /// Accepts a single `{topic, payload}` object or an array of them.
    pub fn from_payload(payload: &Payload) -> Result<Self, MqttError> {
        let value = payload
            .parse_json()
            .map_err(|e| MqttError::InvalidBatch(format!("payload is not JSON: {}", e)))?;
        match serde_json::from_value(value) {
            Ok(OneOrMany::One(message)) => Ok(Self::single(message)),
            Ok(OneOrMany::Many(messages)) => Ok(Self(messages)),
            Err(e) => Err(MqttError::InvalidBatch(e.to_string())),
        }
    }

    pub fn messages(&self) -> &[OutboundMessage] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for OutboundBatch {
    type Item = OutboundMessage;
    type IntoIter = std::vec::IntoIter<OutboundMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<OutboundMessage> for OutboundBatch {
    fn from(message: OutboundMessage) -> Self {
        Self::single(message)
    }
}

impl From<Vec<OutboundMessage>> for OutboundBatch {
    fn from(messages: Vec<OutboundMessage>) -> Self {
        Self(messages)
    }
}
