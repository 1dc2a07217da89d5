use super::topic::Topic;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Body of a bus message: either plain text or a JSON-like tree.
///
/// The bus never looks inside a payload; only subscribers interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Structured(Value),
}

impl Payload {
    /// Wire representation: text goes out as raw UTF-8, everything else as JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Text(text) => Ok(text.clone().into_bytes()),
            Payload::Structured(value) => serde_json::to_vec(value),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Payload::Text(text) => Value::String(text.clone()),
            Payload::Structured(value) => value.clone(),
        }
    }

    /// Structured view of the payload. Text that itself holds JSON is parsed.
    pub fn parse_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            Payload::Text(text) => serde_json::from_str(text),
            Payload::Structured(value) => Ok(value.clone()),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => Payload::Text(text),
            other => Payload::Structured(other),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Text(text) => f.write_str(text),
            Payload::Structured(value) => write!(f, "{}", value),
        }
    }
}

/// Immutable record travelling through the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: Topic,
    pub payload: Payload,
    pub published_at: DateTime<Local>,
}

impl Message {
    pub fn new(topic: Topic, payload: Payload) -> Self {
        Self {
            topic,
            payload,
            published_at: Local::now(),
        }
    }

    /// Short single-line rendering for logs.
    pub fn preview(&self) -> String {
        let mut body = self.payload.to_string();
        if body.len() > 64 {
            let mut cut = 64;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
            body.push_str("...");
        }
        format!("{}: {}", self.topic, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_payload_is_sent_raw() {
        let payload = Payload::from("42");
        assert_eq!(payload.to_bytes().unwrap(), b"42".to_vec());
    }

    #[test]
    fn test_structured_payload_is_sent_as_json() {
        let payload = Payload::from(json!({"value": 1.0}));
        assert_eq!(payload.to_bytes().unwrap(), br#"{"value":1.0}"#.to_vec());
    }

    #[test]
    fn test_json_string_collapses_to_text() {
        assert_eq!(Payload::from(json!("on")), Payload::Text("on".to_string()));
    }

    #[test]
    fn test_parse_json_from_text() {
        let payload = Payload::from(r#"{"controls": {}}"#);
        assert_eq!(payload.parse_json().unwrap(), json!({"controls": {}}));
        assert!(Payload::from("not json").parse_json().is_err());
    }

    #[test]
    fn test_preview_truncates_long_payloads() {
        let message = Message::new(Topic::parse("a/b").unwrap(), Payload::from("x".repeat(200)));
        let preview = message.preview();
        assert!(preview.starts_with("a/b: "));
        assert!(preview.ends_with("..."));
        assert!(preview.len() < 80);
    }
}
