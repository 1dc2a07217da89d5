//! Scripted in-memory broker for exercising the adapter without a network.

use super::error::TransportError;
use super::message_manager::MQTTMessage;
use super::transport::{BrokerConnector, BrokerSession};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct BrokerLog {
    pub connects: usize,
    pub refused: usize,
    pub subscribed: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub closed_sessions: usize,
}

#[derive(Default)]
struct Script {
    refuse_all: bool,
    refuse_next: usize,
    accept_budget: Option<usize>,
    reject_topics: HashSet<String>,
    break_session_topics: HashSet<String>,
    log: BrokerLog,
}

type Inbound = Result<MQTTMessage, TransportError>;

#[derive(Clone)]
pub struct FakeBroker {
    script: Arc<Mutex<Script>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            inbound_tx,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
        }
    }

    /// Every connection attempt is refused.
    pub fn refusing() -> Self {
        let broker = Self::new();
        broker.script.lock().unwrap().refuse_all = true;
        broker
    }

    pub fn refuse_next(&self, count: usize) {
        self.script.lock().unwrap().refuse_next = count;
    }

    /// Accepts `accepted` more connections, then refuses every attempt.
    pub fn refuse_after(&self, accepted: usize) {
        self.script.lock().unwrap().accept_budget = Some(accepted);
    }

    /// Publishes to `topic` fail but leave the session usable.
    pub fn reject_topic(&self, topic: &str) {
        self.script
            .lock()
            .unwrap()
            .reject_topics
            .insert(topic.to_string());
    }

    /// Publishing to `topic` kills the session.
    pub fn break_session_on(&self, topic: &str) {
        self.script
            .lock()
            .unwrap()
            .break_session_topics
            .insert(topic.to_string());
    }

    pub fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let _ = self
            .inbound_tx
            .send(Ok(MQTTMessage::from_topic(topic, payload)));
    }

    /// Ends the currently listening session with a transport error.
    pub fn drop_connection(&self) {
        let _ = self
            .inbound_tx
            .send(Err(TransportError::Connection("connection reset".to_string())));
    }

    pub fn log(&self) -> BrokerLog {
        self.script.lock().unwrap().log.clone()
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl BrokerConnector for FakeBroker {
    async fn connect(&self, filters: &[String]) -> Result<Box<dyn BrokerSession>, TransportError> {
        let mut script = self.script.lock().unwrap();
        script.log.connects += 1;
        let over_budget = script.accept_budget == Some(0);
        if script.refuse_all || over_budget || script.refuse_next > 0 {
            script.refuse_next = script.refuse_next.saturating_sub(1);
            script.log.refused += 1;
            return Err(TransportError::Connection("connection refused".to_string()));
        }
        if let Some(budget) = script.accept_budget.as_mut() {
            *budget -= 1;
        }
        script.log.subscribed.extend(filters.iter().cloned());
        drop(script);

        Ok(Box::new(FakeSession {
            broker: self.clone(),
            broken: false,
        }))
    }
}

struct FakeSession {
    broker: FakeBroker,
    broken: bool,
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.broken {
            return Err(TransportError::Closed);
        }
        let mut script = self.broker.script.lock().unwrap();
        if script.break_session_topics.contains(topic) {
            self.broken = true;
            return Err(TransportError::Connection(format!(
                "broker dropped connection while publishing to {}",
                topic
            )));
        }
        if script.reject_topics.contains(topic) {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        script.log.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn next_message(&mut self) -> Result<MQTTMessage, TransportError> {
        let mut inbound = self.broker.inbound_rx.lock().await;
        match inbound.recv().await {
            Some(next) => next,
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.broker.script.lock().unwrap().log.closed_sessions += 1;
    }
}
