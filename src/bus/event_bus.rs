//! In-process publish/subscribe dispatcher
//!
//! Producers call [`EventBus::publish`], which only enqueues. A single
//! dispatch loop ([`EventBus::run`]) drains the queue in publish order and
//! hands each message to every matching subscriber, one after another. A
//! message is fully delivered before the next one starts, so a subscriber
//! never observes two messages out of publish order.

use super::message::{Message, Payload};
use super::topic::{Topic, TopicError, TopicPattern};
use async_trait::async_trait;
use color_eyre::Result;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Anything that wants to receive bus messages.
#[async_trait]
pub trait BusSubscriber: Send + Sync + 'static {
    async fn on_message(&self, message: Arc<Message>) -> Result<()>;

    fn name(&self) -> &str {
        "subscriber"
    }
}

/// Closure adapter used by [`EventBus::subscribe_fn`].
struct FnSubscriber<F> {
    name: String,
    handler: F,
}

#[async_trait]
impl<F, Fut> BusSubscriber for FnSubscriber<F>
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn on_message(&self, message: Arc<Message>) -> Result<()> {
        (self.handler)(message).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: TopicPattern,
    handler: Arc<dyn BusSubscriber>,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("Dispatch loop is already running")]
    AlreadyRunning,

    #[error("Dispatch loop has stopped, message to '{0}' dropped")]
    Closed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub published: u64,
    pub dispatched: u64,
    pub handler_failures: u64,
}

struct BusInner {
    queue_tx: mpsc::UnboundedSender<Arc<Message>>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Message>>>>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    published: AtomicU64,
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
}

/// Cheap to clone handle; every clone talks to the same queue and table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BusInner {
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                subscriptions: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                dispatched: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Registers `handler` for every topic matching `pattern`.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn BusSubscriber>,
    ) -> Result<SubscriptionId, BusError> {
        let pattern = TopicPattern::parse(pattern)?;
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        info!("Subscribing '{}' to pattern '{}'", handler.name(), pattern);

        let mut subscriptions = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscriptions.push(Subscription {
            id,
            pattern,
            handler,
        });
        Ok(id)
    }

    pub fn subscribe_fn<F, Fut>(
        &self,
        pattern: &str,
        name: &str,
        handler: F,
    ) -> Result<SubscriptionId, BusError>
    where
        F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(
            pattern,
            Arc::new(FnSubscriber {
                name: name.to_string(),
                handler,
            }),
        )
    }

    /// Returns whether a subscription with this id was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .inner
            .subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        before != subscriptions.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Enqueues a message and returns without waiting for any handler.
    pub fn publish(&self, topic: &str, payload: impl Into<Payload>) -> Result<(), BusError> {
        let topic = Topic::parse(topic)?;
        let message = Arc::new(Message::new(topic, payload.into()));

        trace!("Queueing {}", message.preview());
        self.inner
            .queue_tx
            .send(message)
            .map_err(|e| BusError::Closed(e.0.topic.to_string()))?;
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            dispatched: self.inner.dispatched.load(Ordering::Relaxed),
            handler_failures: self.inner.handler_failures.load(Ordering::Relaxed),
        }
    }

    /// Dispatch loop. Runs until `shutdown` is cancelled, then delivers
    /// whatever was already queued and returns.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BusError> {
        let mut queue = self
            .inner
            .queue_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(BusError::AlreadyRunning)?;

        info!("Event bus dispatch loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    break;
                }
                next = queue.recv() => match next {
                    Some(message) => self.dispatch(message).await,
                    None => {
                        warn!("Event bus queue closed");
                        return Ok(());
                    }
                }
            }
        }

        // Stop accepting while draining so the loop terminates.
        queue.close();
        let mut drained = 0usize;
        while let Ok(message) = queue.try_recv() {
            self.dispatch(message).await;
            drained += 1;
        }
        info!(
            "Event bus dispatch loop stopped, drained {} queued messages",
            drained
        );
        Ok(())
    }

    async fn dispatch(&self, message: Arc<Message>) {
        let handlers: Vec<(SubscriptionId, Arc<dyn BusSubscriber>)> = {
            let subscriptions = self
                .inner
                .subscriptions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscriptions
                .iter()
                .filter(|s| s.pattern.matches(&message.topic))
                .map(|s| (s.id, s.handler.clone()))
                .collect()
        };

        if handlers.is_empty() {
            debug!("No subscriber for topic '{}'", message.topic);
        }

        for (id, handler) in handlers {
            let name = handler.name().to_string();
            let delivery = message.clone();
            // Each handler runs in its own task so a panic stays contained.
            let outcome = tokio::spawn(async move { handler.on_message(delivery).await }).await;

            match outcome {
                Ok(Ok(())) => {
                    trace!("Delivered '{}' to {} ({:?})", message.topic, name, id);
                }
                Ok(Err(e)) => {
                    self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Subscriber {} failed on topic '{}': {:#}",
                        name, message.topic, e
                    );
                }
                Err(e) => {
                    self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Subscriber {} panicked on topic '{}': {}",
                        name, message.topic, e
                    );
                }
            }
        }

        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    fn recorder(tx: UnboundedSender<String>) -> impl Fn(Arc<Message>) -> std::future::Ready<Result<()>> {
        move |message: Arc<Message>| {
            let _ = tx.send(format!("{}={}", message.topic, message.payload));
            std::future::ready(Ok(()))
        }
    }

    async fn noop(_message: Arc<Message>) -> Result<()> {
        Ok(())
    }

    async fn explode(_message: Arc<Message>) -> Result<()> {
        panic!("handler bug")
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_single_subscriber_sees_publish_order() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_fn("t/1", "recorder", recorder(tx)).unwrap();

        let shutdown = CancellationToken::new();
        let runner = {
            let bus = bus.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bus.run(shutdown).await })
        };

        for i in 0..50 {
            bus.publish("t/1", i.to_string()).unwrap();
        }
        for i in 0..50 {
            assert_eq!(recv(&mut rx).await, format!("t/1={}", i));
        }

        shutdown.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wildcard_subscriptions_receive_matching_topics_only() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_fn("a/+/c", "single", recorder(tx.clone())).unwrap();
        bus.subscribe_fn("b/#", "multi", recorder(tx)).unwrap();

        let shutdown = CancellationToken::new();
        let runner = {
            let bus = bus.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bus.run(shutdown).await })
        };

        bus.publish("a/x/y/c", "no").unwrap();
        bus.publish("a/x/c", "yes").unwrap();
        bus.publish("b", "root").unwrap();
        bus.publish("b/1/2", "deep").unwrap();

        assert_eq!(recv(&mut rx).await, "a/x/c=yes");
        assert_eq!(recv(&mut rx).await, "b=root");
        assert_eq!(recv(&mut rx).await, "b/1/2=deep");

        shutdown.cancel();
        runner.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe_fn("events", "failing", |message: Arc<Message>| async move {
            if message.payload == Payload::from("M") {
                Err(eyre!("cannot handle {}", message.payload))
            } else {
                Ok(())
            }
        })
        .unwrap();
        bus.subscribe_fn("events", "recorder", recorder(tx)).unwrap();

        let shutdown = CancellationToken::new();
        let runner = {
            let bus = bus.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bus.run(shutdown).await })
        };

        bus.publish("events", "M").unwrap();
        bus.publish("events", "M+1").unwrap();

        assert_eq!(recv(&mut rx).await, "events=M");
        assert_eq!(recv(&mut rx).await, "events=M+1");

        shutdown.cancel();
        runner.await.unwrap().unwrap();
        assert_eq!(bus.stats().handler_failures, 1);
        assert_eq!(bus.stats().dispatched, 2);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe_fn("events", "panicking", explode).unwrap();
        bus.subscribe_fn("events", "recorder", recorder(tx)).unwrap();

        let shutdown = CancellationToken::new();
        let runner = {
            let bus = bus.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bus.run(shutdown).await })
        };

        bus.publish("events", "first").unwrap();
        bus.publish("events", "second").unwrap();
        assert_eq!(recv(&mut rx).await, "events=first");
        assert_eq!(recv(&mut rx).await, "events=second");

        shutdown.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_messages() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_fn("q", "recorder", recorder(tx)).unwrap();

        bus.publish("q", "1").unwrap();
        bus.publish("q", json!({"n": 2})).unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        bus.run(shutdown).await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), "q=1");
        assert_eq!(rx.try_recv().unwrap(), r#"q={"n":2}"#);
        assert!(matches!(bus.publish("q", "late"), Err(BusError::Closed(_))));
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let bus = EventBus::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        bus.run(shutdown.clone()).await.unwrap();
        assert!(matches!(
            bus.run(shutdown).await,
            Err(BusError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_publish_rejects_wildcard_topic() {
        let bus = EventBus::new();
        assert!(matches!(
            bus.publish("a/+", "x"),
            Err(BusError::InvalidTopic(TopicError::WildcardInTopic(_)))
        ));
        assert_eq!(bus.stats().published, 0);
    }

    #[test]
    fn test_subscribe_rejects_malformed_pattern() {
        let bus = EventBus::new();
        let result = bus.subscribe_fn("a//b", "bad", noop);
        assert!(matches!(
            result,
            Err(BusError::InvalidTopic(TopicError::EmptySegment { .. }))
        ));
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_unsubscribe_removes_only_that_subscription() {
        let bus = EventBus::new();
        let first = bus
            .subscribe_fn("a", "first", noop)
            .unwrap();
        let _second = bus
            .subscribe_fn("a", "second", noop)
            .unwrap();

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        assert_eq!(bus.subscription_count(), 1);
    }
}
