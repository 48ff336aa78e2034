// In-process broker
//
// Decision: Each subscription gets a pump task that hands out one message and
// waits for its settlement before the next (prefetch 1).
// Decision: A nacked message goes back to the head of its topic so per-topic
// order survives redelivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::delivery::{Delivery, Message, Settlement, Subscription};
use crate::error::BrokerError;
use crate::Broker;

/// In-memory broker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryBrokerConfig {
    /// Messages retained per topic before publish fails with `TopicFull`
    pub topic_capacity: usize,
    /// Redeliveries before an unacked message is dropped
    pub max_redeliveries: u32,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            topic_capacity: 10_000,
            max_redeliveries: 5,
        }
    }
}

impl InMemoryBrokerConfig {
    pub fn with_topic_capacity(mut self, capacity: usize) -> Self {
        self.topic_capacity = capacity.max(1);
        self
    }

    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }
}

#[derive(Default)]
struct TopicState {
    queue: VecDeque<Message>,
    subscribed: bool,
    notify: Arc<Notify>,
}

struct Inner {
    config: InMemoryBrokerConfig,
    topics: Mutex<HashMap<String, TopicState>>,
    connected: AtomicBool,
    next_id: AtomicU64,
}

impl Inner {
    fn pop(&self, topic: &str) -> Option<Message> {
        if !self.connected.load(Ordering::Acquire) {
            return None;
        }
        self.topics.lock().get_mut(topic)?.queue.pop_front()
    }

    fn push_front(&self, topic: &str, message: Message) {
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        state.queue.push_front(message);
        state.notify.notify_one();
    }

    fn redeliver(&self, mut message: Message) {
        if message.redeliveries >= self.config.max_redeliveries {
            warn!(
                topic = %message.topic,
                message_id = message.id,
                redeliveries = message.redeliveries,
                "Dropping message after max redeliveries"
            );
            return;
        }
        message.redeliveries += 1;
        debug!(
            topic = %message.topic,
            message_id = message.id,
            redeliveries = message.redeliveries,
            "Requeueing unacked message"
        );
        let topic = message.topic.clone();
        self.push_front(&topic, message);
    }

    fn unsubscribe(&self, topic: &str) {
        if let Some(state) = self.topics.lock().get_mut(topic) {
            state.subscribed = false;
        }
        debug!(topic, "Subscriber detached");
    }
}

/// Bounded in-process broker
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_config(InMemoryBrokerConfig::default())
    }

    pub fn with_config(config: InMemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                topics: Mutex::new(HashMap::new()),
                connected: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Simulate an outage: publish, subscribe and ping fail; nothing is delivered
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::Release);
        info!("In-memory broker disconnected");
    }

    /// End a simulated outage; retained messages flow again
    pub fn reconnect(&self) {
        self.inner.connected.store(true, Ordering::Release);
        for state in self.inner.topics.lock().values() {
            state.notify.notify_one();
        }
        info!("In-memory broker reconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Messages retained on a topic and not yet handed out
    pub fn depth(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |state| state.queue.len())
    }

    /// Remove and return every retained message on a topic
    pub fn drain(&self, topic: &str) -> Vec<Message> {
        self.inner
            .topics
            .lock()
            .get_mut(topic)
            .map(|state| state.queue.drain(..).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Disconnected);
        }

        let capacity = self.inner.config.topic_capacity;
        let mut topics = self.inner.topics.lock();
        let state = topics.entry(topic.to_string()).or_default();
        if state.queue.len() >= capacity {
            return Err(BrokerError::TopicFull {
                topic: topic.to_string(),
                capacity,
            });
        }

        state.queue.push_back(Message {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            topic: topic.to_string(),
            payload,
            redeliveries: 0,
        });
        state.notify.notify_one();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Disconnected);
        }

        let notify = {
            let mut topics = self.inner.topics.lock();
            let state = topics.entry(topic.to_string()).or_default();
            if state.subscribed {
                return Err(BrokerError::AlreadySubscribed(topic.to_string()));
            }
            state.subscribed = true;
            Arc::clone(&state.notify)
        };

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(pump(
            Arc::clone(&self.inner),
            topic.to_string(),
            notify,
            tx,
        ));

        debug!(topic, "Subscriber attached");
        Ok(Subscription::new(topic.to_string(), rx))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }
}

/// Hand messages to one subscriber, one at a time
async fn pump(inner: Arc<Inner>, topic: String, notify: Arc<Notify>, tx: mpsc::Sender<Delivery>) {
    loop {
        let message = loop {
            if let Some(message) = inner.pop(&topic) {
                break message;
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = tx.closed() => {
                    inner.unsubscribe(&topic);
                    return;
                }
            }
        };

        let (settle_tx, settle_rx) = oneshot::channel();
        if tx
            .send(Delivery::new(message.clone(), settle_tx))
            .await
            .is_err()
        {
            // Never reached the subscriber; put it back untouched
            inner.push_front(&topic, message);
            inner.unsubscribe(&topic);
            return;
        }

        match settle_rx.await {
            Ok(Settlement::Ack) => {}
            Ok(Settlement::Nack) | Err(_) => inner.redeliver(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish_json;
    use serde_json::json;
    use std::time::Duration;

    const TOPIC: &str = "test.topic";

    async fn next_within(sub: &mut Subscription, ms: u64) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(ms), sub.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_publish_then_subscribe_in_order() {
        let broker = InMemoryBroker::new();
        broker.publish(TOPIC, b"one".to_vec()).await.unwrap();
        broker.publish(TOPIC, b"two".to_vec()).await.unwrap();

        let mut sub = broker.subscribe(TOPIC).await.unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.payload(), b"one");
        first.ack();

        let second = sub.next().await.unwrap();
        assert_eq!(second.payload(), b"two");
        second.ack();
    }

    #[tokio::test]
    async fn test_prefetch_one() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe(TOPIC).await.unwrap();
        broker.publish(TOPIC, b"a".to_vec()).await.unwrap();
        broker.publish(TOPIC, b"b".to_vec()).await.unwrap();

        let first = sub.next().await.unwrap();
        // Second message is held back until the first is settled
        assert!(next_within(&mut sub, 50).await.is_none());

        first.ack();
        let second = next_within(&mut sub, 500).await.unwrap();
        assert_eq!(second.payload(), b"b");
        second.ack();
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_redelivered() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe(TOPIC).await.unwrap();
        broker.publish(TOPIC, b"retry-me".to_vec()).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.message().redeliveries, 0);
        drop(first);

        let again = sub.next().await.unwrap();
        assert_eq!(again.payload(), b"retry-me");
        assert_eq!(again.message().redeliveries, 1);
        again.ack();

        assert!(next_within(&mut sub, 50).await.is_none());
    }

    #[tokio::test]
    async fn test_message_dropped_after_max_redeliveries() {
        let broker =
            InMemoryBroker::with_config(InMemoryBrokerConfig::default().with_max_redeliveries(1));
        let mut sub = broker.subscribe(TOPIC).await.unwrap();
        broker.publish(TOPIC, b"poison".to_vec()).await.unwrap();

        sub.next().await.unwrap().nack();
        sub.next().await.unwrap().nack();

        assert!(next_within(&mut sub, 50).await.is_none());
        assert_eq!(broker.depth(TOPIC), 0);
    }

    #[tokio::test]
    async fn test_topic_full() {
        let broker =
            InMemoryBroker::with_config(InMemoryBrokerConfig::default().with_topic_capacity(2));
        broker.publish(TOPIC, vec![1]).await.unwrap();
        broker.publish(TOPIC, vec![2]).await.unwrap();

        let err = broker.publish(TOPIC, vec![3]).await.unwrap_err();
        assert_eq!(
            err,
            BrokerError::TopicFull {
                topic: TOPIC.to_string(),
                capacity: 2
            }
        );
        assert_eq!(broker.depth(TOPIC), 2);
    }

    #[tokio::test]
    async fn test_single_subscriber_per_topic() {
        let broker = InMemoryBroker::new();
        let sub = broker.subscribe(TOPIC).await.unwrap();
        assert_eq!(
            broker.subscribe(TOPIC).await.unwrap_err(),
            BrokerError::AlreadySubscribed(TOPIC.to_string())
        );

        drop(sub);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(broker.subscribe(TOPIC).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe(TOPIC).await.unwrap();
        broker.publish(TOPIC, b"kept".to_vec()).await.unwrap();

        broker.disconnect();
        assert_eq!(broker.ping().await, Err(BrokerError::Disconnected));
        assert!(broker.publish(TOPIC, vec![0]).await.unwrap_err().is_connection_error());

        broker.reconnect();
        assert!(broker.ping().await.is_ok());
        let delivery = next_within(&mut sub, 500).await.unwrap();
        assert_eq!(delivery.payload(), b"kept");
        delivery.ack();
    }

    #[tokio::test]
    async fn test_publish_json_and_drain() {
        let broker = InMemoryBroker::new();
        publish_json(&broker, TOPIC, &json!({"jobId": "abc"}))
            .await
            .unwrap();

        let drained = broker.drain(TOPIC);
        assert_eq!(drained.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&drained[0].payload).unwrap();
        assert_eq!(value["jobId"], "abc");
        assert_eq!(broker.depth(TOPIC), 0);
    }
}
