// Best-effort background publisher
// Decision: Audit and analysis messages never block the caller; a full outbox drops and logs.

use std::sync::Arc;

use genrelay_broker::Broker;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Outgoing {
    topic: &'static str,
    payload: Vec<u8>,
}

/// Fire-and-forget publishing to side-channel topics
#[derive(Clone)]
pub struct Outbox {
    tx: Option<mpsc::Sender<Outgoing>>,
}

impl Outbox {
    /// Outbox that discards everything (no broker configured)
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn spawn(
        broker: Arc<dyn Broker>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run(broker, rx, cancel));
        (Self { tx: Some(tx) }, handle)
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue `value` for publishing; returns whether it was queued
    pub fn publish<T: Serialize>(&self, topic: &'static str, value: &T) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        let payload = match serde_json::to_vec(value) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(topic, error = %e, "Failed to encode outbox message");
                return false;
            }
        };

        match tx.try_send(Outgoing { topic, payload }) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(topic, error = %e, "Outbox full or closed, dropping message");
                false
            }
        }
    }
}

async fn run(broker: Arc<dyn Broker>, mut rx: mpsc::Receiver<Outgoing>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => send(broker.as_ref(), message).await,
                None => return,
            },
        }
    }

    // Flush what was queued before shutdown
    while let Ok(message) = rx.try_recv() {
        send(broker.as_ref(), message).await;
    }
    tracing::debug!("Outbox stopped");
}

async fn send(broker: &dyn Broker, message: Outgoing) {
    if let Err(e) = broker.publish(message.topic, message.payload).await {
        tracing::warn!(topic = message.topic, error = %e, "Failed to publish outbox message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genrelay_broker::InMemoryBroker;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_disabled_outbox_drops() {
        let outbox = Outbox::disabled();
        assert!(!outbox.is_enabled());
        assert!(!outbox.publish("t", &json!({})));
    }

    #[tokio::test]
    async fn test_messages_reach_broker() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let (outbox, handle) = Outbox::spawn(Arc::new(broker.clone()), 8, cancel.clone());

        assert!(outbox.publish("audit", &json!({"n": 1})));
        assert!(outbox.publish("audit", &json!({"n": 2})));

        for _ in 0..50 {
            if broker.depth("audit") == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.depth("audit"), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_broker_failure_is_not_fatal() {
        let broker = InMemoryBroker::new();
        broker.disconnect();
        let cancel = CancellationToken::new();
        let (outbox, handle) = Outbox::spawn(Arc::new(broker.clone()), 8, cancel.clone());

        assert!(outbox.publish("audit", &json!({})));
        tokio::time::sleep(Duration::from_millis(20)).await;

        broker.reconnect();
        assert!(outbox.publish("audit", &json!({})));
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(broker.depth("audit"), 1);
    }
}
