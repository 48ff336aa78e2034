use tokio::sync::{mpsc, oneshot};

/// A message retained on a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned, increasing per broker
    pub id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    /// How many times this message was handed out before
    pub redeliveries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Ack,
    Nack,
}

/// One message handed to a subscriber
///
/// Call [`Delivery::ack`] once handling is done. Dropping a delivery without
/// acking it requeues the message.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    settle: Option<oneshot::Sender<Settlement>>,
}

impl Delivery {
    pub(crate) fn new(message: Message, settle: oneshot::Sender<Settlement>) -> Self {
        Self {
            message,
            settle: Some(settle),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Confirm handling; the message is gone for good
    pub fn ack(mut self) {
        self.settle_with(Settlement::Ack);
    }

    /// Hand the message back for redelivery
    pub fn nack(mut self) {
        self.settle_with(Settlement::Nack);
    }

    fn settle_with(&mut self, settlement: Settlement) {
        if let Some(tx) = self.settle.take() {
            let _ = tx.send(settlement);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.settle_with(Settlement::Nack);
    }
}

/// Consumer side of a topic
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub(crate) fn new(topic: String, rx: mpsc::Receiver<Delivery>) -> Self {
        Self { topic, rx }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next delivery; `None` once the broker side shut down
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}
