//! Message broker abstraction
//!
//! This crate provides:
//! - [`Broker`] - publish/subscribe/ping seam used by the dispatcher, bridge and correlator
//! - [`Delivery`] - one message handed to a subscriber, acked explicitly
//! - [`InMemoryBroker`] - bounded in-process broker with redelivery and outage simulation
//!
//! # Example
//!
//! ```ignore
//! use genrelay_broker::{topics, Broker, InMemoryBroker};
//!
//! let broker = InMemoryBroker::new();
//! let mut results = broker.subscribe(topics::RESULT).await?;
//! broker.publish(topics::RESULT, b"{}".to_vec()).await?;
//!
//! let delivery = results.next().await.unwrap();
//! handle(delivery.payload());
//! delivery.ack();
//! ```

mod delivery;
mod error;
mod memory;

use async_trait::async_trait;
use serde::Serialize;

pub use delivery::{Delivery, Message, Subscription};
pub use error::BrokerError;
pub use memory::{InMemoryBroker, InMemoryBrokerConfig};

/// Topic names
pub mod topics {
    /// Gateway to backend
    pub const REQUEST: &str = "generation.request";
    /// Backend to correlator
    pub const RESULT: &str = "generation.result";
    /// Audit sink for timeouts, orphans and malformed results
    pub const DEAD_LETTER: &str = "generation.deadletter";
    /// Quality-gate side channel
    pub const ANALYSIS: &str = "generation.analysis";
}

/// Message broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Append a message to a topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Become the consumer of a topic
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;

    /// Connection liveness
    async fn ping(&self) -> Result<(), BrokerError>;
}

/// Serialize `value` as JSON and publish it
pub async fn publish_json<T: Serialize + Sync>(
    broker: &dyn Broker,
    topic: &str,
    value: &T,
) -> Result<(), BrokerError> {
    let payload = serde_json::to_vec(value).map_err(|e| BrokerError::Encode(e.to_string()))?;
    broker.publish(topic, payload).await
}
