use thiserror::Error;

/// Broker errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection lost (or simulated outage)
    #[error("broker is disconnected")]
    Disconnected,

    /// Retention limit reached for the topic
    #[error("topic {topic} is full ({capacity} messages retained)")]
    TopicFull { topic: String, capacity: usize },

    #[error("topic {0} already has a subscriber")]
    AlreadySubscribed(String),

    /// Payload could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl BrokerError {
    /// Whether the broker itself is unreachable, as opposed to a per-message failure
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BrokerError::Disconnected)
    }
}
