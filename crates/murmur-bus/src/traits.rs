//! Bus abstraction traits for Murmur.
//!
//! These traits define the publish/subscribe primitive the chat engine
//! fans messages out through, so the engine does not depend on any one
//! broker.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Maximum topic length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Characters a broker reserves for subject wildcards.
pub const WILDCARD_CHARS: [char; 2] = ['*', '>'];

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Topic cannot be used as a subject.
    #[error("Invalid topic {topic:?}: {reason}")]
    InvalidTopic {
        /// The rejected topic.
        topic: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The bus connection is gone.
    #[error("Bus closed")]
    Closed,

    /// Other broker error.
    #[error("{0}")]
    Other(String),
}

/// Validate a topic name.
///
/// # Errors
///
/// Returns [`BusError::InvalidTopic`] if the topic is empty, too long,
/// contains whitespace or a wildcard character.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    let reason = if topic.is_empty() {
        "topic cannot be empty"
    } else if topic.len() > MAX_TOPIC_LENGTH {
        "topic too long"
    } else if topic.chars().any(char::is_whitespace) {
        "topic contains whitespace"
    } else if topic.contains(WILDCARD_CHARS) {
        "topic contains a wildcard character"
    } else {
        return Ok(());
    };

    Err(BusError::InvalidTopic {
        topic: topic.to_string(),
        reason,
    })
}

/// Inbound side of a single topic subscription.
///
/// Dropping the handle ends the subscription.
#[async_trait]
pub trait Inbound: Send {
    /// The topic this handle receives from.
    fn topic(&self) -> &str;

    /// Receive the next payload published to the topic, in publish order.
    ///
    /// Returns `None` once the subscription can deliver nothing more.
    async fn recv(&mut self) -> Option<Bytes>;
}

/// A publish/subscribe broker.
pub trait Bus: Send + Sync {
    /// Get the bus name (e.g., "local").
    fn name(&self) -> &'static str;

    /// Publish a payload to every current subscriber of `topic`.
    ///
    /// Returns the number of subscribers the payload was handed to.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or the bus is closed.
    fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BusError>;

    /// Open a subscription to `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or the bus is closed.
    fn subscribe(&self, topic: &str) -> Result<Box<dyn Inbound>, BusError>;

    /// Release broker-side state for `topic` once no subscription remains.
    fn unsubscribe(&self, topic: &str);

    /// Check if the bus is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}
