//! In-process bus implementation.
//!
//! Each topic is a `tokio::sync::broadcast` channel, so every subscriber of
//! a topic sees payloads in publish order.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::traits::{validate_topic, Bus, BusError, Inbound};

/// Default per-topic broadcast capacity.
const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// In-process broker backed by broadcast channels.
#[derive(Debug)]
pub struct LocalBus {
    /// Topic senders indexed by topic name.
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    /// Per-topic capacity. Slow subscribers lagging further behind lose payloads.
    capacity: usize,
}

impl LocalBus {
    /// Create a new bus with default topic capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a new bus with a specific topic capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Get bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            topic_count: self.topics.len(),
            subscriber_count: self.topics.iter().map(|t| t.receiver_count()).sum(),
        }
    }

    /// Get the subscriber count for a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|t| t.receiver_count())
            .unwrap_or(0)
    }

    /// Check if a topic currently has broker-side state.
    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for LocalBus {
    fn name(&self) -> &'static str {
        "local"
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, BusError> {
        validate_topic(topic)?;

        let Some(sender) = self.topics.get(topic) else {
            trace!(topic = %topic, "Publish to topic without subscribers");
            return Ok(0);
        };

        match sender.send(payload) {
            Ok(count) => {
                trace!(topic = %topic, recipients = count, "Published");
                Ok(count)
            }
            Err(_) => {
                drop(sender);
                self.unsubscribe(topic);
                Ok(0)
            }
        }
    }

    fn subscribe(&self, topic: &str) -> Result<Box<dyn Inbound>, BusError> {
        validate_topic(topic)?;

        let receiver = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic, "Creating topic");
                broadcast::channel(self.capacity).0
            })
            .subscribe();

        Ok(Box::new(LocalInbound {
            topic: topic.to_string(),
            receiver,
        }))
    }

    fn unsubscribe(&self, topic: &str) {
        if self
            .topics
            .remove_if(topic, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            debug!(topic = %topic, "Deleted empty topic");
        }
    }
}

/// Subscription handle of a [`LocalBus`] topic.
struct LocalInbound {
    topic: String,
    receiver: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl Inbound for LocalInbound {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscriber lagged, payloads dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Bus statistics.
#[derive(Debug, Clone)]
pub struct BusStats {
    /// Number of topics with broker-side state.
    pub topic_count: usize,
    /// Total number of open subscriptions.
    pub subscriber_count: usize,
}
