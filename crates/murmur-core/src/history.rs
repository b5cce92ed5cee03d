//! Bounded message histories.
//!
//! Rooms and private conversations each keep the most recent messages in
//! a FIFO buffer. Evicting a message releases its attachments.

use dashmap::DashMap;
use murmur_protocol::Message;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;

use crate::attachment::AttachmentStore;

/// FIFO buffer holding at most `capacity` messages.
#[derive(Debug)]
pub struct HistoryBuffer {
    messages: VecDeque<Message>,
    capacity: usize,
}

impl HistoryBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    /// Append a message, returning the evicted oldest one if full.
    ///
    /// A zero-capacity buffer retains nothing and hands the message back.
    pub fn push(&mut self, message: Message) -> Option<Message> {
        if self.capacity == 0 {
            return Some(message);
        }
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        evicted
    }

    /// Messages, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.messages.drain(..)
    }
}

/// Histories keyed by conversation.
#[derive(Debug)]
pub struct HistoryStore<K: Eq + Hash> {
    buffers: DashMap<K, Arc<Mutex<HistoryBuffer>>>,
    capacity: usize,
    attachments: Arc<AttachmentStore>,
}

/// Room histories, keyed by room ID.
pub type RoomHistory = HistoryStore<String>;

/// Private histories, keyed by user pair.
pub type PrivateHistory = HistoryStore<PairKey>;

impl<K: Eq + Hash> HistoryStore<K> {
    #[must_use]
    pub fn new(capacity: usize, attachments: Arc<AttachmentStore>) -> Self {
        Self {
            buffers: DashMap::new(),
            capacity,
            attachments,
        }
    }

    fn buffer(&self, key: K) -> Arc<Mutex<HistoryBuffer>> {
        if let Some(buffer) = self.buffers.get(&key) {
            return buffer.clone();
        }
        self.buffers
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(HistoryBuffer::new(self.capacity))))
            .clone()
    }

    /// Append to the conversation, creating its buffer on first use.
    pub fn append(&self, key: K, message: Message) {
        let evicted = self.buffer(key).lock().push(message);
        if let Some(evicted) = evicted {
            self.release(&evicted);
        }
    }

    /// Messages of the conversation, oldest first.
    #[must_use]
    pub fn snapshot<Q>(&self, key: &Q) -> Vec<Message>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.buffers
            .get(key)
            .map(|b| b.lock().snapshot())
            .unwrap_or_default()
    }

    /// Number of retained messages in the conversation.
    #[must_use]
    pub fn len<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.buffers.get(key).map(|b| b.lock().len()).unwrap_or(0)
    }

    /// Drop the conversation and release all of its attachments.
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some((_, buffer)) = self.buffers.remove(key) {
            let messages: Vec<Message> = buffer.lock().drain().collect();
            for message in &messages {
                self.release(message);
            }
        }
    }

    fn release(&self, message: &Message) {
        for attachment in &message.attachments {
            self.attachments.remove(&attachment.id);
        }
    }
}

/// Order-independent key of a two-user conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey(String, String);

impl PairKey {
    #[must_use]
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_protocol::{AttachmentRef, MessageKind};

    fn message(body: &str) -> Message {
        Message::new(MessageKind::RoomMessage).with_body(body)
    }

    fn store(capacity: usize) -> RoomHistory {
        HistoryStore::new(
            capacity,
            Arc::new(AttachmentStore::new("unused", "/upload", 300)),
        )
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = HistoryBuffer::new(2);
        assert!(buffer.push(message("1")).is_none());
        assert!(buffer.push(message("2")).is_none());
        assert_eq!(buffer.push(message("3")).unwrap().body, "1");

        let bodies: Vec<_> = buffer.snapshot().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["2", "3"]);
    }

    #[test]
    fn test_zero_capacity() {
        let mut buffer = HistoryBuffer::new(0);
        assert!(buffer.push(message("1")).is_some());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_store_capacity() {
        let history = store(200);
        for i in 0..205 {
            history.append("room-1".to_string(), message(&i.to_string()));
        }

        let snapshot = history.snapshot("room-1");
        assert_eq!(snapshot.len(), 200);
        assert_eq!(snapshot[0].body, "5");
        assert_eq!(snapshot[199].body, "204");
        assert!(history.snapshot("other").is_empty());
    }

    #[test]
    fn test_store_remove() {
        let history = store(10);
        history.append(
            "room-1".to_string(),
            message("x").with_attachments(vec![AttachmentRef::default()]),
        );
        assert_eq!(history.len("room-1"), 1);

        history.remove("room-1");
        assert_eq!(history.len("room-1"), 0);
    }

    #[test]
    fn test_pair_key_symmetric() {
        assert_eq!(PairKey::new("a", "b"), PairKey::new("b", "a"));
        assert_ne!(PairKey::new("a", "b"), PairKey::new("a", "c"));
    }
}
