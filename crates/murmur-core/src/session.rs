//! Sessions: one logical connection (tab/device) of a user.
//!
//! A session bridges bus deliveries into a buffer a long-poll call can
//! drain. Every topic subscription runs its own forwarder task which
//! decodes deliveries, drops room messages from senders the user muted,
//! appends to the buffer and wakes the poller. The forwarder owns the bus
//! subscription: it releases the topic once its cancel sender is fired or
//! dropped.

use dashmap::DashMap;
use murmur_bus::{Bus, BusError, Inbound};
use murmur_protocol::{codec, Message, MessageKind, Peer};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::user::User;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Unknown, expired or closed session.
    #[error("Session not found: {0}")]
    NotFound(String),
}

/// Result of a long-poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Buffered messages, in arrival order. Never empty.
    Messages(Vec<Message>),
    /// The session was torn down.
    Disconnected,
    /// The caller went away; the session has been torn down.
    Cancelled,
}

#[derive(Debug)]
struct Expiry {
    deadline: Instant,
    expired: bool,
}

/// A single logical connection of a user.
#[derive(Debug)]
pub struct Session {
    id: String,
    user: Arc<User>,
    /// Topic -> forwarder cancel signal.
    subscriptions: Mutex<HashMap<String, oneshot::Sender<()>>>,
    /// Messages not yet handed to a poller.
    buffer: Mutex<Vec<Message>>,
    /// Single-permit "buffer available" signal.
    available: Notify,
    /// IDs of joined rooms.
    rooms: Mutex<HashSet<String>>,
    expiry: Mutex<Expiry>,
    timeout: Duration,
    closing: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Session {
    /// Create a session whose expiry deadline is `timeout` from now.
    #[must_use]
    pub fn new(id: impl Into<String>, user: Arc<User>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            user,
            subscriptions: Mutex::new(HashMap::new()),
            buffer: Mutex::new(Vec::new()),
            available: Notify::new(),
            rooms: Mutex::new(HashSet::new()),
            expiry: Mutex::new(Expiry {
                deadline: Instant::now() + timeout,
                expired: false,
            }),
            timeout,
            closing: AtomicBool::new(false),
            closed: watch::channel(false).0,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    /// Reference to this session as a reply target.
    #[must_use]
    pub fn peer(&self) -> Peer {
        Peer::new(self.id.clone(), self.user.name())
    }

    /// Subscribe to `topic`. A no-op if already subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus refuses the subscription.
    pub fn subscribe(self: &Arc<Self>, bus: &Arc<dyn Bus>, topic: &str) -> Result<(), BusError> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(topic) {
            debug!(session = %self.id, topic = %topic, "Already subscribed");
            return Ok(());
        }

        let inbound = bus.subscribe(topic)?;
        let (cancel, cancelled) = oneshot::channel();
        tokio::spawn(forward(Arc::downgrade(self), bus.clone(), inbound, cancelled));
        subscriptions.insert(topic.to_string(), cancel);

        debug!(session = %self.id, topic = %topic, "Subscribed");
        Ok(())
    }

    /// Cancel the subscription to `topic`, if any. No further deliveries
    /// from it reach the buffer.
    pub fn unsubscribe(&self, topic: &str) {
        let cancel = self.subscriptions.lock().remove(topic);
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
            debug!(session = %self.id, topic = %topic, "Unsubscribed");
        }
    }

    /// Cancel every subscription.
    pub fn unsubscribe_all(&self) {
        let drained: Vec<(String, oneshot::Sender<()>)> = self.subscriptions.lock().drain().collect();
        for (_, cancel) in drained {
            let _ = cancel.send(());
        }
        debug!(session = %self.id, "Unsubscribed from all topics");
    }

    /// Check if subscribed to `topic`.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains_key(topic)
    }

    /// Subscribed topics.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    /// Buffer an inbound message and wake the poller.
    ///
    /// Room messages from senders muted by this session's user are dropped.
    pub fn deliver(&self, message: Message) {
        if message.kind == MessageKind::RoomMessage && self.user.is_muting(&message.from.id) {
            trace!(session = %self.id, from = %message.from.id, "Dropped message from muted sender");
            return;
        }

        self.buffer.lock().push(message);
        // A stored permit coalesces with any later deliveries.
        self.available.notify_one();
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    fn take_buffer(&self) -> Vec<Message> {
        std::mem::take(&mut *self.buffer.lock())
    }

    /// Wait for buffered messages, teardown of the session, or `cancel`.
    ///
    /// Returns immediately when the buffer is non-empty. Cancellation only
    /// reports [`PollOutcome::Cancelled`]; tearing the session down is the
    /// caller's job (see `Chat::poll`).
    pub async fn wait<F>(&self, cancel: F) -> PollOutcome
    where
        F: Future<Output = ()>,
    {
        let mut closed = self.closed.subscribe();
        tokio::pin!(cancel);

        loop {
            if *closed.borrow_and_update() {
                return PollOutcome::Disconnected;
            }

            let batch = self.take_buffer();
            if !batch.is_empty() {
                return PollOutcome::Messages(batch);
            }

            tokio::select! {
                biased;
                () = &mut cancel => return PollOutcome::Cancelled,
                changed = closed.changed() => {
                    if changed.is_err() {
                        return PollOutcome::Disconnected;
                    }
                }
                () = self.available.notified() => {}
            }
        }
    }

    /// Extend the session's life by the heartbeat timeout.
    ///
    /// Returns `false` if the session already expired or is closing; an
    /// expiry that fired concurrently always wins.
    pub fn touch(&self) -> bool {
        if self.is_closing() {
            return false;
        }
        let mut expiry = self.expiry.lock();
        if expiry.expired {
            return false;
        }
        expiry.deadline = Instant::now() + self.timeout;
        true
    }

    /// Current expiry deadline.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.expiry.lock().deadline
    }

    /// Mark the session expired if its deadline has passed.
    ///
    /// Returns `true` exactly once, for the caller that should tear it down.
    pub fn try_expire(&self) -> bool {
        let mut expiry = self.expiry.lock();
        if expiry.expired || Instant::now() < expiry.deadline {
            return false;
        }
        expiry.expired = true;
        true
    }

    /// IDs of joined rooms.
    #[must_use]
    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.lock().iter().cloned().collect()
    }

    /// Check if the session joined the room with `room_id`.
    #[must_use]
    pub fn in_room(&self, room_id: &str) -> bool {
        self.rooms.lock().contains(room_id)
    }

    pub(crate) fn add_room(&self, room_id: &str) {
        self.rooms.lock().insert(room_id.to_string());
    }

    pub(crate) fn remove_room(&self, room_id: &str) {
        self.rooms.lock().remove(room_id);
    }

    /// Claim the teardown. Returns `false` if teardown already started.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    /// Fire the one-shot closed signal.
    pub(crate) fn finish_close(&self) {
        self.closed.send_replace(true);
    }

    /// Check if teardown started.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Check if teardown completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receiver of the closed signal.
    #[must_use]
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Move deliveries from one topic into the session buffer, in order.
///
/// Runs until cancelled, the topic closes or the session is gone, then
/// drops the subscription before releasing the topic on the bus.
async fn forward(
    session: Weak<Session>,
    bus: Arc<dyn Bus>,
    mut inbound: Box<dyn Inbound>,
    mut cancelled: oneshot::Receiver<()>,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = &mut cancelled => break,
            payload = inbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        let Some(session) = session.upgrade() else {
            break;
        };
        match codec::decode(&payload) {
            Ok(message) => session.deliver(message),
            Err(e) => {
                warn!(session = %session.id(), topic = %inbound.topic(), error = %e, "Failed to decode delivery");
            }
        }
    }

    let topic = inbound.topic().to_string();
    drop(inbound);
    bus.unsubscribe(&topic);
    trace!(topic = %topic, "Forwarder stopped");
}

/// Index of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id().to_string(), session);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use murmur_bus::LocalBus;

    fn session(user: &str) -> Arc<Session> {
        let user = Arc::new(User::new(user, user));
        Arc::new(Session::new(
            format!("{}:test", user.id()),
            user,
            Duration::from_secs(30),
        ))
    }

    fn room_message(from: &str, body: &str) -> Message {
        Message::new(MessageKind::RoomMessage)
            .with_from(Peer::new(from, from))
            .with_body(body)
    }

    #[tokio::test]
    async fn test_wait_returns_buffered_immediately() {
        let s = session("alice");
        s.deliver(room_message("bob", "one"));
        s.deliver(room_message("bob", "two"));

        match s.wait(std::future::pending()).await {
            PollOutcome::Messages(batch) => {
                assert_eq!(batch.len(), 2);
                assert_eq!(batch[0].body, "one");
                assert_eq!(batch[1].body, "two");
            }
            other => panic!("Expected messages, got {:?}", other),
        }
        assert_eq!(s.buffered(), 0);
    }

    #[tokio::test]
    async fn test_wait_skips_stale_signal() {
        let s = session("alice");
        s.deliver(room_message("bob", "one"));
        // Drain without consuming the stored permit.
        assert_eq!(s.take_buffer().len(), 1);

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            s.wait(std::future::pending()),
        )
        .await;
        assert!(outcome.is_err(), "poll must keep waiting on an empty buffer");
    }

    #[tokio::test]
    async fn test_wait_wakes_on_delivery() {
        let s = session("alice");
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.wait(std::future::pending()).await })
        };

        tokio::task::yield_now().await;
        s.deliver(room_message("bob", "late"));

        match waiter.await.unwrap() {
            PollOutcome::Messages(batch) => assert_eq!(batch[0].body, "late"),
            other => panic!("Expected messages, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_closed_and_cancelled() {
        let s = session("alice");
        assert_eq!(s.wait(async {}).await, PollOutcome::Cancelled);

        assert!(s.begin_close());
        assert!(!s.begin_close());
        s.finish_close();
        assert_eq!(
            s.wait(std::future::pending()).await,
            PollOutcome::Disconnected
        );
        assert!(s.is_closed());
    }

    #[test]
    fn test_muted_room_messages_dropped() {
        let s = session("alice");
        s.user().mute("bob");

        s.deliver(room_message("bob", "hidden"));
        s.deliver(room_message("carol", "shown"));
        s.deliver(Message::new(MessageKind::PrivateMessage).with_from(Peer::new("bob", "bob")));

        let batch = s.take_buffer();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].body, "shown");
        assert_eq!(batch[1].kind, MessageKind::PrivateMessage);
    }

    fn local_bus() -> (Arc<LocalBus>, Arc<dyn Bus>) {
        let bus = Arc::new(LocalBus::new());
        let handle: Arc<dyn Bus> = bus.clone();
        (bus, handle)
    }

    #[tokio::test]
    async fn test_subscribe_forwards_in_order() {
        let (bus, handle) = local_bus();
        let s = session("alice");

        s.subscribe(&handle, "room-1").unwrap();
        s.subscribe(&handle, "room-1").unwrap();
        assert_eq!(bus.subscriber_count("room-1"), 1);

        for i in 0..5 {
            let payload = codec::encode(&room_message("bob", &i.to_string())).unwrap();
            bus.publish("room-1", payload).unwrap();
        }
        bus.publish("room-1", Bytes::from_static(b"garbage")).unwrap();
        bus.publish("room-1", codec::encode(&room_message("bob", "5")).unwrap())
            .unwrap();

        let mut bodies = Vec::new();
        while bodies.len() < 6 {
            match s.wait(std::future::pending()).await {
                PollOutcome::Messages(batch) => bodies.extend(batch.into_iter().map(|m| m.body)),
                other => panic!("Expected messages, got {:?}", other),
            }
        }
        assert_eq!(bodies, vec!["0", "1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let (bus, handle) = local_bus();
        let s = session("alice");

        s.subscribe(&handle, "a").unwrap();
        s.subscribe(&handle, "b").unwrap();
        assert_eq!(s.topics().len(), 2);

        s.unsubscribe("a");
        assert!(!s.is_subscribed("a"));
        assert!(s.is_subscribed("b"));

        s.unsubscribe_all();
        assert!(s.topics().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.stats().topic_count, 0);
        assert_eq!(bus.stats().subscriber_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_and_expire() {
        let s = session("alice");
        assert!(!s.try_expire());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(s.touch());
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!s.try_expire());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(s.try_expire());
        assert!(!s.try_expire());
        assert!(!s.touch());
    }

    #[test]
    fn test_registry() {
        let registry = SessionRegistry::new();
        let s = session("alice");

        registry.insert(s.clone());
        assert!(registry.contains(s.id()));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(s.id()).is_some());
        assert!(registry.get(s.id()).is_none());
    }
}
