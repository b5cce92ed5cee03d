//! The chat engine.
//!
//! [`Chat`] owns every registry and the bus handle, and exposes the session
//! lifecycle (connect, lookup, poll, close), room join/leave and uploads.
//! Client messages are dispatched by [`Chat::process`] in `router.rs`.

use bytes::Bytes;
use murmur_bus::{Bus, BusError};
use murmur_protocol::{codec, Message, MessageKind, ProtocolError};
use std::future::Future;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::attachment::{AttachmentStore, Upload};
use crate::config::ChatConfig;
use crate::filter::Moderator;
use crate::history::{PairKey, PrivateHistory, RoomHistory};
use crate::room::{Entered, Exited, Room, RoomError, RoomKind, RoomRegistry};
use crate::session::{PollOutcome, Session, SessionError, SessionRegistry};
use crate::user::{User, UserRegistry};
use crate::{random_token, BROADCAST_TOPIC};

/// Engine construction errors.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid bad word pattern: {0}")]
    BadWordPattern(#[from] regex::Error),
}

/// Upload errors.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The request would exceed the user's upload quota.
    #[error("Upload quota exceeded: {used} of {quota} bytes used, {requested} requested")]
    OverQuota { used: u64, requested: u64, quota: u64 },
}

/// A file received by the transport.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub content_type: String,
    pub data: Bytes,
}

/// Encode and publish, logging failures.
pub(crate) fn publish(bus: &dyn Bus, topic: &str, message: &Message) {
    let payload = match codec::encode(message) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(topic = %topic, kind = %message.kind, error = %e, "Failed to encode message");
            return;
        }
    };
    if let Err(e) = bus.publish(topic, payload) {
        warn!(topic = %topic, kind = %message.kind, error = %e, "Failed to publish message");
    }
}

/// Encode a `room.join` echo carrying `history`, dropping the oldest
/// entries until the message fits the codec size limit.
fn encode_history_echo(mut echo: Message, mut history: &[Message]) -> Result<Bytes, ProtocolError> {
    loop {
        echo.body = codec::body_json(history)?;
        match codec::encode(&echo) {
            Err(ProtocolError::TooLarge(size)) if !history.is_empty() => {
                let keep = (history.len() * codec::MAX_MESSAGE_SIZE / size).min(history.len() - 1);
                history = &history[history.len() - keep..];
            }
            result => return result,
        }
    }
}

/// The chat engine.
pub struct Chat {
    this: Weak<Chat>,
    pub(crate) config: ChatConfig,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) users: UserRegistry,
    pub(crate) sessions: SessionRegistry,
    pub(crate) rooms: RoomRegistry,
    pub(crate) room_history: RoomHistory,
    pub(crate) private_history: PrivateHistory,
    pub(crate) attachments: Arc<AttachmentStore>,
    pub(crate) moderator: Moderator,
}

impl std::fmt::Debug for Chat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chat")
            .field("bus", &self.bus.name())
            .field("users", &self.users.len())
            .field("sessions", &self.sessions.len())
            .field("rooms", &self.rooms.len())
            .finish()
    }
}

impl Chat {
    /// Create an engine on top of `bus`.
    ///
    /// # Errors
    ///
    /// Returns an error if a bad word pattern does not compile.
    pub fn new(config: ChatConfig, bus: Arc<dyn Bus>) -> Result<Arc<Self>, ChatError> {
        let moderator = Moderator::new(config.max_text_length, &config.bad_words)?;
        let attachments = Arc::new(AttachmentStore::new(
            config.upload_dir.clone(),
            config.upload_url_prefix.clone(),
            config.thumbnail_width,
        ));

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            users: UserRegistry::new(config.rate_limit_interval, config.upload_quota_reset),
            sessions: SessionRegistry::new(),
            rooms: RoomRegistry::new(bus.clone()),
            room_history: RoomHistory::new(config.room_history_capacity, attachments.clone()),
            private_history: PrivateHistory::new(
                config.private_history_capacity,
                attachments.clone(),
            ),
            attachments,
            moderator,
            bus,
            config,
        }))
    }

    /// Create the configured default rooms as permanent public rooms.
    ///
    /// # Errors
    ///
    /// Returns an error if a room topic cannot be opened.
    pub fn start(&self) -> Result<(), RoomError> {
        for name in &self.config.default_rooms {
            let room = match self.rooms.create(name, RoomKind::Public) {
                Ok(room) => room,
                Err(RoomError::AlreadyExists(room)) => room,
                Err(e) => return Err(e),
            };
            room.set_permanent(true);
        }
        info!(rooms = ?self.config.default_rooms, "Default rooms ready");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    #[must_use]
    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    #[must_use]
    pub fn attachments(&self) -> &Arc<AttachmentStore> {
        &self.attachments
    }

    #[must_use]
    pub fn room_history(&self) -> &RoomHistory {
        &self.room_history
    }

    #[must_use]
    pub fn private_history(&self) -> &PrivateHistory {
        &self.private_history
    }

    /// Resolve an authenticated identity to its user.
    pub fn user(&self, id: &str, name: &str) -> Arc<User> {
        self.users.get_or_create(id, name)
    }

    /// Open a new session for `user`.
    ///
    /// The session listens on its own ID, the user's ID and the broadcast
    /// topic, and is torn down once idle for the heartbeat timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if one of the three subscriptions fails; nothing is
    /// registered in that case.
    pub fn connect(&self, user: &Arc<User>) -> Result<Arc<Session>, BusError> {
        let id = format!("{}:{}", user.id(), random_token(32));
        let session = Arc::new(Session::new(id, user.clone(), self.config.heartbeat_timeout));

        for topic in [session.id(), user.id(), BROADCAST_TOPIC] {
            if let Err(e) = session.subscribe(&self.bus, topic) {
                session.unsubscribe_all();
                return Err(e);
            }
        }

        self.sessions.insert(session.clone());
        user.add_session(session.id());
        self.spawn_reaper(&session);

        info!(session = %session.id(), user = %user.id(), "Session opened");
        Ok(session)
    }

    /// Look up a live session, extending its life by the heartbeat timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] for unknown, expired or closed
    /// sessions.
    pub fn session(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        match self.sessions.get(id) {
            Some(session) if session.touch() => Ok(session),
            _ => Err(SessionError::NotFound(id.to_string())),
        }
    }

    /// Long-poll the session.
    ///
    /// Completion of `cancel` means the client went away and tears the
    /// session down.
    pub async fn poll<F>(&self, session: &Arc<Session>, cancel: F) -> PollOutcome
    where
        F: Future<Output = ()>,
    {
        let outcome = session.wait(cancel).await;
        if outcome == PollOutcome::Cancelled {
            debug!(session = %session.id(), "Poll cancelled by client");
            self.teardown(session);
        }
        outcome
    }

    /// Explicitly close a session.
    pub fn close(&self, session: &Session) {
        self.teardown(session);
    }

    /// Leave every room, drop every subscription, unregister the session
    /// and fire its closed signal. Runs at most once per session.
    pub fn teardown(&self, session: &Session) {
        if !session.begin_close() {
            return;
        }

        for room_id in session.room_ids() {
            match self.rooms.get_by_id(&room_id) {
                Some(room) => {
                    self.leave(&room, session, true);
                }
                None => session.remove_room(&room_id),
            }
        }

        session.unsubscribe_all();
        self.sessions.remove(session.id());
        session.user().remove_session(session.id());
        session.finish_close();

        info!(session = %session.id(), user = %session.user().id(), "Session closed");
    }

    fn spawn_reaper(&self, session: &Arc<Session>) {
        let chat = self.this.clone();
        let weak = Arc::downgrade(session);
        let mut closed = session.closed_signal();

        tokio::spawn(async move {
            loop {
                let Some(deadline) = weak.upgrade().map(|s| s.deadline()) else {
                    return;
                };

                tokio::select! {
                    _ = closed.wait_for(|closed| *closed) => return,
                    () = tokio::time::sleep_until(deadline) => {}
                }

                let Some(session) = weak.upgrade() else {
                    return;
                };
                if session.try_expire() {
                    info!(session = %session.id(), "Session expired");
                    if let Some(chat) = chat.upgrade() {
                        chat.teardown(&session);
                    }
                    return;
                }
            }
        });
    }

    /// Add the session to the room.
    ///
    /// A newly joined session receives the room history on its own topic;
    /// other members see a `room.join` when the user was not yet present
    /// and `notify` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the room was deleted, the session is closing, or
    /// the room topic subscription fails.
    pub fn join(&self, room: &Arc<Room>, session: &Arc<Session>, notify: bool) -> Result<Entered, RoomError> {
        let bus = self.bus.as_ref();
        let entered = room.enter(session, |s| s.subscribe(&self.bus, room.id()))?;

        let user = session.user();
        if entered.new_session {
            let history = self.room_history_for(room, user);
            let echo = Message::new(MessageKind::RoomJoin)
                .with_from(user.peer())
                .with_to(room.peer());
            match encode_history_echo(echo, &history) {
                Ok(payload) => {
                    if let Err(e) = bus.publish(session.id(), payload) {
                        warn!(session = %session.id(), error = %e, "Failed to publish room history");
                    }
                }
                Err(e) => warn!(room = %room.name(), error = %e, "Failed to encode room history"),
            }
        }

        if entered.new_user && notify {
            let notice = Message::new(MessageKind::RoomJoin)
                .with_from(user.peer())
                .with_to(room.peer());
            publish(bus, room.id(), &notice);
        }

        Ok(entered)
    }

    /// Remove the session from the room, deleting the room once it is
    /// empty and not permanent.
    pub fn leave(&self, room: &Arc<Room>, session: &Session, notify: bool) -> Exited {
        let bus = self.bus.as_ref();
        let exited = room.exit(session, |s| s.unsubscribe(room.id()));

        if exited.user_left && notify {
            let notice = Message::new(MessageKind::RoomLeave)
                .with_from(session.user().peer())
                .with_to(room.peer());
            publish(bus, room.id(), &notice);
        }

        if exited.left_session && exited.now_empty && self.rooms.remove_if_empty(room) {
            self.room_history.remove(room.id());
        }

        exited
    }

    /// Delete a room regardless of membership, together with its history.
    pub fn delete_room(&self, room: &Room) {
        if self.rooms.remove(room) {
            self.room_history.remove(room.id());
        }
    }

    /// Room history as seen by `user`.
    ///
    /// Messages from a sender the user muted are hidden when sent after the
    /// mute; attachment references that no longer resolve are stripped.
    #[must_use]
    pub fn room_history_for(&self, room: &Room, user: &User) -> Vec<Message> {
        let mut history = self.room_history.snapshot(room.id());
        history.retain(|m| match user.muted_since(&m.from.id) {
            Some(since) => since >= m.timestamp,
            None => true,
        });
        for message in &mut history {
            self.attachments.strip_missing(&mut message.attachments);
        }
        history
    }

    /// Stored private conversation between two users.
    #[must_use]
    pub fn private_history_for(&self, a: &str, b: &str) -> Vec<Message> {
        let mut history = self.private_history.snapshot(&PairKey::new(a, b));
        for message in &mut history {
            self.attachments.strip_missing(&mut message.attachments);
        }
        history
    }

    /// Store uploaded images for `user`.
    ///
    /// Files that fail individually are logged and skipped. Only content
    /// not already stored counts against the quota.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::OverQuota`] before touching any file if the
    /// request would exceed the user's quota.
    pub async fn upload(&self, user: &User, files: Vec<UploadFile>) -> Result<Vec<Upload>, UploadError> {
        let quota = self.config.upload_quota;
        let requested: u64 = files.iter().map(|f| f.data.len() as u64).sum();
        let used = user.upload_bytes();
        if quota > 0 && used.saturating_add(requested) > quota {
            return Err(UploadError::OverQuota {
                used,
                requested,
                quota,
            });
        }

        let mut uploads = Vec::with_capacity(files.len());
        for file in files {
            match self.attachments.upload(&file.content_type, file.data).await {
                Ok(upload) => {
                    if !upload.cached {
                        user.charge_upload(upload.size);
                    }
                    uploads.push(upload);
                }
                Err(e) => {
                    warn!(user = %user.id(), content_type = %file.content_type, error = %e, "Upload rejected");
                }
            }
        }
        Ok(uploads)
    }
}
