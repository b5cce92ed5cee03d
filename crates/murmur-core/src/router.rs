//! Client message dispatch.
//!
//! Every outcome, including every rejection, is a typed message published
//! to the caller's session topic, user topic, a room topic or the
//! broadcast topic. Nothing is returned to the transport.

use chrono::Utc;
use murmur_protocol::{codec, MemberInfo, Message, MessageKind, Peer};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::chat::{publish, Chat};
use crate::history::PairKey;
use crate::room::{validate_room_name, Room, RoomError, RoomKind};
use crate::session::Session;
use crate::user::User;

impl Chat {
    /// Interpret one client message sent through `session`.
    pub fn process(&self, message: Message, session: &Arc<Session>) {
        trace!(session = %session.id(), kind = %message.kind, "Processing message");

        match message.kind {
            MessageKind::Heartbeat => self.reply(session, Message::heartbeat(session.peer())),
            MessageKind::Rooms => self.list_rooms(session),
            MessageKind::RoomCreate => self.create_room(&message, session),
            MessageKind::RoomJoin => self.join_room(&message, session),
            MessageKind::RoomLeave => self.leave_room(&message, session),
            MessageKind::RoomUsers => self.room_users(&message, session),
            MessageKind::RoomMessage => self.room_message(message, session),
            MessageKind::PrivateMessage => self.private_message(message, session),
            MessageKind::PrivateRequest => self.private_request(&message, session),
            MessageKind::PrivateHistory => self.send_private_history(&message, session),
            MessageKind::Mute => self.set_mute(&message, session, true),
            MessageKind::Unmute => self.set_mute(&message, session, false),
            other => {
                trace!(session = %session.id(), kind = %other, "Ignoring message");
            }
        }
    }

    fn reply(&self, session: &Session, message: Message) {
        publish(self.bus.as_ref(), session.id(), &message);
    }

    fn notice(&self, session: &Session, kind: MessageKind, to: Peer) {
        self.reply(session, Message::new(kind).with_to(to));
    }

    fn reply_json<T: Serialize + ?Sized>(&self, session: &Session, kind: MessageKind, to: Peer, body: &T) {
        match codec::body_json(body) {
            Ok(body) => self.reply(session, Message::new(kind).with_to(to).with_body(body)),
            Err(e) => warn!(session = %session.id(), kind = %kind, error = %e, "Failed to encode reply body"),
        }
    }

    /// Validate the room name in `to` and resolve the room by ID.
    ///
    /// Replies with the rejection and returns `None` on failure.
    fn resolve_room(&self, message: &Message, session: &Session) -> Option<Arc<Room>> {
        if !validate_room_name(&message.to.name, self.config.max_room_name_length) {
            self.notice(session, MessageKind::RoomBadName, message.to.clone());
            return None;
        }
        let room = self.rooms.get_by_id(&message.to.id);
        if room.is_none() {
            self.notice(session, MessageKind::RoomNotFound, message.to.clone());
        }
        room
    }

    /// Like [`Chat::resolve_room`], additionally requiring membership.
    fn resolve_joined_room(&self, message: &Message, session: &Session) -> Option<Arc<Room>> {
        let room = self.resolve_room(message, session)?;
        if !room.has_user(session.user().id()) {
            self.notice(session, MessageKind::RoomNotJoined, room.peer());
            return None;
        }
        Some(room)
    }

    /// Resolve the target user in `to`, replying `user.not_found` if unknown.
    fn resolve_user(&self, message: &Message, session: &Session) -> Option<Arc<User>> {
        let user = self.users.get(&message.to.id);
        if user.is_none() {
            self.notice(session, MessageKind::UserNotFound, message.to.clone());
        }
        user
    }

    fn list_rooms(&self, session: &Session) {
        let rooms = self.rooms.list_public();
        self.reply_json(session, MessageKind::RoomList, session.peer(), &rooms);
    }

    fn create_room(&self, message: &Message, session: &Session) {
        let name = &message.to.name;
        if !validate_room_name(name, self.config.max_room_name_length) {
            self.notice(session, MessageKind::RoomBadName, message.to.clone());
            return;
        }

        let max = self.config.max_rooms;
        if max > 0 && self.rooms.count(RoomKind::Public) >= max {
            self.notice(session, MessageKind::RoomMaxCount, message.to.clone());
            return;
        }

        match self.rooms.create(name, RoomKind::Public) {
            Ok(room) => debug!(session = %session.id(), room = %room.name(), "Room created by client"),
            Err(RoomError::AlreadyExists(existing)) => {
                self.notice(session, MessageKind::RoomAlreadyExists, existing.peer());
            }
            Err(e) => {
                warn!(session = %session.id(), room = %name, error = %e, "Room creation failed");
                self.notice(session, MessageKind::RoomBadName, message.to.clone());
            }
        }
    }

    fn join_room(&self, message: &Message, session: &Arc<Session>) {
        let Some(room) = self.resolve_room(message, session) else {
            return;
        };

        let max = self.config.max_room_users;
        if max > 0 && !room.has_user(session.user().id()) && room.user_count() >= max {
            self.notice(session, MessageKind::RoomFull, room.peer());
            return;
        }

        match self.join(&room, session, true) {
            Ok(_) => {}
            Err(RoomError::NotFound(_)) => {
                self.notice(session, MessageKind::RoomNotFound, message.to.clone());
            }
            Err(RoomError::Closed) => {
                debug!(session = %session.id(), room = %room.name(), "Join on closing session ignored");
            }
            Err(e) => {
                warn!(session = %session.id(), room = %room.name(), error = %e, "Join failed, deleting room");
                self.notice(session, MessageKind::RoomBadName, room.peer());
                self.delete_room(&room);
            }
        }
    }

    fn leave_room(&self, message: &Message, session: &Session) {
        let Some(room) = self.resolve_joined_room(message, session) else {
            return;
        };
        self.leave(&room, session, true);
        self.notice(session, MessageKind::RoomLeave, room.peer());
    }

    fn room_users(&self, message: &Message, session: &Session) {
        let Some(room) = self.resolve_joined_room(message, session) else {
            return;
        };

        let caller = session.user();
        let mut members: Vec<MemberInfo> = room
            .users()
            .iter()
            .map(|u| MemberInfo {
                id: u.id().to_string(),
                name: u.name().to_string(),
                muted: caller.is_muting(u.id()),
            })
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        self.reply_json(session, MessageKind::RoomUsers, room.peer(), &members);
    }

    fn room_message(&self, mut message: Message, session: &Session) {
        let Some(room) = self.resolve_joined_room(&message, session) else {
            return;
        };

        let user = session.user();
        message.from = user.peer();
        message.to = room.peer();
        message.timestamp = Utc::now();
        message.body = self.moderator.apply(&message.body);
        self.attachments.strip_missing(&mut message.attachments);

        if !user.try_acquire(self.config.rate_limit_max) {
            debug!(user = %user.id(), room = %room.name(), "Rate limit exceeded");
            self.notice(session, MessageKind::TooManyRequests, room.peer());
            return;
        }

        publish(self.bus.as_ref(), room.id(), &message);
        self.room_history.append(room.id().to_string(), message);
    }

    fn private_message(&self, mut message: Message, session: &Session) {
        let Some(target) = self.resolve_user(&message, session) else {
            return;
        };

        let user = session.user();
        if user.is_muting(target.id()) || target.is_muting(user.id()) {
            trace!(user = %user.id(), target = %target.id(), "Private message between muted users dropped");
            return;
        }

        message.from = user.peer();
        message.to = target.peer();
        message.timestamp = Utc::now();
        self.attachments.strip_missing(&mut message.attachments);
        self.private_history
            .append(PairKey::new(user.id(), target.id()), message.clone());

        if !user.try_acquire(self.config.rate_limit_max) {
            debug!(user = %user.id(), target = %target.id(), "Rate limit exceeded");
            self.notice(session, MessageKind::TooManyRequests, target.peer());
            return;
        }

        publish(self.bus.as_ref(), target.id(), &message);

        message.kind = MessageKind::PrivateDelivered;
        publish(self.bus.as_ref(), user.id(), &message);
    }

    fn private_request(&self, message: &Message, session: &Session) {
        let Some(target) = self.resolve_user(message, session) else {
            return;
        };

        let user = session.user();
        if user.is_muting(target.id()) || target.is_muting(user.id()) {
            trace!(user = %user.id(), target = %target.id(), "Private request between muted users dropped");
            return;
        }

        let created = Message::new(MessageKind::PrivateCreated)
            .with_from(user.peer())
            .with_to(target.peer());
        publish(self.bus.as_ref(), user.id(), &created);
    }

    fn send_private_history(&self, message: &Message, session: &Session) {
        let Some(target) = self.resolve_user(message, session) else {
            return;
        };

        let history = self.private_history_for(session.user().id(), target.id());
        self.reply_json(session, MessageKind::PrivateHistory, target.peer(), &history);
    }

    fn set_mute(&self, message: &Message, session: &Session, mute: bool) {
        let Some(target) = self.resolve_user(message, session) else {
            return;
        };

        let user = session.user();
        let kind = if mute {
            user.mute(target.id());
            MessageKind::Muted
        } else {
            user.unmute(target.id());
            MessageKind::Unmuted
        };
        debug!(user = %user.id(), target = %target.id(), kind = %kind, "Mute set changed");

        let notice = Message::new(kind).with_from(user.peer()).with_to(target.peer());
        publish(self.bus.as_ref(), user.id(), &notice);
        publish(self.bus.as_ref(), target.id(), &notice);
    }
}
