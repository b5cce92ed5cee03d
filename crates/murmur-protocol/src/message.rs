//! Message types for the Murmur protocol.
//!
//! A [`Message`] is the single unit exchanged between clients and the
//! engine, and the payload carried on every bus topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message type identifiers.
///
/// The first group is sent by clients, the second is produced by the
/// server. Tags the engine does not recognise decode to [`MessageKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", from = "String")]
pub enum MessageKind {
    Heartbeat,
    Rooms,
    RoomCreate,
    RoomJoin,
    RoomLeave,
    RoomUsers,
    RoomMessage,
    PrivateMessage,
    PrivateRequest,
    PrivateHistory,
    Mute,
    Unmute,

    RoomList,
    RoomBadName,
    RoomFull,
    RoomNotJoined,
    RoomMaxCount,
    RoomNotFound,
    RoomAlreadyExists,
    RoomCreated,
    RoomDeleted,
    UserNotFound,
    TooManyRequests,
    Disconnected,
    SessionNotFound,
    PrivateCreated,
    PrivateDelivered,
    Muted,
    Unmuted,

    /// Any tag not listed above.
    Unknown,
}

impl MessageKind {
    /// The wire tag of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Rooms => "rooms",
            MessageKind::RoomCreate => "room.create",
            MessageKind::RoomJoin => "room.join",
            MessageKind::RoomLeave => "room.leave",
            MessageKind::RoomUsers => "room.users",
            MessageKind::RoomMessage => "room.message",
            MessageKind::PrivateMessage => "private.message",
            MessageKind::PrivateRequest => "private.request",
            MessageKind::PrivateHistory => "private.history",
            MessageKind::Mute => "mute",
            MessageKind::Unmute => "unmute",
            MessageKind::RoomList => "room.list",
            MessageKind::RoomBadName => "room.bad_name",
            MessageKind::RoomFull => "room.full",
            MessageKind::RoomNotJoined => "room.not_joined",
            MessageKind::RoomMaxCount => "room.max_count",
            MessageKind::RoomNotFound => "room.not_found",
            MessageKind::RoomAlreadyExists => "room.already_exists",
            MessageKind::RoomCreated => "room.created",
            MessageKind::RoomDeleted => "room.deleted",
            MessageKind::UserNotFound => "user.not_found",
            MessageKind::TooManyRequests => "to_many_requests",
            MessageKind::Disconnected => "disconnected",
            MessageKind::SessionNotFound => "session.not_found",
            MessageKind::PrivateCreated => "private.created",
            MessageKind::PrivateDelivered => "private.delivered",
            MessageKind::Muted => "muted",
            MessageKind::Unmuted => "unmuted",
            MessageKind::Unknown => "unknown",
        }
    }
}

impl From<MessageKind> for &'static str {
    fn from(kind: MessageKind) -> &'static str {
        kind.as_str()
    }
}

impl From<&str> for MessageKind {
    fn from(tag: &str) -> Self {
        match tag {
            "heartbeat" => MessageKind::Heartbeat,
            "rooms" => MessageKind::Rooms,
            "room.create" => MessageKind::RoomCreate,
            "room.join" => MessageKind::RoomJoin,
            "room.leave" => MessageKind::RoomLeave,
            "room.users" => MessageKind::RoomUsers,
            "room.message" => MessageKind::RoomMessage,
            "private.message" => MessageKind::PrivateMessage,
            "private.request" => MessageKind::PrivateRequest,
            "private.history" => MessageKind::PrivateHistory,
            "mute" => MessageKind::Mute,
            "unmute" => MessageKind::Unmute,
            "room.list" => MessageKind::RoomList,
            "room.bad_name" => MessageKind::RoomBadName,
            "room.full" => MessageKind::RoomFull,
            "room.not_joined" => MessageKind::RoomNotJoined,
            "room.max_count" => MessageKind::RoomMaxCount,
            "room.not_found" => MessageKind::RoomNotFound,
            "room.already_exists" => MessageKind::RoomAlreadyExists,
            "room.created" => MessageKind::RoomCreated,
            "room.deleted" => MessageKind::RoomDeleted,
            "user.not_found" => MessageKind::UserNotFound,
            "to_many_requests" => MessageKind::TooManyRequests,
            "disconnected" => MessageKind::Disconnected,
            "session.not_found" => MessageKind::SessionNotFound,
            "private.created" => MessageKind::PrivateCreated,
            "private.delivered" => MessageKind::PrivateDelivered,
            "muted" => MessageKind::Muted,
            "unmuted" => MessageKind::Unmuted,
            _ => MessageKind::Unknown,
        }
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        MessageKind::from(tag.as_str())
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a user or a room: an opaque ID plus a display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Peer {
    pub id: String,
    pub name: String,
}

impl Peer {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Reference to a stored attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentRef {
    /// Per-upload identifier.
    pub id: String,
    /// Upload instant.
    pub uploaded: DateTime<Utc>,
    /// Hex SHA-256 of the content.
    pub hash: String,
    /// Public URL of the original file.
    pub original_url: String,
    /// Public URL of the JPEG thumbnail.
    pub minified_url: String,
}

/// A chat message.
///
/// `from` is always assigned by the engine from the sending session;
/// whatever a client puts there is overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub from: Peer,
    #[serde(default)]
    pub to: Peer,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl Message {
    /// Create an empty message of the given kind, stamped now.
    #[must_use]
    pub fn new(kind: MessageKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            body: String::new(),
            from: Peer::default(),
            to: Peer::default(),
            attachments: Vec::new(),
        }
    }

    /// Set the body text.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the sender reference.
    #[must_use]
    pub fn with_from(mut self, from: Peer) -> Self {
        self.from = from;
        self
    }

    /// Set the target reference.
    #[must_use]
    pub fn with_to(mut self, to: Peer) -> Self {
        self.to = to;
        self
    }

    /// Set the attachment list.
    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Keep-alive echo.
    #[must_use]
    pub fn heartbeat(to: Peer) -> Self {
        Message::new(MessageKind::Heartbeat).with_to(to)
    }

    /// Terminal notice returned by a poll on a torn-down session.
    #[must_use]
    pub fn disconnected() -> Self {
        Message::new(MessageKind::Disconnected)
    }
}

/// Entry of a `room.list` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub permanent: bool,
    pub users: usize,
}

/// Entry of a `room.users` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: String,
    pub name: String,
    /// Whether the requesting user has muted this member.
    pub muted: bool,
}
