//! Shared fixtures for the Murmur benchmarks.
//!
//! Fixtures spawn session forwarders, so they must be built inside a tokio
//! runtime context.

use murmur_bus::LocalBus;
use murmur_core::{Chat, ChatConfig, Room, Session};
use murmur_protocol::{Message, MessageKind};
use std::sync::Arc;

/// Name of the room every fixture session joins.
pub const ROOM: &str = "default";

/// An engine with one populated room.
pub struct Fixture {
    pub chat: Arc<Chat>,
    pub room: Arc<Room>,
    pub sessions: Vec<Arc<Session>>,
}

impl Fixture {
    /// A room message from the first member.
    #[must_use]
    pub fn room_message(&self, body: &str) -> Message {
        Message::new(MessageKind::RoomMessage)
            .with_to(self.room.peer())
            .with_body(body)
    }
}

/// Engine config without rate limiting or membership caps.
#[must_use]
pub fn bench_config() -> ChatConfig {
    ChatConfig {
        rate_limit_max: 0,
        max_room_users: 0,
        default_rooms: vec![ROOM.to_string()],
        ..ChatConfig::default()
    }
}

/// Build an engine whose default room holds `members` users with one
/// session each.
///
/// # Panics
///
/// Panics if the engine cannot be set up.
#[must_use]
pub fn room_with_members(members: usize) -> Fixture {
    let chat = Chat::new(bench_config(), Arc::new(LocalBus::new())).expect("chat engine");
    chat.start().expect("default rooms");
    let room = chat.rooms().get(ROOM).expect("default room");

    let sessions = (0..members)
        .map(|i| {
            let user = chat.user(&format!("user-{}", i), &format!("User {}", i));
            let session = chat.connect(&user).expect("session");
            chat.join(&room, &session, false).expect("join");
            session
        })
        .collect();

    Fixture { chat, room, sessions }
}
