//! # murmur-core
//!
//! In-process chat runtime: users, sessions, rooms, message routing,
//! bounded histories and a deduplicating attachment store, on top of any
//! [`murmur_bus::Bus`].
//!
//! ## Architecture
//!
//! ```text
//!  transport ──► Chat::process ──► Room / User / History state
//!                                    │
//!                                    ▼ publish(topic)
//!                                 ┌──────┐
//!                                 │ Bus  │
//!                                 └──┬───┘
//!                  forwarder tasks   │  one per (session, topic)
//!                                    ▼
//!  transport ◄── Chat::poll ◄── Session buffer
//! ```
//!
//! Every session listens on its own ID (direct replies), its user's ID
//! (cross-device delivery), [`BROADCAST_TOPIC`] and the ID of each joined
//! room.
//!
//! ## Example
//!
//! ```rust,ignore
//! use murmur_bus::LocalBus;
//! use murmur_core::{Chat, ChatConfig};
//!
//! let chat = Chat::new(ChatConfig::default(), Arc::new(LocalBus::new()))?;
//! chat.start()?;
//!
//! let session = chat.connect(&chat.user("u1", "alice"))?;
//! chat.process(message, &session);
//! let outcome = chat.poll(&session, cancelled).await;
//! ```

pub mod attachment;
pub mod chat;
pub mod config;
pub mod filter;
pub mod history;
pub mod room;
mod router;
pub mod session;
pub mod user;

pub use attachment::{AttachmentError, AttachmentStore, Upload};
pub use chat::{Chat, ChatError, UploadError, UploadFile};
pub use config::{default_bad_words, BadWord, ChatConfig};
pub use filter::Moderator;
pub use history::{HistoryBuffer, HistoryStore, PairKey, PrivateHistory, RoomHistory};
pub use room::{validate_room_name, Room, RoomError, RoomKind, RoomRegistry};
pub use session::{PollOutcome, Session, SessionError, SessionRegistry};
pub use user::{User, UserRegistry};

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Topic every session listens on, used for room announcements.
pub const BROADCAST_TOPIC: &str = "chat.broadcast";

/// Random alphanumeric string of `len` characters.
pub(crate) fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
