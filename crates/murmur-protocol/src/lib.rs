//! # murmur-protocol
//!
//! Wire definitions for the Murmur chat engine.
//!
//! Every exchange between a client and the engine, and every payload on
//! the message bus, is a JSON-encoded [`Message`]:
//!
//! ```json
//! {"timestamp": "...", "type": "room.message", "body": "hello",
//!  "from": {"id": "...", "name": "..."}, "to": {"id": "...", "name": "..."},
//!  "attachments": []}
//! ```
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{codec, Message, MessageKind, Peer};
//!
//! let msg = Message::new(MessageKind::RoomMessage)
//!     .with_body("hello")
//!     .with_to(Peer::new("room-id", "default"));
//!
//! let encoded = codec::encode(&msg).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.body, "hello");
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, encode, ProtocolError};
pub use message::{AttachmentRef, MemberInfo, Message, MessageKind, Peer, RoomInfo};
