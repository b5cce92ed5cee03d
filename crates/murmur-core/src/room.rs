//! Room registry and membership.
//!
//! Rooms are indexed by name and by opaque ID under a registry-wide lock.
//! Membership lives behind each room's own lock, so join and leave never
//! touch the registry lock except to delete an emptied room.
//!
//! Lock order: registry, then room, then session state.

use murmur_bus::{Bus, BusError};
use murmur_protocol::{Message, MessageKind, Peer, RoomInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::chat::publish;
use crate::session::Session;
use crate::user::User;
use crate::{random_token, BROADCAST_TOPIC};

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The name is taken; carries the existing room.
    #[error("Room already exists: {}", .0.name())]
    AlreadyExists(Arc<Room>),

    #[error("Subscription failed: {0}")]
    Subscription(#[from] BusError),

    #[error("Room not found: {0}")]
    NotFound(String),

    /// The session is being torn down.
    #[error("Session closed")]
    Closed,
}

/// Room visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Public,
    Private,
}

impl RoomKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Public => "public",
            RoomKind::Private => "private",
        }
    }
}

#[derive(Debug, Default)]
struct Members {
    /// User ID -> user.
    users: HashMap<String, Arc<User>>,
    /// Session ID -> user ID.
    sessions: HashMap<String, String>,
    deleted: bool,
}

/// Outcome of a session entering a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entered {
    /// The session was not in the room before.
    pub new_session: bool,
    /// The user was not present through any other session.
    pub new_user: bool,
}

/// Outcome of a session exiting a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exited {
    /// The session was in the room.
    pub left_session: bool,
    /// That was the user's last session in the room.
    pub user_left: bool,
    /// No user remains.
    pub now_empty: bool,
}

/// A chat room.
#[derive(Debug)]
pub struct Room {
    id: String,
    name: String,
    kind: RoomKind,
    permanent: AtomicBool,
    members: Mutex<Members>,
}

impl Room {
    fn new(name: &str, kind: RoomKind) -> Self {
        Self {
            id: random_token(32),
            name: name.to_string(),
            kind,
            permanent: AtomicBool::new(false),
            members: Mutex::new(Members::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    /// Reference used in message `from`/`to` fields.
    #[must_use]
    pub fn peer(&self) -> Peer {
        Peer::new(self.id.clone(), self.name.clone())
    }

    /// Exclude (or re-include) the room from empty-room deletion.
    pub fn set_permanent(&self, permanent: bool) {
        self.permanent.store(permanent, Ordering::Release);
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.permanent.load(Ordering::Acquire)
    }

    /// Check if `user_id` is present through at least one session.
    #[must_use]
    pub fn has_user(&self, user_id: &str) -> bool {
        self.members.lock().users.contains_key(user_id)
    }

    /// Check if the session is a member.
    #[must_use]
    pub fn has_session(&self, session_id: &str) -> bool {
        self.members.lock().sessions.contains_key(session_id)
    }

    /// Distinct users present.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.members.lock().users.len()
    }

    /// Member sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.members.lock().sessions.len()
    }

    /// Users present.
    #[must_use]
    pub fn users(&self) -> Vec<Arc<User>> {
        self.members.lock().users.values().cloned().collect()
    }

    /// Check if the room was removed from the registry.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.members.lock().deleted
    }

    /// Summary for room listings.
    #[must_use]
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.as_str().to_string(),
            permanent: self.is_permanent(),
            users: self.user_count(),
        }
    }

    /// Add a session, subscribing it to the room topic through `subscribe`.
    ///
    /// Idempotent per session. Subscription happens under the room lock so a
    /// concurrent delete cannot interleave.
    pub(crate) fn enter<F>(&self, session: &Arc<Session>, subscribe: F) -> Result<Entered, RoomError>
    where
        F: FnOnce(&Arc<Session>) -> Result<(), BusError>,
    {
        let mut members = self.members.lock();
        if members.deleted {
            return Err(RoomError::NotFound(self.name.clone()));
        }
        if session.is_closing() {
            return Err(RoomError::Closed);
        }
        if members.sessions.contains_key(session.id()) {
            return Ok(Entered {
                new_session: false,
                new_user: false,
            });
        }

        subscribe(session)?;

        let user = session.user();
        members
            .sessions
            .insert(session.id().to_string(), user.id().to_string());
        let new_user = members
            .users
            .insert(user.id().to_string(), user.clone())
            .is_none();
        session.add_room(&self.id);

        debug!(room = %self.name, session = %session.id(), new_user, "Session entered room");
        Ok(Entered {
            new_session: true,
            new_user,
        })
    }

    /// Remove a session, unsubscribing it through `unsubscribe`.
    pub(crate) fn exit<F>(&self, session: &Session, unsubscribe: F) -> Exited
    where
        F: FnOnce(&Session),
    {
        let mut members = self.members.lock();
        let Some(user_id) = members.sessions.remove(session.id()) else {
            return Exited {
                left_session: false,
                user_left: false,
                now_empty: members.users.is_empty(),
            };
        };

        unsubscribe(session);
        session.remove_room(&self.id);

        let user_left = !members.sessions.values().any(|u| *u == user_id);
        if user_left {
            members.users.remove(&user_id);
        }

        debug!(room = %self.name, session = %session.id(), user_left, "Session exited room");
        Exited {
            left_session: true,
            user_left,
            now_empty: members.users.is_empty(),
        }
    }
}

/// Check a room name before create, join, leave, users or message.
///
/// Rejects names longer than `max_len` characters (`0` disables the
/// check), names containing bus wildcards (`.` or `*`), the broadcast
/// topic and the empty name.
#[must_use]
pub fn validate_room_name(name: &str, max_len: usize) -> bool {
    if name.is_empty() || name == BROADCAST_TOPIC {
        return false;
    }
    if max_len > 0 && name.chars().count() > max_len {
        return false;
    }
    !name.contains(['.', '*'])
}

#[derive(Debug, Default)]
struct RoomIndex {
    by_name: HashMap<String, Arc<Room>>,
    by_id: HashMap<String, Arc<Room>>,
}

/// All live rooms.
pub struct RoomRegistry {
    bus: Arc<dyn Bus>,
    index: RwLock<RoomIndex>,
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry")
            .field("bus", &self.bus.name())
            .field("rooms", &self.index.read().by_id.len())
            .finish()
    }
}

impl RoomRegistry {
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            index: RwLock::new(RoomIndex::default()),
        }
    }

    /// Create a room.
    ///
    /// The room topic is opened once as a check; on failure nothing is
    /// registered. Public rooms are announced on the broadcast topic.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::AlreadyExists`] with the existing room if the
    /// name is taken, or [`RoomError::Subscription`] if the bus refuses
    /// the room topic.
    pub fn create(&self, name: &str, kind: RoomKind) -> Result<Arc<Room>, RoomError> {
        let mut index = self.index.write();
        if let Some(existing) = index.by_name.get(name) {
            return Err(RoomError::AlreadyExists(existing.clone()));
        }

        let room = Arc::new(Room::new(name, kind));

        let trial = self.bus.subscribe(room.id())?;
        drop(trial);
        self.bus.unsubscribe(room.id());

        if kind == RoomKind::Public {
            let notice = Message::new(MessageKind::RoomCreated)
                .with_to(room.peer())
                .with_body(room.name());
            publish(self.bus.as_ref(), BROADCAST_TOPIC, &notice);
        }

        index.by_name.insert(name.to_string(), room.clone());
        index.by_id.insert(room.id().to_string(), room.clone());

        info!(room = %name, id = %room.id(), kind = kind.as_str(), "Created room");
        Ok(room)
    }

    /// Look up a room by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.index.read().by_name.get(name).cloned()
    }

    /// Look up a room by ID.
    #[must_use]
    pub fn get_by_id(&self, id: &str) -> Option<Arc<Room>> {
        self.index.read().by_id.get(id).cloned()
    }

    /// Number of rooms of the given kind.
    #[must_use]
    pub fn count(&self, kind: RoomKind) -> usize {
        self.index
            .read()
            .by_id
            .values()
            .filter(|r| r.kind() == kind)
            .count()
    }

    /// Total number of rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().by_id.is_empty()
    }

    /// Public rooms, permanent ones first, then by name.
    #[must_use]
    pub fn list_public(&self) -> Vec<RoomInfo> {
        let mut rooms: Vec<RoomInfo> = self
            .index
            .read()
            .by_id
            .values()
            .filter(|r| r.kind() == RoomKind::Public)
            .map(|r| r.info())
            .collect();
        rooms.sort_by(|a, b| b.permanent.cmp(&a.permanent).then_with(|| a.name.cmp(&b.name)));
        rooms
    }

    /// Delete the room if it is still empty and not permanent.
    ///
    /// Returns `true` if this call deleted it.
    pub fn remove_if_empty(&self, room: &Room) -> bool {
        let mut index = self.index.write();
        {
            let mut members = room.members.lock();
            if members.deleted || room.is_permanent() || !members.users.is_empty() {
                return false;
            }
            members.deleted = true;
        }
        self.unregister(&mut index, room);
        true
    }

    /// Delete the room regardless of membership.
    ///
    /// Returns `false` if it was already deleted.
    pub fn remove(&self, room: &Room) -> bool {
        let mut index = self.index.write();
        {
            let mut members = room.members.lock();
            if members.deleted {
                return false;
            }
            members.deleted = true;
        }
        self.unregister(&mut index, room);
        true
    }

    fn unregister(&self, index: &mut RoomIndex, room: &Room) {
        if room.kind() == RoomKind::Public {
            let notice = Message::new(MessageKind::RoomDeleted)
                .with_to(room.peer())
                .with_body(room.name());
            publish(self.bus.as_ref(), BROADCAST_TOPIC, &notice);
        }

        index.by_name.remove(room.name());
        index.by_id.remove(room.id());
        info!(room = %room.name(), id = %room.id(), "Deleted room");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_bus::LocalBus;
    use std::time::Duration;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Arc::new(LocalBus::new()))
    }

    fn session(user: &Arc<User>, suffix: &str) -> Arc<Session> {
        Arc::new(Session::new(
            format!("{}:{}", user.id(), suffix),
            user.clone(),
            Duration::from_secs(30),
        ))
    }

    #[test]
    fn test_validate_room_name() {
        assert!(validate_room_name("default", 128));
        assert!(validate_room_name("комната", 7));
        assert!(!validate_room_name("комната", 6));
        assert!(!validate_room_name("", 128));
        assert!(!validate_room_name("a.b", 128));
        assert!(!validate_room_name("a*", 128));
        assert!(!validate_room_name(BROADCAST_TOPIC, 128));
        assert!(validate_room_name(&"x".repeat(500), 0));
    }

    #[test]
    fn test_create_and_lookup() {
        let rooms = registry();
        let room = rooms.create("default", RoomKind::Public).unwrap();

        assert_eq!(room.id().len(), 32);
        assert!(Arc::ptr_eq(&rooms.get("default").unwrap(), &room));
        assert!(Arc::ptr_eq(&rooms.get_by_id(room.id()).unwrap(), &room));
        assert!(rooms.get("missing").is_none());

        match rooms.create("default", RoomKind::Public) {
            Err(RoomError::AlreadyExists(existing)) => assert_eq!(existing.id(), room.id()),
            other => panic!("Expected AlreadyExists, got {:?}", other),
        }
        assert_eq!(rooms.len(), 1);
    }

    #[test]
    fn test_count_by_kind() {
        let rooms = registry();
        rooms.create("a", RoomKind::Public).unwrap();
        rooms.create("b", RoomKind::Public).unwrap();
        rooms.create("p", RoomKind::Private).unwrap();

        assert_eq!(rooms.count(RoomKind::Public), 2);
        assert_eq!(rooms.count(RoomKind::Private), 1);
        assert_eq!(rooms.list_public().len(), 2);
    }

    #[test]
    fn test_list_public_order() {
        let rooms = registry();
        rooms.create("zeta", RoomKind::Public).unwrap();
        rooms.create("alpha", RoomKind::Public).unwrap();
        rooms.create("marvel", RoomKind::Public).unwrap().set_permanent(true);
        rooms.create("dc", RoomKind::Public).unwrap().set_permanent(true);

        let names: Vec<_> = rooms.list_public().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["dc", "marvel", "alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_membership_across_sessions() {
        let rooms = registry();
        let room = rooms.create("default", RoomKind::Public).unwrap();
        let user = Arc::new(User::new("u1", "alice"));
        let s1 = session(&user, "1");
        let s2 = session(&user, "2");

        let entered = room.enter(&s1, |_| Ok(())).unwrap();
        assert_eq!(
            entered,
            Entered {
                new_session: true,
                new_user: true
            }
        );
        assert!(!room.enter(&s1, |_| Ok(())).unwrap().new_session);
        assert!(!room.enter(&s2, |_| Ok(())).unwrap().new_user);
        assert_eq!(room.user_count(), 1);
        assert_eq!(room.session_count(), 2);

        let exited = room.exit(&s1, |_| {});
        assert!(exited.left_session);
        assert!(!exited.user_left);
        assert!(room.has_user("u1"));
        assert!(!s1.in_room(room.id()));

        let exited = room.exit(&s2, |_| {});
        assert!(exited.user_left);
        assert!(exited.now_empty);
        assert!(!room.has_user("u1"));

        assert!(!room.exit(&s2, |_| {}).left_session);
    }

    #[tokio::test]
    async fn test_enter_subscription_failure() {
        let rooms = registry();
        let room = rooms.create("default", RoomKind::Public).unwrap();
        let user = Arc::new(User::new("u1", "alice"));
        let s = session(&user, "1");

        let result = room.enter(&s, |_| Err(BusError::Closed));
        assert!(matches!(result, Err(RoomError::Subscription(_))));
        assert!(!room.has_session(s.id()));
        assert!(!s.in_room(room.id()));
    }

    #[tokio::test]
    async fn test_remove_if_empty() {
        let rooms = registry();
        let room = rooms.create("temp", RoomKind::Public).unwrap();
        let user = Arc::new(User::new("u1", "alice"));
        let s = session(&user, "1");

        room.enter(&s, |_| Ok(())).unwrap();
        assert!(!rooms.remove_if_empty(&room));

        room.exit(&s, |_| {});
        assert!(rooms.remove_if_empty(&room));
        assert!(rooms.get("temp").is_none());
        assert!(room.is_deleted());
        assert!(!rooms.remove_if_empty(&room));

        assert!(matches!(
            room.enter(&s, |_| Ok(())),
            Err(RoomError::NotFound(_))
        ));

        // Name is free again, with a fresh ID.
        let again = rooms.create("temp", RoomKind::Public).unwrap();
        assert_ne!(again.id(), room.id());
    }

    #[test]
    fn test_permanent_room_survives() {
        let rooms = registry();
        let room = rooms.create("default", RoomKind::Public).unwrap();
        room.set_permanent(true);

        assert!(!rooms.remove_if_empty(&room));
        assert!(rooms.get("default").is_some());

        assert!(rooms.remove(&room));
        assert!(rooms.get("default").is_none());
    }

    #[tokio::test]
    async fn test_create_announces_public_rooms() {
        let bus = Arc::new(LocalBus::new());
        let rooms = RoomRegistry::new(bus.clone());
        let mut broadcast = bus.subscribe(BROADCAST_TOPIC).unwrap();

        let room = rooms.create("news", RoomKind::Public).unwrap();
        rooms.create("secret", RoomKind::Private).unwrap();
        rooms.remove(&room);

        let created = murmur_protocol::decode(&broadcast.recv().await.unwrap()).unwrap();
        assert_eq!(created.kind, MessageKind::RoomCreated);
        assert_eq!(created.to.id, room.id());

        let deleted = murmur_protocol::decode(&broadcast.recv().await.unwrap()).unwrap();
        assert_eq!(deleted.kind, MessageKind::RoomDeleted);
        assert_eq!(deleted.to.name, "news");
    }
}
