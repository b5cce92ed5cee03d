//! Identity registry.
//!
//! Maps a stable external identity to a [`User`]. A user owns its rate
//! window counter, mute set and upload total, each behind its own lock so
//! that e.g. muting never waits on message accounting.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use murmur_protocol::Peer;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

/// A chat participant.
#[derive(Debug)]
pub struct User {
    id: String,
    name: String,
    /// IDs of the user's live sessions.
    sessions: Mutex<HashSet<String>>,
    /// Messages sent in the current rate window.
    requests: Mutex<u32>,
    /// Muted user ID -> when the mute was set.
    mutes: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Bytes uploaded in the current quota window.
    upload_bytes: Mutex<u64>,
}

impl User {
    /// Create a user with empty state.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sessions: Mutex::new(HashSet::new()),
            requests: Mutex::new(0),
            mutes: Mutex::new(HashMap::new()),
            upload_bytes: Mutex::new(0),
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

    /// Reference used in message `from`/`to` fields.
    #[must_use]
    pub fn peer(&self) -> Peer {
        Peer::new(self.id.clone(), self.name.clone())
    }

    /// Count one request against the fixed window.
    ///
    /// Returns `false` once `max` requests were already counted in this
    /// window. A `max` of `0` disables the limit.
    pub fn try_acquire(&self, max: u32) -> bool {
        let mut requests = self.requests.lock();
        if max > 0 && *requests >= max {
            return false;
        }
        *requests += 1;
        true
    }

    /// Requests counted in the current window.
    #[must_use]
    pub fn request_count(&self) -> u32 {
        *self.requests.lock()
    }

    /// Start a new rate window.
    pub fn reset_window(&self) {
        *self.requests.lock() = 0;
    }

    /// Mute `target_id`, recording the current instant.
    pub fn mute(&self, target_id: &str) {
        self.mutes.lock().insert(target_id.to_string(), Utc::now());
    }

    /// Remove `target_id` from the mute set.
    pub fn unmute(&self, target_id: &str) {
        self.mutes.lock().remove(target_id);
    }

    /// When `target_id` was muted, if it is muted.
    #[must_use]
    pub fn muted_since(&self, target_id: &str) -> Option<DateTime<Utc>> {
        self.mutes.lock().get(target_id).copied()
    }

    /// Check if this user has muted `target_id`.
    #[must_use]
    pub fn is_muting(&self, target_id: &str) -> bool {
        self.mutes.lock().contains_key(target_id)
    }

    /// Bytes uploaded in the current quota window.
    #[must_use]
    pub fn upload_bytes(&self) -> u64 {
        *self.upload_bytes.lock()
    }

    /// Charge `bytes` against the upload quota.
    pub fn charge_upload(&self, bytes: u64) {
        let mut total = self.upload_bytes.lock();
        *total = total.saturating_add(bytes);
    }

    /// Start a new quota window.
    pub fn reset_upload(&self) {
        *self.upload_bytes.lock() = 0;
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) fn add_session(&self, session_id: &str) {
        self.sessions.lock().insert(session_id.to_string());
    }

    pub(crate) fn remove_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }
}

/// Registry of all users seen by the process.
///
/// Users are never removed.
#[derive(Debug)]
pub struct UserRegistry {
    users: DashMap<String, Arc<User>>,
    rate_limit_interval: Duration,
    upload_quota_reset: Duration,
}

impl UserRegistry {
    /// Create a registry whose users reset their counters on the given periods.
    #[must_use]
    pub fn new(rate_limit_interval: Duration, upload_quota_reset: Duration) -> Self {
        Self {
            users: DashMap::new(),
            rate_limit_interval,
            upload_quota_reset,
        }
    }

    /// Get the user for `id`, creating it with `name` on first reference.
    ///
    /// Creation starts the user's rate window and upload quota resets.
    pub fn get_or_create(&self, id: &str, name: &str) -> Arc<User> {
        if let Some(user) = self.users.get(id) {
            return user.clone();
        }

        self.users
            .entry(id.to_string())
            .or_insert_with(|| {
                let user = Arc::new(User::new(id, name));
                spawn_periodic(&user, self.rate_limit_interval, User::reset_window);
                spawn_periodic(&user, self.upload_quota_reset, User::reset_upload);
                debug!(user = %id, "Created user");
                user
            })
            .clone()
    }

    /// Get an existing user.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<User>> {
        self.users.get(id).map(|u| u.clone())
    }

    /// Check if a user exists.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.users.contains_key(id)
    }

    /// Number of known users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Check if no user is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Run `reset` on `user` every `period` for as long as the user is alive.
fn spawn_periodic(user: &Arc<User>, period: Duration, reset: fn(&User)) {
    if period.is_zero() {
        return;
    }
    let Ok(runtime) = Handle::try_current() else {
        warn!(user = %user.id(), "No runtime, periodic reset not started");
        return;
    };

    let user: Weak<User> = Arc::downgrade(user);
    runtime.spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            match user.upgrade() {
                Some(user) => reset(&user),
                None => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_window() {
        let user = User::new("u1", "alice");

        for _ in 0..3 {
            assert!(user.try_acquire(3));
        }
        assert!(!user.try_acquire(3));
        assert_eq!(user.request_count(), 3);

        user.reset_window();
        assert!(user.try_acquire(3));
    }

    #[test]
    fn test_unlimited_window() {
        let user = User::new("u1", "alice");
        for _ in 0..1000 {
            assert!(user.try_acquire(0));
        }
    }

    #[test]
    fn test_mute_set() {
        let user = User::new("u1", "alice");

        assert!(!user.is_muting("u2"));
        user.mute("u2");
        assert!(user.is_muting("u2"));
        assert!(user.muted_since("u2").is_some());

        user.unmute("u2");
        assert!(!user.is_muting("u2"));
        assert!(user.muted_since("u2").is_none());
    }

    #[test]
    fn test_upload_charge() {
        let user = User::new("u1", "alice");
        user.charge_upload(10);
        user.charge_upload(5);
        assert_eq!(user.upload_bytes(), 15);

        user.reset_upload();
        assert_eq!(user.upload_bytes(), 0);
    }

    #[tokio::test]
    async fn test_get_or_create_idempotent() {
        let registry = UserRegistry::new(Duration::from_secs(10), Duration::from_secs(60));

        let first = registry.get_or_create("u1", "alice");
        let second = registry.get_or_create("u1", "ignored");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.name(), "alice");
        assert!(registry.exists("u1"));
        assert!(!registry.exists("u2"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_resets() {
        let registry = UserRegistry::new(Duration::from_secs(10), Duration::from_secs(60));
        let user = registry.get_or_create("u1", "alice");

        assert!(user.try_acquire(1));
        assert!(!user.try_acquire(1));
        user.charge_upload(100);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(user.try_acquire(1));
        assert_eq!(user.upload_bytes(), 100);

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(user.upload_bytes(), 0);
    }
}
