//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A redaction rule: every match of `pattern` is replaced by `replacement`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadWord {
    /// Regular expression to match.
    pub pattern: String,
    /// Substitution text.
    pub replacement: String,
}

impl BadWord {
    #[must_use]
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }
}

/// Chat engine configuration.
///
/// Limits set to `0` are unlimited.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Maximum room name length, in characters.
    pub max_room_name_length: usize,
    /// Maximum number of public rooms.
    pub max_rooms: usize,
    /// Maximum distinct users per room.
    pub max_room_users: usize,
    /// Messages retained per room.
    pub room_history_capacity: usize,
    /// Messages retained per private conversation.
    pub private_history_capacity: usize,
    /// Room message bodies are truncated to this many characters.
    pub max_text_length: usize,
    /// Redaction rules applied to room message bodies, in order.
    pub bad_words: Vec<BadWord>,
    /// Messages a user may send per rate window.
    pub rate_limit_max: u32,
    /// Length of the fixed rate window.
    pub rate_limit_interval: Duration,
    /// Idle time after which a session is torn down.
    pub heartbeat_timeout: Duration,
    /// Bytes a user may upload per quota window.
    pub upload_quota: u64,
    /// Length of the upload quota window.
    pub upload_quota_reset: Duration,
    /// Directory holding uploaded files and thumbnails.
    pub upload_dir: PathBuf,
    /// Public URL prefix the upload directory is served under.
    pub upload_url_prefix: String,
    /// Thumbnail width in pixels.
    pub thumbnail_width: u32,
    /// Permanent public rooms created at start-up.
    pub default_rooms: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_room_name_length: 128,
            max_rooms: 100,
            max_room_users: 100,
            room_history_capacity: 200,
            private_history_capacity: 200,
            max_text_length: 0,
            bad_words: default_bad_words(),
            rate_limit_max: 20,
            rate_limit_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            upload_quota: 100 * 1024 * 1024,
            upload_quota_reset: Duration::from_secs(15 * 60),
            upload_dir: PathBuf::from("static/upload"),
            upload_url_prefix: "/upload".to_string(),
            thumbnail_width: 300,
            default_rooms: vec!["default".into(), "marvel".into(), "dc".into()],
        }
    }
}

/// Built-in redaction rules.
#[must_use]
pub fn default_bad_words() -> Vec<BadWord> {
    vec![
        BadWord::new("fu+c+k", "f***"),
        BadWord::new(r"http://[^\s]*", "--link-hide--"),
        BadWord::new(r"telegram.me/[^\s]*", "--telegram-hide--"),
    ]
}
