//! Server configuration.
//!
//! Configuration is layered:
//! - Defaults (every field has one)
//! - TOML configuration file (`murmur.toml`, `/etc/murmur/murmur.toml` or
//!   `~/.config/murmur/murmur.toml`, first found wins)
//! - Environment variables `MURMUR__<SECTION>__<KEY>`, e.g.
//!   `MURMUR__LIMITS__MAX_ROOMS=50`
//!
//! `MURMUR_HOST` and `MURMUR_PORT` set the bind address defaults.

use anyhow::{Context, Result};
use murmur_core::{default_bad_words, BadWord, ChatConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Rooms and history.
    #[serde(default)]
    pub chat: ChatSection,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Session heartbeat.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Attachment uploads.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Room message moderation.
    #[serde(default)]
    pub moderation: ModerationConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Rooms and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSection {
    /// Permanent public rooms created at start-up.
    #[serde(default = "default_rooms")]
    pub default_rooms: Vec<String>,

    /// Messages retained per room.
    #[serde(default = "default_history_capacity")]
    pub room_history_capacity: usize,

    /// Messages retained per private conversation.
    #[serde(default = "default_history_capacity")]
    pub private_history_capacity: usize,
}

/// Resource limits configuration. `0` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum room name length in characters.
    #[serde(default = "default_max_room_name_length")]
    pub max_room_name_length: usize,

    /// Maximum number of public rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Maximum distinct users per room.
    #[serde(default = "default_max_room_users")]
    pub max_room_users: usize,

    /// Messages per user per rate window.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,

    /// Rate window length in seconds.
    #[serde(default = "default_rate_limit_interval")]
    pub rate_limit_interval_secs: u64,

    /// Maximum size of a sent message in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Idle seconds after which a session is torn down.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
}

/// Upload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Directory holding uploaded files. Emptied at start-up.
    #[serde(default = "default_upload_dir")]
    pub dir: PathBuf,

    /// Public URL prefix of the upload directory.
    #[serde(default = "default_upload_url_prefix")]
    pub url_prefix: String,

    /// Bytes a user may upload per quota window.
    #[serde(default = "default_upload_quota")]
    pub quota_bytes: u64,

    /// Quota window length in seconds.
    #[serde(default = "default_upload_quota_reset")]
    pub quota_reset_secs: u64,

    /// Thumbnail width in pixels.
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,

    /// Maximum size of an upload request body.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

/// Moderation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Room message bodies are truncated to this many characters.
    #[serde(default)]
    pub max_text_length: usize,

    /// Redaction rules, applied in order.
    #[serde(default = "default_bad_words")]
    pub bad_words: Vec<BadWord>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("MURMUR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("MURMUR_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_rooms() -> Vec<String> {
    ChatConfig::default().default_rooms
}

fn default_history_capacity() -> usize {
    200
}

fn default_max_room_name_length() -> usize {
    128
}

fn default_max_rooms() -> usize {
    100
}

fn default_max_room_users() -> usize {
    100
}

fn default_rate_limit_max() -> u32 {
    20
}

fn default_rate_limit_interval() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("static/upload")
}

fn default_upload_url_prefix() -> String {
    "/upload".to_string()
}

fn default_upload_quota() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_upload_quota_reset() -> u64 {
    15 * 60
}

fn default_thumbnail_width() -> u32 {
    300
}

fn default_max_request_bytes() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            chat: ChatSection::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            upload: UploadConfig::default(),
            moderation: ModerationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            default_rooms: default_rooms(),
            room_history_capacity: default_history_capacity(),
            private_history_capacity: default_history_capacity(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_room_name_length: default_max_room_name_length(),
            max_rooms: default_max_rooms(),
            max_room_users: default_max_room_users(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_interval_secs: default_rate_limit_interval(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: default_upload_dir(),
            url_prefix: default_upload_url_prefix(),
            quota_bytes: default_upload_quota(),
            quota_reset_secs: default_upload_quota_reset(),
            thumbnail_width: default_thumbnail_width(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            max_text_length: 0,
            bad_words: default_bad_words(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// an override has the wrong type.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "murmur.toml",
            "/etc/murmur/murmur.toml",
            "~/.config/murmur/murmur.toml",
        ];

        let file = config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(::config::File::from(path.as_path()));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("MURMUR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .with_context(|| match &file {
                Some(path) => format!("Invalid configuration in {}", path.display()),
                None => "Invalid configuration in environment".to_string(),
            })?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Engine configuration.
    #[must_use]
    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            max_room_name_length: self.limits.max_room_name_length,
            max_rooms: self.limits.max_rooms,
            max_room_users: self.limits.max_room_users,
            room_history_capacity: self.chat.room_history_capacity,
            private_history_capacity: self.chat.private_history_capacity,
            max_text_length: self.moderation.max_text_length,
            bad_words: self.moderation.bad_words.clone(),
            rate_limit_max: self.limits.rate_limit_max,
            rate_limit_interval: Duration::from_secs(self.limits.rate_limit_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat.timeout_secs),
            upload_quota: self.upload.quota_bytes,
            upload_quota_reset: Duration::from_secs(self.upload.quota_reset_secs),
            upload_dir: self.upload.dir.clone(),
            upload_url_prefix: self.upload.url_prefix.clone(),
            thumbnail_width: self.upload.thumbnail_width,
            default_rooms: self.chat.default_rooms.clone(),
        }
    }
}
