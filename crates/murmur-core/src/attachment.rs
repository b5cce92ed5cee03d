//! Content-addressed attachment store.
//!
//! Uploaded images are written once per distinct content under
//! `<dir>/<sha256>.<ext>` together with a JPEG thumbnail at
//! `<dir>/<sha256>.min.jpeg`. Every upload still gets its own entry, and
//! files are deleted only when the last entry referencing their hash goes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use murmur_protocol::AttachmentRef;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::random_token;

/// JPEG quality of generated thumbnails.
const THUMBNAIL_QUALITY: u8 = 80;

/// Attachment store errors.
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Image decode error: {0}")]
    Decode(#[from] image::ImageError),
}

/// A stored upload.
#[derive(Debug, Clone)]
struct Attachment {
    id: String,
    hash: String,
    uploaded: DateTime<Utc>,
    original_file: PathBuf,
    minified_file: PathBuf,
    original_url: String,
    minified_url: String,
}

impl Attachment {
    fn to_ref(&self) -> AttachmentRef {
        AttachmentRef {
            id: self.id.clone(),
            uploaded: self.uploaded,
            hash: self.hash.clone(),
            original_url: self.original_url.clone(),
            minified_url: self.minified_url.clone(),
        }
    }
}

/// Result of a single upload.
#[derive(Debug, Clone)]
pub struct Upload {
    pub attachment: AttachmentRef,
    /// Content was already on disk; nothing was written.
    pub cached: bool,
    /// Size of the uploaded content in bytes.
    pub size: u64,
}

/// Registered attachments plus hashes with an upload in flight.
#[derive(Debug, Default)]
struct Registry {
    attachments: Vec<Attachment>,
    pending: HashMap<String, usize>,
}

impl Registry {
    fn references(&self, hash: &str) -> bool {
        self.pending.contains_key(hash) || self.attachments.iter().any(|a| a.hash == hash)
    }
}

/// Keeps a hash referenced while its upload runs, so a concurrent
/// `remove` of the last registered entry cannot delete the files.
struct Reservation<'a> {
    registry: &'a Mutex<Registry>,
    hash: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        if let Some(count) = registry.pending.get_mut(&self.hash) {
            *count -= 1;
            if *count == 0 {
                registry.pending.remove(&self.hash);
            }
        }
    }
}

/// Attachment registry plus its backing directory.
#[derive(Debug)]
pub struct AttachmentStore {
    dir: PathBuf,
    url_prefix: String,
    thumbnail_width: u32,
    registry: Mutex<Registry>,
}

impl AttachmentStore {
    /// Create a store writing into `dir`, served under `url_prefix`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, url_prefix: impl Into<String>, thumbnail_width: u32) -> Self {
        Self {
            dir: dir.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
            thumbnail_width: thumbnail_width.max(1),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Directory holding the stored files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store an image and register a new attachment for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the content type is not `image/jpeg` or
    /// `image/png`, the content cannot be decoded, or writing fails.
    pub async fn upload(&self, content_type: &str, data: Bytes) -> Result<Upload, AttachmentError> {
        let ext = match content_type {
            "image/jpeg" => "jpeg",
            "image/png" => "png",
            other => return Err(AttachmentError::UnsupportedType(other.to_string())),
        };

        let hash = hex::encode(Sha256::digest(&data));
        let original_file = self.dir.join(format!("{hash}.{ext}"));
        let minified_file = self.dir.join(format!("{hash}.min.jpeg"));

        let reservation = self.reserve(&hash);
        tokio::fs::create_dir_all(&self.dir).await?;

        let cached = tokio::fs::try_exists(&original_file).await?
            && tokio::fs::try_exists(&minified_file).await?;

        if cached {
            debug!(hash = %hash, "Attachment content already stored");
        } else {
            let thumbnail = {
                let data = data.clone();
                let width = self.thumbnail_width;
                tokio::task::spawn_blocking(move || make_thumbnail(&data, width))
                    .await
                    .map_err(io::Error::other)??
            };
            tokio::fs::write(&original_file, &data).await?;
            tokio::fs::write(&minified_file, &thumbnail).await?;
            info!(hash = %hash, size = data.len(), "Stored attachment");
        }

        let attachment = Attachment {
            id: random_token(32),
            uploaded: Utc::now(),
            original_url: format!("{}/{hash}.{ext}", self.url_prefix),
            minified_url: format!("{}/{hash}.min.jpeg", self.url_prefix),
            hash,
            original_file,
            minified_file,
        };
        let reference = attachment.to_ref();
        self.registry.lock().attachments.push(attachment);
        drop(reservation);

        Ok(Upload {
            attachment: reference,
            cached,
            size: data.len() as u64,
        })
    }

    fn reserve(&self, hash: &str) -> Reservation<'_> {
        *self.registry.lock().pending.entry(hash.to_string()).or_insert(0) += 1;
        Reservation {
            registry: &self.registry,
            hash: hash.to_string(),
        }
    }

    /// Unregister an attachment, deleting its files when no other
    /// attachment shares the content.
    pub fn remove(&self, id: &str) {
        // Files go while the lock is held: an upload of the same content
        // either reserved the hash first or checks the disk after this.
        let mut registry = self.registry.lock();
        let Some(pos) = registry.attachments.iter().position(|a| a.id == id) else {
            return;
        };
        let removed = registry.attachments.swap_remove(pos);
        if registry.references(&removed.hash) {
            return;
        }

        for file in [&removed.original_file, &removed.minified_file] {
            match std::fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %file.display(), error = %e, "Failed to delete attachment file"),
            }
        }
        debug!(hash = %removed.hash, "Deleted attachment files");
    }

    /// Check if an attachment is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.registry.lock().attachments.iter().any(|a| a.id == id)
    }

    /// Drop references to attachments that are no longer registered.
    pub fn strip_missing(&self, attachments: &mut Vec<AttachmentRef>) {
        if attachments.is_empty() {
            return;
        }
        let registry = self.registry.lock();
        attachments.retain(|r| registry.attachments.iter().any(|a| a.id == r.id));
    }

    /// Number of registered attachments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.lock().attachments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.lock().attachments.is_empty()
    }

    /// Delete every file in the store directory.
    ///
    /// Registrations are kept in memory only, so files left by a previous
    /// run are unreachable. A missing directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub async fn cleanup(&self) -> io::Result<usize> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %entry.path().display(), error = %e, "Failed to delete stale upload"),
            }
        }
        Ok(removed)
    }
}

/// Scale to `width` keeping the aspect ratio and encode as JPEG.
fn make_thumbnail(data: &[u8], width: u32) -> Result<Vec<u8>, AttachmentError> {
    let image = image::load_from_memory(data)?;
    let height = (u64::from(image.height()) * u64::from(width) / u64::from(image.width().max(1)))
        .clamp(1, u64::from(u32::MAX)) as u32;

    let resized = image.resize_exact(width, height, FilterType::Lanczos3).to_rgb8();

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, THUMBNAIL_QUALITY).encode_image(&resized)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png(width: u32, height: u32) -> Bytes {
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 255) as u8, (y % 255) as u8, 128u8]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        Bytes::from(out.into_inner())
    }

    fn store(dir: &TempDir) -> AttachmentStore {
        AttachmentStore::new(dir.path().join("upload"), "/upload/", 300)
    }

    #[tokio::test]
    async fn test_upload_writes_original_and_thumbnail() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let data = png(40, 20);

        let upload = store.upload("image/png", data.clone()).await.unwrap();
        assert!(!upload.cached);
        assert_eq!(upload.size, data.len() as u64);

        let hash = hex::encode(Sha256::digest(&data));
        assert_eq!(upload.attachment.hash, hash);
        assert_eq!(upload.attachment.original_url, format!("/upload/{hash}.png"));
        assert_eq!(upload.attachment.minified_url, format!("/upload/{hash}.min.jpeg"));

        let original = store.dir().join(format!("{hash}.png"));
        assert_eq!(std::fs::read(&original).unwrap(), data.to_vec());

        let thumbnail = image::open(store.dir().join(format!("{hash}.min.jpeg"))).unwrap();
        assert_eq!(thumbnail.width(), 300);
        assert_eq!(thumbnail.height(), 150);
    }

    #[tokio::test]
    async fn test_duplicate_content_shares_files() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let data = png(10, 10);

        let first = store.upload("image/png", data.clone()).await.unwrap();
        let second = store.upload("image/png", data).await.unwrap();
        assert!(second.cached);
        assert_ne!(first.attachment.id, second.attachment.id);
        assert_eq!(first.attachment.hash, second.attachment.hash);
        assert_eq!(store.len(), 2);

        let original = store.dir().join(format!("{}.png", first.attachment.hash));

        store.remove(&first.attachment.id);
        assert!(original.exists());
        assert!(!store.contains(&first.attachment.id));

        store.remove(&second.attachment.id);
        assert!(!original.exists());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_upload_keeps_shared_files() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let data = png(8, 8);

        let first = store.upload("image/png", data.clone()).await.unwrap();
        let original = store.dir().join(format!("{}.png", first.attachment.hash));
        let minified = store.dir().join(format!("{}.min.jpeg", first.attachment.hash));

        // A second upload of the same content has reserved the hash but
        // not registered yet when the last entry is removed.
        let reservation = store.reserve(&first.attachment.hash);
        store.remove(&first.attachment.id);
        assert!(store.is_empty());
        assert!(original.exists());
        assert!(minified.exists());

        let second = store.upload("image/png", data.clone()).await.unwrap();
        drop(reservation);
        assert!(second.cached);
        assert!(original.exists());
        assert!(minified.exists());
        assert!(store.registry.lock().pending.is_empty());

        // Without a reservation the files go, and the next upload rewrites them.
        store.remove(&second.attachment.id);
        assert!(!original.exists());
        let third = store.upload("image/png", data).await.unwrap();
        assert!(!third.cached);
        assert!(original.exists());
        assert!(minified.exists());
    }

    #[tokio::test]
    async fn test_unsupported_and_undecodable() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);

        assert!(matches!(
            store.upload("image/gif", Bytes::from_static(b"GIF89a")).await,
            Err(AttachmentError::UnsupportedType(_))
        ));
        assert!(matches!(
            store.upload("image/png", Bytes::from_static(b"not a png")).await,
            Err(AttachmentError::Decode(_))
        ));
        assert!(store.is_empty());
        assert!(store.registry.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn test_strip_missing() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let kept = store.upload("image/png", png(4, 4)).await.unwrap();

        let mut refs = vec![
            kept.attachment.clone(),
            AttachmentRef {
                id: "gone".into(),
                ..Default::default()
            },
        ];
        store.strip_missing(&mut refs);
        assert_eq!(refs, vec![kept.attachment]);
    }

    #[tokio::test]
    async fn test_cleanup() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        assert_eq!(store.cleanup().await.unwrap(), 0);

        store.upload("image/png", png(4, 4)).await.unwrap();
        assert_eq!(store.cleanup().await.unwrap(), 2);
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    }
}
