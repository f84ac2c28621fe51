//! Media relay between the provider and durable tenant storage.
//!
//! Provider download URLs expire, so every media item is mirrored into the
//! object store and only the store's URL is ever written to a message row.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::graph::{MediaMetadata, WhatsAppApi};
use crate::tenant::TenantPrefix;
use crate::types::MediaType;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable object storage capability.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key` and returns a publicly resolvable URL.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str)
        -> Result<String, StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// Object store backed by a local directory and served by `/api/media/{*key}`.
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        if !is_safe_media_key(key) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(format!("{}/api/media/{}", self.public_base_url, key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFolder {
    Incoming,
    Outgoing,
}

impl MediaFolder {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaFolder::Incoming => "incoming",
            MediaFolder::Outgoing => "outgoing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderMedia {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Clone)]
pub struct MediaRelay {
    api: Arc<dyn WhatsAppApi>,
    objects: Arc<dyn ObjectStore>,
}

impl MediaRelay {
    pub fn new(api: Arc<dyn WhatsAppApi>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { api, objects }
    }

    /// Metadata step only: signed URL plus declared MIME type.
    pub async fn resolve(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Result<MediaMetadata, ProviderError> {
        self.api.media_metadata(media_id, access_token).await
    }

    /// Downloads a provider media object. Returns `None` on any failure.
    pub async fn fetch_provider_media(
        &self,
        media_id: &str,
        access_token: &str,
    ) -> Option<ProviderMedia> {
        let metadata = match self.resolve(media_id, access_token).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(media_id, error = %err, "media metadata lookup failed");
                return None;
            }
        };
        self.download(media_id, &metadata, access_token).await
    }

    async fn download(
        &self,
        media_id: &str,
        metadata: &MediaMetadata,
        access_token: &str,
    ) -> Option<ProviderMedia> {
        match self.api.download_media(&metadata.url, access_token).await {
            Ok(downloaded) => {
                // declared type wins over the download's content-type
                let mime_type = if metadata.mime_type.is_empty() {
                    downloaded.content_type
                } else {
                    metadata.mime_type.clone()
                };
                Some(ProviderMedia {
                    bytes: downloaded.bytes,
                    mime_type,
                })
            }
            Err(err) => {
                warn!(media_id, error = %err, "media download failed");
                None
            }
        }
    }

    /// Writes bytes under `{prefix}/{folder}/{timestamp}_{random}.{ext}`.
    pub async fn persist(
        &self,
        prefix: &TenantPrefix,
        bytes: &[u8],
        filename: Option<&str>,
        content_type: &str,
        folder: MediaFolder,
    ) -> Option<String> {
        let ext = filename
            .and_then(media_extension_from_filename)
            .unwrap_or_else(|| media_extension_from_mime(content_type));
        let key = format!(
            "{}/{}/{}_{}.{}",
            prefix,
            folder.as_str(),
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple(),
            ext
        );
        match self.objects.put(&key, bytes, content_type).await {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(key = %key, error = %err, "failed to persist media");
                None
            }
        }
    }

    /// Downloads a media object whose metadata is already known and mirrors it.
    pub async fn mirror_resolved(
        &self,
        prefix: &TenantPrefix,
        media_id: &str,
        metadata: &MediaMetadata,
        access_token: &str,
        filename: Option<&str>,
        folder: MediaFolder,
    ) -> Option<String> {
        let media = self.download(media_id, metadata, access_token).await?;
        self.persist(prefix, &media.bytes, filename, &media.mime_type, folder)
            .await
    }

    /// Full fetch-and-persist of a provider media id.
    pub async fn mirror(
        &self,
        prefix: &TenantPrefix,
        media_id: &str,
        access_token: &str,
        filename: Option<&str>,
        folder: MediaFolder,
    ) -> Option<String> {
        let media = self.fetch_provider_media(media_id, access_token).await?;
        self.persist(prefix, &media.bytes, filename, &media.mime_type, folder)
            .await
    }
}

pub fn media_extension_from_filename(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.trim().to_ascii_lowercase();
    if ext.is_empty() || ext.len() > 10 {
        return None;
    }
    if ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(ext)
    } else {
        None
    }
}

pub fn media_extension_from_mime(mime: &str) -> String {
    let mt = mime.to_ascii_lowercase();
    let ext = if mt.contains("jpeg") || mt.contains("jpg") {
        "jpg"
    } else if mt.contains("png") {
        "png"
    } else if mt.contains("webp") {
        "webp"
    } else if mt.contains("gif") {
        "gif"
    } else if mt.contains("mpeg") || mt.contains("mp3") {
        "mp3"
    } else if mt.contains("ogg") || mt.contains("opus") {
        "ogg"
    } else if mt.contains("aac") {
        "aac"
    } else if mt.contains("amr") {
        "amr"
    } else if mt.contains("mp4") {
        "mp4"
    } else if mt.contains("3gpp") {
        "3gp"
    } else if mt.contains("pdf") {
        "pdf"
    } else if mt.contains("plain") {
        "txt"
    } else {
        "bin"
    };
    ext.to_string()
}

pub fn media_content_type_from_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "aac" => "audio/aac",
        "amr" => "audio/amr",
        "mp4" => "video/mp4",
        "3gp" => "video/3gpp",
        "pdf" => "application/pdf",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Maps a MIME type to the format tag used to pick the provider message type.
pub fn media_kind_from_mime(mime: &str) -> MediaType {
    let mt = mime.to_ascii_lowercase();
    if mt.starts_with("image/") {
        MediaType::Image
    } else if mt.starts_with("audio/") {
        MediaType::Audio
    } else if mt.starts_with("video/") {
        MediaType::Video
    } else {
        MediaType::Document
    }
}

/// Keys are relative paths of safe segments; no traversal, no absolute paths.
pub fn is_safe_media_key(key: &str) -> bool {
    if key.is_empty() || key.contains('\\') {
        return false;
    }
    let safe_chars = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    safe_chars
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}
