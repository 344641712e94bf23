// Storage provider abstraction for published HLS output
//
// Backends:
// - LocalStorage: copies into the web-servable public HLS root (default)
// - S3Storage: uploads to S3-compatible object storage
// - MemoryStorage: keeps bytes in process (tests, `storage.dry_run`)
//
// The provider only knows names and staged files. Ordering between
// segments and playlists is the relay's job.

pub mod local;
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use livecast_core::config::StorageConfig;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use s3::S3Storage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage setup failed: {0}")]
    Setup(String),

    #[error("Invalid storage name: {0}")]
    InvalidName(String),

    /// The staged file disappeared before it could be read
    #[error("Staged file missing: {0}")]
    SourceMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for livecast_core::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Setup(msg) => Self::Setup(msg),
            other => Self::Setup(other.to_string()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    S3,
    Memory,
}

impl StorageKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Memory => "memory",
        }
    }
}

/// Uniform interface over a storage backend.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// One-time backend initialization.
    ///
    /// Idempotent: once it has succeeded, later calls return `Ok(())`
    /// without touching the backend again.
    async fn setup(&self) -> StorageResult<()>;

    /// Publish the staged file at `local_path` under `name` and return the
    /// URL it is retrievable at.
    ///
    /// Saving the same name twice replaces the earlier object; readers see
    /// either the old or the new bytes, never a partial file.
    async fn save(&self, name: &str, local_path: &Path) -> StorageResult<String>;
}

/// Build the provider selected by configuration.
///
/// This is the only place a provider is constructed. The returned provider
/// still needs `setup()`. `dry_run` wins over every other backend.
pub fn build_provider(config: &StorageConfig) -> StorageResult<Arc<dyn StorageProvider>> {
    if config.dry_run {
        Ok(Arc::new(MemoryStorage::new()))
    } else if config.s3.enabled {
        Ok(Arc::new(S3Storage::new(config.s3.clone())?))
    } else {
        Ok(Arc::new(LocalStorage::new(
            config.public_hls_path.clone(),
            config.public_url_prefix.clone(),
        )))
    }
}

/// Reject names that could escape the storage root.
pub(crate) fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidName("empty name".to_string()));
    }
    let path = Path::new(name);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// HTTP content type for a published file, by extension.
#[must_use]
pub fn content_type_for(name: &str) -> &'static str {
    match Path::new(name).extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/x-mpegURL",
        Some("ts") => "video/MP2T",
        Some("m4s") | Some("mp4") => "video/mp4",
        Some("aac") => "audio/aac",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// Read a staged file, mapping `NotFound` to `SourceMissing`.
pub(crate) async fn read_staged(local_path: &Path) -> StorageResult<Vec<u8>> {
    match tokio::fs::read(local_path).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StorageError::SourceMissing(local_path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}
