// S3-compatible object storage backend
//
// Supports:
// - AWS S3
// - Minio
// - Any S3-compatible storage
//
// Uses OpenDAL for unified storage access. A PUT replaces the whole object
// atomically, so overwriting a playlist never exposes a partial upload.

use super::{
    content_type_for, read_staged, validate_name, StorageError, StorageKind, StorageProvider,
    StorageResult,
};
use async_trait::async_trait;
use livecast_core::config::S3Config;
use opendal::{services::S3, Operator};
use std::path::Path;
use tokio::sync::OnceCell;

const DEFAULT_ENDPOINT: &str = "https://s3.amazonaws.com";
const DEFAULT_REGION: &str = "us-east-1";

/// S3 storage backend
pub struct S3Storage {
    config: S3Config,
    operator: Operator,
    ready: OnceCell<()>,
}

impl S3Storage {
    /// Create new S3 storage with configuration.
    ///
    /// Builds the client only; the bucket is first contacted by `setup()`.
    pub fn new(config: S3Config) -> StorageResult<Self> {
        let endpoint = if config.endpoint.is_empty() {
            DEFAULT_ENDPOINT
        } else {
            config.endpoint.as_str()
        };

        let builder = S3::default()
            .endpoint(endpoint)
            .access_key_id(&config.access_key)
            .secret_access_key(&config.secret)
            .bucket(&config.bucket)
            .region(config.region.as_deref().unwrap_or(DEFAULT_REGION));

        let operator = Operator::new(builder)
            .map_err(|e| StorageError::Setup(format!("invalid S3 configuration: {e}")))?
            .finish();

        Ok(Self {
            config,
            operator,
            ready: OnceCell::new(),
        })
    }

    /// Object key for a storage name, with the configured base path prefix
    fn object_key(&self, name: &str) -> String {
        let base = self.config.base_path.trim_matches('/');
        if base.is_empty() {
            name.to_string()
        } else {
            format!("{base}/{name}")
        }
    }

    fn public_url(&self, name: &str) -> String {
        let key = self.object_key(name);
        if self.config.serving_endpoint.is_empty() {
            let endpoint = if self.config.endpoint.is_empty() {
                DEFAULT_ENDPOINT
            } else {
                self.config.endpoint.as_str()
            };
            format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.config.bucket,
                key
            )
        } else {
            format!("{}/{}", self.config.serving_endpoint.trim_end_matches('/'), key)
        }
    }

    async fn initialize(&self) -> StorageResult<()> {
        tracing::info!(
            "Verifying S3 storage: bucket={}, endpoint={}",
            self.config.bucket,
            self.config.endpoint
        );

        self.operator.check().await.map_err(|e| {
            StorageError::Setup(format!("bucket {} is not reachable: {e}", self.config.bucket))
        })?;

        tracing::info!("S3 storage ready: bucket={}", self.config.bucket);
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for S3Storage {
    fn kind(&self) -> StorageKind {
        StorageKind::S3
    }

    async fn setup(&self) -> StorageResult<()> {
        self.ready
            .get_or_try_init(|| self.initialize())
            .await
            .map(|_| ())
    }

    async fn save(&self, name: &str, local_path: &Path) -> StorageResult<String> {
        validate_name(name)?;

        let data = read_staged(local_path).await?;
        let size = data.len();
        let object_key = self.object_key(name);

        // Playlists change every segment; segments never change once written
        let cache_control = if name.ends_with(".m3u8") {
            "no-cache, no-store, must-revalidate"
        } else {
            "public, max-age=3600"
        };

        self.operator
            .write_with(&object_key, data)
            .content_type(content_type_for(name))
            .cache_control(cache_control)
            .await
            .map_err(|e| StorageError::Backend(format!("S3 upload of {object_key} failed: {e}")))?;

        tracing::trace!("Uploaded to S3: {} ({} bytes)", object_key, size);

        Ok(self.public_url(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> S3Config {
        S3Config {
            enabled: true,
            endpoint: "https://minio.example.com:9000/".to_string(),
            region: Some("us-east-1".to_string()),
            bucket: "live".to_string(),
            access_key: "test".to_string(),
            secret: "test".to_string(),
            base_path: "hls/".to_string(),
            serving_endpoint: String::new(),
        }
    }

    #[test]
    fn test_public_url_without_cdn() {
        let storage = S3Storage::new(test_config()).unwrap();
        assert_eq!(
            storage.public_url("0/stream-3.ts"),
            "https://minio.example.com:9000/live/hls/0/stream-3.ts"
        );
    }

    #[test]
    fn test_public_url_with_cdn() {
        let config = S3Config {
            serving_endpoint: "https://cdn.example.com/".to_string(),
            base_path: String::new(),
            ..test_config()
        };
        let storage = S3Storage::new(config).unwrap();
        assert_eq!(
            storage.public_url("0/stream.m3u8"),
            "https://cdn.example.com/0/stream.m3u8"
        );
    }

    #[tokio::test]
    async fn test_save_rejects_escaping_name_before_upload() {
        let storage = S3Storage::new(test_config()).unwrap();
        let err = storage
            .save("../x.ts", Path::new("/nonexistent"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_save_missing_source_is_superseded() {
        let storage = S3Storage::new(test_config()).unwrap();
        let temp_dir = tempfile::tempdir().unwrap();
        let err = storage
            .save("0/stream-1.ts", &temp_dir.path().join("gone.ts"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SourceMissing(_)));
    }
}
