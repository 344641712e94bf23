use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub video: VideoConfig,
    pub storage: StorageConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
    /// Level for forwarded transcoder stderr; "off" silences it
    pub ffmpeg_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
            ffmpeg_level: "warn".to_string(),
        }
    }
}

/// One rendition of the output quality ladder.
///
/// The values are handed to the transcoder untouched; this crate only
/// cares about how many renditions there are.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamQuality {
    pub name: String,
    pub video_bitrate_kbps: u32,
    pub scaled_height: Option<u32>,
    pub framerate: Option<u32>,
    /// Copy the source video instead of re-encoding it
    pub passthrough: bool,
}

impl Default for StreamQuality {
    fn default() -> Self {
        Self {
            name: "source".to_string(),
            video_bitrate_kbps: 1200,
            scaled_height: None,
            framerate: None,
            passthrough: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub stream_qualities: Vec<StreamQuality>,
    pub segment_length_seconds: u32,
    /// Number of segments kept in each media playlist
    pub playlist_length: u32,
    pub offline_content_path: PathBuf,
    pub ffmpeg_path: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            stream_qualities: Vec::new(),
            segment_length_seconds: 4,
            playlist_length: 6,
            offline_content_path: PathBuf::from("static/offline.ts"),
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl VideoConfig {
    /// Number of output renditions. An empty ladder still produces one.
    #[must_use]
    pub fn quality_count(&self) -> usize {
        self.stream_qualities.len().max(1)
    }

    /// The configured ladder, or a single default rendition when none is set.
    #[must_use]
    pub fn effective_qualities(&self) -> Vec<StreamQuality> {
        if self.stream_qualities.is_empty() {
            vec![StreamQuality::default()]
        } else {
            self.stream_qualities.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Web-servable HLS root
    pub public_hls_path: PathBuf,
    /// Staging HLS root written by the transcoder, never served
    pub private_hls_path: PathBuf,
    /// Prefix of URLs returned for files saved to local storage
    pub public_url_prefix: String,
    pub thumbnail_path: PathBuf,
    /// Bundled image copied to `thumbnail_path` while no thumbnail exists
    pub logo_path: PathBuf,
    /// Keep published files in memory only; takes precedence over S3
    pub dry_run: bool,
    pub s3: S3Config,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            public_hls_path: PathBuf::from("webroot/hls"),
            private_hls_path: PathBuf::from("hls"),
            public_url_prefix: "/hls/".to_string(),
            thumbnail_path: PathBuf::from("webroot/thumbnail.jpg"),
            logo_path: PathBuf::from("static/logo.png"),
            dry_run: false,
            s3: S3Config::default(),
        }
    }
}

/// S3-compatible object storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub enabled: bool,
    /// Endpoint (e.g., "https://s3.amazonaws.com" or a Minio address)
    pub endpoint: String,
    pub region: Option<String>,
    pub bucket: String,
    pub access_key: String,
    pub secret: String,
    /// Key prefix inside the bucket (e.g., "hls/")
    pub base_path: String,
    /// Public URL prefix (CDN). Falls back to `endpoint/bucket` when empty
    pub serving_endpoint: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            region: None,
            bucket: String::new(),
            access_key: String::new(),
            secret: String::new(),
            base_path: String::new(),
            serving_endpoint: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Staging tree scan period
    pub poll_interval_ms: u64,
    /// Saves allowed in flight across all directories
    pub max_concurrent_saves: usize,
    /// Per-directory queue bound; the oldest queued file is dropped beyond it
    pub queue_depth: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            max_concurrent_saves: 4,
            queue_depth: 64,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LIVECAST_STORAGE__S3__ENABLED=true, LIVECAST_RELAY__QUEUE_DEPTH=128, ...
        builder = builder.add_source(
            Environment::with_prefix("LIVECAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Check values that would otherwise fail much later at runtime.
    ///
    /// Returns every problem found, not just the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.video.segment_length_seconds == 0 {
            errors.push("video.segment_length_seconds must be greater than 0".to_string());
        }
        if self.video.playlist_length == 0 {
            errors.push("video.playlist_length must be greater than 0".to_string());
        }
        if self.storage.public_hls_path.as_os_str().is_empty() {
            errors.push("storage.public_hls_path must not be empty".to_string());
        }
        if self.storage.private_hls_path.as_os_str().is_empty() {
            errors.push("storage.private_hls_path must not be empty".to_string());
        }
        if self.storage.public_hls_path == self.storage.private_hls_path {
            errors.push("storage.public_hls_path and storage.private_hls_path must differ".to_string());
        }
        if self.storage.s3.enabled && !self.storage.dry_run {
            let s3 = &self.storage.s3;
            for (field, value) in [
                ("endpoint", &s3.endpoint),
                ("bucket", &s3.bucket),
                ("access_key", &s3.access_key),
                ("secret", &s3.secret),
            ] {
                if value.is_empty() {
                    errors.push(format!("storage.s3.{field} is required when S3 is enabled"));
                }
            }
        }
        if self.relay.poll_interval_ms == 0 {
            errors.push("relay.poll_interval_ms must be greater than 0".to_string());
        }
        if self.relay.max_concurrent_saves == 0 {
            errors.push("relay.max_concurrent_saves must be greater than 0".to_string());
        }
        if self.relay.queue_depth == 0 {
            errors.push("relay.queue_depth must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration shared with the lifecycle controller.
///
/// Readers take a snapshot at each transition instead of holding on to it.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    /// Modify the configuration; picked up by the next transition.
    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        let mut guard = self.inner.write();
        f(&mut guard);
    }

    /// Swap in a freshly loaded configuration.
    pub fn replace(&self, config: Config) {
        *self.inner.write() = config;
    }
}
