// Segment relay
//
// watcher  - scans the private staging tree and reports finalized files
// handler  - per-directory lanes that forward files to the storage provider
//
// A relay is bound to one provider for its whole life. Swapping providers
// means stopping this relay (in-flight saves finish) and starting another.

pub mod handler;
pub mod watcher;

use crate::storage::StorageProvider;
use livecast_core::config::RelayConfig;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use handler::OutputHandler;
pub use watcher::StagingWatcher;

/// What a staged file is, by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Segment,
    Playlist,
}

impl FileKind {
    #[must_use]
    pub fn classify(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("m3u8") => Some(Self::Playlist),
            Some("ts" | "m4s" | "mp4" | "aac") => Some(Self::Segment),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Segment => "segment",
            Self::Playlist => "playlist",
        }
    }
}

/// A finalized file observed in the staging tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEvent {
    /// `/`-separated path relative to the staging root, used as storage name
    pub relative_name: String,
    pub absolute_path: PathBuf,
    pub kind: FileKind,
}

impl SegmentEvent {
    /// Build an event for `absolute_path` under `root`.
    ///
    /// Returns `None` for files outside the root or with unknown extensions.
    #[must_use]
    pub fn from_path(root: &Path, absolute_path: PathBuf) -> Option<Self> {
        let kind = FileKind::classify(&absolute_path)?;
        let relative = absolute_path.strip_prefix(root).ok()?;

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }

        Some(Self {
            relative_name: parts.join("/"),
            absolute_path,
            kind,
        })
    }

    /// Directory part of the relative name, `""` for the staging root
    #[must_use]
    pub fn directory(&self) -> &str {
        self.relative_name
            .rsplit_once('/')
            .map_or("", |(dir, _)| dir)
    }
}

/// Counters of one relay instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub saved: u64,
    /// Saves that failed
    pub dropped: u64,
    /// Files that vanished before they could be saved
    pub superseded: u64,
    /// Files dropped because their lane queue was full
    pub overflowed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RelayCounters {
    saved: AtomicU64,
    dropped: AtomicU64,
    superseded: AtomicU64,
    overflowed: AtomicU64,
}

impl RelayCounters {
    pub(crate) fn record_saved(&self) {
        self.saved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_superseded(&self) {
        self.superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_overflowed(&self) {
        self.overflowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RelayStats {
        RelayStats {
            saved: self.saved.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
        }
    }
}

/// Running relay: staging watcher wired to an output handler.
pub struct SegmentRelay {
    handler: Arc<OutputHandler>,
    watcher: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SegmentRelay {
    /// Start watching `staging_root` and forwarding to `provider`.
    pub fn start(
        provider: Arc<dyn StorageProvider>,
        staging_root: impl Into<PathBuf>,
        config: &RelayConfig,
    ) -> Self {
        let staging_root = staging_root.into();
        let handler = Arc::new(OutputHandler::new(
            provider,
            staging_root.clone(),
            config.max_concurrent_saves,
            config.queue_depth,
        ));
        let cancel = CancellationToken::new();

        let watcher = StagingWatcher::new(
            staging_root,
            Duration::from_millis(config.poll_interval_ms),
        )
        .spawn(Arc::clone(&handler), cancel.clone());

        tracing::info!(
            provider = handler.provider().kind().as_str(),
            "Segment relay started"
        );

        Self {
            handler,
            watcher: Some(watcher),
            cancel,
        }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        self.handler.provider()
    }

    #[must_use]
    pub fn stats(&self) -> RelayStats {
        self.handler.stats()
    }

    /// Stop observing and wait until every queued and in-flight save is done.
    ///
    /// No save is issued against this relay's provider once this returns.
    pub async fn stop(mut self) -> RelayStats {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher.take() {
            if let Err(e) = watcher.await {
                tracing::error!("Staging watcher task failed: {}", e);
            }
        }
        self.handler.shutdown().await;

        let stats = self.handler.stats();
        tracing::info!(
            saved = stats.saved,
            dropped = stats.dropped,
            superseded = stats.superseded,
            overflowed = stats.overflowed,
            "Segment relay stopped"
        );
        stats
    }
}

impl Drop for SegmentRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
