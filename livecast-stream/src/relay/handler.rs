// Output handler
//
// Every staging directory gets its own lane: a bounded queue drained by one
// task, so files of a directory are saved in the order they arrived while
// different quality levels upload side by side. A shared semaphore bounds
// the number of saves in flight across all lanes.
//
// Playlists are held back until every segment they reference has settled
// (saved, failed, dropped from a full queue, vanished, or never staged),
// then published from a snapshot of the exact contents that were checked.

use super::{FileKind, RelayCounters, RelayStats, SegmentEvent};
use crate::storage::{StorageError, StorageProvider};
use dashmap::DashMap;
use livecast_core::metrics;
use lru::LruCache;
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Settled segment names remembered per lane, well beyond any playlist window
const SETTLED_CAPACITY: NonZeroUsize = nonzero!(512usize);

#[derive(Default)]
struct LaneQueue {
    events: VecDeque<SegmentEvent>,
    /// Segments pushed out of a full queue, not yet seen by the worker
    overflowed: Vec<String>,
}

struct Lane {
    queue: Mutex<LaneQueue>,
    notify: Notify,
    closed: AtomicBool,
}

impl Lane {
    fn new() -> Self {
        Self {
            queue: Mutex::new(LaneQueue::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Dispatches staged files to the storage provider captured at construction.
pub struct OutputHandler {
    provider: Arc<dyn StorageProvider>,
    staging_root: PathBuf,
    lanes: DashMap<String, Arc<Lane>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    permits: Arc<Semaphore>,
    queue_depth: usize,
    counters: Arc<RelayCounters>,
    closed: AtomicBool,
}

impl OutputHandler {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        staging_root: impl Into<PathBuf>,
        max_concurrent_saves: usize,
        queue_depth: usize,
    ) -> Self {
        Self {
            provider,
            staging_root: staging_root.into(),
            lanes: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(max_concurrent_saves.max(1))),
            queue_depth: queue_depth.max(1),
            counters: Arc::new(RelayCounters::default()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    #[must_use]
    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }

    /// Queue a file on its directory's lane. Never waits on storage.
    ///
    /// When the lane is full the oldest queued file is dropped. A dropped
    /// segment counts as settled, so playlists listing it are not held back.
    pub fn dispatch(&self, event: SegmentEvent) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!("Handler closed, ignoring {}", event.relative_name);
            return;
        }

        let lane = self.lane_for(event.directory());

        let overflowed = {
            let mut queue = lane.queue.lock();
            let overflowed = if queue.events.len() >= self.queue_depth {
                queue.events.pop_front()
            } else {
                None
            };
            if let Some(dropped) = &overflowed {
                if dropped.kind == FileKind::Segment {
                    queue.overflowed.push(dropped.relative_name.clone());
                }
            }
            queue.events.push_back(event);
            overflowed
        };
        lane.notify.notify_one();

        if let Some(dropped) = overflowed {
            self.counters.record_overflowed();
            metrics::relay::FILES_DROPPED
                .with_label_values(&["queue_full"])
                .inc();
            tracing::warn!(
                "Relay queue full (depth {}), dropped oldest file {}",
                self.queue_depth,
                dropped.relative_name
            );
        }
    }

    /// Close all lanes and wait for queued and in-flight saves to finish.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for lane in self.lanes.iter() {
            lane.value().close();
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Relay lane task failed: {}", e);
            }
        }
    }

    fn lane_for(&self, directory: &str) -> Arc<Lane> {
        if let Some(lane) = self.lanes.get(directory) {
            return Arc::clone(lane.value());
        }

        let entry = self.lanes.entry(directory.to_string()).or_insert_with(|| {
            let lane = Arc::new(Lane::new());
            let worker = LaneWorker {
                directory: directory.to_string(),
                lane: Arc::clone(&lane),
                provider: Arc::clone(&self.provider),
                staging_root: self.staging_root.clone(),
                permits: Arc::clone(&self.permits),
                counters: Arc::clone(&self.counters),
                settled: LruCache::new(SETTLED_CAPACITY),
                pending: HashMap::new(),
            };
            let span = tracing::debug_span!("relay_lane", directory = %directory);
            self.tasks.lock().push(tokio::spawn(worker.run().instrument(span)));
            lane
        });
        Arc::clone(entry.value())
    }
}

struct LaneWorker {
    directory: String,
    lane: Arc<Lane>,
    provider: Arc<dyn StorageProvider>,
    staging_root: PathBuf,
    permits: Arc<Semaphore>,
    counters: Arc<RelayCounters>,
    /// Segment names that need no further waiting on
    settled: LruCache<String, ()>,
    /// Latest unpublished version of each playlist, by name
    pending: HashMap<String, SegmentEvent>,
}

impl LaneWorker {
    async fn run(mut self) {
        loop {
            let (next, overflowed) = {
                let mut queue = self.lane.queue.lock();
                (queue.events.pop_front(), std::mem::take(&mut queue.overflowed))
            };

            if !overflowed.is_empty() {
                for name in overflowed {
                    self.settled.put(name, ());
                }
                if next.is_none() {
                    self.publish_ready_playlists().await;
                }
            }

            match next {
                Some(event) => self.handle(event).await,
                None => {
                    if self.lane.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    self.lane.notify.notified().await;
                }
            }
        }

        // Whatever is still pending references segments that never arrived
        for (name, _) in self.pending.drain() {
            self.counters.record_superseded();
            tracing::debug!("Discarding unpublished playlist {}", name);
        }
    }

    async fn handle(&mut self, event: SegmentEvent) {
        match event.kind {
            FileKind::Segment => {
                self.forward(&event.relative_name, &event.absolute_path, event.kind)
                    .await;
                self.settled.put(event.relative_name, ());
            }
            FileKind::Playlist => {
                self.pending.insert(event.relative_name.clone(), event);
            }
        }
        self.publish_ready_playlists().await;
    }

    /// Publish every pending playlist whose segments have all settled.
    async fn publish_ready_playlists(&mut self) {
        let names: Vec<String> = self.pending.keys().cloned().collect();
        for name in names {
            let Some(event) = self.pending.get(&name) else {
                continue;
            };
            let path = event.absolute_path.clone();

            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(e) => {
                    self.pending.remove(&name);
                    if e.kind() == std::io::ErrorKind::NotFound {
                        self.counters.record_superseded();
                        tracing::debug!("Playlist {} vanished before publishing", name);
                    } else {
                        self.record_drop(&name, &e.to_string());
                    }
                    continue;
                }
            };

            if !self.references_settled(&contents).await {
                continue;
            }
            self.pending.remove(&name);
            self.publish_snapshot(&name, &path, &contents).await;
        }
    }

    async fn references_settled(&self, playlist: &str) -> bool {
        for reference in segment_references(playlist, &self.directory) {
            if self.settled.contains(reference.as_str()) {
                continue;
            }
            // Never staged, or already rotated away: nothing to wait for
            let staged = self.staging_root.join(&reference);
            if tokio::fs::try_exists(&staged).await.unwrap_or(false) {
                return false;
            }
        }
        true
    }

    /// Save the exact playlist contents that passed the reference check.
    async fn publish_snapshot(&self, name: &str, path: &Path, contents: &str) {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let snapshot = path.with_file_name(format!(".relay-{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&snapshot, contents).await {
            if e.kind() == std::io::ErrorKind::NotFound {
                // Directory wiped under us
                self.counters.record_superseded();
            } else {
                self.record_drop(name, &e.to_string());
            }
            return;
        }

        self.forward(name, &snapshot, FileKind::Playlist).await;
        let _ = tokio::fs::remove_file(&snapshot).await;
    }

    async fn forward(&self, name: &str, local_path: &Path, kind: FileKind) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };

        match self.provider.save(name, local_path).await {
            Ok(url) => {
                self.counters.record_saved();
                metrics::relay::FILES_SAVED
                    .with_label_values(&[self.provider.kind().as_str(), kind.as_str()])
                    .inc();
                tracing::trace!("Forwarded {} -> {}", name, url);
            }
            Err(StorageError::SourceMissing(_)) => {
                self.counters.record_superseded();
                metrics::relay::FILES_DROPPED
                    .with_label_values(&["superseded"])
                    .inc();
                tracing::debug!("{} was rotated away before saving", name);
            }
            Err(e) => self.record_drop(name, &e.to_string()),
        }
    }

    fn record_drop(&self, name: &str, reason: &str) {
        self.counters.record_dropped();
        metrics::relay::FILES_DROPPED
            .with_label_values(&["save_failed"])
            .inc();
        let err = livecast_core::Error::RelayDrop {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        tracing::warn!("{}", err);
    }
}

/// Staging names of the media segments a playlist references.
///
/// Nested playlists and absolute URLs are skipped; both are outside this
/// directory's ordering.
fn segment_references(playlist: &str, directory: &str) -> Vec<String> {
    let mut references = Vec::new();

    for line in playlist.lines().map(str::trim) {
        let uri = if let Some(tag) = line.strip_prefix("#EXT-X-MAP:") {
            match map_uri(tag) {
                Some(uri) => uri,
                None => continue,
            }
        } else if line.is_empty() || line.starts_with('#') {
            continue;
        } else {
            line
        };

        let uri = uri.split(|c| c == '?' || c == '#').next().unwrap_or(uri);
        if uri.contains("://") || uri.starts_with('/') {
            continue;
        }
        if FileKind::classify(Path::new(uri)) != Some(FileKind::Segment) {
            continue;
        }

        let uri = uri.trim_start_matches("./");
        if directory.is_empty() {
            references.push(uri.to_string());
        } else {
            references.push(format!("{directory}/{uri}"));
        }
    }

    references
}

fn map_uri(attributes: &str) -> Option<&str> {
    let start = attributes.find("URI=\"")? + "URI=\"".len();
    let rest = &attributes[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;
    use tempfile::tempdir;

    fn stage(root: &Path, name: &str, contents: &str) -> SegmentEvent {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        SegmentEvent::from_path(root, path).unwrap()
    }

    #[test]
    fn test_segment_references() {
        let playlist = "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:4.0,\nstream-1.m4s\n#EXTINF:4.0,\n./stream-2.m4s?v=1\nhttps://cdn/x.ts\n";
        assert_eq!(
            segment_references(playlist, "0"),
            vec!["0/init.mp4", "0/stream-1.m4s", "0/stream-2.m4s"]
        );

        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1200000\n0/stream.m3u8\n";
        assert!(segment_references(master, "").is_empty());
    }

    #[tokio::test]
    async fn test_segments_saved_before_playlist() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        let storage = MemoryStorage::new();
        let handler = OutputHandler::new(Arc::new(storage.clone()), root, 4, 16);

        let seg0 = stage(root, "0/stream-0.ts", "s0");
        let seg1 = stage(root, "0/stream-1.ts", "s1");
        let playlist = stage(root, "0/stream.m3u8", "#EXTM3U\nstream-0.ts\nstream-1.ts\n");

        handler.dispatch(seg0);
        handler.dispatch(seg1);
        handler.dispatch(playlist);
        handler.shutdown().await;

        assert_eq!(
            storage.save_log(),
            vec!["0/stream-0.ts", "0/stream-1.ts", "0/stream.m3u8"]
        );
        assert_eq!(handler.stats().saved, 3);
    }

    #[tokio::test]
    async fn test_playlist_observed_first_waits_for_segments() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        let storage = MemoryStorage::new();
        let handler = OutputHandler::new(Arc::new(storage.clone()), root, 4, 16);

        let seg0 = stage(root, "0/stream-0.ts", "s0");
        let seg1 = stage(root, "0/stream-1.ts", "s1");
        let playlist = stage(root, "0/stream.m3u8", "#EXTM3U\nstream-0.ts\nstream-1.ts\n");

        handler.dispatch(playlist);
        handler.dispatch(seg0);
        handler.dispatch(seg1);
        handler.shutdown().await;

        assert_eq!(
            storage.save_log(),
            vec!["0/stream-0.ts", "0/stream-1.ts", "0/stream.m3u8"]
        );
        assert_eq!(
            storage.get("0/stream.m3u8").unwrap(),
            bytes::Bytes::from_static(b"#EXTM3U\nstream-0.ts\nstream-1.ts\n")
        );
    }

    #[tokio::test]
    async fn test_failed_save_does_not_block_later_segments() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        let storage = MemoryStorage::new();
        storage.fail_on("0/stream-0.ts");
        let handler = OutputHandler::new(Arc::new(storage.clone()), root, 4, 16);

        handler.dispatch(stage(root, "0/stream-0.ts", "s0"));
        handler.dispatch(stage(root, "0/stream-1.ts", "s1"));
        handler.dispatch(stage(root, "0/stream.m3u8", "#EXTM3U\nstream-0.ts\nstream-1.ts\n"));
        handler.dispatch(stage(root, "0/stream-2.ts", "s2"));
        handler.shutdown().await;

        assert_eq!(
            storage.save_log(),
            vec!["0/stream-1.ts", "0/stream.m3u8", "0/stream-2.ts"]
        );
        let stats = handler.stats();
        assert_eq!(stats.saved, 3);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_vanished_segment_is_superseded() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        let storage = MemoryStorage::new();
        let handler = OutputHandler::new(Arc::new(storage.clone()), root, 4, 16);

        let gone = stage(root, "0/stream-0.ts", "s0");
        std::fs::remove_file(&gone.absolute_path).unwrap();

        handler.dispatch(gone);
        handler.dispatch(stage(root, "0/stream.m3u8", "#EXTM3U\nstream-0.ts\n"));
        handler.shutdown().await;

        assert_eq!(storage.save_log(), vec!["0/stream.m3u8"]);
        let stats = handler.stats();
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_directories_are_independent() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        let storage = MemoryStorage::new();
        let handler = OutputHandler::new(Arc::new(storage.clone()), root, 4, 16);

        handler.dispatch(stage(root, "0/stream-0.ts", "a"));
        handler.dispatch(stage(root, "1/stream-0.ts", "b"));
        handler.dispatch(stage(root, "0/stream.m3u8", "#EXTM3U\nstream-0.ts\n"));
        handler.dispatch(stage(root, "1/stream.m3u8", "#EXTM3U\nstream-0.ts\n"));
        handler.dispatch(stage(root, "stream.m3u8", "#EXTM3U\n0/stream.m3u8\n1/stream.m3u8\n"));
        handler.shutdown().await;

        let log = storage.save_log();
        assert_eq!(log.len(), 5);
        for dir in ["0", "1"] {
            let seg = log.iter().position(|n| *n == format!("{dir}/stream-0.ts")).unwrap();
            let pl = log.iter().position(|n| *n == format!("{dir}/stream.m3u8")).unwrap();
            assert!(seg < pl);
        }
        assert!(log.contains(&"stream.m3u8".to_string()));
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        let storage = MemoryStorage::new().with_save_delay(Duration::from_millis(50));
        let handler = OutputHandler::new(Arc::new(storage.clone()), root, 1, 2);

        let events: Vec<SegmentEvent> = (0..6)
            .map(|i| stage(root, &format!("0/stream-{i}.ts"), "s"))
            .collect();
        for event in events {
            handler.dispatch(event);
        }
        handler.shutdown().await;

        let stats = handler.stats();
        assert!(stats.overflowed >= 1);
        assert_eq!(stats.saved + stats.overflowed, 6);
        // The newest file is never the one dropped
        assert_eq!(storage.save_log().last().unwrap(), "0/stream-5.ts");
    }

    #[tokio::test]
    async fn test_playlist_published_after_overflow() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        let storage = MemoryStorage::new().with_save_delay(Duration::from_millis(100));
        let handler = OutputHandler::new(Arc::new(storage.clone()), root, 1, 2);

        // stream-0 is in flight while the rest queue up behind it
        handler.dispatch(stage(root, "0/stream-0.ts", "s0"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        handler.dispatch(stage(root, "0/stream-1.ts", "s1"));
        handler.dispatch(stage(root, "0/stream-2.ts", "s2"));
        handler.dispatch(stage(root, "0/stream-3.ts", "s3"));
        handler.dispatch(stage(
            root,
            "0/stream.m3u8",
            "#EXTM3U\nstream-1.ts\nstream-2.ts\nstream-3.ts\n",
        ));
        handler.shutdown().await;

        // stream-1 and stream-2 were pushed out but are still staged
        assert!(root.join("0/stream-1.ts").exists());
        assert_eq!(
            storage.save_log(),
            vec!["0/stream-0.ts", "0/stream-3.ts", "0/stream.m3u8"]
        );
        let stats = handler.stats();
        assert_eq!(stats.overflowed, 2);
        assert_eq!(stats.superseded, 0);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_ignored() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        let storage = MemoryStorage::new();
        let handler = OutputHandler::new(Arc::new(storage.clone()), root, 1, 4);

        handler.shutdown().await;
        handler.dispatch(stage(root, "0/stream-0.ts", "s"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(storage.save_log().is_empty());
    }
}
