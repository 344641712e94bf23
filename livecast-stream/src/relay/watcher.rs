// Staging tree watcher
//
// Polls the private HLS root and reports files once they are finalized:
// a file counts as finalized when its size and modification time did not
// change between two consecutive scans. Rewritten playlists are reported
// again every time they settle on new contents.

use super::{OutputHandler, SegmentEvent};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: SystemTime,
}

#[derive(Debug)]
struct Observation {
    stamp: FileStamp,
    reported: Option<FileStamp>,
}

/// Polling watcher over the staging tree
pub struct StagingWatcher {
    root: PathBuf,
    interval: Duration,
    seen: HashMap<PathBuf, Observation>,
}

impl StagingWatcher {
    pub fn new(root: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            root: root.into(),
            interval,
            seen: HashMap::new(),
        }
    }

    /// Scan once and return newly finalized files in arrival order.
    pub async fn scan(&mut self) -> std::io::Result<Vec<SegmentEvent>> {
        let current = collect_files(&self.root).await?;

        // Forget files the transcoder rotated away
        self.seen.retain(|path, _| current.contains_key(path));

        let mut ready = Vec::new();
        for (path, stamp) in current {
            match self.seen.get_mut(&path) {
                Some(obs) if obs.stamp == stamp => {
                    if obs.reported != Some(stamp) {
                        obs.reported = Some(stamp);
                        ready.push((stamp.modified, path));
                    }
                }
                Some(obs) => obs.stamp = stamp,
                None => {
                    self.seen.insert(
                        path,
                        Observation {
                            stamp,
                            reported: None,
                        },
                    );
                }
            }
        }

        ready.sort();
        Ok(ready
            .into_iter()
            .filter_map(|(_, path)| SegmentEvent::from_path(&self.root, path))
            .collect())
    }

    /// Run the scan loop until `cancel` fires, dispatching into `handler`.
    pub fn spawn(mut self, handler: Arc<OutputHandler>, cancel: CancellationToken) -> JoinHandle<()> {
        let span = tracing::info_span!("staging_watcher", root = %self.root.display());
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            match self.scan().await {
                                Ok(events) => {
                                    for event in events {
                                        handler.dispatch(event);
                                    }
                                }
                                Err(e) => tracing::warn!("Staging scan failed: {}", e),
                            }
                        }
                    }
                }

                tracing::debug!("Staging watcher stopped");
            }
            .instrument(span),
        )
    }
}

fn is_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.') && !name.ends_with(".tmp")
}

/// Walk the tree under `root`, returning the stamp of every candidate file.
async fn collect_files(root: &Path) -> std::io::Result<HashMap<PathBuf, FileStamp>> {
    let mut files = HashMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // Directory vanished between listing and reading
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(path);
            } else if metadata.is_file() && is_candidate(&path) {
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                files.insert(
                    path,
                    FileStamp {
                        len: metadata.len(),
                        modified,
                    },
                );
            }
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::FileKind;
    use tempfile::tempdir;

    fn names(events: &[SegmentEvent]) -> Vec<&str> {
        events.iter().map(|e| e.relative_name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_scan_reports_after_file_settles() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("0")).unwrap();
        std::fs::write(root.join("0/stream-0.ts"), b"seg").unwrap();

        let mut watcher = StagingWatcher::new(root, Duration::from_millis(10));

        // First sighting only records the stamp
        assert!(watcher.scan().await.unwrap().is_empty());

        let events = watcher.scan().await.unwrap();
        assert_eq!(names(&events), vec!["0/stream-0.ts"]);
        assert_eq!(events[0].kind, FileKind::Segment);

        // Reported once
        assert!(watcher.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_ignores_temporary_and_unknown_files() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("0")).unwrap();
        std::fs::write(root.join("0/stream.m3u8.tmp"), b"partial").unwrap();
        std::fs::write(root.join("0/.hidden.ts"), b"x").unwrap();
        std::fs::write(root.join("0/ffmpeg.log"), b"x").unwrap();

        let mut watcher = StagingWatcher::new(root, Duration::from_millis(10));
        watcher.scan().await.unwrap();
        assert!(watcher.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_reports_rewritten_playlist_again() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("0")).unwrap();
        let playlist = root.join("0/stream.m3u8");
        std::fs::write(&playlist, b"#EXTM3U\nstream-0.ts\n").unwrap();

        let mut watcher = StagingWatcher::new(root, Duration::from_millis(10));
        watcher.scan().await.unwrap();
        assert_eq!(names(&watcher.scan().await.unwrap()), vec!["0/stream.m3u8"]);

        std::fs::write(&playlist, b"#EXTM3U\nstream-0.ts\nstream-1.ts\n").unwrap();
        assert!(watcher.scan().await.unwrap().is_empty());
        assert_eq!(names(&watcher.scan().await.unwrap()), vec!["0/stream.m3u8"]);
    }

    #[tokio::test]
    async fn test_scan_forgets_removed_files() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("1")).unwrap();
        let segment = root.join("1/stream-0.ts");
        std::fs::write(&segment, b"seg").unwrap();

        let mut watcher = StagingWatcher::new(root, Duration::from_millis(10));
        watcher.scan().await.unwrap();
        watcher.scan().await.unwrap();
        assert_eq!(watcher.seen.len(), 1);

        std::fs::remove_file(&segment).unwrap();
        assert!(watcher.scan().await.unwrap().is_empty());
        assert!(watcher.seen.is_empty());
    }

    #[tokio::test]
    async fn test_scan_missing_root_is_empty() {
        let temp_dir = tempdir().unwrap();
        let mut watcher = StagingWatcher::new(temp_dir.path().join("absent"), Duration::from_millis(10));
        assert!(watcher.scan().await.unwrap().is_empty());
    }
}
