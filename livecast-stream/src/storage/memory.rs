// In-memory storage backend
//
// Useful for:
// - Testing relay ordering and failure handling without a filesystem target
// - Dry runs (`storage.dry_run`) where nothing should be published
//
// Note: data is lost when the provider is dropped

use super::{read_staged, validate_name, StorageError, StorageKind, StorageProvider, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MemoryStorageInner {
    objects: HashMap<String, Bytes>,
    /// Names in the order their saves completed
    save_log: Vec<String>,
    /// Names whose saves fail with a backend error
    failing: HashSet<String>,
}

/// In-memory storage backend.
///
/// Cloning shares the underlying store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
    setup_runs: Arc<AtomicUsize>,
    save_delay: Option<Duration>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every save, simulating a slow remote backend.
    #[must_use]
    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = Some(delay);
        self
    }

    /// Make saves of `name` fail until cleared.
    pub fn fail_on(&self, name: impl Into<String>) {
        self.inner.lock().failing.insert(name.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.inner.lock().objects.get(name).cloned()
    }

    /// Names of completed saves, in completion order
    #[must_use]
    pub fn save_log(&self) -> Vec<String> {
        self.inner.lock().save_log.clone()
    }

    /// How many times `setup` actually initialized the store
    #[must_use]
    pub fn setup_runs(&self) -> usize {
        self.setup_runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    async fn setup(&self) -> StorageResult<()> {
        // Only the first call counts as initialization
        let _ = self
            .setup_runs
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
        Ok(())
    }

    async fn save(&self, name: &str, local_path: &Path) -> StorageResult<String> {
        validate_name(name)?;

        if let Some(delay) = self.save_delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.lock().failing.contains(name) {
            return Err(StorageError::Backend(format!("injected failure for {name}")));
        }

        let data = Bytes::from(read_staged(local_path).await?);

        let mut inner = self.inner.lock();
        inner.objects.insert(name.to_string(), data);
        inner.save_log.push(name.to_string());

        Ok(format!("memory://{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_storage_save_and_log() {
        let temp_dir = tempdir().unwrap();
        let staged = temp_dir.path().join("a.ts");
        std::fs::write(&staged, b"abc").unwrap();

        let storage = MemoryStorage::new();
        storage.setup().await.unwrap();
        storage.setup().await.unwrap();
        assert_eq!(storage.setup_runs(), 1);

        let url = storage.save("0/a.ts", &staged).await.unwrap();
        assert_eq!(url, "memory://0/a.ts");
        assert_eq!(storage.get("0/a.ts").unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(storage.save_log(), vec!["0/a.ts".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_storage_injected_failure() {
        let temp_dir = tempdir().unwrap();
        let staged = temp_dir.path().join("a.ts");
        std::fs::write(&staged, b"abc").unwrap();

        let storage = MemoryStorage::new();
        storage.fail_on("0/a.ts");

        let err = storage.save("0/a.ts", &staged).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert!(storage.save_log().is_empty());
    }
}
