// Local filesystem storage backend
//
// Publishes staged files into the web-servable public HLS root.
// Every save goes through a temporary file in the destination directory
// followed by a rename, so the web server never serves a half-copied file.

use super::{validate_name, StorageError, StorageKind, StorageProvider, StorageResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::OnceCell;

/// Local filesystem storage backend
pub struct LocalStorage {
    root: PathBuf,
    url_prefix: String,
    ready: OnceCell<()>,
}

impl LocalStorage {
    /// Create new local storage publishing under `root`
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into(),
            ready: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn public_url(&self, name: &str) -> String {
        if self.url_prefix.ends_with('/') {
            format!("{}{}", self.url_prefix, name)
        } else {
            format!("{}/{}", self.url_prefix, name)
        }
    }

    async fn initialize(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            StorageError::Setup(format!("cannot create {}: {e}", self.root.display()))
        })?;

        // The root must be writable before any segment depends on it
        let marker = self.root.join(format!(".write-check-{}", uuid::Uuid::new_v4()));
        fs::write(&marker, b"ok").await.map_err(|e| {
            StorageError::Setup(format!("{} is not writable: {e}", self.root.display()))
        })?;
        let _ = fs::remove_file(&marker).await;

        tracing::info!("Local storage ready at {:?}", self.root);
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn setup(&self) -> StorageResult<()> {
        self.ready
            .get_or_try_init(|| self.initialize())
            .await
            .map(|_| ())
    }

    async fn save(&self, name: &str, local_path: &Path) -> StorageResult<String> {
        validate_name(name)?;

        let dest = self.root.join(name);
        let parent = dest.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).await?;

        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let size = match fs::copy(local_path, &tmp).await {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                if e.kind() == std::io::ErrorKind::NotFound {
                    return Err(StorageError::SourceMissing(local_path.to_path_buf()));
                }
                return Err(e.into());
            }
        };

        if let Err(e) = fs::rename(&tmp, &dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::trace!("Published {:?} ({} bytes) as {}", dest, size, name);

        Ok(self.public_url(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path().join("public");
        let storage = LocalStorage::new(&root, "/hls/");

        storage.setup().await.unwrap();
        assert!(root.is_dir());
        // Only the root itself, no write-check files left behind
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);

        // A second setup must not redo the work
        std::fs::remove_dir(&root).unwrap();
        storage.setup().await.unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_setup_fails_on_file_root() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path().join("not-a-dir");
        std::fs::write(&root, b"x").unwrap();

        let storage = LocalStorage::new(&root, "/hls/");
        let err = storage.setup().await.unwrap_err();
        assert!(matches!(err, StorageError::Setup(_)));
    }

    #[tokio::test]
    async fn test_save_copies_and_returns_url() {
        let temp_dir = tempdir().unwrap();
        let staged = temp_dir.path().join("staged.ts");
        std::fs::write(&staged, b"segment data").unwrap();

        let storage = LocalStorage::new(temp_dir.path().join("public"), "/hls");
        storage.setup().await.unwrap();

        let url = storage.save("0/stream-1.ts", &staged).await.unwrap();
        assert_eq!(url, "/hls/0/stream-1.ts");

        let published = temp_dir.path().join("public/0/stream-1.ts");
        assert_eq!(std::fs::read(&published).unwrap(), b"segment data");
        // Staged copy is left for the transcoder to rotate
        assert!(staged.exists());
    }

    #[tokio::test]
    async fn test_save_overwrites_last_write_wins() {
        let temp_dir = tempdir().unwrap();
        let staged = temp_dir.path().join("stream.m3u8");
        let storage = LocalStorage::new(temp_dir.path().join("public"), "/hls/");

        std::fs::write(&staged, b"#EXTM3U\nv1").unwrap();
        storage.save("0/stream.m3u8", &staged).await.unwrap();
        std::fs::write(&staged, b"#EXTM3U\nv2").unwrap();
        storage.save("0/stream.m3u8", &staged).await.unwrap();

        let dir = temp_dir.path().join("public/0");
        assert_eq!(std::fs::read(dir.join("stream.m3u8")).unwrap(), b"#EXTM3U\nv2");
        // No temporary files remain next to the published playlist
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_save_missing_source_is_superseded() {
        let temp_dir = tempdir().unwrap();
        let storage = LocalStorage::new(temp_dir.path().join("public"), "/hls/");

        let err = storage
            .save("0/stream-9.ts", &temp_dir.path().join("gone.ts"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SourceMissing(_)));
        assert_eq!(
            std::fs::read_dir(temp_dir.path().join("public/0")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn test_save_rejects_escaping_name() {
        let temp_dir = tempdir().unwrap();
        let staged = temp_dir.path().join("staged.ts");
        std::fs::write(&staged, b"x").unwrap();
        let storage = LocalStorage::new(temp_dir.path().join("public"), "/hls/");

        let err = storage.save("../escape.ts", &staged).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidName(_)));
    }
}
