// Output directory layout
//
// public_root/  web-servable HLS tree, one subdirectory per quality index
// private_root/ transcoder staging tree, same shape, never served
//
// Both trees are wiped and rebuilt on startup and whenever the quality
// ladder changes size. Callers stop the transcoder before resetting.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Owner of the staging and public HLS directory trees.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    public_root: PathBuf,
    private_root: PathBuf,
    thumbnail_path: PathBuf,
    quality_count: usize,
}

impl OutputLayout {
    pub fn new(
        public_root: impl Into<PathBuf>,
        private_root: impl Into<PathBuf>,
        thumbnail_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            public_root: public_root.into(),
            private_root: private_root.into(),
            thumbnail_path: thumbnail_path.into(),
            quality_count: 0,
        }
    }

    #[must_use]
    pub fn public_root(&self) -> &Path {
        &self.public_root
    }

    #[must_use]
    pub fn private_root(&self) -> &Path {
        &self.private_root
    }

    /// Quality directories created by the last reset, 0 before the first one
    #[must_use]
    pub fn quality_count(&self) -> usize {
        self.quality_count
    }

    #[must_use]
    pub fn public_dir(&self, index: usize) -> PathBuf {
        self.public_root.join(index.to_string())
    }

    #[must_use]
    pub fn private_dir(&self, index: usize) -> PathBuf {
        self.private_root.join(index.to_string())
    }

    /// Whether a ladder of `quality_count` renditions needs a reset first
    #[must_use]
    pub fn needs_reset(&self, quality_count: usize) -> bool {
        self.quality_count != quality_count.max(1)
    }

    /// Wipe both trees and recreate one directory per quality index.
    ///
    /// At least one quality directory (`0`) is always created. Missing roots
    /// are fine; any other removal failure aborts the reset.
    pub async fn reset(&mut self, quality_count: usize) -> std::io::Result<()> {
        tracing::trace!("Resetting file directories to a clean slate");

        let count = quality_count.max(1);
        // Forget the old shape first so a failed reset always forces a retry
        self.quality_count = 0;

        remove_dir_all_if_exists(&self.public_root).await?;
        remove_dir_all_if_exists(&self.private_root).await?;

        fs::create_dir_all(&self.public_root).await?;
        fs::create_dir_all(&self.private_root).await?;

        for index in 0..count {
            fs::create_dir_all(self.private_dir(index)).await?;
            fs::create_dir_all(self.public_dir(index)).await?;
        }

        // Stale thumbnail goes too, a fresh default is provisioned later
        remove_file_if_exists(&self.thumbnail_path).await?;

        self.quality_count = count;
        tracing::debug!(
            public = %self.public_root.display(),
            private = %self.private_root.display(),
            qualities = count,
            "Output layout reset"
        );
        Ok(())
    }

    /// Copy the bundled logo into place when no thumbnail exists.
    ///
    /// Returns whether a copy was made.
    pub async fn provision_default_thumbnail(&self, logo_path: &Path) -> std::io::Result<bool> {
        if fs::try_exists(&self.thumbnail_path).await? {
            return Ok(false);
        }
        if let Some(parent) = self.thumbnail_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::copy(logo_path, &self.thumbnail_path).await?;
        tracing::debug!("Provisioned default thumbnail from {:?}", logo_path);
        Ok(true)
    }
}

async fn remove_dir_all_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
