//! File-backed audio output for headless runs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use super::traits::AudioPlayer;
use crate::error::TaskError;

/// Writes every clip to `<dir>/clip-NNN.<ext>` in playback order.  A clip
/// counts as played once it is fully flushed to disk.
pub struct FilePlayer {
    dir: PathBuf,
    extension: String,
    played: AtomicUsize,
}

impl FilePlayer {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            played: AtomicUsize::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of clips written so far.
    pub fn played(&self) -> usize {
        self.played.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioPlayer for FilePlayer {
    async fn play(&self, clip: &Bytes) -> Result<(), TaskError> {
        let index = self.played.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.dir.join(format!("clip-{index:03}.{}", self.extension));

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TaskError::Internal(format!("create {}: {e}", self.dir.display())))?;
        tokio::fs::write(&path, clip)
            .await
            .map_err(|e| TaskError::Internal(format!("write {}: {e}", path.display())))?;

        log::info!("pipeline: wrote {} bytes to {}", clip.len(), path.display());
        Ok(())
    }
}
