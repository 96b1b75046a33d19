//! Per-session staging files, removed when the guard is dropped

use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};

use crate::probe::{sanitize_file_name, FALLBACK_FILE_NAME};

/// A staging path owned by one session.
///
/// The file (if it was ever created) is deleted when the guard goes out of
/// scope, on success, failure, or a dropped future alike.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
}

impl StagedFile {
    /// Reserve `<dir>/<session>_<name>`, creating `dir` if needed
    pub async fn create(dir: &Path, session_id: u64, file_name: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let mut name = sanitize_file_name(file_name);
        if name.is_empty() {
            name = FALLBACK_FILE_NAME.to_string();
        }
        Ok(Self {
            path: dir.join(format!("{}_{}", session_id, name)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("staging_removed: {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("staging_remove_failed: {} error={}", self.path.display(), e),
        }
    }
}

/// Delete files left behind by a previous process
pub async fn sweep_staging_dir(dir: &Path) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!("staging_sweep: {} removed={}", dir.display(), removed);
    }
    Ok(removed)
}
