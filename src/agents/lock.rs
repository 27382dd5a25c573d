//! Advisory lock that keeps two updater processes off the same tree.
//!
//! Held for the whole of a check or apply and released on drop.

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use fs2::FileExt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "updater.lock";

#[derive(Debug)]
pub struct UpdateLock {
    /// Kept open to hold the lock
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl UpdateLock {
    pub fn path_for(config: &UpdaterConfig) -> PathBuf {
        config.status_dir().join(LOCK_FILE)
    }

    /// Take the lock for `config`'s tree, failing fast if another process has it.
    pub fn acquire(config: &UpdaterConfig) -> Result<Self> {
        let path = Self::path_for(config);
        Self::try_acquire(&path)?.ok_or_else(|| UpdaterError::Locked(path.display().to_string()))
    }

    /// `Ok(None)` if the lock is held elsewhere.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "acquired updater lock");
                Ok(Some(Self {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                tracing::debug!(path = %path.display(), "updater lock already held");
                Ok(None)
            }
            Err(e) => Err(UpdaterError::Io(e)),
        }
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "released updater lock");
    }
}
