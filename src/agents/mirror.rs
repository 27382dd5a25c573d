use crate::config::{UpdateSpeed, UpdaterConfig};
use crate::error::{Result, UpdaterError};
use crate::repository::MirrorSource;
use crate::utils::fs::{copy_file, file_exists, remove_path, replace_dir};
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Build manifests that a dependency refresh rewrites in place.
pub const MODULE_MANIFESTS: &[&str] = &["go.mod", "go.sum"];

pub(crate) const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Cancellation signal for the mirror fetch loop: a shared flag plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    #[allow(dead_code)]
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Sleep for `duration`, waking early on cancellation. Returns false if cancelled.
    fn sleep(&self, duration: Duration) -> bool {
        let end = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= end {
                return true;
            }
            thread::sleep(CANCEL_POLL.min(end - now));
        }
    }
}

/// Owns the local mirror of the upstream catalog.
pub struct MirrorManager<'a> {
    config: &'a UpdaterConfig,
    source: Arc<dyn MirrorSource>,
}

impl<'a> MirrorManager<'a> {
    pub fn new(config: &'a UpdaterConfig, source: Arc<dyn MirrorSource>) -> Self {
        Self { config, source }
    }

    /// Refresh the mirror from upstream.
    ///
    /// With `UpdateSpeed::Fast` this does nothing and whatever mirror exists is reused.
    /// Otherwise an existing mirror is pulled; if that fails it is discarded and
    /// fetched again, retrying until success or until `cancel` fires.
    pub fn check(&self, cancel: &CancelToken) -> Result<()> {
        if self.config.speed == UpdateSpeed::Fast {
            tracing::debug!("fast mode: reusing existing mirror");
            return Ok(());
        }

        let mirror_dir = self.config.mirror_dir();
        if mirror_dir.join(".git").is_dir() {
            match self.source.pull(&mirror_dir, cancel) {
                Ok(()) => {
                    tracing::info!(mirror = %mirror_dir.display(), "mirror refreshed");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "incremental refresh failed, fetching a fresh mirror");
                }
            }
        }

        self.full_fetch(cancel)
    }

    fn full_fetch(&self, cancel: &CancelToken) -> Result<()> {
        let update_dir = self.config.update_dir();
        let mirror_dir = self.config.mirror_dir();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(UpdaterError::Connectivity(format!(
                    "gave up fetching {} after {attempt} attempt(s)",
                    self.config.git_url
                )));
            }
            attempt += 1;

            remove_path(&update_dir)?;
            fs::create_dir_all(&update_dir)?;

            match self.source.fetch(&self.config.git_url, &mirror_dir, cancel) {
                Ok(()) => {
                    tracing::info!(attempt, mirror = %mirror_dir.display(), "mirror fetched");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        "failed to download the catalog repository, retrying in {}s",
                        self.config.fetch_retry.as_secs()
                    );
                }
            }

            if !cancel.sleep(self.config.fetch_retry) {
                return Err(UpdaterError::Connectivity(format!(
                    "gave up fetching {} after {attempt} attempt(s)",
                    self.config.git_url
                )));
            }
        }
    }

    /// Copy freshly tidied build manifests from the live tree into the mirror.
    ///
    /// A dependency refresh rewrites these files locally; without this step the
    /// next comparison would report them as changed again.
    pub fn reconcile_module_manifests(&self) -> Result<()> {
        let mirror_dir = self.config.mirror_dir();
        for manifest in MODULE_MANIFESTS {
            let local = self.config.root.join(manifest);
            if file_exists(&local) {
                copy_file(&local, &mirror_dir.join(manifest)).map_err(|e| {
                    UpdaterError::Finalize(format!(
                        "failed to update {manifest} in mirror: {e}"
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Replace the local version-control metadata with the mirror's.
    pub fn adopt_mirror_ref(&self) -> Result<()> {
        let mirror_git = self.config.mirror_dir().join(".git");
        if !mirror_git.is_dir() {
            return Err(UpdaterError::Finalize(format!(
                "mirror has no version-control metadata at {}",
                mirror_git.display()
            )));
        }
        replace_dir(&mirror_git, &self.config.root.join(".git"))
            .map_err(|e| UpdaterError::Finalize(format!("failed to replace .git: {e}")))
    }
}
