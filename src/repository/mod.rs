use crate::agents::mirror::CancelToken;
use crate::error::Result;
use std::path::Path;

pub mod git;
pub use git::GitMirrorSource;

/// Transport used to keep the local mirror in sync with the upstream catalog.
pub trait MirrorSource: Send + Sync {
    /// Bring an existing mirror up to date in place. Gives up once `cancel` fires.
    fn pull(&self, mirror_dir: &Path, cancel: &CancelToken) -> Result<()>;

    /// Create a fresh mirror at `mirror_dir` (which does not exist yet).
    fn fetch(&self, url: &str, mirror_dir: &Path, cancel: &CancelToken) -> Result<()>;
}
