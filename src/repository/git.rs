use crate::agents::mirror::{CANCEL_POLL, CancelToken};
use crate::error::{Result, UpdaterError};
use crate::repository::MirrorSource;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;

/// Mirrors the upstream catalog with the `git` command line client.
#[derive(Debug)]
pub struct GitMirrorSource {
    program: PathBuf,
}

impl Default for GitMirrorSource {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }
}

impl GitMirrorSource {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run git in `dir`, killing it as soon as `cancel` fires.
    fn run_git(&self, dir: &Path, args: &[&str], cancel: &CancelToken) -> Result<()> {
        let command = format!("git {}", args.first().copied().unwrap_or_default());
        let mut child = Command::new(&self.program)
            .current_dir(dir)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                UpdaterError::Connectivity(format!(
                    "Failed to execute git command '{}': {e}",
                    args.join(" ")
                ))
            })?;

        // helpers spawned by git may keep the pipe open after a kill, so the
        // reader is only joined once git itself has exited
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        loop {
            if let Some(status) = child.try_wait()? {
                let stderr = stderr
                    .and_then(|reader| reader.join().ok())
                    .unwrap_or_default();
                if status.success() {
                    return Ok(());
                }
                return Err(UpdaterError::Connectivity(format!(
                    "{command} failed: {}",
                    stderr.trim()
                )));
            }
            if cancel.is_cancelled() {
                Self::kill(&mut child, &command);
                return Err(UpdaterError::Connectivity(format!("{command} cancelled")));
            }
            thread::sleep(CANCEL_POLL);
        }
    }

    fn kill(child: &mut Child, command: &str) {
        tracing::warn!(pid = child.id(), "{command} cancelled, stopping it");
        if let Err(e) = child.kill() {
            tracing::debug!(error = %e, "git already exited");
        }
        let _ = child.wait();
    }

    fn validate_url(url: &str) -> Result<()> {
        // a leading dash would be parsed by git as an option
        if url.starts_with('-') || url.chars().any(|c| c.is_control()) {
            return Err(UpdaterError::Config(format!(
                "Refusing suspicious repository URL '{url}'"
            )));
        }
        Ok(())
    }
}

impl MirrorSource for GitMirrorSource {
    fn pull(&self, mirror_dir: &Path, cancel: &CancelToken) -> Result<()> {
        self.run_git(mirror_dir, &["pull", "-q"], cancel)
    }

    fn fetch(&self, url: &str, mirror_dir: &Path, cancel: &CancelToken) -> Result<()> {
        Self::validate_url(url)?;

        let parent = mirror_dir.parent().ok_or_else(|| {
            UpdaterError::Connectivity(format!(
                "Mirror directory '{}' has no parent",
                mirror_dir.display()
            ))
        })?;
        let target = mirror_dir.to_string_lossy();

        self.run_git(parent, &["clone", "-q", "--depth=1", url, &target], cancel)
    }
}
