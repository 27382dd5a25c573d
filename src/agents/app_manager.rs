use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use crate::utils::fs::{file_exists, files_match};
use crate::utils::path_validator::PathValidator;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Which set of application names to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppScope {
    /// Local and upstream apps combined
    #[allow(dead_code)]
    All,
    /// Apps present in the local tree
    Local,
    /// Local apps whose status is installed
    Installed,
    /// Apps known to the upstream catalog (the mirror)
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Installed,
    Uninstalled,
    Corrupted,
}

impl AppStatus {
    fn parse(value: &str) -> Self {
        match value.trim() {
            "installed" => AppStatus::Installed,
            "corrupted" => AppStatus::Corrupted,
            _ => AppStatus::Uninstalled,
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AppStatus::Installed => "installed",
            AppStatus::Uninstalled => "uninstalled",
            AppStatus::Corrupted => "corrupted",
        })
    }
}

/// The package-management layer, consumed as an opaque capability.
pub trait AppManager: Send + Sync {
    fn list_apps(&self, scope: AppScope) -> Result<Vec<String>>;
    fn status(&self, app: &str) -> Result<AppStatus>;
    /// Whether updating `app` requires uninstalling and installing it again.
    fn will_reinstall(&self, app: &str) -> Result<bool>;
    fn install(&self, app: &str) -> Result<()>;
    fn uninstall(&self, app: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InstallKind {
    Packages,
    Script(&'static str),
}

/// App manager backed by the catalog layout: `apps/<name>/install*` scripts,
/// `apps/<name>/packages` lists and `data/status/<name>` status files.
pub struct ScriptAppManager {
    apps_dir: PathBuf,
    mirror_apps_dir: PathBuf,
    status_dir: PathBuf,
}

impl ScriptAppManager {
    pub fn new(config: &UpdaterConfig) -> Self {
        Self {
            apps_dir: config.apps_dir(),
            mirror_apps_dir: config.mirror_dir().join("apps"),
            status_dir: config.data_dir().join("status"),
        }
    }

    fn list_dirs(dir: &Path) -> Result<Vec<String>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn install_kind(app_dir: &Path) -> Option<InstallKind> {
        if file_exists(&app_dir.join("packages")) {
            return Some(InstallKind::Packages);
        }

        let preferred: &[&'static str] = if cfg!(target_pointer_width = "64") {
            &["install-64", "install"]
        } else {
            &["install-32", "install"]
        };

        preferred
            .iter()
            .copied()
            .find(|name| file_exists(&app_dir.join(name)))
            .map(InstallKind::Script)
    }

    fn write_status(&self, app: &str, status: AppStatus) -> Result<()> {
        fs::create_dir_all(&self.status_dir)?;
        fs::write(self.status_dir.join(app), format!("{status}\n"))?;
        Ok(())
    }

    fn run_script(&self, app: &str, script: &str) -> Result<()> {
        let app_dir = self.apps_dir.join(app);
        tracing::info!(app, script, "running app script");

        let output = Command::new("bash")
            .arg(app_dir.join(script))
            .current_dir(&app_dir)
            .output()
            .map_err(|e| UpdaterError::AppManager(format!("Failed to run {script} for {app}: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        Err(UpdaterError::AppManager(format!(
            "{script} for {app} exited with code {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

impl AppManager for ScriptAppManager {
    fn list_apps(&self, scope: AppScope) -> Result<Vec<String>> {
        match scope {
            AppScope::Local => Self::list_dirs(&self.apps_dir),
            AppScope::Online => Self::list_dirs(&self.mirror_apps_dir),
            AppScope::All => {
                let mut all: BTreeSet<String> = Self::list_dirs(&self.apps_dir)?.into_iter().collect();
                all.extend(Self::list_dirs(&self.mirror_apps_dir)?);
                Ok(all.into_iter().collect())
            }
            AppScope::Installed => {
                let mut installed = Vec::new();
                for app in Self::list_dirs(&self.apps_dir)? {
                    if self.status(&app)? == AppStatus::Installed {
                        installed.push(app);
                    }
                }
                Ok(installed)
            }
        }
    }

    fn status(&self, app: &str) -> Result<AppStatus> {
        PathValidator::validate_app_name(app)?;
        let path = self.status_dir.join(app);
        if !file_exists(&path) {
            return Ok(AppStatus::Uninstalled);
        }
        Ok(AppStatus::parse(&fs::read_to_string(path)?))
    }

    fn will_reinstall(&self, app: &str) -> Result<bool> {
        if self.status(app)? != AppStatus::Installed {
            return Ok(false);
        }

        let local_dir = self.apps_dir.join(app);
        let mirror_dir = self.mirror_apps_dir.join(app);

        let (Some(local), Some(upstream)) =
            (Self::install_kind(&local_dir), Self::install_kind(&mirror_dir))
        else {
            // gone upstream or never installable locally: nothing to reinstall
            return Ok(false);
        };

        let changed = match (&local, &upstream) {
            (InstallKind::Packages, InstallKind::Packages) => {
                let read = |dir: &Path| -> Result<String> {
                    Ok(fs::read_to_string(dir.join("packages"))?.trim().to_string())
                };
                read(&local_dir)? != read(&mirror_dir)?
            }
            (InstallKind::Script(a), InstallKind::Script(b)) => {
                !files_match(&local_dir.join(a), &mirror_dir.join(b))?
            }
            _ => true,
        };

        tracing::debug!(app, changed, "reinstall check");
        Ok(changed)
    }

    fn install(&self, app: &str) -> Result<()> {
        PathValidator::validate_app_name(app)?;
        let script = match Self::install_kind(&self.apps_dir.join(app)) {
            Some(InstallKind::Script(script)) => script,
            Some(InstallKind::Packages) => {
                return Err(UpdaterError::AppManager(format!(
                    "{app} is a package app and must be installed by the package manager"
                )));
            }
            None => {
                return Err(UpdaterError::AppManager(format!(
                    "{app} has no install script"
                )));
            }
        };

        match self.run_script(app, script) {
            Ok(()) => self.write_status(app, AppStatus::Installed),
            Err(e) => {
                self.write_status(app, AppStatus::Corrupted)?;
                Err(e)
            }
        }
    }

    fn uninstall(&self, app: &str) -> Result<()> {
        PathValidator::validate_app_name(app)?;
        if file_exists(&self.apps_dir.join(app).join("uninstall")) {
            if let Err(e) = self.run_script(app, "uninstall") {
                self.write_status(app, AppStatus::Corrupted)?;
                return Err(e);
            }
        }
        self.write_status(app, AppStatus::Uninstalled)
    }
}
