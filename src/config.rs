use crate::error::{Result, UpdaterError};
use crate::utils::path_validator::PathValidator;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_GIT_URL: &str = "https://github.com/pi-apps-go/pi-apps";
const DEFAULT_FETCH_RETRY_SECS: u64 = 60;
const CONFIG_FILE: &str = "etc/updater.toml";
const LEGACY_GIT_URL_FILE: &str = "etc/git_url";
const MULTI_CALL_ENV: &str = "MULTI_CALL_BINARY";

/// How the updater interacts with the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Autostarted,
    GetStatus,
    SetStatus,
    Gui,
    GuiYes,
    Cli,
    CliYes,
}

impl UpdateMode {
    /// Modes that must never prompt the user.
    pub fn is_unattended(self) -> bool {
        matches!(
            self,
            UpdateMode::Autostarted | UpdateMode::GuiYes | UpdateMode::CliYes
        )
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpdateMode::Autostarted => "autostarted",
            UpdateMode::GetStatus => "get-status",
            UpdateMode::SetStatus => "set-status",
            UpdateMode::Gui => "gui",
            UpdateMode::GuiYes => "gui-yes",
            UpdateMode::Cli => "cli",
            UpdateMode::CliYes => "cli-yes",
        };
        f.write_str(label)
    }
}

/// Whether the mirror is refreshed from upstream or cached results are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateSpeed {
    #[default]
    Normal,
    Fast,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    git_url: Option<String>,
    fetch_retry_secs: Option<u64>,
    multi_call: Option<bool>,
    build: BuildSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BuildSection {
    rebuild: Option<Vec<String>>,
    dependency_refresh: Option<Vec<String>>,
}

/// Everything the updater needs to know about one distribution root.
///
/// Built once at startup and passed by reference to every agent.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub root: PathBuf,
    pub speed: UpdateSpeed,
    pub git_url: String,
    pub mirror_name: String,
    pub fetch_retry: Duration,
    pub fetch_timeout: Option<Duration>,
    pub rebuild_command: Vec<String>,
    pub dependency_refresh_command: Vec<String>,
}

impl UpdaterConfig {
    /// Configuration with built-in defaults, without touching the filesystem.
    pub fn new<P: AsRef<Path>>(root: P, speed: UpdateSpeed) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            speed,
            git_url: DEFAULT_GIT_URL.to_string(),
            mirror_name: "pi-apps".to_string(),
            fetch_retry: Duration::from_secs(DEFAULT_FETCH_RETRY_SECS),
            fetch_timeout: None,
            rebuild_command: default_rebuild_command(false),
            dependency_refresh_command: default_dependency_refresh_command(),
        }
    }

    /// Validate the root and layer `etc/updater.toml` and `etc/git_url` over the defaults.
    pub fn load<P: AsRef<Path>>(
        root: P,
        speed: UpdateSpeed,
        fetch_timeout: Option<Duration>,
    ) -> Result<Self> {
        let root = PathValidator::validate_project_path(root)?;
        let file_config = Self::read_file_config(&root)?;

        let git_url = match file_config.git_url {
            Some(url) => url,
            None => Self::read_legacy_git_url(&root).unwrap_or_else(|| DEFAULT_GIT_URL.to_string()),
        };
        let mirror_name = mirror_name_from_url(&git_url)?;

        let multi_call = file_config.multi_call.unwrap_or_else(detect_multi_call);

        let mut config = Self::new(&root, speed);
        config.git_url = git_url;
        config.mirror_name = mirror_name;
        config.fetch_timeout = fetch_timeout;
        if let Some(secs) = file_config.fetch_retry_secs {
            config.fetch_retry = Duration::from_secs(secs);
        }
        config.rebuild_command = match file_config.build.rebuild {
            Some(command) => non_empty_command(command, "build.rebuild")?,
            None => default_rebuild_command(multi_call),
        };
        if let Some(command) = file_config.build.dependency_refresh {
            config.dependency_refresh_command =
                non_empty_command(command, "build.dependency_refresh")?;
        }

        tracing::debug!(
            root = %config.root.display(),
            git_url = %config.git_url,
            multi_call,
            "configuration loaded"
        );

        Ok(config)
    }

    fn read_file_config(root: &Path) -> Result<FileConfig> {
        let path = root.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(FileConfig::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    fn read_legacy_git_url(root: &Path) -> Option<String> {
        let content = fs::read_to_string(root.join(LEGACY_GIT_URL_FILE)).ok()?;
        let trimmed = content.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Create the directories the updater writes to.
    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.status_dir())?;
        Ok(())
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.root.join("apps")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn status_dir(&self) -> PathBuf {
        self.data_dir().join("update-status")
    }

    pub fn update_dir(&self) -> PathBuf {
        self.root.join("update")
    }

    /// Local clone of the upstream catalog.
    pub fn mirror_dir(&self) -> PathBuf {
        self.update_dir().join(&self.mirror_name)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.root.join("update-backup")
    }

    pub fn runonce_hook(&self) -> PathBuf {
        self.root.join("etc").join("runonce-entries")
    }
}

fn default_rebuild_command(multi_call: bool) -> Vec<String> {
    let target = if multi_call {
        "install-with-multi-call"
    } else {
        "install"
    };
    vec!["make".to_string(), target.to_string()]
}

fn default_dependency_refresh_command() -> Vec<String> {
    vec!["go".to_string(), "mod".to_string(), "tidy".to_string()]
}

fn non_empty_command(command: Vec<String>, key: &str) -> Result<Vec<String>> {
    if command.first().is_none_or(|program| program.trim().is_empty()) {
        return Err(UpdaterError::Config(format!(
            "'{key}' must name a program to run"
        )));
    }
    Ok(command)
}

fn detect_multi_call() -> bool {
    if std::env::var_os(MULTI_CALL_ENV).is_some_and(|v| !v.is_empty()) {
        return true;
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().to_lowercase()))
        .is_some_and(|name| name.contains("multi-call"))
}

/// Host and path of an scp-style remote such as `git@host:org/repo.git`.
pub(crate) fn scp_remote(git_url: &str) -> Option<(&str, &str)> {
    if git_url.contains("://") {
        return None;
    }
    let (user_host, path) = git_url.split_once(':')?;
    let host = user_host.rsplit('@').next().unwrap_or(user_host);
    if host.is_empty() || host.contains('/') || path.is_empty() {
        return None;
    }
    Some((host, path))
}

/// Directory name `git clone` will create for the given URL.
fn mirror_name_from_url(git_url: &str) -> Result<String> {
    let no_name = || UpdaterError::Config(format!("Git URL '{git_url}' has no repository name"));

    if let Some((_, path)) = scp_remote(git_url) {
        return path
            .rsplit(['/', ':'])
            .find(|s| !s.is_empty())
            .map(|s| s.trim_end_matches(".git").to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(no_name);
    }

    let parsed = Url::parse(git_url)
        .map_err(|e| UpdaterError::Config(format!("Invalid git URL '{git_url}': {e}")))?;

    if !matches!(parsed.scheme(), "https" | "http" | "git" | "ssh" | "file") {
        return Err(UpdaterError::Config(format!(
            "Unsupported git URL scheme '{}'",
            parsed.scheme()
        )));
    }

    parsed
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(|s| s.trim_end_matches(".git").to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(no_name)
}
