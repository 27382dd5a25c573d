use crate::agents::change_classifier::FileChange;
use crate::config::UpdaterConfig;
use crate::error::Result;
use crate::utils::fs::file_exists;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const UPDATABLE_FILES: &str = "updatable-files";
const UPDATABLE_APPS: &str = "updatable-apps";
const LAST_UPDATE_CHECK: &str = "last-update-check";
const INTERVAL_SETTING: &str = "settings/Check for updates";

/// User preference for how often the boot-time check may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInterval {
    Never,
    Daily,
    Weekly,
    Always,
}

impl CheckInterval {
    /// Unknown values allow the check.
    fn parse(value: &str) -> Self {
        match value.trim() {
            "Never" => CheckInterval::Never,
            "Daily" => CheckInterval::Daily,
            "Weekly" => CheckInterval::Weekly,
            _ => CheckInterval::Always,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalDecision {
    Check,
    Skip(&'static str),
}

/// Plain-text state persisted between runs, one entry per line.
pub struct StatusStore {
    status_dir: PathBuf,
    data_dir: PathBuf,
}

impl StatusStore {
    pub fn new(config: &UpdaterConfig) -> Self {
        Self {
            status_dir: config.status_dir(),
            data_dir: config.data_dir(),
        }
    }

    /// Persisted changed-file list, or `None` if no check has been recorded.
    pub fn load_files(&self) -> Result<Option<Vec<String>>> {
        read_lines(&self.status_dir.join(UPDATABLE_FILES))
    }

    /// Persisted changed-app list, or `None` if no check has been recorded.
    pub fn load_apps(&self) -> Result<Option<Vec<String>>> {
        read_lines(&self.status_dir.join(UPDATABLE_APPS))
    }

    pub fn save(&self, files: &[FileChange], apps: &[String]) -> Result<()> {
        fs::create_dir_all(&self.status_dir)?;
        write_lines(
            &self.status_dir.join(UPDATABLE_FILES),
            files.iter().map(|f| f.path.as_str()),
        )?;
        write_lines(
            &self.status_dir.join(UPDATABLE_APPS),
            apps.iter().map(String::as_str),
        )?;
        tracing::debug!(files = files.len(), apps = apps.len(), "update status saved");
        Ok(())
    }

    /// True if the last recorded check found anything to update.
    pub fn has_updates(&self) -> bool {
        [UPDATABLE_FILES, UPDATABLE_APPS].iter().any(|name| {
            fs::read_to_string(self.status_dir.join(name))
                .is_ok_and(|content| !content.trim().is_empty())
        })
    }

    pub fn interval(&self) -> CheckInterval {
        fs::read_to_string(self.data_dir.join(INTERVAL_SETTING))
            .map(|value| CheckInterval::parse(&value))
            .unwrap_or(CheckInterval::Weekly)
    }

    pub fn last_check_day(&self) -> i64 {
        fs::read_to_string(self.data_dir.join(LAST_UPDATE_CHECK))
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Decide whether a boot-time check may run on `today` (days since epoch).
    /// The day is recorded only when the check goes ahead.
    pub fn check_interval(&self, today: i64) -> Result<IntervalDecision> {
        let last = self.last_check_day();
        let decision = match self.interval() {
            CheckInterval::Never => IntervalDecision::Skip("update checking is disabled"),
            CheckInterval::Daily if today == last => IntervalDecision::Skip("already checked today"),
            CheckInterval::Weekly if today <= last + 7 => {
                IntervalDecision::Skip("checked within the last week")
            }
            _ => IntervalDecision::Check,
        };

        if decision == IntervalDecision::Check {
            fs::create_dir_all(&self.data_dir)?;
            fs::write(self.data_dir.join(LAST_UPDATE_CHECK), today.to_string())?;
        }
        Ok(decision)
    }
}

/// Days since the Unix epoch, in UTC.
pub fn today() -> i64 {
    jiff::Timestamp::now().as_second().div_euclid(86_400)
}

fn read_lines(path: &Path) -> Result<Option<Vec<String>>> {
    if !file_exists(path) {
        return Ok(None);
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
    ))
}

fn write_lines<'a>(path: &Path, lines: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut content = String::new();
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(())
}
