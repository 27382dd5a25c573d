use crate::agents::status_store::today;
use crate::agents::update::UpdateInteraction;
use crate::agents::{
    AppManager, AppScope, BackupManager, CancelToken, ChangeClassifier, CommandBuildRunner,
    ConnectivityProbe, FileChange, IntervalDecision, MirrorManager, RollbackData, SafetyFilter,
    ScriptAppManager, StatusStore, UpdateLock, UpdateResult, Updater,
};
use crate::config::{UpdateMode, UpdateSpeed, UpdaterConfig};
use crate::error::{Result, UpdaterError};
use crate::repository::{GitMirrorSource, MirrorSource};
use crate::utils::fs::{dir_exists, file_exists};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

const COUNTDOWN_SECS: u64 = 6;

/// Run the updater in `mode` against `config.root`.
pub fn execute_mode(config: &UpdaterConfig, mode: UpdateMode) -> Result<()> {
    println!("{}", format!("Updater mode: {mode}").cyan().bold());
    tracing::debug!(%mode, unattended = mode.is_unattended(), root = %config.root.display(), "starting");

    match mode {
        UpdateMode::GetStatus => execute_get_status(config),
        UpdateMode::SetStatus => execute_set_status(config),
        UpdateMode::Autostarted => match execute_autostarted(config) {
            Ok(()) => Ok(()),
            Err(e) => {
                // boot-time runs must never surface an error to the session
                tracing::warn!(error = %e, "automatic update check failed");
                Ok(())
            }
        },
        UpdateMode::Gui | UpdateMode::GuiYes => execute_gui(config, mode),
        UpdateMode::CliYes => execute_cli_yes(config),
        UpdateMode::Cli => match execute_cli(config) {
            Err(UpdaterError::UserCancelled) => {
                println!("\n{}", "Update cancelled by user.".yellow());
                Ok(())
            }
            other => other,
        },
    }
}

/// Report whether the last recorded check found updates.
pub fn execute_get_status(config: &UpdaterConfig) -> Result<()> {
    if StatusStore::new(config).has_updates() {
        println!("{}", "Updates available".green());
        Ok(())
    } else {
        Err(UpdaterError::NoUpdatesAvailable)
    }
}

fn execute_set_status(config: &UpdaterConfig) -> Result<()> {
    let session = Session::open(config)?;

    println!("\n{}", "1. Checking repository...".yellow());
    session.check_repo()?;

    session.run_runonce_hook();

    println!("\n{}", "2. Comparing with upstream...".yellow());
    let (files, apps) = session.changes()?;
    session.store.save(&files, &apps)?;
    println!(
        "{}",
        format!("✓ {} files and {} apps updatable", files.len(), apps.len()).green()
    );

    drop(session);
    execute_get_status(config)
}

fn execute_autostarted(config: &UpdaterConfig) -> Result<()> {
    let store = StatusStore::new(config);
    if let IntervalDecision::Skip(reason) = store.check_interval(today())? {
        println!("Won't check for updates today: {reason}");
        return Ok(());
    }

    if !has_installed_apps(config) {
        println!("No apps have been installed yet, so exiting now.");
        return Ok(());
    }

    let session = Session::open(config)?;

    let spinner = spinner("Checking internet connection...");
    let probe = ConnectivityProbe::new(config)?.wait(&CancelToken::new());
    spinner.finish_and_clear();
    probe?;

    session.check_repo()?;
    let (files, apps) = session.changes()?;

    let (safe_files, safe_apps) = SafetyFilter::new(config, &session.apps).safe_subset(&files, &apps);
    let (files, apps) = if safe_files.is_empty() && safe_apps.is_empty() {
        (files, apps)
    } else {
        println!(
            "Performing background updates: {} safe files, {} safe apps",
            safe_files.len(),
            safe_apps.len()
        );
        let result = session.updater().perform_update(&safe_files, &safe_apps);
        if result.success {
            println!("{}", format!("✓ {}", result.message).green());
        } else {
            tracing::warn!(message = %result.message, "background update failed");
        }
        session.fresh_changes()?
    };

    session.store.save(&files, &apps)?;

    if files.is_empty() && apps.is_empty() {
        println!("Nothing is updatable.");
        return Ok(());
    }

    let installed: HashSet<String> = session.apps.list_apps(AppScope::Installed)?.into_iter().collect();
    if files.is_empty() && !apps.iter().any(|app| installed.contains(app)) {
        println!("No installed apps are updatable.");
        return Ok(());
    }

    println!(
        "{}",
        format!("Updates available: {} files, {} apps", files.len(), apps.len())
            .cyan()
            .bold()
    );
    Ok(())
}

/// GUI modes share the apply path; the chooser itself is not rendered here.
fn execute_gui(config: &UpdaterConfig, mode: UpdateMode) -> Result<()> {
    let session = Session::open(config)?;
    session.check_repo()?;
    let (files, apps) = session.changes()?;

    if files.is_empty() && apps.is_empty() {
        println!("{}", "Nothing is updatable.".green());
        return Ok(());
    }

    if mode == UpdateMode::Gui {
        println!("{} files and {} apps available for update", files.len(), apps.len());
    }
    let reinstall = session.reinstall_set(&apps);
    UpdateInteraction::stdio().print_summary(&files, &apps, &reinstall)?;

    let result = session.apply(&files, &apps);
    session.report(&result)
}

fn execute_cli_yes(config: &UpdaterConfig) -> Result<()> {
    let session = Session::open(config)?;
    session.check_repo()?;
    let (files, apps) = session.changes()?;

    if files.is_empty() && apps.is_empty() {
        println!("\n{}", "✓ Nothing to update.".green());
        return Ok(());
    }

    let reinstall = session.reinstall_set(&apps);
    UpdateInteraction::stdio().print_summary(&files, &apps, &reinstall)?;

    let result = session.apply(&files, &apps);
    session.report(&result)
}

fn execute_cli(config: &UpdaterConfig) -> Result<()> {
    let session = Session::open(config)?;
    session.check_repo()?;
    let (files, apps) = session.changes()?;

    if files.is_empty() && apps.is_empty() {
        println!("\n{}", "✓ Everything is up to date.".green());
        return Ok(());
    }

    let reinstall = session.reinstall_set(&apps);
    let mut interaction = UpdateInteraction::stdio();
    let selection = interaction.select(&files, &apps, &reinstall)?;
    if selection.is_empty() {
        println!("\n{}", "No updates selected.".yellow());
        return Ok(());
    }

    interaction.countdown(COUNTDOWN_SECS, Duration::from_secs(1))?;

    loop {
        let result = session.apply(&selection.files, &selection.apps);
        if result.success {
            return session.report(&result);
        }

        print_failure(&result);

        if let Some(rollback) = &result.rollback {
            if interaction.offer_rollback()? {
                println!("\n{}", "Rolling back changes...".yellow());
                match BackupManager::new(config, &session.build).restore(rollback) {
                    Ok(()) => println!("{}", "✓ Rollback completed successfully".green()),
                    Err(e) => println!("{}", format!("✗ Rollback failed: {e}").red()),
                }
            }
        }

        if !interaction.offer_retry()? {
            return Err(UpdaterError::UpdateFailed(result.message));
        }
        println!("\n{}", "Retrying update...".yellow());
    }
}

/// Restore a snapshot taken by an earlier apply.
pub fn execute_rollback(config: &UpdaterConfig, backup: Option<PathBuf>) -> Result<()> {
    let session = Session::open(config)?;
    let manager = BackupManager::new(config, &session.build);

    let backup_dir = match backup {
        Some(dir) => dir,
        None => manager
            .latest_snapshot()?
            .ok_or_else(|| UpdaterError::Restore("no backup snapshot found".into()))?,
    };

    println!(
        "{}",
        format!("Restoring backup {}...", backup_dir.display()).cyan().bold()
    );
    let data = RollbackData::load(&backup_dir)?;
    let spinner = spinner("Restoring files and apps...");
    let restored = manager.restore(&data);
    spinner.finish_and_clear();
    restored?;

    println!("{}", "✓ Rollback completed successfully".green().bold());
    session.refresh_status();
    Ok(())
}

/// True once any app has a recorded status.
fn has_installed_apps(config: &UpdaterConfig) -> bool {
    fs::read_dir(config.data_dir().join("status"))
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn print_failure(result: &UpdateResult) {
    println!("\n{}", format!("✗ Update failed: {}", result.message).red());
    for path in &result.failed_files {
        println!("   • file {}", path.red());
    }
    for app in &result.failed_apps {
        println!("   • app {}", app.red());
    }
    println!("   {}", format!("stopped at: {}", result.stage).dimmed());
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("  {spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Everything one locked run against a distribution root needs.
struct Session<'a> {
    config: &'a UpdaterConfig,
    apps: ScriptAppManager,
    build: CommandBuildRunner,
    source: Arc<dyn MirrorSource>,
    store: StatusStore,
    /// Shared by every `Updater` of the session
    busy: AtomicBool,
    _lock: UpdateLock,
}

impl<'a> Session<'a> {
    fn open(config: &'a UpdaterConfig) -> Result<Self> {
        config.ensure_layout()?;
        let lock = UpdateLock::acquire(config)?;
        Ok(Self {
            config,
            apps: ScriptAppManager::new(config),
            build: CommandBuildRunner::new(config),
            source: Arc::new(GitMirrorSource::new()),
            store: StatusStore::new(config),
            busy: AtomicBool::new(false),
            _lock: lock,
        })
    }

    fn mirror(&self) -> MirrorManager<'a> {
        MirrorManager::new(self.config, Arc::clone(&self.source))
    }

    fn updater(&self) -> Updater<'_> {
        Updater::new(
            self.config,
            &self.apps,
            &self.build,
            self.mirror(),
            &self.busy,
        )
    }

    fn check_repo(&self) -> Result<()> {
        if self.config.speed == UpdateSpeed::Fast {
            println!("{}", "Fast mode: reusing the existing mirror".dimmed());
            return Ok(());
        }

        let spinner = spinner(&format!("Downloading {}...", self.config.git_url));
        let checked = self
            .mirror()
            .check(&CancelToken::with_timeout(self.config.fetch_timeout));
        spinner.finish_and_clear();
        checked?;

        println!("{}", "✓ Repository is up to date".green());
        Ok(())
    }

    fn changes(&self) -> Result<(Vec<FileChange>, Vec<String>)> {
        Self::classify(self.config, &self.apps)
    }

    /// Recompute against the mirror, ignoring cached lists.
    fn fresh_changes(&self) -> Result<(Vec<FileChange>, Vec<String>)> {
        let mut fresh = self.config.clone();
        fresh.speed = UpdateSpeed::Normal;
        Self::classify(&fresh, &self.apps)
    }

    fn classify(
        config: &UpdaterConfig,
        apps: &dyn AppManager,
    ) -> Result<(Vec<FileChange>, Vec<String>)> {
        let classifier = ChangeClassifier::new(config, apps);
        let files = classifier.changed_files()?;
        let changed_apps = classifier.changed_apps()?;
        if dir_exists(&config.mirror_dir()) {
            classifier.warn_removed_apps()?;
        }
        Ok((files, changed_apps))
    }

    fn reinstall_set(&self, apps: &[String]) -> HashSet<String> {
        apps.iter()
            .filter(|app| match self.apps.will_reinstall(app) {
                Ok(reinstall) => reinstall,
                Err(e) => {
                    tracing::warn!(app = %app, error = %e, "cannot tell whether app will be reinstalled");
                    false
                }
            })
            .cloned()
            .collect()
    }

    fn apply(&self, files: &[FileChange], apps: &[String]) -> UpdateResult {
        println!("\n{}", "Starting update process...".cyan().bold());
        let spinner = spinner("Applying updates...");
        let result = self.updater().perform_update(files, apps);
        spinner.finish_and_clear();
        result
    }

    /// Print the outcome; on success refresh the persisted lists.
    fn report(&self, result: &UpdateResult) -> Result<()> {
        if !result.success {
            print_failure(result);
            return Err(UpdaterError::UpdateFailed(result.message.clone()));
        }
        println!("\n{}", format!("✓ {}", result.message).green().bold());
        self.refresh_status();
        Ok(())
    }

    fn refresh_status(&self) {
        let refreshed = self
            .fresh_changes()
            .and_then(|(files, apps)| self.store.save(&files, &apps));
        if let Err(e) = refreshed {
            tracing::warn!(error = %e, "failed to update status files");
        }
    }

    /// Run the distribution's one-off fixups. Failures are only reported.
    fn run_runonce_hook(&self) {
        let hook = self.config.runonce_hook();
        if !file_exists(&hook) {
            return;
        }

        tracing::info!(hook = %hook.display(), "running runonce entries");
        match Command::new("bash")
            .arg(&hook)
            .current_dir(&self.config.root)
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(code = ?status.code(), "runonce entries failed"),
            Err(e) => tracing::warn!(error = %e, "failed to execute runonce entries"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: PathBuf, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn get_status_follows_persisted_lists() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);

        assert!(matches!(
            execute_get_status(&config),
            Err(UpdaterError::NoUpdatesAvailable)
        ));

        write(config.status_dir().join("updatable-files"), "\n");
        assert!(execute_get_status(&config).is_err());

        write(config.status_dir().join("updatable-apps"), "Foo\n");
        assert!(execute_get_status(&config).is_ok());
    }

    #[test]
    fn set_status_in_fast_mode_reuses_cache() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Fast);
        write(config.status_dir().join("updatable-files"), "README.md\n");
        write(config.status_dir().join("updatable-apps"), "");

        execute_set_status(&config).unwrap();
        assert_eq!(
            fs::read_to_string(config.status_dir().join("updatable-files")).unwrap(),
            "README.md\n"
        );
        assert!(!config.update_dir().exists());
    }

    #[test]
    fn autostarted_respects_interval_and_install_gate() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        write(config.data_dir().join("settings/Check for updates"), "Never\n");
        execute_autostarted(&config).unwrap();
        assert!(!config.data_dir().join("last-update-check").exists());

        write(config.data_dir().join("settings/Check for updates"), "Always\n");
        execute_autostarted(&config).unwrap();
        assert!(config.data_dir().join("last-update-check").exists());
        assert!(!config.update_dir().exists());
    }

    #[test]
    fn session_updaters_share_one_busy_flag() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Fast);
        let session = Session::open(&config).unwrap();

        session.busy.store(true, std::sync::atomic::Ordering::SeqCst);
        let result = session.apply(&[], &[]);
        assert!(!result.success);
        assert!(result.message.contains("already in progress"));

        session.busy.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(session.apply(&[], &[]).success);
    }

    #[test]
    fn rollback_without_snapshots_fails() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        let err = execute_rollback(&config, None).unwrap_err();
        assert!(matches!(err, UpdaterError::Restore(_)));
    }

    #[test]
    fn rollback_command_restores_latest_snapshot() {
        let dir = tempdir().unwrap();
        let mut config = UpdaterConfig::new(dir.path(), UpdateSpeed::Fast);
        config.rebuild_command = vec!["true".into()];
        write(config.root.join("README.md"), "before\n");

        let build = CommandBuildRunner::new(&config);
        let data = BackupManager::new(&config, &build)
            .backup(&[FileChange::new("README.md")], &[])
            .unwrap();
        write(config.root.join("README.md"), "after\n");

        execute_rollback(&config, None).unwrap();
        assert_eq!(
            fs::read_to_string(config.root.join("README.md")).unwrap(),
            "before\n"
        );
        assert!(data.backup_path.exists());
    }
}
