use crate::agents::app_manager::{AppManager, AppStatus};
use crate::agents::backup::{BackupManager, CompilationState, RollbackData};
use crate::agents::build_execution::BuildRunner;
use crate::agents::change_classifier::FileChange;
use crate::agents::mirror::MirrorManager;
use crate::agents::update::context::{UpdateResult, UpdateStage};
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use crate::utils::fs::{copy_file, dir_exists, replace_dir};
use crate::utils::path_validator::PathValidator;
use std::sync::atomic::{AtomicBool, Ordering};

/// Applies a change set in stages, restoring the backup on any failure.
///
/// Stages run strictly in order: backup, files, apps, dependency refresh
/// (only when a module manifest changed), rebuild (only when sources or build
/// scripts changed) and finalization. Updaters sharing a busy flag never run
/// two applies at once.
pub struct Updater<'a> {
    config: &'a UpdaterConfig,
    apps: &'a dyn AppManager,
    build: &'a dyn BuildRunner,
    mirror: MirrorManager<'a>,
    busy: &'a AtomicBool,
}

/// Clears the busy flag when an apply ends, however it ends.
struct BusyGuard<'b>(&'b AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<'a> Updater<'a> {
    pub fn new(
        config: &'a UpdaterConfig,
        apps: &'a dyn AppManager,
        build: &'a dyn BuildRunner,
        mirror: MirrorManager<'a>,
        busy: &'a AtomicBool,
    ) -> Self {
        Self {
            config,
            apps,
            build,
            mirror,
            busy,
        }
    }

    pub fn perform_update(&self, files: &[FileChange], apps: &[String]) -> UpdateResult {
        if self.busy.swap(true, Ordering::SeqCst) {
            return UpdateResult::failed("An update is already in progress".to_string());
        }
        let _guard = BusyGuard(self.busy);

        tracing::info!(files = files.len(), apps = apps.len(), "starting update");
        let backup = BackupManager::new(self.config, self.build);

        let mut rollback = match backup.backup(files, apps) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "backup failed, nothing was changed");
                return UpdateResult::failed(format!("Failed to create backup: {e}"));
            }
        };

        let mut result = UpdateResult {
            stage: UpdateStage::BackedUp,
            ..Default::default()
        };

        let needs_module_refresh = files.iter().any(|f| f.is_module_file);
        // manifests alone are handled by the dependency refresh
        let needs_rebuild = files
            .iter()
            .any(|f| f.requires_rebuild && !f.is_module_file);

        if let Err(e) = self.apply_files(files, &mut result.failed_files) {
            return self.fail(&backup, result, rollback, format!("Failed to update files: {e}"));
        }
        result.stage = UpdateStage::FilesApplied;

        if let Err(e) = self.apply_apps(apps, &mut result.failed_apps) {
            return self.fail(&backup, result, rollback, format!("Failed to update apps: {e}"));
        }
        result.stage = UpdateStage::AppsApplied;

        if needs_module_refresh {
            tracing::info!("refreshing module dependencies");
            if let Err(e) = self.build.refresh_dependencies().into_result("Module update") {
                rollback.set_compilation_state(CompilationState::Failed);
                return self.fail(&backup, result, rollback, e.to_string());
            }
            result.module_refreshed = true;
            result.stage = UpdateStage::ModuleRefreshed;

            if let Err(e) = self.mirror.reconcile_module_manifests() {
                tracing::warn!(error = %e, "tidied manifests were not copied into the mirror");
            }
        }

        if needs_rebuild {
            tracing::info!("recompiling");
            if let Err(e) = self.build.rebuild().into_result("Compilation") {
                rollback.set_compilation_state(CompilationState::Failed);
                return self.fail(&backup, result, rollback, e.to_string());
            }
            rollback.set_compilation_state(CompilationState::Success);
            result.recompiled = true;
            result.stage = UpdateStage::Rebuilt;
        }

        if !result.module_refreshed {
            if let Err(e) = self.mirror.adopt_mirror_ref() {
                tracing::warn!(error = %e, "failed to update version-control metadata");
            }
        }

        result.stage = UpdateStage::Finalized;
        result.success = true;
        result.message = UpdateResult::success_message(result.module_refreshed, result.recompiled);
        tracing::info!(
            backup = %rollback.backup_path.display(),
            "{}",
            result.message
        );
        result
    }

    /// Restore the snapshot and hand it to the caller. A failed restore is
    /// reported, never retried.
    fn fail(
        &self,
        backup: &BackupManager<'_>,
        mut result: UpdateResult,
        rollback: RollbackData,
        message: String,
    ) -> UpdateResult {
        tracing::error!(stage = %result.stage, "{message}");
        result.success = false;
        result.message = message;

        match backup.restore(&rollback) {
            Ok(()) => result.stage = UpdateStage::RolledBack,
            Err(e) => {
                tracing::error!(error = %e, "rollback failed");
                result.stage = UpdateStage::RollbackFailed;
                result.message.push_str(&format!(" (rollback failed: {e})"));
            }
        }

        result.rollback = Some(rollback);
        result
    }

    fn apply_files(&self, files: &[FileChange], failed: &mut Vec<String>) -> Result<()> {
        let mirror_dir = self.config.mirror_dir();
        for change in files {
            let outcome = PathValidator::validate_relative(&change.path).and_then(|relative| {
                copy_file(&mirror_dir.join(relative), &self.config.root.join(relative))
                    .map_err(|e| UpdaterError::Apply(format!("{}: {e}", change.path)))
            });
            if let Err(e) = outcome {
                failed.push(change.path.clone());
                return Err(e);
            }
            tracing::debug!(path = %change.path, category = %change.category, "file updated");
        }
        Ok(())
    }

    fn apply_apps(&self, apps: &[String], failed: &mut Vec<String>) -> Result<()> {
        for app in apps {
            if let Err(e) = self.apply_app(app) {
                failed.push(app.clone());
                return Err(e);
            }
        }
        Ok(())
    }

    fn apply_app(&self, app: &str) -> Result<()> {
        PathValidator::validate_app_name(app)?;

        if !self.apps.will_reinstall(app)? {
            tracing::debug!(app, "refreshing app");
            return self.refresh_app(app);
        }

        tracing::info!(app, "reinstalling app");
        if self.apps.status(app)? != AppStatus::Uninstalled {
            self.apps.uninstall(app)?;
        }
        self.refresh_app(app)?;
        self.apps.install(app)
    }

    /// Replace the local app directory with the mirror's, leaving install state alone.
    fn refresh_app(&self, app: &str) -> Result<()> {
        let upstream = self.config.mirror_dir().join("apps").join(app);
        if !dir_exists(&upstream) {
            return Err(UpdaterError::Apply(format!("{app} is missing from the mirror")));
        }
        replace_dir(&upstream, &self.config.apps_dir().join(app))
            .map_err(|e| UpdaterError::Apply(format!("failed to refresh {app}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::build_execution::tests::FakeBuild;
    use crate::agents::change_classifier::tests::{FakeApps, write};
    use crate::agents::mirror::tests::FakeSource;
    use crate::config::UpdateSpeed;
    use crate::utils::fs::tree_digest;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, UpdaterConfig) {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        fs::create_dir_all(config.mirror_dir().join(".git")).unwrap();
        fs::write(config.mirror_dir().join(".git/HEAD"), "upstream\n").unwrap();
        (dir, config)
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path).unwrap()
    }

    fn run(
        config: &UpdaterConfig,
        apps: &FakeApps,
        build: &FakeBuild,
        files: &[&str],
        app_names: &[&str],
    ) -> UpdateResult {
        let busy = AtomicBool::new(false);
        let mirror = MirrorManager::new(config, Arc::new(FakeSource::default()));
        let updater = Updater::new(config, apps, build, mirror, &busy);
        let files: Vec<FileChange> = files.iter().map(|p| FileChange::new(*p)).collect();
        let app_names: Vec<String> = app_names.iter().map(|a| a.to_string()).collect();
        updater.perform_update(&files, &app_names)
    }

    #[test]
    fn app_without_reinstall_is_only_refreshed() {
        let (_dir, config) = setup();
        write(config.apps_dir().join("Foo/install"), "echo v1\n");
        write(config.mirror_dir().join("apps/Foo/install"), "echo v2\n");

        let apps = FakeApps::default();
        let build = FakeBuild::new(true, true);
        let result = run(&config, &apps, &build, &[], &["Foo"]);

        assert!(result.success, "{}", result.message);
        assert_eq!(result.stage, UpdateStage::Finalized);
        assert_eq!(result.message, "Update completed successfully");
        assert!(result.rollback.is_none());
        assert_eq!(read(&config.apps_dir().join("Foo/install")), "echo v2\n");
        assert!(apps.calls.lock().unwrap().is_empty());
        assert_eq!(build.rebuild_count() + build.refresh_count(), 0);
        assert_eq!(read(&config.root.join(".git/HEAD")), "upstream\n");
    }

    #[test]
    fn manifest_change_refreshes_dependencies_without_rebuild() {
        let (_dir, config) = setup();
        write(config.root.join("go.mod"), "module old\n");
        write(config.mirror_dir().join("go.mod"), "module new\n");

        let apps = FakeApps::default();
        let build = FakeBuild::new(true, true);
        let result = run(&config, &apps, &build, &["go.mod"], &[]);

        assert!(result.success, "{}", result.message);
        assert!(result.module_refreshed);
        assert!(!result.recompiled);
        assert!(result.message.contains("(Module dependencies updated)"));
        assert_eq!(build.refresh_count(), 1);
        assert_eq!(build.rebuild_count(), 0);
        assert_eq!(
            read(&config.mirror_dir().join("go.mod")),
            read(&config.root.join("go.mod"))
        );
        // module refresh already synced the mirror, so the ref is left alone
        assert!(!config.root.join(".git").exists());
    }

    #[test]
    fn failed_dependency_refresh_rolls_back_before_rebuilding() {
        let (_dir, config) = setup();
        write(config.root.join("go.mod"), "module old\n");
        write(config.mirror_dir().join("go.mod"), "module new\n");
        write(config.root.join("pkg/foo.go"), "package foo\n");
        write(config.mirror_dir().join("pkg/foo.go"), "package foo // v2\n");

        let apps = FakeApps::default();
        let build = FakeBuild::new(true, false);
        let result = run(&config, &apps, &build, &["go.mod", "pkg/foo.go"], &[]);

        assert!(!result.success);
        assert!(result.message.starts_with("Module update failed: "));
        assert!(result.message.contains("go: module lookup failed"));
        assert_eq!(result.stage, UpdateStage::RolledBack);
        assert!(!result.module_refreshed && !result.recompiled);
        assert_eq!(build.refresh_count(), 1);
        assert_eq!(build.rebuild_count(), 0);

        assert_eq!(read(&config.root.join("go.mod")), "module old\n");
        assert_eq!(read(&config.root.join("pkg/foo.go")), "package foo\n");
        assert_eq!(read(&config.mirror_dir().join("go.mod")), "module new\n");
        assert!(!config.root.join(".git").exists());

        let rollback = result.rollback.expect("rollback data on failure");
        assert_eq!(rollback.compilation_state, CompilationState::Failed);
        let persisted = RollbackData::load(&rollback.backup_path).unwrap();
        assert_eq!(persisted.compilation_state, CompilationState::Failed);
    }

    #[test]
    fn failed_rebuild_restores_exact_tree() {
        let (_dir, config) = setup();
        write(config.root.join("pkg/foo.go"), "package foo\n");
        write(config.root.join("pkg/keep.go"), "package foo // keep\n");
        write(config.mirror_dir().join("pkg/foo.go"), "package foo // broken\n");
        write(config.mirror_dir().join("pkg/sub/new.go"), "package sub\n");
        let before = tree_digest(&config.root.join("pkg")).unwrap();

        let apps = FakeApps::default();
        let build = FakeBuild::new(false, true);
        let result = run(&config, &apps, &build, &["pkg/foo.go", "pkg/sub/new.go"], &[]);

        assert!(!result.success);
        assert!(result.message.starts_with("Compilation failed: "));
        assert_eq!(result.stage, UpdateStage::RolledBack);
        let rollback = result.rollback.expect("rollback data on failure");
        assert_eq!(rollback.compilation_state, CompilationState::Failed);
        assert_eq!(tree_digest(&config.root.join("pkg")).unwrap(), before);
        assert_eq!(build.rebuild_count(), 1);

        let persisted = RollbackData::load(&rollback.backup_path).unwrap();
        assert_eq!(persisted.compilation_state, CompilationState::Failed);
    }

    #[test]
    fn source_and_manifest_change_runs_both_steps() {
        let (_dir, config) = setup();
        write(config.mirror_dir().join("go.sum"), "sum\n");
        write(config.mirror_dir().join("cmd/tool/main.go"), "package main\n");

        let apps = FakeApps::default();
        let build = FakeBuild::new(true, true);
        let result = run(&config, &apps, &build, &["go.sum", "cmd/tool/main.go"], &[]);

        assert!(result.success, "{}", result.message);
        assert!(result.recompiled && result.module_refreshed);
        assert_eq!(
            result.message,
            "Update completed successfully (Module dependencies updated and recompilation completed)"
        );
        assert!(result.rollback.is_none());
    }

    #[test]
    fn reinstall_uninstalls_refreshes_and_installs() {
        let (_dir, config) = setup();
        write(config.apps_dir().join("Bar/install"), "echo v1\n");
        write(config.mirror_dir().join("apps/Bar/install"), "echo v2\n");

        let apps = FakeApps {
            reinstall: vec!["Bar".into()],
            statuses: HashMap::from([("Bar".to_string(), AppStatus::Installed)]),
            ..Default::default()
        };
        let build = FakeBuild::new(true, true);
        let result = run(&config, &apps, &build, &[], &["Bar"]);

        assert!(result.success, "{}", result.message);
        assert_eq!(*apps.calls.lock().unwrap(), ["uninstall Bar", "install Bar"]);
        assert_eq!(read(&config.apps_dir().join("Bar/install")), "echo v2\n");
    }

    #[test]
    fn failed_install_rolls_back_apps() {
        let (_dir, config) = setup();
        write(config.root.join("README.md"), "old\n");
        write(config.mirror_dir().join("README.md"), "new\n");
        write(config.apps_dir().join("Bar/install"), "echo v1\n");
        write(config.mirror_dir().join("apps/Bar/install"), "echo v2\n");
        write(config.mirror_dir().join("apps/Bar/icon-64.png"), "png\n");

        let apps = FakeApps {
            reinstall: vec!["Bar".into()],
            fail_install: vec!["Bar".into()],
            ..Default::default()
        };
        let build = FakeBuild::new(true, true);
        let result = run(&config, &apps, &build, &["README.md"], &["Bar"]);

        assert!(!result.success);
        assert!(result.message.starts_with("Failed to update apps: "));
        assert_eq!(result.failed_apps, ["Bar"]);
        assert_eq!(result.stage, UpdateStage::RolledBack);
        assert_eq!(read(&config.root.join("README.md")), "old\n");
        assert_eq!(read(&config.apps_dir().join("Bar/install")), "echo v1\n");
        assert!(!config.apps_dir().join("Bar/icon-64.png").exists());
        // status was uninstalled, so no uninstall call
        assert_eq!(*apps.calls.lock().unwrap(), ["install Bar"]);
    }

    #[test]
    fn missing_mirror_file_fails_apply() {
        let (_dir, config) = setup();
        write(config.root.join("notes.txt"), "mine\n");

        let apps = FakeApps::default();
        let build = FakeBuild::new(true, true);
        let result = run(&config, &apps, &build, &["notes.txt"], &[]);

        assert!(!result.success);
        assert!(result.message.starts_with("Failed to update files: "));
        assert_eq!(result.failed_files, ["notes.txt"]);
        assert_eq!(read(&config.root.join("notes.txt")), "mine\n");
    }

    #[test]
    fn backup_failure_changes_nothing() {
        let (_dir, config) = setup();
        write(config.root.join("README.md"), "old\n");
        write(config.mirror_dir().join("README.md"), "new\n");
        // a plain file where the backup directory should go
        write(config.backup_root(), "not a directory");

        let apps = FakeApps::default();
        let build = FakeBuild::new(true, true);
        let result = run(&config, &apps, &build, &["README.md"], &[]);

        assert!(!result.success);
        assert!(result.message.starts_with("Failed to create backup: "));
        assert_eq!(result.stage, UpdateStage::Failed);
        assert!(result.rollback.is_none());
        assert_eq!(read(&config.root.join("README.md")), "old\n");
    }

    #[test]
    fn updaters_sharing_a_flag_reject_a_concurrent_apply() {
        let (_dir, config) = setup();
        let apps = FakeApps::default();
        let build = FakeBuild::new(true, true);
        let busy = AtomicBool::new(false);
        let mirror = || MirrorManager::new(&config, Arc::new(FakeSource::default()));
        let first = Updater::new(&config, &apps, &build, mirror(), &busy);
        let second = Updater::new(&config, &apps, &build, mirror(), &busy);

        // first apply still running
        let guard = BusyGuard(&busy);
        busy.store(true, Ordering::SeqCst);
        let result = second.perform_update(&[], &[]);
        assert!(!result.success);
        assert!(result.message.contains("already in progress"));
        assert_eq!(result.stage, UpdateStage::Failed);

        drop(guard);
        assert!(first.perform_update(&[], &[]).success);
        assert!(second.perform_update(&[], &[]).success);
        assert!(!busy.load(Ordering::SeqCst));
    }
}
