use crate::agents::build_execution::BuildRunner;
use crate::agents::change_classifier::FileChange;
use crate::config::UpdaterConfig;
use crate::error::{Result, UpdaterError};
use crate::utils::fs::{copy_dir, copy_file, dir_exists, file_exists, remove_path, replace_dir};
use crate::utils::path_validator::PathValidator;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE: &str = "snapshot.json";
const FILES_DIR: &str = "files";
const APPS_DIR: &str = "apps";

/// Whether the rebuild step of an apply ran, and how it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompilationState {
    #[default]
    NotAttempted,
    Success,
    Failed,
}

/// Everything needed to return the tree to its pre-apply state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackData {
    pub backup_path: PathBuf,
    pub compilation_state: CompilationState,
    /// Unix seconds at which the snapshot was taken
    pub created_at: i64,
    #[serde(default)]
    pub backed_up_files: Vec<String>,
    #[serde(default)]
    pub backed_up_apps: Vec<String>,
    /// Files the apply creates; a restore deletes them
    #[serde(default)]
    pub created_files: Vec<String>,
    /// Outermost directories the apply creates for new files
    #[serde(default)]
    pub created_dirs: Vec<String>,
    #[serde(default)]
    pub created_apps: Vec<String>,
}

impl RollbackData {
    /// Read the snapshot description stored in `backup_dir`.
    pub fn load(backup_dir: &Path) -> Result<Self> {
        let path = backup_dir.join(SNAPSHOT_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            UpdaterError::Restore(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut data: RollbackData = serde_json::from_str(&content)?;
        data.backup_path = backup_dir.to_path_buf();
        Ok(data)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(self.backup_path.join(SNAPSHOT_FILE), content)?;
        Ok(())
    }

    /// Record the rebuild outcome and persist it for a later manual rollback.
    pub fn set_compilation_state(&mut self, state: CompilationState) {
        self.compilation_state = state;
        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "could not persist compilation state");
        }
    }
}

/// Takes snapshots before an apply and restores them afterwards.
pub struct BackupManager<'a> {
    config: &'a UpdaterConfig,
    build: &'a dyn BuildRunner,
}

impl<'a> BackupManager<'a> {
    pub fn new(config: &'a UpdaterConfig, build: &'a dyn BuildRunner) -> Self {
        Self { config, build }
    }

    /// Snapshot the local copies of everything about to be overwritten.
    ///
    /// Nothing in the live tree is modified. Targets that do not exist yet are
    /// recorded as created instead of copied.
    pub fn backup(&self, files: &[FileChange], apps: &[String]) -> Result<RollbackData> {
        self.take_snapshot(files, apps)
            .map_err(|e| match e {
                UpdaterError::Backup(_) => e,
                other => UpdaterError::Backup(other.to_string()),
            })
    }

    fn take_snapshot(&self, files: &[FileChange], apps: &[String]) -> Result<RollbackData> {
        let created_at = jiff::Timestamp::now().as_second();
        let backup_path = self.unique_snapshot_dir(created_at)?;
        fs::create_dir_all(backup_path.join(FILES_DIR))?;
        fs::create_dir_all(backup_path.join(APPS_DIR))?;

        let mut data = RollbackData {
            backup_path: backup_path.clone(),
            compilation_state: CompilationState::NotAttempted,
            created_at,
            backed_up_files: Vec::new(),
            backed_up_apps: Vec::new(),
            created_files: Vec::new(),
            created_dirs: Vec::new(),
            created_apps: Vec::new(),
        };

        for change in files {
            let relative = PathValidator::validate_relative(&change.path)?;
            let local = self.config.root.join(relative);
            if file_exists(&local) {
                copy_file(&local, &backup_path.join(FILES_DIR).join(relative)).map_err(|e| {
                    UpdaterError::Backup(format!("failed to back up {}: {e}", change.path))
                })?;
                data.backed_up_files.push(change.path.clone());
            } else {
                if let Some(dir) = self.outermost_missing_dir(relative) {
                    if !data.created_dirs.contains(&dir) {
                        data.created_dirs.push(dir);
                    }
                }
                data.created_files.push(change.path.clone());
            }
        }

        for app in apps {
            PathValidator::validate_app_name(app)?;
            let local = self.config.apps_dir().join(app);
            if dir_exists(&local) {
                copy_dir(&local, &backup_path.join(APPS_DIR).join(app)).map_err(|e| {
                    UpdaterError::Backup(format!("failed to back up app {app}: {e}"))
                })?;
                data.backed_up_apps.push(app.clone());
            } else {
                data.created_apps.push(app.clone());
            }
        }

        data.save()?;
        tracing::info!(
            path = %backup_path.display(),
            files = data.backed_up_files.len(),
            apps = data.backed_up_apps.len(),
            "backup created"
        );
        Ok(data)
    }

    fn unique_snapshot_dir(&self, created_at: i64) -> Result<PathBuf> {
        let root = self.config.backup_root();
        fs::create_dir_all(&root)?;
        let mut candidate = root.join(created_at.to_string());
        let mut n = 1;
        while candidate.exists() {
            candidate = root.join(format!("{created_at}-{n}"));
            n += 1;
        }
        Ok(candidate)
    }

    fn outermost_missing_dir(&self, relative: &Path) -> Option<String> {
        let parent = relative.parent()?;
        let mut prefix = PathBuf::new();
        for component in parent.components() {
            prefix.push(component);
            if !self.config.root.join(&prefix).exists() {
                return Some(prefix.to_string_lossy().replace('\\', "/"));
            }
        }
        None
    }

    /// Put the snapshot back. Safe to run more than once.
    ///
    /// If the apply had compiled successfully the rebuild is run again so the
    /// executables match the restored sources.
    pub fn restore(&self, data: &RollbackData) -> Result<()> {
        let backup_path = &data.backup_path;
        if !dir_exists(backup_path) {
            return Err(UpdaterError::Restore(format!(
                "backup directory {} not found",
                backup_path.display()
            )));
        }
        tracing::info!(path = %backup_path.display(), "restoring backup");

        for path in &data.backed_up_files {
            let relative = PathValidator::validate_relative(path)?;
            copy_file(
                &backup_path.join(FILES_DIR).join(relative),
                &self.config.root.join(relative),
            )
            .map_err(|e| UpdaterError::Restore(format!("failed to restore {path}: {e}")))?;
        }

        for app in &data.backed_up_apps {
            PathValidator::validate_app_name(app)?;
            replace_dir(
                &backup_path.join(APPS_DIR).join(app),
                &self.config.apps_dir().join(app),
            )
            .map_err(|e| UpdaterError::Restore(format!("failed to restore app {app}: {e}")))?;
        }

        for path in data.created_files.iter().chain(&data.created_dirs) {
            let relative = PathValidator::validate_relative(path)?;
            remove_path(&self.config.root.join(relative))
                .map_err(|e| UpdaterError::Restore(format!("failed to remove {path}: {e}")))?;
        }

        for app in &data.created_apps {
            PathValidator::validate_app_name(app)?;
            remove_path(&self.config.apps_dir().join(app))
                .map_err(|e| UpdaterError::Restore(format!("failed to remove app {app}: {e}")))?;
        }

        if data.compilation_state == CompilationState::Success {
            tracing::info!("recompiling restored sources");
            let output = self.build.rebuild();
            if !output.success {
                return Err(UpdaterError::Restore(format!(
                    "recompilation after restore failed: {}",
                    output.tail(5)
                )));
            }
        }

        tracing::info!("backup restored");
        Ok(())
    }

    /// Most recent snapshot directory that carries a snapshot description.
    pub fn latest_snapshot(&self) -> Result<Option<PathBuf>> {
        let root = self.config.backup_root();
        if !dir_exists(&root) {
            return Ok(None);
        }

        let mut best: Option<((i64, u32), PathBuf)> = None;
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if !file_exists(&path.join(SNAPSHOT_FILE)) {
                continue;
            }
            let Some(key) = path.file_name().and_then(|n| n.to_str()).and_then(snapshot_key)
            else {
                continue;
            };
            if best.as_ref().is_none_or(|(k, _)| key > *k) {
                best = Some((key, path));
            }
        }
        Ok(best.map(|(_, path)| path))
    }
}

/// Sort key for `<secs>` and `<secs>-<n>` directory names.
fn snapshot_key(name: &str) -> Option<(i64, u32)> {
    match name.split_once('-') {
        Some((secs, n)) => Some((secs.parse().ok()?, n.parse().ok()?)),
        None => Some((name.parse().ok()?, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::build_execution::tests::FakeBuild;
    use crate::agents::change_classifier::tests::write;
    use crate::config::UpdateSpeed;
    use crate::utils::fs::tree_digest;
    use tempfile::tempdir;

    fn changes(paths: &[&str]) -> Vec<FileChange> {
        paths.iter().map(|p| FileChange::new(*p)).collect()
    }

    fn seed(config: &UpdaterConfig) {
        write(config.root.join("README.md"), "old readme\n");
        write(config.root.join("pkg/a.go"), "package a\n");
        write(config.apps_dir().join("Foo/install"), "echo foo v1\n");
        write(config.apps_dir().join("Foo/description"), "Foo app\n");
    }

    /// Simulates an apply touching everything the snapshot covers.
    fn mutate(config: &UpdaterConfig) {
        write(config.root.join("README.md"), "new readme\n");
        write(config.root.join("pkg/a.go"), "package a // v2\n");
        write(config.root.join("cmd/tool/main.go"), "package main\n");
        write(config.apps_dir().join("Foo/install"), "echo foo v2\n");
        write(config.apps_dir().join("Foo/icon-64.png"), "png\n");
        write(config.apps_dir().join("Bar/install"), "echo bar\n");
    }

    #[test]
    fn backup_then_restore_returns_exact_tree() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        seed(&config);
        let before_root = tree_digest(&config.root.join("pkg")).unwrap();
        let before_apps = tree_digest(&config.apps_dir()).unwrap();

        let build = FakeBuild::new(true, true);
        let manager = BackupManager::new(&config, &build);
        let files = changes(&["README.md", "pkg/a.go", "cmd/tool/main.go"]);
        let apps = vec!["Foo".to_string(), "Bar".to_string()];
        let data = manager.backup(&files, &apps).unwrap();

        assert_eq!(data.created_files, ["cmd/tool/main.go"]);
        assert_eq!(data.created_dirs, ["cmd"]);
        assert_eq!(data.created_apps, ["Bar"]);
        assert!(data.backup_path.join("snapshot.json").is_file());

        mutate(&config);
        manager.restore(&data).unwrap();

        assert_eq!(
            fs::read_to_string(config.root.join("README.md")).unwrap(),
            "old readme\n"
        );
        assert!(!config.root.join("cmd").exists());
        assert_eq!(tree_digest(&config.root.join("pkg")).unwrap(), before_root);
        assert_eq!(tree_digest(&config.apps_dir()).unwrap(), before_apps);
        assert_eq!(build.rebuild_count(), 0);
    }

    #[test]
    fn restore_is_idempotent() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        seed(&config);

        let build = FakeBuild::new(true, true);
        let manager = BackupManager::new(&config, &build);
        let data = manager
            .backup(&changes(&["README.md", "new.txt"]), &["Foo".to_string()])
            .unwrap();
        mutate(&config);
        write(config.root.join("new.txt"), "created\n");

        manager.restore(&data).unwrap();
        let once = tree_digest(&config.root).unwrap();
        manager.restore(&data).unwrap();
        assert_eq!(tree_digest(&config.root).unwrap(), once);
        assert!(!config.root.join("new.txt").exists());
    }

    #[test]
    fn restore_recompiles_after_successful_compilation() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        seed(&config);

        let build = FakeBuild::new(true, true);
        let manager = BackupManager::new(&config, &build);
        let mut data = manager.backup(&changes(&["pkg/a.go"]), &[]).unwrap();
        data.set_compilation_state(CompilationState::Success);

        manager.restore(&data).unwrap();
        assert_eq!(build.rebuild_count(), 1);

        let reloaded = RollbackData::load(&data.backup_path).unwrap();
        assert_eq!(reloaded, data);
    }

    #[test]
    fn failed_recompilation_fails_the_restore() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        seed(&config);

        let build = FakeBuild::new(false, true);
        let manager = BackupManager::new(&config, &build);
        let mut data = manager.backup(&changes(&["pkg/a.go"]), &[]).unwrap();
        data.compilation_state = CompilationState::Success;

        let err = manager.restore(&data).unwrap_err();
        assert!(matches!(err, UpdaterError::Restore(_)));
    }

    #[test]
    fn backup_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        let build = FakeBuild::new(true, true);
        let manager = BackupManager::new(&config, &build);

        let err = manager.backup(&changes(&["../etc/passwd"]), &[]).unwrap_err();
        assert!(matches!(err, UpdaterError::Backup(_)));
    }

    #[test]
    fn latest_snapshot_picks_newest() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        for name in ["100", "200", "200-1", "300"] {
            let path = config.backup_root().join(name);
            fs::create_dir_all(&path).unwrap();
            if name != "300" {
                fs::write(path.join("snapshot.json"), "{}").unwrap();
            }
        }

        let build = FakeBuild::new(true, true);
        let manager = BackupManager::new(&config, &build);
        assert_eq!(
            manager.latest_snapshot().unwrap(),
            Some(config.backup_root().join("200-1"))
        );
    }

    #[test]
    fn snapshot_keys_order_suffixes() {
        assert_eq!(snapshot_key("17"), Some((17, 0)));
        assert_eq!(snapshot_key("17-2"), Some((17, 2)));
        assert_eq!(snapshot_key("notes"), None);
    }
}
