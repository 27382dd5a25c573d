use crate::agents::app_manager::{AppManager, AppScope, AppStatus};
use crate::agents::exclusion::ExclusionFilter;
use crate::agents::status_store::StatusStore;
use crate::config::{UpdateSpeed, UpdaterConfig};
use crate::error::{Result, UpdaterError};
use crate::utils::fs::{dir_exists, dirs_match, file_exists, files_match};
use crate::utils::path_validator::PathValidator;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path};
use std::sync::LazyLock;
use walkdir::WalkDir;

/// Top-level entries of the mirror that are never compared as plain files.
const MIRROR_EXCLUDED: &[&str] = &[".git", "apps", "data"];
/// Top-level entries of the local tree that are never compared as plain files.
const LOCAL_EXCLUDED: &[&str] = &[".git", "apps", "data", "update", "update-backup", "logs"];
/// Everything below these directories is compiled or embedded into the binaries.
const SOURCE_TREES: &[&str] = &["pkg/", "cmd/"];

static IMAGE_EXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(png|jpe?g|gif|svg|ico)$").expect("valid regex"));
static BINARY_EXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(bin|exe|so|dylib|dll|a|o)$").expect("valid regex"));

/// Risk category of a changed file, derived from its path alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Module,
    Source,
    BuildScript,
    AppAsset,
    Image,
    Binary,
    Plain,
}

impl FileCategory {
    pub fn of(path: &str) -> Self {
        let file_name = path.rsplit('/').next().unwrap_or(path);

        if path == "go.mod" || path == "go.sum" {
            FileCategory::Module
        } else if SOURCE_TREES.iter().any(|tree| path.starts_with(tree)) {
            FileCategory::Source
        } else if file_name.eq_ignore_ascii_case("makefile")
            || file_name == "GNUmakefile"
            || file_name.to_ascii_lowercase().ends_with(".mk")
        {
            FileCategory::BuildScript
        } else if path.contains("/apps/") {
            FileCategory::AppAsset
        } else if IMAGE_EXT.is_match(path) {
            FileCategory::Image
        } else if BINARY_EXT.is_match(path) || path.starts_with("bin/") || path.contains("/bin/") {
            FileCategory::Binary
        } else {
            FileCategory::Plain
        }
    }

    pub fn requires_rebuild(self) -> bool {
        matches!(
            self,
            FileCategory::Module | FileCategory::Source | FileCategory::BuildScript
        )
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileCategory::Module => "module",
            FileCategory::Source => "source",
            FileCategory::BuildScript => "build-script",
            FileCategory::AppAsset => "app-asset",
            FileCategory::Image => "image",
            FileCategory::Binary => "binary",
            FileCategory::Plain => "plain",
        })
    }
}

/// A path under the distribution root whose mirror copy differs from the local one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub category: FileCategory,
    pub requires_rebuild: bool,
    pub is_module_file: bool,
}

impl FileChange {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let category = FileCategory::of(&path);
        Self {
            path,
            category,
            requires_rebuild: category.requires_rebuild(),
            is_module_file: category == FileCategory::Module,
        }
    }
}

/// Computes which files and apps differ between the mirror and the local tree.
pub struct ChangeClassifier<'a> {
    config: &'a UpdaterConfig,
    apps: &'a dyn AppManager,
    store: StatusStore,
    exclusion: ExclusionFilter,
}

impl<'a> ChangeClassifier<'a> {
    pub fn new(config: &'a UpdaterConfig, apps: &'a dyn AppManager) -> Self {
        Self {
            config,
            apps,
            store: StatusStore::new(config),
            exclusion: ExclusionFilter::load(config),
        }
    }

    /// Files that must be copied from the mirror.
    ///
    /// In fast mode a persisted list is returned when one exists; it may be stale.
    pub fn changed_files(&self) -> Result<Vec<FileChange>> {
        if self.config.speed == UpdateSpeed::Fast {
            if let Some(cached) = self.store.load_files()? {
                tracing::debug!(count = cached.len(), "using cached file list");
                return Ok(cached
                    .into_iter()
                    .filter(|path| PathValidator::validate_relative(path).is_ok())
                    .map(FileChange::new)
                    .collect());
            }
        }

        let mirror_dir = self.config.mirror_dir();
        if !dir_exists(&mirror_dir) {
            return Err(UpdaterError::Comparison(format!(
                "mirror not found at {}",
                mirror_dir.display()
            )));
        }

        let mut paths = list_files(&mirror_dir, MIRROR_EXCLUDED)?;
        paths.extend(list_files(&self.config.root, LOCAL_EXCLUDED)?);

        let mut changed = Vec::new();
        for path in paths {
            let local = self.config.root.join(&path);
            let upstream = mirror_dir.join(&path);

            if !file_exists(&upstream) {
                continue;
            }

            let differs = !file_exists(&local)
                || !files_match(&local, &upstream).map_err(|e| {
                    UpdaterError::Comparison(format!("failed to compare {path}: {e}"))
                })?;

            if differs {
                changed.push(FileChange::new(path));
            }
        }

        let changed = self.exclusion.filter(changed);
        tracing::info!(count = changed.len(), "changed files computed");
        Ok(changed)
    }

    /// Upstream apps that are new or whose directory differs from the local one.
    ///
    /// In fast mode a persisted list is returned when one exists; it may be stale.
    pub fn changed_apps(&self) -> Result<Vec<String>> {
        if self.config.speed == UpdateSpeed::Fast {
            if let Some(cached) = self.store.load_apps()? {
                tracing::debug!(count = cached.len(), "using cached app list");
                return Ok(cached);
            }
        }

        let mirror_apps = self.config.mirror_dir().join("apps");
        let mut changed = Vec::new();

        for app in self.apps.list_apps(AppScope::Online)? {
            let local = self.config.apps_dir().join(&app);
            if !dir_exists(&local) {
                changed.push(app);
                continue;
            }

            let same = dirs_match(&local, &mirror_apps.join(&app)).map_err(|e| {
                UpdaterError::Comparison(format!("failed to compare app {app}: {e}"))
            })?;
            if !same {
                changed.push(app);
            }
        }

        tracing::info!(count = changed.len(), "changed apps computed");
        Ok(changed)
    }

    /// Apps present locally that the upstream catalog no longer has.
    pub fn removed_apps(&self) -> Result<Vec<String>> {
        let online: BTreeSet<String> = self.apps.list_apps(AppScope::Online)?.into_iter().collect();
        Ok(self
            .apps
            .list_apps(AppScope::Local)?
            .into_iter()
            .filter(|app| !online.contains(app))
            .collect())
    }

    /// Warn about installed apps that vanished upstream. Nothing is removed.
    pub fn warn_removed_apps(&self) -> Result<Vec<String>> {
        let mut flagged = Vec::new();
        for app in self.removed_apps()? {
            match self.apps.status(&app) {
                Ok(AppStatus::Installed) if dir_exists(&self.config.apps_dir().join(&app)) => {
                    tracing::warn!(
                        app = %app,
                        "app was removed from the repository but is still installed; consider deprecating it"
                    );
                    flagged.push(app);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(app = %app, error = %e, "skipping removed app"),
            }
        }
        Ok(flagged)
    }
}

/// Relative, `/`-separated paths of all non-directory entries under `root`,
/// skipping the named top-level entries.
fn list_files(root: &Path, excluded: &[&str]) -> Result<BTreeSet<String>> {
    let mut files = BTreeSet::new();

    let walker = WalkDir::new(root).min_depth(1).into_iter().filter_entry(|entry| {
        entry.depth() != 1 || !excluded.iter().any(|name| entry.file_name() == *name)
    });

    for entry in walker {
        let entry = entry.map_err(|e| {
            UpdaterError::Comparison(format!("failed to walk {}: {e}", root.display()))
        })?;
        if entry.file_type().is_dir() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| UpdaterError::Comparison(e.to_string()))?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        files.insert(parts.join("/"));
    }

    Ok(files)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// In-memory app manager that records install/uninstall calls.
    #[derive(Default)]
    pub(crate) struct FakeApps {
        pub online: Vec<String>,
        pub local: Vec<String>,
        pub statuses: HashMap<String, AppStatus>,
        pub reinstall: Vec<String>,
        pub fail_install: Vec<String>,
        pub calls: Mutex<Vec<String>>,
    }

    impl AppManager for FakeApps {
        fn list_apps(&self, scope: AppScope) -> Result<Vec<String>> {
            Ok(match scope {
                AppScope::Online => self.online.clone(),
                AppScope::Local => self.local.clone(),
                AppScope::All => {
                    let mut all: BTreeSet<String> = self.online.iter().cloned().collect();
                    all.extend(self.local.iter().cloned());
                    all.into_iter().collect()
                }
                AppScope::Installed => self
                    .statuses
                    .iter()
                    .filter(|(_, s)| **s == AppStatus::Installed)
                    .map(|(a, _)| a.clone())
                    .collect(),
            })
        }

        fn status(&self, app: &str) -> Result<AppStatus> {
            Ok(self
                .statuses
                .get(app)
                .copied()
                .unwrap_or(AppStatus::Uninstalled))
        }

        fn will_reinstall(&self, app: &str) -> Result<bool> {
            Ok(self.reinstall.iter().any(|a| a == app))
        }

        fn install(&self, app: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("install {app}"));
            if self.fail_install.iter().any(|a| a == app) {
                return Err(UpdaterError::AppManager(format!("{app} install failed")));
            }
            Ok(())
        }

        fn uninstall(&self, app: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("uninstall {app}"));
            Ok(())
        }
    }

    pub(crate) fn write(path: PathBuf, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn categories_follow_path_shape() {
        assert_eq!(FileCategory::of("go.mod"), FileCategory::Module);
        assert_eq!(FileCategory::of("go.sum"), FileCategory::Module);
        assert_eq!(FileCategory::of("pkg/api/list.go"), FileCategory::Source);
        assert_eq!(FileCategory::of("cmd/updater/main.go"), FileCategory::Source);
        assert_eq!(FileCategory::of("Makefile"), FileCategory::BuildScript);
        assert_eq!(FileCategory::of("build/rules.mk"), FileCategory::BuildScript);
        assert_eq!(FileCategory::of("etc/apps/list"), FileCategory::AppAsset);
        assert_eq!(FileCategory::of("icons/logo.PNG"), FileCategory::Image);
        assert_eq!(FileCategory::of("tools/bin/helper"), FileCategory::Binary);
        assert_eq!(FileCategory::of("lib/libfoo.so"), FileCategory::Binary);
        assert_eq!(FileCategory::of("README.md"), FileCategory::Plain);
        assert_eq!(FileCategory::of("docs/pkg/README.md"), FileCategory::Plain);
        assert_eq!(FileCategory::of("pkgs.txt"), FileCategory::Plain);
    }

    #[test]
    fn anything_in_a_source_tree_needs_a_rebuild() {
        for path in [
            "pkg/gui/xlunch_native.c",
            "pkg/gui/xlunch_native.h",
            "cmd/api/embed/index.html",
            "pkg/README.md",
            "pkg/gui/icons/logo.png",
        ] {
            let change = FileChange::new(path);
            assert_eq!(change.category, FileCategory::Source, "{path}");
            assert!(change.requires_rebuild && !change.is_module_file, "{path}");
        }
    }

    #[test]
    fn rebuild_flags_derive_from_category() {
        let module = FileChange::new("go.mod");
        assert!(module.requires_rebuild && module.is_module_file);

        let source = FileChange::new("pkg/x.go");
        assert!(source.requires_rebuild && !source.is_module_file);

        let makefile = FileChange::new("Makefile");
        assert!(makefile.requires_rebuild && !makefile.is_module_file);

        let icon = FileChange::new("icons/a.png");
        assert!(!icon.requires_rebuild && !icon.is_module_file);
    }

    fn setup() -> (tempfile::TempDir, UpdaterConfig) {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        fs::create_dir_all(config.mirror_dir()).unwrap();
        (dir, config)
    }

    #[test]
    fn identical_files_are_not_reported() {
        let (_dir, config) = setup();
        write(config.root.join("README.md"), "same\n");
        write(config.mirror_dir().join("README.md"), "same\n");
        write(config.root.join("pkg/a.go"), "package a\n");
        write(config.mirror_dir().join("pkg/a.go"), "package a\n");

        let apps = FakeApps::default();
        let changed = ChangeClassifier::new(&config, &apps).changed_files().unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn new_and_modified_files_are_reported_local_only_ignored() {
        let (_dir, config) = setup();
        write(config.root.join("README.md"), "old\n");
        write(config.mirror_dir().join("README.md"), "new\n");
        write(config.mirror_dir().join("pkg/new.go"), "package new\n");
        write(config.root.join("local-only.txt"), "mine\n");

        let apps = FakeApps::default();
        let changed = ChangeClassifier::new(&config, &apps).changed_files().unwrap();
        let paths: Vec<&str> = changed.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, ["README.md", "pkg/new.go"]);
        assert!(changed[1].requires_rebuild);
    }

    #[test]
    fn excluded_regions_are_skipped() {
        let (_dir, config) = setup();
        write(config.mirror_dir().join(".git/HEAD"), "ref\n");
        write(config.mirror_dir().join("apps/Foo/install"), "x\n");
        write(config.mirror_dir().join("data/settings/x"), "x\n");
        write(config.root.join("logs/today.log"), "log\n");

        let apps = FakeApps::default();
        let changed = ChangeClassifier::new(&config, &apps).changed_files().unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn exclusion_list_drops_verbatim_paths() {
        let (_dir, config) = setup();
        write(config.root.join("etc/theme"), "mine\n");
        write(config.mirror_dir().join("etc/theme"), "theirs\n");
        write(config.mirror_dir().join("etc/other"), "new\n");
        write(config.data_dir().join("update-exclusion"), "# keep my theme\netc/theme\n");

        let apps = FakeApps::default();
        let changed = ChangeClassifier::new(&config, &apps).changed_files().unwrap();
        let paths: Vec<&str> = changed.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, ["etc/other"]);
    }

    #[test]
    fn missing_mirror_is_a_comparison_error() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Normal);
        let apps = FakeApps::default();
        let err = ChangeClassifier::new(&config, &apps).changed_files().unwrap_err();
        assert!(matches!(err, UpdaterError::Comparison(_)));
    }

    #[test]
    fn apps_compare_by_structure() {
        let (_dir, config) = setup();
        for app in ["Same", "Changed"] {
            write(config.apps_dir().join(app).join("install"), "v1\n");
            write(config.mirror_dir().join("apps").join(app).join("install"), "v1\n");
        }
        write(config.mirror_dir().join("apps/Changed/icon-64.png"), "png\n");
        write(config.mirror_dir().join("apps/Brand-New/install"), "v1\n");

        let apps = FakeApps {
            online: vec!["Brand-New".into(), "Changed".into(), "Same".into()],
            ..Default::default()
        };
        let changed = ChangeClassifier::new(&config, &apps).changed_apps().unwrap();
        assert_eq!(changed, ["Brand-New", "Changed"]);
    }

    #[test]
    fn fast_speed_returns_cached_lists() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig::new(dir.path(), UpdateSpeed::Fast);
        write(config.status_dir().join("updatable-files"), "go.mod\nREADME.md\n");
        write(config.status_dir().join("updatable-apps"), "Foo\n");

        let apps = FakeApps::default();
        let classifier = ChangeClassifier::new(&config, &apps);
        let files = classifier.changed_files().unwrap();
        assert_eq!(files, [FileChange::new("go.mod"), FileChange::new("README.md")]);
        assert!(files[0].is_module_file);
        assert_eq!(classifier.changed_apps().unwrap(), ["Foo"]);
        assert!(!config.mirror_dir().exists());
    }

    #[test]
    fn removed_apps_are_only_flagged() {
        let (_dir, config) = setup();
        write(config.apps_dir().join("Gone/install"), "x\n");
        write(config.apps_dir().join("Kept/install"), "x\n");

        let apps = FakeApps {
            online: vec!["Kept".into()],
            local: vec!["Gone".into(), "Kept".into()],
            statuses: HashMap::from([("Gone".to_string(), AppStatus::Installed)]),
            ..Default::default()
        };
        let classifier = ChangeClassifier::new(&config, &apps);
        assert_eq!(classifier.removed_apps().unwrap(), ["Gone"]);
        assert_eq!(classifier.warn_removed_apps().unwrap(), ["Gone"]);
        assert!(config.apps_dir().join("Gone").exists());
    }
}
