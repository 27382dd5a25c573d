use crate::agents::app_manager::{AppManager, AppStatus};
use crate::agents::change_classifier::FileChange;
use crate::config::UpdaterConfig;
use crate::utils::fs::dir_exists;

/// Selects the part of a change set that can be applied without supervision.
pub struct SafetyFilter<'a> {
    config: &'a UpdaterConfig,
    apps: &'a dyn AppManager,
}

impl<'a> SafetyFilter<'a> {
    pub fn new(config: &'a UpdaterConfig, apps: &'a dyn AppManager) -> Self {
        Self { config, apps }
    }

    /// Files that need neither a rebuild nor a dependency refresh.
    pub fn safe_files(files: &[FileChange]) -> Vec<FileChange> {
        files
            .iter()
            .filter(|f| !f.requires_rebuild && !f.is_module_file)
            .cloned()
            .collect()
    }

    /// Whether `app` can be refreshed in place.
    ///
    /// Any app-manager error counts as unsafe.
    pub fn is_safe_app(&self, app: &str) -> bool {
        if !dir_exists(&self.config.apps_dir().join(app)) {
            return false;
        }

        match self.apps.will_reinstall(app) {
            Ok(false) => {}
            Ok(true) => return false,
            Err(e) => {
                tracing::warn!(app, error = %e, "cannot tell whether app needs reinstalling");
                return false;
            }
        }

        match self.apps.status(app) {
            Ok(AppStatus::Corrupted) => false,
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(app, error = %e, "cannot read app status");
                false
            }
        }
    }

    pub fn safe_subset(
        &self,
        files: &[FileChange],
        apps: &[String],
    ) -> (Vec<FileChange>, Vec<String>) {
        let safe_files = Self::safe_files(files);
        let safe_apps: Vec<String> = apps
            .iter()
            .filter(|app| self.is_safe_app(app))
            .cloned()
            .collect();

        tracing::info!(
            files = safe_files.len(),
            apps = safe_apps.len(),
            deferred = files.len() + apps.len() - safe_files.len() - safe_apps.len(),
            "safe subset selected"
        );
        (safe_files, safe_apps)
    }
}
