use crate::agents::backup::RollbackData;
use std::fmt;

/// Furthest point an apply reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStage {
    #[default]
    Start,
    BackedUp,
    FilesApplied,
    AppsApplied,
    ModuleRefreshed,
    Rebuilt,
    Finalized,
    /// Failed before anything was changed
    Failed,
    RolledBack,
    RollbackFailed,
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpdateStage::Start => "start",
            UpdateStage::BackedUp => "backed up",
            UpdateStage::FilesApplied => "files applied",
            UpdateStage::AppsApplied => "apps applied",
            UpdateStage::ModuleRefreshed => "module dependencies refreshed",
            UpdateStage::Rebuilt => "rebuilt",
            UpdateStage::Finalized => "finalized",
            UpdateStage::Failed => "failed",
            UpdateStage::RolledBack => "rolled back",
            UpdateStage::RollbackFailed => "rollback failed",
        };
        f.write_str(label)
    }
}

/// Outcome of one orchestrated apply.
#[derive(Debug, Clone, Default)]
pub struct UpdateResult {
    pub success: bool,
    pub message: String,
    pub failed_apps: Vec<String>,
    pub failed_files: Vec<String>,
    pub recompiled: bool,
    pub module_refreshed: bool,
    pub stage: UpdateStage,
    /// Present only when the apply failed, for a later manual rollback
    pub rollback: Option<RollbackData>,
}

impl UpdateResult {
    pub(crate) fn failed(message: String) -> Self {
        Self {
            success: false,
            message,
            stage: UpdateStage::Failed,
            ..Default::default()
        }
    }

    /// Success message naming the conditional steps that ran.
    pub(crate) fn success_message(module_refreshed: bool, recompiled: bool) -> String {
        let suffix = match (module_refreshed, recompiled) {
            (true, true) => " (Module dependencies updated and recompilation completed)",
            (true, false) => " (Module dependencies updated)",
            (false, true) => " (Recompilation completed)",
            (false, false) => "",
        };
        format!("Update completed successfully{suffix}")
    }
}
