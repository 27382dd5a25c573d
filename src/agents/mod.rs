pub mod app_manager;
pub mod backup;
pub mod build_execution;
pub mod change_classifier;
pub mod connectivity;
pub mod exclusion;
pub mod lock;
pub mod mirror;
pub mod safety;
pub mod status_store;

pub mod update;
pub use update::{UpdateResult, Updater};

pub use app_manager::{AppManager, AppScope, ScriptAppManager};
pub use backup::{BackupManager, RollbackData};
pub use build_execution::CommandBuildRunner;
pub use change_classifier::{ChangeClassifier, FileChange};
pub use connectivity::ConnectivityProbe;
pub use lock::UpdateLock;
pub use mirror::{CancelToken, MirrorManager};
pub use safety::SafetyFilter;
pub use status_store::{IntervalDecision, StatusStore};
