use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Repository fetch failed: {0}")]
    Connectivity(String),

    #[error("Comparison failed: {0}")]
    Comparison(String),

    #[error("Backup failed: {0}")]
    Backup(String),

    #[error("Apply failed: {0}")]
    Apply(String),

    #[error("{0}")]
    Build(String),

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Finalization failed: {0}")]
    Finalize(String),

    #[error("App manager error: {0}")]
    AppManager(String),

    #[error("Another updater instance is already running (lock: {0})")]
    Locked(String),

    #[error("Update failed: {0}")]
    UpdateFailed(String),

    #[error("No updates available")]
    NoUpdatesAvailable,

    #[error("Update cancelled by user")]
    UserCancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, UpdaterError>;
