use crate::error::{Result, UpdaterError};
use std::path::{Component, Path, PathBuf};

/// Provides safe path validation helpers to avoid traversal and host intrusion.
pub struct PathValidator;

impl PathValidator {
    /// Validates and canonicalises an incoming distribution root.
    pub fn validate_project_path(path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();

        let canonical = path.canonicalize().map_err(|e| {
            UpdaterError::Config(format!("Invalid path '{}': {e}", path.display()))
        })?;

        if !canonical.is_dir() {
            return Err(UpdaterError::Config(format!(
                "Path '{}' is not a directory",
                canonical.display()
            )));
        }

        const FORBIDDEN: &[&str] = &["/etc", "/sys", "/proc", "/dev", "/boot"];

        for forbidden in FORBIDDEN {
            let forbidden_path = Path::new(forbidden);

            if path.starts_with(forbidden_path) || canonical.starts_with(forbidden_path) {
                return Err(UpdaterError::Config(format!(
                    "Access to system directory '{}' is not allowed",
                    forbidden
                )));
            }

            if let Ok(canonical_forbidden) = forbidden_path.canonicalize() {
                if canonical.starts_with(&canonical_forbidden) {
                    return Err(UpdaterError::Config(format!(
                        "Access to system directory '{}' is not allowed",
                        forbidden
                    )));
                }
            }
        }

        Ok(canonical)
    }

    /// Ensures a tree-relative path (as stored in status lists) cannot escape its root.
    pub fn validate_relative(relative: &str) -> Result<&Path> {
        let path = Path::new(relative);
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });

        if relative.is_empty() || escapes {
            return Err(UpdaterError::Apply(format!(
                "Refusing unsafe relative path '{relative}'"
            )));
        }

        Ok(path)
    }

    /// Ensures an app name is a single path component.
    pub fn validate_app_name(app: &str) -> Result<&str> {
        let mut components = Path::new(app).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(app),
            _ => Err(UpdaterError::AppManager(format!(
                "Invalid app name '{app}'"
            ))),
        }
    }
}
