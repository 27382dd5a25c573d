use crate::agents::change_classifier::FileChange;
use crate::config::UpdaterConfig;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Administrator-maintained list of paths the updater must never touch.
///
/// One path per line in `data/update-exclusion`; lines starting with `#` or `;`
/// are comments. Matching is exact, there is no globbing.
#[derive(Debug, Default, Clone)]
pub struct ExclusionFilter {
    excluded: HashSet<String>,
}

impl ExclusionFilter {
    pub fn load(config: &UpdaterConfig) -> Self {
        Self::from_file(&config.data_dir().join("update-exclusion"))
    }

    /// A missing or unreadable list excludes nothing.
    pub fn from_file(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read exclusion list");
                }
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Self {
        let excluded = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
            .map(str::to_string)
            .collect();
        Self { excluded }
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded.contains(path)
    }

    pub fn filter(&self, changes: Vec<FileChange>) -> Vec<FileChange> {
        changes
            .into_iter()
            .filter(|change| {
                let keep = !self.is_excluded(&change.path);
                if !keep {
                    tracing::debug!(path = %change.path, "excluded from update");
                }
                keep
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let filter = ExclusionFilter::parse("# comment\n; also comment\n\n  etc/theme  \n");
        assert!(filter.is_excluded("etc/theme"));
        assert!(!filter.is_excluded("# comment"));
        assert!(!filter.is_excluded("; also comment"));
    }

    #[test]
    fn matching_is_exact() {
        let filter = ExclusionFilter::parse("etc/*\npkg\n");
        let kept = filter.filter(vec![
            FileChange::new("etc/theme"),
            FileChange::new("pkg/a.go"),
            FileChange::new("pkg"),
        ]);
        let paths: Vec<&str> = kept.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, ["etc/theme", "pkg/a.go"]);
    }

    #[test]
    fn missing_file_excludes_nothing() {
        let dir = tempdir().unwrap();
        let filter = ExclusionFilter::from_file(&dir.path().join("none"));
        let kept = filter.filter(vec![FileChange::new("README.md")]);
        assert_eq!(kept.len(), 1);
    }
}
