//! On-disk layout of the output directory.

use std::path::{Path, PathBuf};

use plancrawl_shared::{PlanCrawlError, Result};

/// Primary state file.
pub const STATE_FILE: &str = "crawl_state.json";
/// Full-record export.
pub const RECORDS_FILE: &str = "medicare_plans.json";
/// One row per zipcode.
pub const SUMMARY_FILE: &str = "zipcode_summary.csv";
/// One row per plan.
pub const DETAIL_FILE: &str = "medicare_plans.csv";

/// Locations of every artifact under one output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub dir: PathBuf,
    pub state: PathBuf,
    pub records: PathBuf,
    pub summary: PathBuf,
    pub detail: PathBuf,
}

impl StatePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            state: dir.join(STATE_FILE),
            records: dir.join(RECORDS_FILE),
            summary: dir.join(SUMMARY_FILE),
            detail: dir.join(DETAIL_FILE),
            dir,
        }
    }

    pub fn state_backup(&self) -> PathBuf {
        backup_path(&self.state)
    }

    /// Every file this crate may write, existing or not.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        vec![
            self.state.clone(),
            self.state_backup(),
            self.records.clone(),
            self.summary.clone(),
            self.detail.clone(),
        ]
    }

    /// Artifacts that currently exist on disk.
    pub fn existing_artifacts(&self) -> Vec<PathBuf> {
        self.artifacts().into_iter().filter(|p| p.exists()).collect()
    }

    pub fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| PlanCrawlError::io(&self.dir, e))
    }
}

/// `<file>.backup` next to `path`.
pub fn backup_path(path: &Path) -> PathBuf {
    sibling(path, "", ".backup")
}

/// Hidden `.<file>.tmp` next to `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    sibling(path, ".", ".tmp")
}

fn sibling(path: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{prefix}{name}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_names() {
        let paths = StatePaths::new("/data/out");
        assert_eq!(paths.state, PathBuf::from("/data/out/crawl_state.json"));
        assert_eq!(
            paths.state_backup(),
            PathBuf::from("/data/out/crawl_state.json.backup")
        );
        assert_eq!(
            temp_path(&paths.detail),
            PathBuf::from("/data/out/.medicare_plans.csv.tmp")
        );
    }

    #[test]
    fn no_artifacts_in_missing_dir() {
        let paths = StatePaths::new(std::env::temp_dir().join(format!(
            "pc-paths-test-{}",
            uuid::Uuid::now_v7()
        )));
        assert!(paths.existing_artifacts().is_empty());
        assert_eq!(paths.artifacts().len(), 5);
    }
}
