//! Startup state loading and artifact reset.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use plancrawl_shared::{
    CURRENT_SCHEMA_VERSION, CrawlState, PlanCrawlError, PlanStatus, Result, ZipcodeEntry,
    ZipcodeStatus,
};
use tracing::{info, warn};

use crate::atomic::discard_stale_temp;
use crate::paths::StatePaths;

/// Where a loaded state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    Primary,
    Backup,
    /// Rebuilt from the full-record export.
    Reconstructed,
    /// Nothing on disk.
    Fresh,
}

impl RecoverySource {
    pub fn label(self) -> &'static str {
        match self {
            Self::Primary => "primary state file",
            Self::Backup => "backup state file",
            Self::Reconstructed => "full-record export",
            Self::Fresh => "fresh state",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Recovered {
    pub state: CrawlState,
    pub source: RecoverySource,
}

/// Load the best available state: primary, backup, full-record export, or
/// fresh when no artifact exists at all.
///
/// Fails with a recovery error when artifacts exist but none can be used.
pub fn load_state(paths: &StatePaths, workers: usize) -> Result<Recovered> {
    for path in [&paths.state, &paths.records, &paths.summary, &paths.detail] {
        discard_stale_temp(path);
    }

    let mut failures: Vec<String> = Vec::new();

    let candidates = [
        (paths.state.clone(), RecoverySource::Primary),
        (paths.state_backup(), RecoverySource::Backup),
    ];
    for (path, source) in candidates {
        match read_state_file(&path) {
            Ok(Some(state)) => {
                info!(path = %path.display(), source = source.label(), "loaded crawl state");
                return Ok(Recovered { state, source });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state file unusable");
                failures.push(format!("{}: {e}", path.display()));
            }
        }
    }

    match read_records(&paths.records, workers) {
        Ok(Some(state)) => {
            warn!(
                path = %paths.records.display(),
                zipcodes = state.order.len(),
                "state rebuilt from full-record export; phase timestamps are lost"
            );
            return Ok(Recovered {
                state,
                source: RecoverySource::Reconstructed,
            });
        }
        Ok(None) => {}
        Err(e) => {
            warn!(path = %paths.records.display(), error = %e, "full-record export unusable");
            failures.push(format!("{}: {e}", paths.records.display()));
        }
    }

    let existing = paths.existing_artifacts();
    if existing.is_empty() {
        info!(dir = %paths.dir.display(), "no prior state, starting fresh");
        return Ok(Recovered {
            state: CrawlState::empty(workers),
            source: RecoverySource::Fresh,
        });
    }

    let found: Vec<String> = existing.iter().map(|p| p.display().to_string()).collect();
    let detail = if failures.is_empty() {
        String::from("no loadable state file")
    } else {
        failures.join("; ")
    };
    Err(PlanCrawlError::recovery(format!(
        "existing artifacts could not be loaded ({detail}). Found: {}. \
         Inspect or move them, or rerun with --reset to archive them and start fresh",
        found.join(", ")
    )))
}

fn read_state_file(path: &Path) -> Result<Option<CrawlState>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| PlanCrawlError::io(path, e))?;
    let mut state: CrawlState = serde_json::from_str(&content)
        .map_err(|e| PlanCrawlError::parse(format!("invalid state JSON: {e}")))?;

    if state.metadata.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(PlanCrawlError::parse(format!(
            "schema version {} is newer than supported version {CURRENT_SCHEMA_VERSION}",
            state.metadata.schema_version
        )));
    }
    state.metadata.schema_version = CURRENT_SCHEMA_VERSION;
    repair_order(&mut state);
    state.recompute_metadata();
    Ok(Some(state))
}

fn read_records(path: &Path, workers: usize) -> Result<Option<CrawlState>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| PlanCrawlError::io(path, e))?;
    let entries = plancrawl_artifacts::parse_records(&content)?;
    Ok(Some(reconstruct(entries, workers)))
}

/// Rebuild a state from exported records.
///
/// A completed plan keeps its status only when its payload survived or it
/// never had a detail page; otherwise it goes back to pending and a completed
/// parent is demoted to urls_collected.
pub fn reconstruct(entries: Vec<ZipcodeEntry>, workers: usize) -> CrawlState {
    let mut state = CrawlState::empty(workers);
    let mut reopened = 0usize;

    for mut entry in entries {
        let key = entry.zipcode.trim().to_string();
        if key.is_empty() || state.entries.contains_key(&key) {
            continue;
        }

        let mut reset = false;
        for plan in entry.plans.iter_mut() {
            let payload_lost = plan.details.as_ref().is_none_or(|d| d.is_null());
            if plan.status == PlanStatus::Completed && payload_lost && plan.details_url.is_some() {
                plan.status = PlanStatus::Pending;
                plan.details = None;
                plan.scraped_at = None;
                reset = true;
                reopened += 1;
            }
        }
        if reset && entry.status == ZipcodeStatus::Completed {
            entry.status = ZipcodeStatus::UrlsCollected;
            entry.completed_at = None;
        }

        entry.zipcode = key.clone();
        entry.index = state.order.len();
        state.order.push(key.clone());
        state.entries.insert(key, entry);
    }

    if reopened > 0 {
        warn!(reopened, "completed plans without payload reopened");
    }
    state.recompute_metadata();
    state
}

/// Make `order` and `entries` agree: unknown keys leave `order`, orphaned
/// entries are appended by their stored index.
fn repair_order(state: &mut CrawlState) {
    let mut seen = HashSet::new();
    let entries = &state.entries;
    state
        .order
        .retain(|key| entries.contains_key(key) && seen.insert(key.clone()));

    let mut orphans: Vec<&ZipcodeEntry> = state
        .entries
        .values()
        .filter(|e| !seen.contains(&e.zipcode))
        .collect();
    if orphans.is_empty() {
        return;
    }
    orphans.sort_by_key(|e| e.index);
    warn!(count = orphans.len(), "state entries missing from order, appended");
    let keys: Vec<String> = orphans.iter().map(|e| e.zipcode.clone()).collect();
    state.order.extend(keys);
    for (index, key) in state.order.clone().iter().enumerate() {
        if let Some(entry) = state.entries.get_mut(key) {
            entry.index = index;
        }
    }
}

/// Move every existing artifact into `<dir>/reset-<timestamp>/`.
/// Returns the archive directory, or `None` when there was nothing to move.
pub fn reset_artifacts(paths: &StatePaths) -> Result<Option<PathBuf>> {
    let existing = paths.existing_artifacts();
    if existing.is_empty() {
        return Ok(None);
    }

    let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let mut archive = paths.dir.join(format!("reset-{stamp}"));
    let mut suffix = 1;
    while archive.exists() {
        archive = paths.dir.join(format!("reset-{stamp}-{suffix}"));
        suffix += 1;
    }
    std::fs::create_dir_all(&archive).map_err(|e| PlanCrawlError::io(&archive, e))?;

    for path in &existing {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = archive.join(name);
        std::fs::rename(path, &target).map_err(|e| PlanCrawlError::io(path, e))?;
    }

    info!(
        archive = %archive.display(),
        files = existing.len(),
        "archived previous artifacts"
    );
    Ok(Some(archive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::persist_snapshot;
    use plancrawl_shared::{PlanEntry, PlanSummary, ZipcodeInput};
    use serde_json::json;

    fn temp_paths() -> StatePaths {
        StatePaths::new(std::env::temp_dir().join(format!(
            "pc-recovery-test-{}",
            uuid::Uuid::now_v7()
        )))
    }

    fn plan(id: &str, url: Option<&str>) -> PlanEntry {
        PlanEntry::from_summary(
            id.into(),
            PlanSummary {
                details_url: url.map(String::from),
                ..PlanSummary::default()
            },
        )
    }

    /// "A" completed with two plans, "B" errored, "C" still pending.
    fn progressed_state() -> CrawlState {
        let inputs: Vec<_> = ["A", "B", "C"].into_iter().map(ZipcodeInput::new).collect();
        let mut state = CrawlState::fresh(&inputs, 2);
        state
            .apply_discovery_success("A", vec![plan("1", Some("/p/1")), plan("2", None)])
            .unwrap();
        state.apply_discovery_failure("B", "unreachable").unwrap();
        state.settle_trivial_plans();
        state
            .apply_plan_outcome("A", "1", Ok(json!({"copay": "$0"})))
            .unwrap();
        state
    }

    #[test]
    fn fresh_when_nothing_exists() {
        let paths = temp_paths();
        let recovered = load_state(&paths, 3).unwrap();
        assert_eq!(recovered.source, RecoverySource::Fresh);
        assert!(recovered.state.order.is_empty());
        assert_eq!(recovered.state.metadata.workers, 3);
    }

    #[test]
    fn primary_wins() {
        let paths = temp_paths();
        persist_snapshot(&paths, &progressed_state()).unwrap();

        let recovered = load_state(&paths, 1).unwrap();
        assert_eq!(recovered.source, RecoverySource::Primary);
        assert_eq!(recovered.state.order, vec!["A", "B", "C"]);
        assert_eq!(recovered.state.entries["A"].status, ZipcodeStatus::Completed);
        assert_eq!(recovered.state.metadata.phase2_completed, 1);
        assert_eq!(recovered.state.metadata.workers, 2);

        let _ = std::fs::remove_dir_all(&paths.dir);
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let paths = temp_paths();
        let state = progressed_state();
        persist_snapshot(&paths, &state).unwrap();
        persist_snapshot(&paths, &state).unwrap();
        std::fs::write(&paths.state, b"{\"metadata\": tru").unwrap();

        let recovered = load_state(&paths, 1).unwrap();
        assert_eq!(recovered.source, RecoverySource::Backup);
        assert_eq!(recovered.state.order, vec!["A", "B", "C"]);

        let _ = std::fs::remove_dir_all(&paths.dir);
    }

    #[test]
    fn reconstructs_from_records_and_reopens_lost_payloads() {
        let paths = temp_paths();
        let mut state = progressed_state();
        // Payload of plan 1 lost in the export.
        if let Some(entry) = state.entries.get_mut("A") {
            entry.plans[0].details = None;
        }
        persist_snapshot(&paths, &state).unwrap();
        std::fs::remove_file(&paths.state).unwrap();

        let recovered = load_state(&paths, 1).unwrap();
        assert_eq!(recovered.source, RecoverySource::Reconstructed);

        let rebuilt = recovered.state;
        assert_eq!(rebuilt.order, vec!["A", "B", "C"]);
        let a = &rebuilt.entries["A"];
        assert_eq!(a.status, ZipcodeStatus::UrlsCollected);
        assert_eq!(a.plans[0].status, PlanStatus::Pending);
        // No detail page: stays completed.
        assert_eq!(a.plans[1].status, PlanStatus::Completed);
        assert_eq!(rebuilt.metadata.phase1_completed, 2);
        assert_eq!(rebuilt.metadata.phase2_completed, 0);
        assert_eq!(rebuilt.metadata.plans_filled, 1);
        assert!(rebuilt.metadata.phase1_finished_at.is_none());
        rebuilt.check_invariants().unwrap();

        let _ = std::fs::remove_dir_all(&paths.dir);
    }

    #[test]
    fn unusable_artifacts_are_a_recovery_error() {
        let paths = temp_paths();
        paths.ensure_dir().unwrap();
        std::fs::write(&paths.state, b"garbage").unwrap();
        std::fs::write(&paths.records, b"also garbage").unwrap();

        let err = load_state(&paths, 1).unwrap_err();
        assert!(err.is_recovery());
        let message = err.to_string();
        assert!(message.contains("crawl_state.json"));
        assert!(message.contains("--reset"));

        let _ = std::fs::remove_dir_all(&paths.dir);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let paths = temp_paths();
        let mut state = progressed_state();
        state.metadata.schema_version = CURRENT_SCHEMA_VERSION + 1;
        paths.ensure_dir().unwrap();
        std::fs::write(&paths.state, serde_json::to_vec(&state).unwrap()).unwrap();

        assert!(load_state(&paths, 1).unwrap_err().is_recovery());
        let _ = std::fs::remove_dir_all(&paths.dir);
    }

    #[test]
    fn order_is_repaired_on_load() {
        let paths = temp_paths();
        let mut state = progressed_state();
        state.order = vec!["C".into(), "ghost".into(), "A".into()];
        paths.ensure_dir().unwrap();
        std::fs::write(&paths.state, serde_json::to_vec(&state).unwrap()).unwrap();

        let loaded = load_state(&paths, 1).unwrap().state;
        assert_eq!(loaded.order, vec!["C", "A", "B"]);
        assert_eq!(loaded.entries["B"].index, 2);
        loaded.check_invariants().unwrap();

        let _ = std::fs::remove_dir_all(&paths.dir);
    }

    #[test]
    fn reset_archives_without_deleting() {
        let paths = temp_paths();
        persist_snapshot(&paths, &progressed_state()).unwrap();
        persist_snapshot(&paths, &progressed_state()).unwrap();

        let archive = reset_artifacts(&paths).unwrap().unwrap();
        assert!(paths.existing_artifacts().is_empty());
        assert!(archive.join("crawl_state.json").exists());
        assert!(archive.join("crawl_state.json.backup").exists());
        assert!(archive.join("medicare_plans.csv").exists());

        assert!(reset_artifacts(&paths).unwrap().is_none());
        assert_eq!(load_state(&paths, 1).unwrap().source, RecoverySource::Fresh);

        let _ = std::fs::remove_dir_all(&paths.dir);
    }
}
