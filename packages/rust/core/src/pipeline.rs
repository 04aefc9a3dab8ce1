//! End-to-end runs over one output directory: recover → merge → crawl → save.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use plancrawl_crawler::{Collaborators, SessionProvider};
use plancrawl_shared::{
    CrawlConfig, CrawlMetadata, CrawlState, CrawlStore, PendingCounts, PlanCrawlError, PlanStatus,
    Result, ZipcodeInput, ZipcodeStatus,
};
use plancrawl_storage::{
    RecoverySource, StatePaths, StateWriter, WriterStats, load_state, reset_artifacts,
    write_exports,
};

use crate::progress::ProgressReporter;
use crate::scheduler::{PhaseReport, Scheduler};
use crate::shutdown::ShutdownCoordinator;

/// Lower bound on how long the final save may take.
const MIN_FINAL_SAVE_WAIT: Duration = Duration::from_secs(10);

/// Result of [`run_crawl`].
#[derive(Debug)]
pub struct RunSummary {
    pub output_dir: PathBuf,
    pub source: RecoverySource,
    /// Where `--reset` moved the previous artifacts, if anything existed.
    pub archived: Option<PathBuf>,
    /// Zipcodes this run was allowed to schedule.
    pub scoped: usize,
    pub discovery: PhaseReport,
    pub detail: PhaseReport,
    pub metadata: CrawlMetadata,
    pub pending: PendingCounts,
    pub writer: WriterStats,
    /// The final save did not complete; the last debounced flush stands.
    pub final_save_failed: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn interrupted(&self) -> bool {
        self.discovery.cancelled || self.detail.cancelled
    }

    /// Another run would have work to do (retries, or an interrupted phase).
    pub fn has_remaining_work(&self) -> bool {
        self.pending.zipcodes > 0 || self.pending.plans > 0
    }
}

/// Crawl `inputs` into `config.output_dir`, resuming whatever is on disk.
///
/// Every input row becomes (or stays) a state entry; `config.limit` only
/// restricts which of them this run schedules.
#[instrument(skip_all, fields(output = %config.output_dir.display(), workers = config.workers))]
pub async fn run_crawl<P: SessionProvider>(
    config: &CrawlConfig,
    inputs: Vec<ZipcodeInput>,
    kit: Collaborators<P>,
    shutdown: &ShutdownCoordinator,
    progress: Arc<dyn ProgressReporter>,
) -> Result<RunSummary> {
    let started = Instant::now();
    config.validate()?;
    if inputs.is_empty() {
        return Err(PlanCrawlError::validation("input contains no zipcodes"));
    }

    let paths = StatePaths::new(&config.output_dir);
    paths.ensure_dir()?;

    let archived = if config.reset {
        let archived = reset_artifacts(&paths)?;
        if let Some(dir) = &archived {
            info!(archive = %dir.display(), "previous artifacts archived");
        }
        archived
    } else {
        None
    };

    let recovered = load_state(&paths, config.workers)?;
    info!(source = recovered.source.label(), entries = recovered.state.entries.len(), "state loaded");

    let store = CrawlStore::new(recovered.state);
    store.merge(&inputs);
    store.set_workers(config.workers);

    let scope: Option<Vec<String>> = config
        .limit
        .map(|limit| store.with_state(|s| s.order.iter().take(limit).cloned().collect()));
    let scoped = scope.as_ref().map_or_else(|| store.len(), Vec::len);

    let (writer, handle) = StateWriter::spawn(store.clone(), paths.clone(), config.save_debounce);

    // Persist the merged state before any task runs; an unwritable output
    // directory should fail now, not after an hour of crawling.
    if let Err(e) = writer.save_now().await {
        stop_writer(&writer, handle, MIN_FINAL_SAVE_WAIT).await;
        return Err(e);
    }

    let mut scheduler = Scheduler::new(
        store.clone(),
        writer.clone(),
        kit,
        config,
        shutdown.token(),
        progress,
    );
    if let Some(scope) = scope {
        info!(limit = scope.len(), "scheduling limited to the first input rows");
        scheduler = scheduler.with_scope(scope);
    }

    let phases = scheduler.run().await;

    let final_save_failed =
        !stop_writer(&writer, handle, config.shutdown_grace.max(MIN_FINAL_SAVE_WAIT)).await;

    let (discovery, detail) = phases?;
    let (metadata, pending) = store.with_state(|s| (s.metadata.clone(), s.pending_counts()));

    let summary = RunSummary {
        output_dir: config.output_dir.clone(),
        source: recovered.source,
        archived,
        scoped,
        discovery,
        detail,
        metadata,
        pending,
        writer: writer.stats(),
        final_save_failed,
        elapsed: started.elapsed(),
    };
    info!(
        pending_zipcodes = summary.pending.zipcodes,
        pending_plans = summary.pending.plans,
        interrupted = summary.interrupted(),
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "run finished"
    );
    Ok(summary)
}

/// Final flush plus join of the actor, both bounded by `wait`. Returns whether
/// the final flush succeeded. A writer stuck in a flush is detached.
async fn stop_writer(writer: &StateWriter, handle: JoinHandle<()>, wait: Duration) -> bool {
    match writer.shutdown(wait).await {
        Ok(()) => join_bounded(handle, wait).await,
        Err(e) => {
            warn!(error = %e, "final save failed, detaching state writer");
            false
        }
    }
}

/// Wait at most `wait` for `handle`; on expiry the task is left detached.
async fn join_bounded(handle: JoinHandle<()>, wait: Duration) -> bool {
    match tokio::time::timeout(wait, handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "state writer task ended abnormally");
            false
        }
        Err(_) => {
            warn!(wait_ms = wait.as_millis() as u64, "state writer did not stop in time, detaching it");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Offline commands
// ---------------------------------------------------------------------------

/// Entry and plan counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub zipcodes_pending: usize,
    pub zipcodes_collected: usize,
    pub zipcodes_completed: usize,
    pub zipcodes_error: usize,
    pub plans_pending: usize,
    pub plans_completed: usize,
    pub plans_error: usize,
}

impl StatusCounts {
    pub fn of(state: &CrawlState) -> Self {
        let mut counts = Self::default();
        for entry in state.entries.values() {
            match entry.status {
                ZipcodeStatus::Pending => counts.zipcodes_pending += 1,
                ZipcodeStatus::UrlsCollected => counts.zipcodes_collected += 1,
                ZipcodeStatus::Completed => counts.zipcodes_completed += 1,
                ZipcodeStatus::Error => counts.zipcodes_error += 1,
            }
            for plan in &entry.plans {
                match plan.status {
                    PlanStatus::Pending => counts.plans_pending += 1,
                    PlanStatus::Completed => counts.plans_completed += 1,
                    PlanStatus::Error => counts.plans_error += 1,
                }
            }
        }
        counts
    }
}

/// What `status` reports about an output directory.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub source: RecoverySource,
    pub metadata: CrawlMetadata,
    pub counts: StatusCounts,
    pub pending: PendingCounts,
}

/// View of the state under `output_dir`. The state file is not rewritten.
pub fn crawl_status(output_dir: &Path) -> Result<StatusReport> {
    let recovered = load_existing(output_dir)?;
    let state = &recovered.state;
    Ok(StatusReport {
        source: recovered.source,
        metadata: state.metadata.clone(),
        counts: StatusCounts::of(state),
        pending: state.pending_counts(),
    })
}

/// Re-render every export from the persisted state. Returns the entry count.
#[instrument(skip_all, fields(output = %output_dir.display()))]
pub fn export_state(output_dir: &Path) -> Result<usize> {
    let recovered = load_existing(output_dir)?;
    let paths = StatePaths::new(output_dir);
    write_exports(&paths, &recovered.state)?;
    info!(
        source = recovered.source.label(),
        entries = recovered.state.entries.len(),
        "exports rewritten"
    );
    Ok(recovered.state.entries.len())
}

fn load_existing(output_dir: &Path) -> Result<plancrawl_storage::Recovered> {
    let paths = StatePaths::new(output_dir);
    let recovered = load_state(&paths, 0)?;
    if recovered.source == RecoverySource::Fresh {
        return Err(PlanCrawlError::recovery(format!(
            "no crawl state found in {}",
            output_dir.display()
        )));
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use crate::scheduler::tests::{FakeSite, kit, summary, test_config};
    use plancrawl_storage::{DETAIL_FILE, RECORDS_FILE, STATE_FILE, SUMMARY_FILE};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("pc-pipeline-test-{}", uuid::Uuid::now_v7()))
    }

    fn site() -> FakeSite {
        let mut site = FakeSite::default();
        site.results.insert(
            "10001".into(),
            vec![vec![
                summary(Some("H1"), Some("/h1")),
                summary(Some("H2"), Some("/h2")),
            ]],
        );
        site.results.insert("10002".into(), vec![vec![summary(Some("H3"), None)]]);
        site.details.insert("/h1".into(), json!({ "title": "One", "premium": "$0" }));
        site.details.insert("/h2".into(), json!({ "title": "Two" }));
        site
    }

    fn inputs() -> Vec<ZipcodeInput> {
        ["10001", "10002"].into_iter().map(ZipcodeInput::new).collect()
    }

    fn read_exports(dir: &Path) -> Vec<Vec<u8>> {
        [RECORDS_FILE, SUMMARY_FILE, DETAIL_FILE]
            .iter()
            .map(|f| std::fs::read(dir.join(f)).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn full_run_then_resume_does_no_work() {
        let dir = temp_dir();
        let config = test_config(&dir);
        let shutdown = ShutdownCoordinator::new();

        let (first_kit, first_site) = kit(site());
        let first = run_crawl(&config, inputs(), first_kit, &shutdown, Arc::new(SilentProgress))
            .await
            .unwrap();
        assert_eq!(first.source, RecoverySource::Fresh);
        assert!(!first.interrupted());
        assert!(!first.has_remaining_work());
        assert_eq!(first.metadata.plans_filled, 3);
        assert!(first.writer.flushes >= 2);
        assert!(first_site.calls.load(Ordering::SeqCst) > 0);

        let exports_before = read_exports(&dir);

        let (second_kit, second_site) = kit(site());
        let second = run_crawl(&config, inputs(), second_kit, &shutdown, Arc::new(SilentProgress))
            .await
            .unwrap();
        assert_eq!(second.source, RecoverySource::Primary);
        assert_eq!(second_site.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.discovery.scheduled + second.detail.scheduled, 0);

        // Entry timestamps are untouched by a no-op run, so exports match.
        assert_eq!(exports_before, read_exports(&dir));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn limit_schedules_only_the_first_rows() {
        let dir = temp_dir();
        let mut config = test_config(&dir);
        config.limit = Some(1);

        let (kit, _) = kit(site());
        let summary = run_crawl(&config, inputs(), kit, &ShutdownCoordinator::new(), Arc::new(SilentProgress))
            .await
            .unwrap();
        assert_eq!(summary.scoped, 1);
        assert_eq!(summary.metadata.total_zipcodes, 2);
        assert_eq!(summary.pending.zipcodes, 1);
        assert!(summary.has_remaining_work());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn reset_archives_previous_artifacts() {
        let dir = temp_dir();
        let mut config = test_config(&dir);
        let (first_kit, _) = kit(site());
        run_crawl(&config, inputs(), first_kit, &ShutdownCoordinator::new(), Arc::new(SilentProgress))
            .await
            .unwrap();

        config.reset = true;
        let (second_kit, second_site) = kit(site());
        let summary = run_crawl(&config, inputs(), second_kit, &ShutdownCoordinator::new(), Arc::new(SilentProgress))
            .await
            .unwrap();
        assert_eq!(summary.source, RecoverySource::Fresh);
        let archive = summary.archived.expect("archive directory");
        assert!(archive.join(STATE_FILE).exists());
        assert!(second_site.calls.load(Ordering::SeqCst) > 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn stuck_writer_join_is_bounded() {
        let stuck = tokio::spawn(std::future::pending::<()>());
        let started = Instant::now();
        assert!(!join_bounded(stuck, Duration::from_millis(30)).await);
        assert!(started.elapsed() < Duration::from_secs(2));

        let finished = tokio::spawn(async {});
        assert!(join_bounded(finished, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn stop_writer_reports_a_clean_shutdown() {
        let dir = temp_dir();
        let store = CrawlStore::new(CrawlState::fresh(&inputs(), 1));
        let (writer, handle) =
            StateWriter::spawn(store, StatePaths::new(&dir), Duration::from_millis(20));

        assert!(stop_writer(&writer, handle, Duration::from_secs(5)).await);
        assert!(writer.is_closed());
        assert!(dir.join(STATE_FILE).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let dir = temp_dir();
        let (kit, _) = kit(site());
        let err = run_crawl(&test_config(&dir), Vec::new(), kit, &ShutdownCoordinator::new(), Arc::new(SilentProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanCrawlError::Validation { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn status_and_export_read_persisted_state() {
        let dir = temp_dir();
        assert!(crawl_status(&dir).unwrap_err().is_recovery());

        let (kit, _) = kit(site());
        run_crawl(&test_config(&dir), inputs(), kit, &ShutdownCoordinator::new(), Arc::new(SilentProgress))
            .await
            .unwrap();

        let report = crawl_status(&dir).unwrap();
        assert_eq!(report.counts.zipcodes_completed, 2);
        assert_eq!(report.counts.plans_completed, 3);
        assert_eq!(report.pending, PendingCounts::default());

        std::fs::remove_file(dir.join(DETAIL_FILE)).unwrap();
        assert_eq!(export_state(&dir).unwrap(), 2);
        assert!(dir.join(DETAIL_FILE).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
