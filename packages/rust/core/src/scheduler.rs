//! Two-phase crawl scheduling over the shared store.
//!
//! Phase 1 (discovery) collects plan listings for every pending zipcode.
//! Phase 2 (detail fill) fetches the detail payload of every pending plan
//! under a zipcode that finished phase 1 successfully. Pending work is always
//! derived from entry status, so a re-run over a finished state does nothing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use plancrawl_crawler::{
    Collaborators, Extractor, Navigator, PaginationInfo, PoolConfig, PoolReport, SessionProvider,
    TaskOutcome, TaskRunner, WorkerPool,
};
use plancrawl_shared::{
    CrawlConfig, CrawlStore, Phase, PlanCrawlError, PlanEntry, PlanTask, Result,
};
use plancrawl_storage::StateWriter;

use crate::progress::{PhaseProgress, ProgressReporter};

/// What one phase did.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: Phase,
    /// Tasks handed to the pool.
    pub scheduled: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Plans completed without a detail fetch (phase 2 only).
    pub settled: usize,
    /// The phase never started because shutdown was requested first.
    pub skipped: bool,
    pub cancelled: bool,
    pub pool: PoolReport,
    pub elapsed: Duration,
}

impl PhaseReport {
    fn skipped(phase: Phase) -> Self {
        Self {
            phase,
            scheduled: 0,
            succeeded: 0,
            failed: 0,
            settled: 0,
            skipped: true,
            cancelled: true,
            pool: PoolReport::default(),
            elapsed: Duration::ZERO,
        }
    }
}

/// Drives both phases against one store, one writer and one set of
/// collaborators.
pub struct Scheduler<P: SessionProvider> {
    store: CrawlStore,
    writer: StateWriter,
    kit: Collaborators<P>,
    pool: WorkerPool<P>,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
    /// Zipcodes this run may touch; `None` means all of them.
    scope: Option<HashSet<String>>,
}

impl<P: SessionProvider> Scheduler<P> {
    pub fn new(
        store: CrawlStore,
        writer: StateWriter,
        kit: Collaborators<P>,
        config: &CrawlConfig,
        cancel: CancellationToken,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        let pool = WorkerPool::new(
            Arc::clone(&kit.sessions),
            PoolConfig::from(config),
            cancel.clone(),
        );
        Self {
            store,
            writer,
            kit,
            pool,
            cancel,
            progress,
            scope: None,
        }
    }

    /// Restrict scheduling to `zipcodes`. Entries outside the scope keep
    /// their state untouched.
    pub fn with_scope(mut self, zipcodes: impl IntoIterator<Item = String>) -> Self {
        self.scope = Some(zipcodes.into_iter().collect());
        self
    }

    fn in_scope(&self, zipcode: &str) -> bool {
        self.scope.as_ref().is_none_or(|scope| scope.contains(zipcode))
    }

    /// Phase 1 then phase 2. Phase 2 is skipped when shutdown was requested.
    pub async fn run(&self) -> Result<(PhaseReport, PhaseReport)> {
        let discovery = self.run_discovery().await?;
        let detail = if self.cancel.is_cancelled() {
            info!("shutdown requested, skipping detail phase");
            let report = PhaseReport::skipped(Phase::DetailFill);
            self.progress.phase_finished(&report);
            report
        } else {
            self.run_detail_fill().await?
        };
        Ok((discovery, detail))
    }

    /// Phase 1 over every pending zipcode.
    #[instrument(skip_all, fields(phase = "discovery"))]
    pub async fn run_discovery(&self) -> Result<PhaseReport> {
        let started = Instant::now();
        let mut zipcodes = self.store.pending_zipcodes();
        zipcodes.retain(|zipcode| self.in_scope(zipcode));
        let total = zipcodes.len();
        info!(pending = total, "phase 1 starting");
        self.progress.phase_started(Phase::Discovery, total);

        let runner = Arc::new(DiscoveryTask {
            navigator: Arc::clone(&self.kit.navigator),
            extractor: Arc::clone(&self.kit.extractor),
            pagination: Arc::clone(&self.kit.pagination),
        });

        let mut tracker = PhaseProgress::new(Phase::Discovery, total);
        let pool = self
            .pool
            .run(runner, zipcodes, |outcome: TaskOutcome<Vec<PlanEntry>>| {
                let succeeded = outcome.result.is_ok();
                let applied = match outcome.result {
                    Ok(plans) => {
                        let found = plans.len();
                        self.store
                            .apply_discovery_success(&outcome.key, plans)
                            .inspect(|()| info!(zipcode = %outcome.key, plans = found, "urls collected"))
                    }
                    Err(ref message) => self.store.apply_discovery_failure(&outcome.key, message),
                };
                self.after_outcome(&mut tracker, &outcome.key, succeeded, applied, outcome.attempts, outcome.elapsed);
            })
            .await;

        self.finish_phase(Phase::Discovery, total, 0, pool, started).await
    }

    /// Phase 2 over every pending plan with a detail location.
    #[instrument(skip_all, fields(phase = "detail_fill"))]
    pub async fn run_detail_fill(&self) -> Result<PhaseReport> {
        let started = Instant::now();

        let settled = self.store.settle_trivial_plans_in(|zip| self.in_scope(zip));
        if settled > 0 {
            self.writer.request_save();
        }

        let mut tasks = self.store.pending_plans();
        tasks.retain(|task| self.in_scope(&task.zipcode));
        let total = tasks.len();
        info!(pending = total, settled, "phase 2 starting");
        self.progress.phase_started(Phase::DetailFill, total);

        let by_key: HashMap<String, (String, String)> = tasks
            .iter()
            .map(|t| (t.key(), (t.zipcode.clone(), t.plan_id.clone())))
            .collect();
        let runner = Arc::new(DetailTask {
            navigator: Arc::clone(&self.kit.navigator),
            extractor: Arc::clone(&self.kit.extractor),
        });

        let mut tracker = PhaseProgress::new(Phase::DetailFill, total);
        let pool = self
            .pool
            .run(runner, tasks, |outcome: TaskOutcome<serde_json::Value>| {
                let succeeded = outcome.result.is_ok();
                let applied = match by_key.get(&outcome.key) {
                    Some((zipcode, plan_id)) => self
                        .store
                        .apply_plan_outcome(zipcode, plan_id, outcome.result)
                        .map(|_| ()),
                    None => Err(PlanCrawlError::validation(format!(
                        "outcome for unscheduled task '{}'",
                        outcome.key
                    ))),
                };
                self.after_outcome(&mut tracker, &outcome.key, succeeded, applied, outcome.attempts, outcome.elapsed);
            })
            .await;

        self.finish_phase(Phase::DetailFill, total, settled, pool, started).await
    }

    fn after_outcome(
        &self,
        tracker: &mut PhaseProgress,
        key: &str,
        succeeded: bool,
        applied: Result<()>,
        attempts: u32,
        elapsed: Duration,
    ) {
        if let Err(e) = applied {
            warn!(%key, attempts, error = %e, "outcome not applied");
        }
        self.writer.request_save();
        let update = tracker.record(key, succeeded, elapsed);
        self.progress.task_finished(&update);
    }

    async fn finish_phase(
        &self,
        phase: Phase,
        scheduled: usize,
        settled: usize,
        pool: PoolReport,
        started: Instant,
    ) -> Result<PhaseReport> {
        let cancelled = pool.cancelled || self.cancel.is_cancelled();
        if !cancelled && self.scope.is_none() {
            self.store.mark_phase_finished(phase);
        }
        if let Err(e) = self.writer.save_now().await {
            warn!(%phase, error = %e, "phase boundary save failed, will retry");
        }

        let counts = self.store.pending_counts();
        let report = PhaseReport {
            phase,
            scheduled,
            succeeded: pool.succeeded,
            failed: pool.failed,
            settled,
            skipped: false,
            cancelled,
            pool,
            elapsed: started.elapsed(),
        };
        info!(
            %phase,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled,
            pending_zipcodes = counts.zipcodes,
            pending_plans = counts.plans,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "phase finished"
        );
        self.progress.phase_finished(&report);
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Task runners
// ---------------------------------------------------------------------------

/// Phase 1: reach a zipcode's results and read every result page.
struct DiscoveryTask<S> {
    navigator: Arc<dyn Navigator<S>>,
    extractor: Arc<dyn Extractor<S>>,
    pagination: Arc<dyn PaginationInfo<S>>,
}

#[async_trait]
impl<S: Send + 'static> TaskRunner<S> for DiscoveryTask<S> {
    type Item = String;
    type Output = Vec<PlanEntry>;

    fn key(&self, zipcode: &String) -> String {
        zipcode.clone()
    }

    async fn attempt(&self, session: &mut S, zipcode: &String) -> Result<Vec<PlanEntry>> {
        if !self.navigator.reach_results_view(session, zipcode).await? {
            return Err(PlanCrawlError::collaborator(format!(
                "results view unreachable for {zipcode}"
            )));
        }

        let counts = self.pagination.read(session).await?;
        let pages = counts.page_count.max(1);

        let mut seen = HashSet::new();
        let mut plans = Vec::new();
        for page in 1..=pages {
            if page > 1 && !self.navigator.next_results_page(session, page).await? {
                return Err(PlanCrawlError::collaborator(format!(
                    "result page {page} of {pages} unreachable for {zipcode}"
                )));
            }
            let summaries = self.extractor.read_result_page(session).await?;
            for (position, summary) in summaries.into_iter().enumerate() {
                let id = summary
                    .plan_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map_or_else(|| format!("p{page}-{}", position + 1), String::from);
                if seen.insert(id.clone()) {
                    plans.push(PlanEntry::from_summary(id, summary));
                }
            }
        }

        if counts.item_count > 0 && plans.len() != counts.item_count {
            debug!(
                %zipcode,
                expected = counts.item_count,
                found = plans.len(),
                "plan count differs from pagination summary"
            );
        }
        Ok(plans)
    }
}

/// Phase 2: open one plan's detail page and read its payload.
struct DetailTask<S> {
    navigator: Arc<dyn Navigator<S>>,
    extractor: Arc<dyn Extractor<S>>,
}

#[async_trait]
impl<S: Send + 'static> TaskRunner<S> for DetailTask<S> {
    type Item = PlanTask;
    type Output = serde_json::Value;

    fn key(&self, task: &PlanTask) -> String {
        task.key()
    }

    async fn attempt(&self, session: &mut S, task: &PlanTask) -> Result<serde_json::Value> {
        if !self.navigator.reach_detail_view(session, &task.details_url).await? {
            return Err(PlanCrawlError::collaborator(format!(
                "detail view unreachable: {}",
                task.details_url
            )));
        }
        self.extractor.read_detail_page(session).await
    }
}
