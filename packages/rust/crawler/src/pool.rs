//! Bounded-concurrency task runner.
//!
//! One pool run executes one batch of keyed work items with at most
//! `workers` tasks in flight. Each task holds one session for its lifetime,
//! retries with capped exponential backoff, and bounds every attempt with a
//! hard timeout. The pool reports raw outcomes; callers decide what they mean.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use plancrawl_shared::{CrawlConfig, PlanCrawlError, Result};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::collaborators::SessionProvider;

/// The per-item work a pool run executes.
#[async_trait]
pub trait TaskRunner<S: Send>: Send + Sync + 'static {
    type Item: Send + Sync + 'static;
    type Output: Send + 'static;

    /// Ownership key; two items with the same key never run together.
    fn key(&self, item: &Self::Item) -> String;

    /// One attempt. Errors are retried until the attempt budget runs out.
    async fn attempt(&self, session: &mut S, item: &Self::Item) -> Result<Self::Output>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub task_timeout: Duration,
    /// Delay before each task starts.
    pub pacing: Duration,
    pub backoff: Backoff,
    /// How long in-flight tasks may run after cancellation.
    pub shutdown_grace: Duration,
}

impl From<&CrawlConfig> for PoolConfig {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_attempts: config.max_attempts.max(1),
            task_timeout: config.task_timeout,
            pacing: config.pacing,
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            shutdown_grace: config.shutdown_grace,
        }
    }
}

/// Result of one task, after all its attempts.
#[derive(Debug)]
pub struct TaskOutcome<T> {
    pub key: String,
    /// Last error message when every attempt failed.
    pub result: std::result::Result<T, String>,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Totals for one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Items dropped because their key was already in the batch.
    pub duplicates: usize,
    /// Items never started because of cancellation.
    pub not_started: usize,
    /// Tasks aborted after the shutdown grace period.
    pub aborted: usize,
    /// Tasks that stopped retrying because of cancellation (no outcome
    /// reported; their items stay pending).
    pub abandoned: usize,
    /// Tasks that panicked (no outcome reported).
    pub panicked: usize,
    pub cancelled: bool,
}

/// Runs keyed work items with bounded concurrency.
pub struct WorkerPool<P: SessionProvider> {
    sessions: Arc<P>,
    config: PoolConfig,
    cancel: CancellationToken,
}

impl<P: SessionProvider> WorkerPool<P> {
    pub fn new(sessions: Arc<P>, config: PoolConfig, cancel: CancellationToken) -> Self {
        Self {
            sessions,
            config,
            cancel,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Execute `items`, calling `on_outcome` once per finished task, one at a
    /// time, in completion order.
    pub async fn run<R, F>(&self, runner: Arc<R>, items: Vec<R::Item>, mut on_outcome: F) -> PoolReport
    where
        R: TaskRunner<P::Session>,
        F: FnMut(TaskOutcome<R::Output>),
    {
        let mut report = PoolReport::default();
        let mut seen = HashSet::with_capacity(items.len());
        let mut queue: VecDeque<(String, R::Item)> = VecDeque::with_capacity(items.len());
        for item in items {
            let key = runner.key(&item);
            if seen.insert(key.clone()) {
                queue.push_back((key, item));
            } else {
                debug!(%key, "duplicate key dropped from batch");
                report.duplicates += 1;
            }
        }

        info!(
            tasks = queue.len(),
            workers = self.config.workers,
            max_attempts = self.config.max_attempts,
            "pool run starting"
        );

        let mut join_set: JoinSet<Option<TaskOutcome<R::Output>>> = JoinSet::new();

        loop {
            while join_set.len() < self.config.workers && !self.cancel.is_cancelled() {
                let Some((key, item)) = queue.pop_front() else {
                    break;
                };
                join_set.spawn(execute(
                    Arc::clone(&runner),
                    Arc::clone(&self.sessions),
                    self.config.clone(),
                    self.cancel.clone(),
                    key,
                    item,
                ));
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    report.cancelled = true;
                    self.drain(&mut join_set, &mut report, &mut on_outcome).await;
                    break;
                }
                Some(joined) = join_set.join_next() => {
                    record(joined, &mut report, &mut on_outcome);
                }
            }
        }

        report.not_started = queue.len();
        if self.cancel.is_cancelled() {
            report.cancelled = true;
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            not_started = report.not_started,
            aborted = report.aborted,
            abandoned = report.abandoned,
            cancelled = report.cancelled,
            "pool run finished"
        );
        report
    }

    /// Let in-flight tasks finish within the grace period, abort the rest.
    async fn drain<T, F>(
        &self,
        join_set: &mut JoinSet<Option<TaskOutcome<T>>>,
        report: &mut PoolReport,
        on_outcome: &mut F,
    ) where
        T: Send + 'static,
        F: FnMut(TaskOutcome<T>),
    {
        info!(
            in_flight = join_set.len(),
            grace_secs = self.config.shutdown_grace.as_secs(),
            "cancellation requested, draining in-flight tasks"
        );

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = join_set.join_next().await {
                record(joined, report, on_outcome);
            }
        })
        .await;

        if drained.is_err() {
            report.aborted = join_set.len();
            warn!(aborted = report.aborted, "grace period elapsed, aborting tasks");
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }
    }
}

fn record<T, F>(
    joined: std::result::Result<Option<TaskOutcome<T>>, JoinError>,
    report: &mut PoolReport,
    on_outcome: &mut F,
) where
    F: FnMut(TaskOutcome<T>),
{
    match joined {
        Ok(None) => report.abandoned += 1,
        Ok(Some(outcome)) => {
            if outcome.result.is_ok() {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
            on_outcome(outcome);
        }
        Err(e) if e.is_cancelled() => report.aborted += 1,
        Err(e) => {
            warn!(error = %e, "task panicked");
            report.panicked += 1;
        }
    }
}

/// One task: acquire a session, attempt until success or budget exhausted,
/// release the session. `None` when cancellation cut the retries short.
async fn execute<P, R>(
    runner: Arc<R>,
    sessions: Arc<P>,
    config: PoolConfig,
    cancel: CancellationToken,
    key: String,
    item: R::Item,
) -> Option<TaskOutcome<R::Output>>
where
    P: SessionProvider,
    R: TaskRunner<P::Session>,
{
    if !config.pacing.is_zero() {
        tokio::time::sleep(config.pacing).await;
    }

    let started = Instant::now();
    let mut session = SessionGuard::new(sessions);
    let mut attempts = 0u32;

    let result: Option<std::result::Result<R::Output, String>> = loop {
        attempts += 1;

        let attempt = async {
            let current = session.get().await?;
            runner.attempt(current, &item).await
        };
        let error = match tokio::time::timeout(config.task_timeout, attempt).await {
            Ok(Ok(output)) => break Some(Ok(output)),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}s", config.task_timeout.as_secs()),
        };

        if attempts >= config.max_attempts {
            break Some(Err(error));
        }
        if cancel.is_cancelled() {
            debug!(%key, attempts, error = %error, "retry abandoned on shutdown");
            break None;
        }

        let delay = config.backoff.delay(attempts - 1);
        debug!(%key, attempts, delay_ms = delay.as_millis() as u64, error = %error, "attempt failed, retrying");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                debug!(%key, attempts, error = %error, "retry abandoned on shutdown");
                break None;
            }
        }
    };

    session.release().await;

    let result = result?;
    if let Err(e) = &result {
        warn!(%key, attempts, error = %e, "task failed");
    }

    Some(TaskOutcome {
        key,
        result,
        attempts,
        elapsed: started.elapsed(),
    })
}

/// A task's session, acquired lazily and kept across attempts.
///
/// Dropping the guard while it still holds a session (abort after the grace
/// period, a panicking runner) hands the session back on a spawned task.
struct SessionGuard<P: SessionProvider> {
    sessions: Arc<P>,
    session: Option<P::Session>,
}

impl<P: SessionProvider> SessionGuard<P> {
    fn new(sessions: Arc<P>) -> Self {
        Self {
            sessions,
            session: None,
        }
    }

    async fn get(&mut self) -> Result<&mut P::Session> {
        if self.session.is_none() {
            self.session = Some(self.sessions.acquire().await?);
        }
        self.session
            .as_mut()
            .ok_or_else(|| PlanCrawlError::collaborator("no session available"))
    }

    async fn release(mut self) {
        if let Some(session) = self.session.take() {
            self.sessions.release(session).await;
        }
    }
}

impl<P: SessionProvider> Drop for SessionGuard<P> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let sessions = Arc::clone(&self.sessions);
                handle.spawn(async move { sessions.release(session).await });
            }
            Err(_) => warn!("no runtime left to release a session, dropping it"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSessions {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    #[async_trait]
    impl SessionProvider for CountingSessions {
        type Session = usize;

        async fn acquire(&self) -> Result<usize> {
            Ok(self.acquired.fetch_add(1, Ordering::SeqCst))
        }

        async fn release(&self, _session: usize) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Fails each key `failures[key]` times, sleeps `delay`, records overlap.
    #[derive(Default)]
    struct ScriptedRunner {
        failures: HashMap<String, u32>,
        delay: Duration,
        calls: Mutex<HashMap<String, u32>>,
        running: Mutex<HashSet<String>>,
        overlap: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner<usize> for ScriptedRunner {
        type Item = String;
        type Output = String;

        fn key(&self, item: &String) -> String {
            item.clone()
        }

        async fn attempt(&self, _session: &mut usize, item: &String) -> Result<String> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(item.clone()).or_default();
                *n += 1;
                *n
            };
            {
                let mut running = self.running.lock().unwrap();
                if !running.insert(item.clone()) {
                    self.overlap.fetch_add(1, Ordering::SeqCst);
                }
                self.peak.fetch_max(running.len(), Ordering::SeqCst);
            }
            tokio::time::sleep(self.delay).await;
            self.running.lock().unwrap().remove(item);

            if call <= self.failures.get(item).copied().unwrap_or(0) {
                return Err(PlanCrawlError::collaborator(format!("{item} failed #{call}")));
            }
            Ok(format!("done {item}"))
        }
    }

    fn config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            max_attempts: 3,
            task_timeout: Duration::from_secs(5),
            pacing: Duration::ZERO,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
            shutdown_grace: Duration::from_millis(200),
        }
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("k{i}")).collect()
    }

    #[tokio::test]
    async fn runs_every_item_within_worker_bound() {
        let sessions = Arc::new(CountingSessions::default());
        let pool = WorkerPool::new(sessions.clone(), config(3), CancellationToken::new());
        let runner = Arc::new(ScriptedRunner {
            delay: Duration::from_millis(10),
            ..ScriptedRunner::default()
        });

        let mut outcomes = Vec::new();
        let report = pool.run(runner.clone(), keys(10), |o| outcomes.push(o)).await;

        assert_eq!(report.succeeded, 10);
        assert_eq!(outcomes.len(), 10);
        assert!(runner.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(runner.overlap.load(Ordering::SeqCst), 0);
        assert_eq!(sessions.acquired.load(Ordering::SeqCst), 10);
        assert_eq!(sessions.released.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn duplicate_keys_never_run_twice() {
        let sessions = Arc::new(CountingSessions::default());
        let pool = WorkerPool::new(sessions, config(4), CancellationToken::new());
        let runner = Arc::new(ScriptedRunner {
            delay: Duration::from_millis(20),
            ..ScriptedRunner::default()
        });

        let items = vec!["a".to_string(), "a".into(), "b".into(), "a".into()];
        let report = pool.run(runner.clone(), items, |_| {}).await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.duplicates, 2);
        assert_eq!(runner.calls.lock().unwrap()["a"], 1);
        assert_eq!(runner.overlap.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_until_success_or_budget() {
        let sessions = Arc::new(CountingSessions::default());
        let pool = WorkerPool::new(sessions.clone(), config(2), CancellationToken::new());
        let runner = Arc::new(ScriptedRunner {
            failures: HashMap::from([("flaky".to_string(), 2), ("broken".to_string(), 9)]),
            ..ScriptedRunner::default()
        });

        let mut outcomes = HashMap::new();
        let report = pool
            .run(runner, vec!["flaky".into(), "broken".into()], |o| {
                outcomes.insert(o.key.clone(), o);
            })
            .await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(outcomes["flaky"].attempts, 3);
        assert!(outcomes["flaky"].result.is_ok());
        assert_eq!(outcomes["broken"].attempts, 3);
        assert_eq!(outcomes["broken"].result.as_ref().unwrap_err(), "collaborator error: broken failed #3");
        // One session per task, reused across attempts.
        assert_eq!(sessions.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(sessions.released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_counts_as_failed_attempt_and_releases_session() {
        let sessions = Arc::new(CountingSessions::default());
        let mut cfg = config(1);
        cfg.task_timeout = Duration::from_millis(20);
        cfg.max_attempts = 2;
        let pool = WorkerPool::new(sessions.clone(), cfg, CancellationToken::new());
        let runner = Arc::new(ScriptedRunner {
            delay: Duration::from_secs(5),
            ..ScriptedRunner::default()
        });

        let mut outcomes = Vec::new();
        pool.run(runner, vec!["slow".into()], |o| outcomes.push(o)).await;

        assert_eq!(outcomes[0].attempts, 2);
        assert!(outcomes[0].result.as_ref().unwrap_err().contains("timed out"));
        assert_eq!(sessions.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_spawning_and_aborts_after_grace() {
        let sessions = Arc::new(CountingSessions::default());
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(sessions, config(2), cancel.clone());
        let runner = Arc::new(ScriptedRunner {
            delay: Duration::from_secs(5),
            ..ScriptedRunner::default()
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let mut outcomes = Vec::new();
        let report = pool.run(runner, keys(6), |o| outcomes.push(o)).await;

        assert!(report.cancelled);
        assert_eq!(report.not_started, 4);
        assert_eq!(report.aborted, 2);
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn aborted_tasks_still_release_their_sessions() {
        let sessions = Arc::new(CountingSessions::default());
        let cancel = CancellationToken::new();
        let mut cfg = config(2);
        cfg.shutdown_grace = Duration::from_millis(50);
        let pool = WorkerPool::new(sessions.clone(), cfg, cancel.clone());
        let runner = Arc::new(ScriptedRunner {
            delay: Duration::from_secs(5),
            ..ScriptedRunner::default()
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = pool.run(runner, keys(2), |_| {}).await;
        assert_eq!(report.aborted, 2);

        // Releases of aborted tasks run on their own spawned tasks.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sessions.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(sessions.released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_runner_releases_its_session() {
        struct Panicky;

        #[async_trait]
        impl TaskRunner<usize> for Panicky {
            type Item = String;
            type Output = ();

            fn key(&self, item: &String) -> String {
                item.clone()
            }

            async fn attempt(&self, _session: &mut usize, item: &String) -> Result<()> {
                panic!("runner blew up on {item}");
            }
        }

        let sessions = Arc::new(CountingSessions::default());
        let pool = WorkerPool::new(sessions.clone(), config(1), CancellationToken::new());

        let report = pool.run(Arc::new(Panicky), vec!["boom".to_string()], |_| {}).await;
        assert_eq!(report.panicked, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sessions.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(sessions.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_abandons_instead_of_failing() {
        let sessions = Arc::new(CountingSessions::default());
        let cancel = CancellationToken::new();
        let mut cfg = config(1);
        cfg.backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(5));
        let pool = WorkerPool::new(sessions.clone(), cfg, cancel.clone());
        let runner = Arc::new(ScriptedRunner {
            failures: HashMap::from([("flaky".to_string(), 1)]),
            ..ScriptedRunner::default()
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let mut outcomes = Vec::new();
        let report = pool.run(runner, vec!["flaky".into()], |o| outcomes.push(o)).await;

        assert_eq!(report.abandoned, 1);
        assert_eq!(report.failed, 0);
        assert!(outcomes.is_empty());
        assert_eq!(sessions.released.load(Ordering::SeqCst), 1);
    }
}
