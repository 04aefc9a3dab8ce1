//! Debounced single-writer persistence actor.
//!
//! All file writes for one output directory go through one background task.
//! Callers signal "state changed" with [`StateWriter::request_save`]; requests
//! landing inside the debounce window collapse into a single flush.
//! [`StateWriter::save_now`] flushes immediately and waits for the result.
//! [`StateWriter::shutdown`] performs a final flush and closes the writer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use plancrawl_shared::{CrawlState, CrawlStore, PlanCrawlError, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::paths::StatePaths;

const QUEUE_CAPACITY: usize = 16;

enum Command {
    Save,
    SaveNow(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

/// Flush counters, shared between the actor and its handles.
#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of the writer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Successful flushes.
    pub flushes: u64,
    /// Failed flush attempts.
    pub failures: u64,
}

/// Handle to the writer actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StateWriter {
    tx: mpsc::Sender<Command>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl StateWriter {
    /// Start the actor for `store`, writing under `paths`.
    pub fn spawn(store: CrawlStore, paths: StatePaths, debounce: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let counters = Arc::new(Counters::default());

        let actor = WriterActor {
            store,
            paths,
            debounce,
            rx,
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(actor.run());

        let writer = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            counters,
        };
        (writer, handle)
    }

    /// Mark the state dirty. Never blocks; a full queue already holds a
    /// request that will observe this change.
    pub fn request_save(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match self.tx.try_send(Command::Save) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("save requested after writer stopped");
            }
        }
    }

    /// Flush immediately, bypassing the debounce window.
    pub async fn save_now(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PlanCrawlError::persistence("state writer is shut down"));
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SaveNow(reply))
            .await
            .map_err(|_| PlanCrawlError::persistence("state writer is not running"))?;
        rx.await
            .map_err(|_| PlanCrawlError::persistence("state writer dropped the request"))?
    }

    /// Final flush, then refuse further requests. Waits at most `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(Command::Shutdown(reply))
                .await
                .map_err(|_| PlanCrawlError::persistence("state writer is not running"))?;
            rx.await
                .map_err(|_| PlanCrawlError::persistence("state writer dropped the request"))?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(PlanCrawlError::Timeout {
                secs: timeout.as_secs(),
            }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct WriterActor {
    store: CrawlStore,
    paths: StatePaths,
    debounce: Duration,
    rx: mpsc::Receiver<Command>,
    counters: Arc<Counters>,
}

impl WriterActor {
    async fn run(mut self) {
        debug!(
            dir = %self.paths.dir.display(),
            debounce_ms = self.debounce.as_millis() as u64,
            "state writer started"
        );

        let mut deadline: Option<Instant> = None;

        loop {
            let command = match deadline {
                Some(at) => {
                    tokio::select! {
                        command = self.rx.recv() => command,
                        () = tokio::time::sleep_until(at) => {
                            deadline = self.flush_or_rearm().await;
                            continue;
                        }
                    }
                }
                None => self.rx.recv().await,
            };

            match command {
                Some(Command::Save) => {
                    deadline.get_or_insert_with(|| Instant::now() + self.debounce);
                }
                Some(Command::SaveNow(reply)) => {
                    let result = self.flush().await;
                    deadline = result.is_err().then(|| Instant::now() + self.debounce);
                    let _ = reply.send(result);
                }
                Some(Command::Shutdown(reply)) => {
                    let result = self.flush().await;
                    let _ = reply.send(result);
                    break;
                }
                None => {
                    // Every handle dropped without an explicit shutdown.
                    if deadline.is_some() {
                        let _ = self.flush().await;
                    }
                    break;
                }
            }
        }

        info!(
            flushes = self.counters.flushes.load(Ordering::Relaxed),
            failures = self.counters.failures.load(Ordering::Relaxed),
            "state writer stopped"
        );
    }

    /// Debounced flush; on failure the state stays dirty and the timer re-arms.
    async fn flush_or_rearm(&self) -> Option<Instant> {
        match self.flush().await {
            Ok(()) => None,
            Err(_) => Some(Instant::now() + self.debounce),
        }
    }

    async fn flush(&self) -> Result<()> {
        let snapshot = self.store.snapshot();
        let paths = self.paths.clone();

        let result = tokio::task::spawn_blocking(move || persist_snapshot(&paths, &snapshot))
            .await
            .map_err(|e| PlanCrawlError::persistence(format!("flush task failed: {e}")))
            .and_then(|r| r);

        match &result {
            Ok(()) => {
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "state save failed, will retry");
            }
        }
        result
    }
}

/// Write the state file (with backup) and every export for one snapshot.
pub fn persist_snapshot(paths: &StatePaths, state: &CrawlState) -> Result<()> {
    paths.ensure_dir()?;

    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| PlanCrawlError::persistence(format!("failed to serialize state: {e}")))?;
    write_atomic(&paths.state, &json, true)?;
    write_exports(paths, state)?;

    debug!(
        zipcodes = state.order.len(),
        plans = state.metadata.total_plans_found,
        "state persisted"
    );
    Ok(())
}

/// Re-render the derived exports only; the state file is left alone.
pub fn write_exports(paths: &StatePaths, state: &CrawlState) -> Result<()> {
    paths.ensure_dir()?;
    let exports = plancrawl_artifacts::render_all(state)?;
    write_atomic(&paths.records, exports.records_json.as_bytes(), false)?;
    write_atomic(&paths.summary, exports.summary_csv.as_bytes(), false)?;
    write_atomic(&paths.detail, exports.detail_csv.as_bytes(), false)
}
