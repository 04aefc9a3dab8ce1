//! Shared handle over the in-memory crawl state.
//!
//! [`CrawlStore`] is the only owner of the [`CrawlState`] tree. Scheduler,
//! writer and exporters hold clones of the handle; readers get snapshots,
//! writers go through the narrow mutation API below.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;
use crate::state::{PendingCounts, PlanApplied};
use crate::types::{CrawlState, PlanEntry, PlanTask, Phase, ZipcodeEntry, ZipcodeInput};

/// Cloneable handle to the process-wide crawl state.
#[derive(Debug, Clone)]
pub struct CrawlStore {
    inner: Arc<RwLock<CrawlState>>,
}

impl CrawlStore {
    pub fn new(state: CrawlState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    // A panicking writer never leaves a half-applied mutation (each one runs
    // to completion under the lock), so poisoned guards are safe to reuse.
    fn read(&self) -> RwLockReadGuard<'_, CrawlState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CrawlState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Clone of one entry.
    pub fn get(&self, zipcode: &str) -> Option<ZipcodeEntry> {
        self.read().entries.get(zipcode).cloned()
    }

    /// Insert or replace an entry; unknown keys are appended to the order.
    /// The entry's index always follows its position in the order.
    pub fn upsert(&self, mut entry: ZipcodeEntry) {
        let mut state = self.write();
        let key = entry.zipcode.clone();
        entry.index = match state.order.iter().position(|k| *k == key) {
            Some(position) => position,
            None => {
                state.order.push(key.clone());
                state.order.len() - 1
            }
        };
        state.entries.insert(key, entry);
        state.recompute_metadata();
    }

    /// Merge a new ordered input list (see [`CrawlState::merge`]).
    pub fn merge(&self, inputs: &[ZipcodeInput]) {
        self.write().merge(inputs);
    }

    pub fn pending(&self, phase: Phase) -> Vec<String> {
        self.read().pending_keys(phase)
    }

    pub fn pending_zipcodes(&self) -> Vec<String> {
        self.read().pending_zipcodes()
    }

    pub fn pending_plans(&self) -> Vec<PlanTask> {
        self.read().pending_plans()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        self.read().pending_counts()
    }

    pub fn apply_discovery_success(&self, zipcode: &str, plans: Vec<PlanEntry>) -> Result<()> {
        self.write().apply_discovery_success(zipcode, plans)
    }

    pub fn apply_discovery_failure(&self, zipcode: &str, message: &str) -> Result<()> {
        self.write().apply_discovery_failure(zipcode, message)
    }

    pub fn apply_plan_outcome(
        &self,
        zipcode: &str,
        plan_id: &str,
        outcome: std::result::Result<serde_json::Value, String>,
    ) -> Result<PlanApplied> {
        self.write().apply_plan_outcome(zipcode, plan_id, outcome)
    }

    pub fn settle_trivial_plans(&self) -> usize {
        self.write().settle_trivial_plans()
    }

    pub fn settle_trivial_plans_in(&self, in_scope: impl Fn(&str) -> bool) -> usize {
        self.write().settle_trivial_plans_in(in_scope)
    }

    pub fn mark_phase_finished(&self, phase: Phase) {
        self.write().mark_phase_finished(phase);
    }

    pub fn set_workers(&self, workers: usize) {
        self.write().metadata.workers = workers;
    }

    /// Consistent copy of the whole tree, for persistence and exports.
    pub fn snapshot(&self) -> CrawlState {
        self.read().clone()
    }

    /// Run a read-only closure against the current state.
    pub fn with_state<T>(&self, f: impl FnOnce(&CrawlState) -> T) -> T {
        f(&self.read())
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
