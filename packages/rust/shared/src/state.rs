//! Transitions and aggregates of the [`CrawlState`] tree.
//!
//! Every mutating method updates the affected entry *and* the aggregate
//! counters before returning, so a caller holding the state lock never
//! exposes a half-applied mutation.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use tracing::debug;

use crate::error::{PlanCrawlError, Result};
use crate::types::{
    CrawlMetadata, CrawlState, PlanEntry, PlanStatus, PlanTask, Phase, ZipcodeEntry,
    ZipcodeInput, ZipcodeStatus,
};

/// Outcome of applying a phase-2 result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanApplied {
    /// The plan was updated; the parent still has pending plans.
    Updated,
    /// The plan was updated and its parent is now completed.
    ParentCompleted,
    /// The plan was already terminal; nothing changed.
    Ignored,
}

/// Pending work left in a state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub zipcodes: usize,
    pub plans: usize,
}

impl CrawlState {
    /// An empty state with no entries.
    pub fn empty(workers: usize) -> Self {
        Self {
            metadata: CrawlMetadata::new(workers),
            order: Vec::new(),
            entries: BTreeMap::new(),
        }
    }

    /// A fresh state for an input list.
    pub fn fresh(inputs: &[ZipcodeInput], workers: usize) -> Self {
        let mut state = Self::empty(workers);
        state.merge(inputs);
        state
    }

    /// Merge a new ordered input list into this state.
    ///
    /// Existing entries keep their progress but take the new index and the
    /// input's state/city; new keys start pending, keys missing from `inputs`
    /// are dropped. Duplicate input
    /// keys keep their first occurrence. Aggregates are recomputed afterwards.
    pub fn merge(&mut self, inputs: &[ZipcodeInput]) {
        let mut previous = std::mem::take(&mut self.entries);
        let mut seen = HashSet::with_capacity(inputs.len());
        let mut order = Vec::with_capacity(inputs.len());
        let mut kept = 0usize;

        for input in inputs {
            let key = input.zipcode.trim();
            if key.is_empty() || !seen.insert(key.to_string()) {
                continue;
            }

            let index = order.len();
            let entry = match previous.remove(key) {
                Some(mut existing) => {
                    existing.index = index;
                    existing.state = input.state.clone();
                    existing.city = input.city.clone();
                    kept += 1;
                    existing
                }
                None => {
                    let mut entry = ZipcodeEntry::pending(index, input);
                    entry.zipcode = key.to_string();
                    entry
                }
            };

            order.push(key.to_string());
            self.entries.insert(key.to_string(), entry);
        }

        debug!(
            kept,
            added = order.len() - kept,
            dropped = previous.len(),
            "merged input list into state"
        );

        self.order = order;
        self.recompute_metadata();
    }

    /// Recount every aggregate from entry statuses.
    pub fn recompute_metadata(&mut self) {
        let mut meta = std::mem::replace(&mut self.metadata, CrawlMetadata::new(0));
        meta.total_zipcodes = self.order.len();
        meta.phase1_completed = 0;
        meta.phase2_completed = 0;
        meta.total_plans_found = 0;
        meta.plans_filled = 0;
        meta.plans_failed = 0;

        for entry in self.entries.values_mut() {
            entry.total_plans = entry.plans.len();
            entry.plans_with_details = entry
                .plans
                .iter()
                .filter(|p| p.status == PlanStatus::Completed)
                .count();

            if entry.status.is_processed() {
                meta.phase1_completed += 1;
            }
            if entry.status == ZipcodeStatus::Completed {
                meta.phase2_completed += 1;
            }
            meta.total_plans_found += entry.total_plans;
            meta.plans_filled += entry.plans_with_details;
            meta.plans_failed += entry
                .plans
                .iter()
                .filter(|p| p.status == PlanStatus::Error)
                .count();
        }

        self.metadata = meta;
    }

    /// Entries in declared order.
    pub fn ordered_entries(&self) -> impl Iterator<Item = &ZipcodeEntry> {
        self.order.iter().filter_map(|key| self.entries.get(key))
    }

    /// Zipcodes still waiting for phase 1, in order.
    pub fn pending_zipcodes(&self) -> Vec<String> {
        self.ordered_entries()
            .filter(|e| e.status == ZipcodeStatus::Pending)
            .map(|e| e.zipcode.clone())
            .collect()
    }

    /// Plans waiting for phase 2, in order. Only plans with a detail location
    /// under a zipcode that finished phase 1 successfully qualify.
    pub fn pending_plans(&self) -> Vec<PlanTask> {
        self.ordered_entries()
            .filter(|e| matches!(e.status, ZipcodeStatus::UrlsCollected | ZipcodeStatus::Completed))
            .flat_map(|e| {
                e.plans.iter().filter_map(move |p| {
                    if p.status != PlanStatus::Pending {
                        return None;
                    }
                    p.details_url.as_ref().map(|url| PlanTask {
                        zipcode: e.zipcode.clone(),
                        plan_id: p.plan_id.clone(),
                        details_url: url.clone(),
                    })
                })
            })
            .collect()
    }

    /// Keys of pending work for a phase.
    pub fn pending_keys(&self, phase: Phase) -> Vec<String> {
        match phase {
            Phase::Discovery => self.pending_zipcodes(),
            Phase::DetailFill => self.pending_plans().iter().map(PlanTask::key).collect(),
        }
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for entry in self.ordered_entries() {
            match entry.status {
                ZipcodeStatus::Pending => counts.zipcodes += 1,
                ZipcodeStatus::UrlsCollected | ZipcodeStatus::Completed => {
                    counts.plans += entry
                        .plans
                        .iter()
                        .filter(|p| p.status == PlanStatus::Pending)
                        .count();
                }
                ZipcodeStatus::Error => {}
            }
        }
        counts
    }

    /// Phase 1 succeeded: record the discovered plans.
    pub fn apply_discovery_success(&mut self, zipcode: &str, plans: Vec<PlanEntry>) -> Result<()> {
        let entry = self.pending_entry_mut(zipcode)?;
        let found = plans.len();
        entry.status = ZipcodeStatus::UrlsCollected;
        entry.urls_collected_at = Some(Utc::now());
        entry.error = None;
        entry.total_plans = found;
        entry.plans_with_details = 0;
        entry.plans = plans;

        self.metadata.phase1_completed += 1;
        self.metadata.total_plans_found += found;
        self.touch();
        Ok(())
    }

    /// Phase 1 failed after retries: the zipcode is processed, with an error.
    pub fn apply_discovery_failure(&mut self, zipcode: &str, message: &str) -> Result<()> {
        let entry = self.pending_entry_mut(zipcode)?;
        entry.status = ZipcodeStatus::Error;
        entry.error = Some(message.to_string());
        entry.urls_collected_at = None;

        self.metadata.phase1_completed += 1;
        self.touch();
        Ok(())
    }

    /// Phase 2 finished for one plan, successfully (`Ok(details)`) or not.
    ///
    /// Terminal plans are never rewritten. When the last pending plan of a
    /// zipcode settles, the zipcode completes.
    pub fn apply_plan_outcome(
        &mut self,
        zipcode: &str,
        plan_id: &str,
        outcome: std::result::Result<serde_json::Value, String>,
    ) -> Result<PlanApplied> {
        let entry = self
            .entries
            .get_mut(zipcode)
            .ok_or_else(|| PlanCrawlError::validation(format!("unknown zipcode '{zipcode}'")))?;
        let plan = entry
            .plans
            .iter_mut()
            .find(|p| p.plan_id == plan_id)
            .ok_or_else(|| {
                PlanCrawlError::validation(format!("unknown plan '{plan_id}' under '{zipcode}'"))
            })?;

        if plan.status.is_terminal() {
            return Ok(PlanApplied::Ignored);
        }

        plan.scraped_at = Some(Utc::now());
        match outcome {
            Ok(details) => {
                plan.status = PlanStatus::Completed;
                plan.details = Some(details);
                plan.error = None;
                entry.plans_with_details += 1;
                self.metadata.plans_filled += 1;
            }
            Err(message) => {
                plan.status = PlanStatus::Error;
                plan.error = Some(message);
                self.metadata.plans_failed += 1;
            }
        }

        let completed = Self::complete_if_settled(entry);
        if completed {
            self.metadata.phase2_completed += 1;
        }
        self.touch();

        Ok(if completed {
            PlanApplied::ParentCompleted
        } else {
            PlanApplied::Updated
        })
    }

    /// Complete every plan that has no detail location (null payload), then
    /// every zipcode whose plans are all terminal. Returns the number of
    /// plans settled this way.
    pub fn settle_trivial_plans(&mut self) -> usize {
        self.settle_trivial_plans_in(|_| true)
    }

    /// [`Self::settle_trivial_plans`] limited to zipcodes accepted by `in_scope`.
    pub fn settle_trivial_plans_in(&mut self, in_scope: impl Fn(&str) -> bool) -> usize {
        let mut settled = 0usize;
        let mut parents = 0usize;
        let now = Utc::now();

        for entry in self.entries.values_mut() {
            if entry.status != ZipcodeStatus::UrlsCollected || !in_scope(&entry.zipcode) {
                continue;
            }
            for plan in entry.plans.iter_mut() {
                if plan.status == PlanStatus::Pending && plan.details_url.is_none() {
                    plan.status = PlanStatus::Completed;
                    plan.details = None;
                    plan.scraped_at = Some(now);
                    entry.plans_with_details += 1;
                    settled += 1;
                }
            }
            if Self::complete_if_settled(entry) {
                parents += 1;
            }
        }

        if settled > 0 || parents > 0 {
            self.metadata.plans_filled += settled;
            self.metadata.phase2_completed += parents;
            self.touch();
            debug!(settled, parents, "settled plans without detail pages");
        }
        settled
    }

    /// Stamp the end of a phase.
    pub fn mark_phase_finished(&mut self, phase: Phase) {
        let now = Some(Utc::now());
        match phase {
            Phase::Discovery => self.metadata.phase1_finished_at = now,
            Phase::DetailFill => self.metadata.phase2_finished_at = now,
        }
        self.touch();
    }

    /// Verify the counter invariants and order/entries consistency.
    pub fn check_invariants(&self) -> Result<()> {
        let meta = &self.metadata;
        if meta.phase2_completed > meta.phase1_completed
            || meta.phase1_completed > meta.total_zipcodes
        {
            return Err(PlanCrawlError::validation(format!(
                "zipcode counters out of order: phase2={} phase1={} total={}",
                meta.phase2_completed, meta.phase1_completed, meta.total_zipcodes
            )));
        }
        let created: usize = self.entries.values().map(|e| e.plans.len()).sum();
        if meta.plans_filled > meta.total_plans_found || meta.total_plans_found > created {
            return Err(PlanCrawlError::validation(format!(
                "plan counters out of order: filled={} found={} created={created}",
                meta.plans_filled, meta.total_plans_found
            )));
        }
        if self.order.len() != self.entries.len()
            || self.order.iter().any(|k| !self.entries.contains_key(k))
        {
            return Err(PlanCrawlError::validation(
                "order and entries disagree on the key set",
            ));
        }
        Ok(())
    }

    fn pending_entry_mut(&mut self, zipcode: &str) -> Result<&mut ZipcodeEntry> {
        let entry = self
            .entries
            .get_mut(zipcode)
            .ok_or_else(|| PlanCrawlError::validation(format!("unknown zipcode '{zipcode}'")))?;
        if entry.status != ZipcodeStatus::Pending {
            return Err(PlanCrawlError::validation(format!(
                "zipcode '{zipcode}' is {} and cannot take a phase 1 result",
                entry.status
            )));
        }
        Ok(entry)
    }

    fn complete_if_settled(entry: &mut ZipcodeEntry) -> bool {
        if entry.status == ZipcodeStatus::UrlsCollected && entry.all_plans_terminal() {
            entry.status = ZipcodeStatus::Completed;
            entry.completed_at = Some(Utc::now());
            return true;
        }
        false
    }

    fn touch(&mut self) {
        self.metadata.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlanSummary;

    fn inputs(keys: &[&str]) -> Vec<ZipcodeInput> {
        keys.iter().map(|k| ZipcodeInput::new(*k)).collect()
    }

    fn plans(n: usize, with_urls: bool) -> Vec<PlanEntry> {
        (0..n)
            .map(|i| {
                let summary = PlanSummary {
                    plan_name: Some(format!("Plan {i}")),
                    details_url: with_urls.then(|| format!("/plan/{i}")),
                    ..PlanSummary::default()
                };
                PlanEntry::from_summary(format!("P{i}"), summary)
            })
            .collect()
    }

    #[test]
    fn merge_follows_new_input_order() {
        let mut state = CrawlState::fresh(&inputs(&["c", "a", "b"]), 2);
        state.merge(&inputs(&["b", "d", "a"]));

        assert_eq!(state.order, vec!["b", "d", "a"]);
        assert_eq!(state.entries.len(), 3);
        assert!(!state.entries.contains_key("c"));
        assert_eq!(state.entries["b"].index, 0);
        assert_eq!(state.entries["d"].index, 1);
        assert_eq!(state.entries["a"].index, 2);
        state.check_invariants().unwrap();
    }

    #[test]
    fn merge_preserves_completed_work() {
        let mut state = CrawlState::fresh(&inputs(&["a", "b"]), 2);
        state.apply_discovery_success("a", plans(2, true)).unwrap();
        state.merge(&inputs(&["b", "a", "c"]));

        let a = &state.entries["a"];
        assert_eq!(a.status, ZipcodeStatus::UrlsCollected);
        assert_eq!(a.plans.len(), 2);
        assert_eq!(a.index, 1);
        assert_eq!(state.metadata.total_zipcodes, 3);
        assert_eq!(state.metadata.phase1_completed, 1);
        assert_eq!(state.metadata.total_plans_found, 2);
    }

    #[test]
    fn merge_refreshes_locality_of_kept_entries() {
        let mut state = CrawlState::fresh(&inputs(&["a"]), 1);
        state.apply_discovery_success("a", plans(1, true)).unwrap();

        let corrected = ZipcodeInput {
            zipcode: "a".into(),
            state: "NY".into(),
            city: "New York".into(),
        };
        state.merge(&[corrected]);

        let a = &state.entries["a"];
        assert_eq!(a.state, "NY");
        assert_eq!(a.city, "New York");
        assert_eq!(a.status, ZipcodeStatus::UrlsCollected);
    }

    #[test]
    fn merge_deduplicates_and_skips_blank_keys() {
        let state = CrawlState::fresh(&inputs(&["a", " ", "a", "b "]), 1);
        assert_eq!(state.order, vec!["a", "b"]);
        assert_eq!(state.metadata.total_zipcodes, 2);
    }

    #[test]
    fn merge_recomputes_stale_counters() {
        let mut state = CrawlState::fresh(&inputs(&["a"]), 1);
        state.apply_discovery_success("a", plans(3, true)).unwrap();
        state.metadata.total_plans_found = 99;
        state.metadata.phase1_completed = 42;

        state.merge(&inputs(&["a"]));
        assert_eq!(state.metadata.total_plans_found, 3);
        assert_eq!(state.metadata.phase1_completed, 1);
    }

    #[test]
    fn discovery_result_only_applies_to_pending() {
        let mut state = CrawlState::fresh(&inputs(&["a"]), 1);
        state.apply_discovery_failure("a", "network down").unwrap();
        let err = state.apply_discovery_success("a", plans(1, true)).unwrap_err();
        assert!(err.to_string().contains("cannot take a phase 1 result"));
        assert!(state.apply_discovery_failure("zz", "x").is_err());
    }

    #[test]
    fn discovery_failure_leaves_collection_time_empty() {
        let mut state = CrawlState::fresh(&inputs(&["a"]), 1);
        state.apply_discovery_failure("a", "network down").unwrap();

        let a = &state.entries["a"];
        assert_eq!(a.status, ZipcodeStatus::Error);
        assert!(a.urls_collected_at.is_none());
    }

    #[test]
    fn two_phase_scenario_counts() {
        let mut state = CrawlState::fresh(&inputs(&["A", "B", "C"]), 3);
        state.apply_discovery_success("A", plans(5, true)).unwrap();
        state.apply_discovery_failure("B", "network error").unwrap();
        state.apply_discovery_success("C", Vec::new()).unwrap();

        assert_eq!(state.metadata.phase1_completed, 3);
        assert_eq!(state.metadata.total_plans_found, 5);
        assert_eq!(state.entries["B"].status, ZipcodeStatus::Error);
        assert_eq!(state.entries["C"].total_plans, 0);

        assert_eq!(state.settle_trivial_plans(), 0);
        assert_eq!(state.entries["C"].status, ZipcodeStatus::Completed);

        let tasks = state.pending_plans();
        assert_eq!(tasks.len(), 5);
        assert!(tasks.iter().all(|t| t.zipcode == "A"));

        let mut last = PlanApplied::Ignored;
        for task in tasks {
            last = state
                .apply_plan_outcome(&task.zipcode, &task.plan_id, Ok(serde_json::json!({"ok": true})))
                .unwrap();
            state.check_invariants().unwrap();
        }
        assert_eq!(last, PlanApplied::ParentCompleted);
        assert_eq!(state.metadata.phase2_completed, 2);
        assert_eq!(state.metadata.plans_filled, 5);
        assert_eq!(state.entries["B"].status, ZipcodeStatus::Error);
    }

    #[test]
    fn terminal_plans_are_immutable() {
        let mut state = CrawlState::fresh(&inputs(&["a"]), 1);
        state.apply_discovery_success("a", plans(2, true)).unwrap();
        state
            .apply_plan_outcome("a", "P0", Err("detail page missing".into()))
            .unwrap();
        let again = state
            .apply_plan_outcome("a", "P0", Ok(serde_json::json!({})))
            .unwrap();

        assert_eq!(again, PlanApplied::Ignored);
        let plan = state.entries["a"].plan("P0").unwrap();
        assert_eq!(plan.status, PlanStatus::Error);
        assert_eq!(state.metadata.plans_failed, 1);
        assert_eq!(state.metadata.plans_filled, 0);
    }

    #[test]
    fn plans_without_detail_location_settle_trivially() {
        let mut state = CrawlState::fresh(&inputs(&["a"]), 1);
        state.apply_discovery_success("a", plans(2, false)).unwrap();

        assert!(state.pending_plans().is_empty());
        assert_eq!(state.settle_trivial_plans(), 2);

        let entry = &state.entries["a"];
        assert_eq!(entry.status, ZipcodeStatus::Completed);
        assert!(entry.plans.iter().all(|p| p.details.is_none()));
        assert_eq!(state.metadata.plans_filled, 2);
        assert_eq!(state.metadata.phase2_completed, 1);
    }

    #[test]
    fn scoped_settling_skips_other_zipcodes() {
        let mut state = CrawlState::fresh(&inputs(&["a", "b"]), 1);
        state.apply_discovery_success("a", plans(1, false)).unwrap();
        state.apply_discovery_success("b", plans(2, false)).unwrap();

        assert_eq!(state.settle_trivial_plans_in(|zip| zip == "a"), 1);
        assert_eq!(state.entries["a"].status, ZipcodeStatus::Completed);
        assert_eq!(state.entries["b"].status, ZipcodeStatus::UrlsCollected);
        assert!(state.entries["b"].plans.iter().all(|p| p.status == PlanStatus::Pending));
        assert_eq!(state.metadata.phase2_completed, 1);
        state.check_invariants().unwrap();
    }

    #[test]
    fn pending_keys_per_phase() {
        let mut state = CrawlState::fresh(&inputs(&["a", "b"]), 1);
        assert_eq!(state.pending_keys(Phase::Discovery), vec!["a", "b"]);

        state.apply_discovery_success("a", plans(1, true)).unwrap();
        assert_eq!(state.pending_keys(Phase::Discovery), vec!["b"]);
        assert_eq!(state.pending_keys(Phase::DetailFill), vec!["a/P0"]);
        assert_eq!(state.pending_counts(), PendingCounts { zipcodes: 1, plans: 1 });
    }

    #[test]
    fn invariant_violation_is_reported() {
        let mut state = CrawlState::fresh(&inputs(&["a"]), 1);
        state.metadata.phase2_completed = 1;
        assert!(state.check_invariants().is_err());
    }
}
