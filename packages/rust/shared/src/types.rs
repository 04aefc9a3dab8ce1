//! Core domain types for the crawl state tree.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version of the persisted state file.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Statuses & phases
// ---------------------------------------------------------------------------

/// Lifecycle of a zipcode entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZipcodeStatus {
    Pending,
    UrlsCollected,
    Completed,
    Error,
}

impl ZipcodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::UrlsCollected => "urls_collected",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Phase 1 has been attempted (errors count as processed).
    pub fn is_processed(self) -> bool {
        self != Self::Pending
    }
}

impl std::fmt::Display for ZipcodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a plan entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Completed,
    Error,
}

impl PlanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two sequential crawl phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Phase 1: enumerate plans per zipcode.
    Discovery,
    /// Phase 2: fetch the detail payload per plan.
    DetailFill,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Discovery => "phase 1: collecting plan urls",
            Self::DetailFill => "phase 2: filling plan details",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Inputs & collaborator records
// ---------------------------------------------------------------------------

/// One row of the ordered input list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipcodeInput {
    pub zipcode: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub city: String,
}

impl ZipcodeInput {
    pub fn new(zipcode: impl Into<String>) -> Self {
        Self {
            zipcode: zipcode.into(),
            state: String::new(),
            city: String::new(),
        }
    }
}

/// A plan as read off a result page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Stable id, when the site exposes one.
    pub plan_id: Option<String>,
    pub plan_name: Option<String>,
    pub plan_type: Option<String>,
    pub monthly_premium: Option<String>,
    pub estimated_annual_cost: Option<String>,
    pub star_rating: Option<String>,
    /// Where the detail page lives; `None` means nothing to fill.
    pub details_url: Option<String>,
}

/// Item and page totals shown on a result view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCounts {
    pub item_count: usize,
    pub page_count: usize,
}

/// One unit of phase-2 work: a pending plan and where to find its details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanTask {
    pub zipcode: String,
    pub plan_id: String,
    pub details_url: String,
}

impl PlanTask {
    /// Ownership key; unique across the whole state.
    pub fn key(&self) -> String {
        format!("{}/{}", self.zipcode, self.plan_id)
    }
}

// ---------------------------------------------------------------------------
// State tree
// ---------------------------------------------------------------------------

/// A discovered plan nested under a zipcode entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub plan_id: String,
    #[serde(default)]
    pub plan_name: Option<String>,
    #[serde(default)]
    pub plan_type: Option<String>,
    #[serde(default)]
    pub monthly_premium: Option<String>,
    #[serde(default)]
    pub estimated_annual_cost: Option<String>,
    #[serde(default)]
    pub star_rating: Option<String>,
    #[serde(default)]
    pub details_url: Option<String>,
    pub status: PlanStatus,
    /// Opaque detail record; null until phase 2 fills it.
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub scraped_at: Option<DateTime<Utc>>,
}

impl PlanEntry {
    /// A fresh pending plan from a result-page summary.
    pub fn from_summary(plan_id: String, summary: PlanSummary) -> Self {
        Self {
            plan_id,
            plan_name: summary.plan_name,
            plan_type: summary.plan_type,
            monthly_premium: summary.monthly_premium,
            estimated_annual_cost: summary.estimated_annual_cost,
            star_rating: summary.star_rating,
            details_url: summary.details_url.filter(|u| !u.trim().is_empty()),
            status: PlanStatus::Pending,
            details: None,
            error: None,
            scraped_at: None,
        }
    }
}

/// One top-level unit of work, keyed by zipcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipcodeEntry {
    /// Position in the current input list.
    pub index: usize,
    pub zipcode: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub city: String,
    pub status: ZipcodeStatus,
    #[serde(default)]
    pub urls_collected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of plans discovered.
    #[serde(default)]
    pub total_plans: usize,
    /// Number of plans in `completed` status.
    #[serde(default)]
    pub plans_with_details: usize,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub plans: Vec<PlanEntry>,
}

impl ZipcodeEntry {
    /// A fresh pending entry for an input row.
    pub fn pending(index: usize, input: &ZipcodeInput) -> Self {
        Self {
            index,
            zipcode: input.zipcode.clone(),
            state: input.state.clone(),
            city: input.city.clone(),
            status: ZipcodeStatus::Pending,
            urls_collected_at: None,
            completed_at: None,
            total_plans: 0,
            plans_with_details: 0,
            error: None,
            plans: Vec::new(),
        }
    }

    pub fn plan(&self, plan_id: &str) -> Option<&PlanEntry> {
        self.plans.iter().find(|p| p.plan_id == plan_id)
    }

    /// Every plan is completed or errored (vacuously true with no plans).
    pub fn all_plans_terminal(&self) -> bool {
        self.plans.iter().all(|p| p.status.is_terminal())
    }
}

/// Aggregate counters and run timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlMetadata {
    pub schema_version: u32,
    pub total_zipcodes: usize,
    /// Zipcodes that left `pending` (including errors).
    pub phase1_completed: usize,
    /// Zipcodes in `completed`.
    pub phase2_completed: usize,
    pub total_plans_found: usize,
    /// Plans in `completed`.
    pub plans_filled: usize,
    #[serde(default)]
    pub plans_failed: usize,
    pub workers: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub phase1_finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase2_finished_at: Option<DateTime<Utc>>,
}

impl CrawlMetadata {
    pub fn new(workers: usize) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            total_zipcodes: 0,
            phase1_completed: 0,
            phase2_completed: 0,
            total_plans_found: 0,
            plans_filled: 0,
            plans_failed: 0,
            workers,
            started_at: now,
            updated_at: now,
            phase1_finished_at: None,
            phase2_finished_at: None,
        }
    }
}

/// Root of the persisted crawl state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlState {
    pub metadata: CrawlMetadata,
    /// Keys in declared input order; every export follows it.
    pub order: Vec<String>,
    pub entries: BTreeMap<String, ZipcodeEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_snake_case() {
        let json = serde_json::to_string(&ZipcodeStatus::UrlsCollected).unwrap();
        assert_eq!(json, "\"urls_collected\"");
        let parsed: PlanStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, PlanStatus::Error);
    }

    #[test]
    fn entry_fields_are_camel_case() {
        let entry = ZipcodeEntry::pending(0, &ZipcodeInput::new("10001"));
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("totalPlans").is_some());
        assert!(value.get("plansWithDetails").is_some());
        assert!(value.get("urlsCollectedAt").is_some());
    }

    #[test]
    fn empty_details_url_is_dropped() {
        let summary = PlanSummary {
            details_url: Some("  ".into()),
            ..PlanSummary::default()
        };
        let plan = PlanEntry::from_summary("p1-0".into(), summary);
        assert!(plan.details_url.is_none());
        assert_eq!(plan.status, PlanStatus::Pending);
    }

    #[test]
    fn no_plans_means_all_terminal() {
        let entry = ZipcodeEntry::pending(0, &ZipcodeInput::new("10001"));
        assert!(entry.all_plans_terminal());
    }

    #[test]
    fn plan_task_key_is_scoped_by_zipcode() {
        let task = PlanTask {
            zipcode: "10001".into(),
            plan_id: "H1234-001".into(),
            details_url: "/plan/H1234-001".into(),
        };
        assert_eq!(task.key(), "10001/H1234-001");
    }
}
