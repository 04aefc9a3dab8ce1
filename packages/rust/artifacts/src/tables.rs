//! Tabular exports: one row per zipcode, and one row per plan.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use plancrawl_shared::{CrawlState, PlanCrawlError, PlanEntry, Result, ZipcodeEntry};

use crate::flatten::{compare_columns, flatten_value};

const SUMMARY_COLUMNS: [&str; 10] = [
    "index",
    "zipcode",
    "state",
    "city",
    "status",
    "totalPlans",
    "plansWithDetails",
    "error",
    "urlsCollectedAt",
    "completedAt",
];

/// Plan-level columns that always come first, in this order.
pub const PRIORITY_COLUMNS: [&str; 18] = [
    "zipcode_index",
    "zipcode",
    "state",
    "city",
    "zipcode_status",
    "zipcode_totalPlans",
    "zipcode_plansWithDetails",
    "zipcode_error",
    "plan_status",
    "plan_planId",
    "plan_planName",
    "plan_planType",
    "plan_monthlyPremium",
    "plan_estimatedAnnualCost",
    "plan_starRating",
    "plan_detailsUrl",
    "plan_error",
    "plan_scrapedAt",
];

/// Render the per-zipcode summary CSV.
pub fn render_summary_csv(state: &CrawlState) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(SUMMARY_COLUMNS).map_err(csv_error)?;

    for entry in state.ordered_entries() {
        writer
            .write_record([
                entry.index.to_string(),
                entry.zipcode.clone(),
                entry.state.clone(),
                entry.city.clone(),
                entry.status.to_string(),
                entry.total_plans.to_string(),
                entry.plans_with_details.to_string(),
                cell(entry.error.as_deref()),
                timestamp(entry.urls_collected_at),
                timestamp(entry.completed_at),
            ])
            .map_err(csv_error)?;
    }

    finish(writer)
}

/// Render the per-plan detail CSV with flattened `details_*` columns.
pub fn render_detail_csv(state: &CrawlState) -> Result<String> {
    let rows: Vec<HashMap<String, String>> = state
        .ordered_entries()
        .flat_map(|entry| entry.plans.iter().map(move |plan| plan_row(entry, plan)))
        .collect();

    let mut detail_columns: BTreeSet<&str> = BTreeSet::new();
    for row in &rows {
        for column in row.keys() {
            if !PRIORITY_COLUMNS.contains(&column.as_str()) {
                detail_columns.insert(column.as_str());
            }
        }
    }
    let mut detail_columns: Vec<&str> = detail_columns.into_iter().collect();
    detail_columns.sort_by(|a, b| compare_columns(a, b));

    let columns: Vec<&str> = PRIORITY_COLUMNS
        .iter()
        .copied()
        .chain(detail_columns)
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&columns).map_err(csv_error)?;
    for row in &rows {
        writer
            .write_record(columns.iter().map(|c| row.get(*c).map_or("", String::as_str)))
            .map_err(csv_error)?;
    }

    finish(writer)
}

fn plan_row(entry: &ZipcodeEntry, plan: &PlanEntry) -> HashMap<String, String> {
    let mut row: HashMap<String, String> = [
        ("zipcode_index", entry.index.to_string()),
        ("zipcode", entry.zipcode.clone()),
        ("state", entry.state.clone()),
        ("city", entry.city.clone()),
        ("zipcode_status", entry.status.to_string()),
        ("zipcode_totalPlans", entry.total_plans.to_string()),
        ("zipcode_plansWithDetails", entry.plans_with_details.to_string()),
        ("zipcode_error", cell(entry.error.as_deref())),
        ("plan_status", plan.status.to_string()),
        ("plan_planId", plan.plan_id.clone()),
        ("plan_planName", cell(plan.plan_name.as_deref())),
        ("plan_planType", cell(plan.plan_type.as_deref())),
        ("plan_monthlyPremium", cell(plan.monthly_premium.as_deref())),
        ("plan_estimatedAnnualCost", cell(plan.estimated_annual_cost.as_deref())),
        ("plan_starRating", cell(plan.star_rating.as_deref())),
        ("plan_detailsUrl", cell(plan.details_url.as_deref())),
        ("plan_error", cell(plan.error.as_deref())),
        ("plan_scrapedAt", timestamp(plan.scraped_at)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    if let Some(details) = plan.details.as_ref().filter(|d| !d.is_null()) {
        let mut cells = Vec::new();
        flatten_value(details, "details", &mut cells);
        row.extend(cells);
    }
    row
}

fn cell(value: Option<&str>) -> String {
    value.unwrap_or_default().replace('\n', " | ")
}

fn timestamp(value: Option<DateTime<Utc>>) -> String {
    value.map(|t| t.to_rfc3339()).unwrap_or_default()
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer
        .into_inner()
        .map_err(|e| PlanCrawlError::parse(format!("failed to flush CSV: {e}")))?;
    String::from_utf8(bytes).map_err(|e| PlanCrawlError::parse(format!("CSV is not UTF-8: {e}")))
}

fn csv_error(e: csv::Error) -> PlanCrawlError {
    PlanCrawlError::parse(format!("failed to write CSV: {e}"))
}
