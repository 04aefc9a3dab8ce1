//! Derived, human-readable exports of the crawl state.
//!
//! Every export preserves the state's `order` sequence:
//! - [`records`]: full-record JSON dump (also the last-resort recovery source)
//! - [`tables`]: per-zipcode summary CSV and per-plan detail CSV
//! - [`flatten`]: nested payload → column flattening used by the detail CSV

pub mod flatten;
pub mod records;
pub mod tables;

pub use records::{parse_records, render_records};
pub use tables::{PRIORITY_COLUMNS, render_detail_csv, render_summary_csv};

use plancrawl_shared::{CrawlState, Result};

/// All exports rendered from one snapshot.
#[derive(Debug, Clone)]
pub struct Exports {
    pub records_json: String,
    pub summary_csv: String,
    pub detail_csv: String,
}

/// Render every export from the same snapshot.
pub fn render_all(state: &CrawlState) -> Result<Exports> {
    let exports = Exports {
        records_json: render_records(state)?,
        summary_csv: render_summary_csv(state)?,
        detail_csv: render_detail_csv(state)?,
    };
    tracing::trace!(
        records_bytes = exports.records_json.len(),
        detail_bytes = exports.detail_csv.len(),
        "rendered exports"
    );
    Ok(exports)
}
