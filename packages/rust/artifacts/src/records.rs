//! Full-record export: every zipcode with its plans and details, in order.

use plancrawl_shared::{CrawlState, PlanCrawlError, Result, ZipcodeEntry};

/// Render the full-record JSON array (pretty-printed) in `order` sequence.
pub fn render_records(state: &CrawlState) -> Result<String> {
    let records: Vec<&ZipcodeEntry> = state.ordered_entries().collect();
    serde_json::to_string_pretty(&records)
        .map_err(|e| PlanCrawlError::parse(format!("failed to serialize records: {e}")))
}

/// Parse a full-record export back into entries (array order preserved).
pub fn parse_records(content: &str) -> Result<Vec<ZipcodeEntry>> {
    serde_json::from_str(content)
        .map_err(|e| PlanCrawlError::parse(format!("invalid full-record export: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use plancrawl_shared::{PlanEntry, PlanSummary, ZipcodeInput, ZipcodeStatus};

    #[test]
    fn records_follow_declared_order() {
        let inputs: Vec<_> = ["30301", "10001", "60601"]
            .into_iter()
            .map(ZipcodeInput::new)
            .collect();
        let mut state = CrawlState::fresh(&inputs, 1);
        state
            .apply_discovery_success(
                "10001",
                vec![PlanEntry::from_summary("H1".into(), PlanSummary::default())],
            )
            .unwrap();

        let json = render_records(&state).unwrap();
        let parsed = parse_records(&json).unwrap();
        let keys: Vec<_> = parsed.iter().map(|e| e.zipcode.as_str()).collect();
        assert_eq!(keys, vec!["30301", "10001", "60601"]);
        assert_eq!(parsed[1].status, ZipcodeStatus::UrlsCollected);
        assert_eq!(parsed[1].plans[0].plan_id, "H1");
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_records("{not json").unwrap_err();
        assert!(matches!(err, PlanCrawlError::Parse { .. }));
    }
}
