//! Ordered zipcode list from a CSV file.
//!
//! The header row is required. `zipcode` (or `zip` / `zip_code`) is mandatory;
//! `state` and `city` are optional. Zipcodes are kept as text so leading
//! zeros survive.

use std::path::Path;

use color_eyre::eyre::{Result, WrapErr, eyre};
use plancrawl_shared::ZipcodeInput;
use tracing::{debug, warn};

const ZIPCODE_HEADERS: &[&str] = &["zipcode", "zip", "zip_code"];

pub(crate) fn load_inputs(path: &Path) -> Result<Vec<ZipcodeInput>> {
    let file = std::fs::File::open(path)
        .wrap_err_with(|| format!("cannot open input file {}", path.display()))?;
    read_inputs(file).wrap_err_with(|| format!("invalid input file {}", path.display()))
}

fn read_inputs(reader: impl std::io::Read) -> Result<Vec<ZipcodeInput>> {
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = csv
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_ascii_lowercase())
        .collect();
    let column = |names: &[&str]| headers.iter().position(|h| names.contains(&h.as_str()));

    let zipcode_col = column(ZIPCODE_HEADERS)
        .ok_or_else(|| eyre!("missing a zipcode column (expected one of: {})", ZIPCODE_HEADERS.join(", ")))?;
    let state_col = column(&["state"]);
    let city_col = column(&["city"]);

    let mut inputs = Vec::new();
    for (row, record) in csv.records().enumerate() {
        let record = record?;
        let field = |col: Option<usize>| col.and_then(|c| record.get(c)).unwrap_or_default().to_string();

        let zipcode = field(Some(zipcode_col));
        if zipcode.is_empty() {
            // +2: header row plus 1-based numbering.
            warn!(row = row + 2, "skipping row without a zipcode");
            continue;
        }
        inputs.push(ZipcodeInput {
            zipcode,
            state: field(state_col),
            city: field(city_col),
        });
    }

    debug!(rows = inputs.len(), "input loaded");
    Ok(inputs)
}
