//! Flattening of nested detail payloads into CSV columns.

use std::cmp::Ordering;

use serde_json::Value;

/// Flatten `value` into `(column, cell)` pairs under `prefix`.
///
/// Object keys are joined with `_`, array items by their index. Strings have
/// newlines replaced with ` | `; null becomes an empty cell.
pub fn flatten_value(value: &Value, prefix: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::Null => out.push((prefix.to_string(), String::new())),
        Value::Object(map) => {
            for (key, child) in map {
                flatten_value(child, &join(prefix, key), out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten_value(child, &join(prefix, &i.to_string()), out);
            }
        }
        Value::String(s) => out.push((prefix.to_string(), s.replace('\n', " | "))),
        Value::Bool(b) => out.push((prefix.to_string(), b.to_string())),
        Value::Number(n) => out.push((prefix.to_string(), n.to_string())),
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}_{key}")
    }
}

/// Order columns segment by segment, numeric segments numerically and
/// before textual ones, so `details_2` sorts ahead of `details_10`.
pub fn compare_columns(a: &str, b: &str) -> Ordering {
    let mut left = a.split('_');
    let mut right = b.split('_');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(m), Ok(n)) => m.cmp(&n),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_nested_objects_and_arrays() {
        let value = json!({
            "overview": {"premium": "$0", "deductible": null},
            "benefits": [{"name": "Dental"}, {"name": "Vision\nExtra"}],
            "stars": 4.5,
            "snp": false
        });
        let mut out = Vec::new();
        flatten_value(&value, "details", &mut out);

        let get = |k: &str| out.iter().find(|(c, _)| c == k).map(|(_, v)| v.as_str());
        assert_eq!(get("details_overview_premium"), Some("$0"));
        assert_eq!(get("details_overview_deductible"), Some(""));
        assert_eq!(get("details_benefits_1_name"), Some("Vision | Extra"));
        assert_eq!(get("details_stars"), Some("4.5"));
        assert_eq!(get("details_snp"), Some("false"));
    }

    #[test]
    fn numeric_segments_sort_numerically() {
        let mut cols = vec![
            "details_benefits_10_name",
            "details_benefits_2_name",
            "details_benefits_1_name",
            "details_alpha",
        ];
        cols.sort_by(|a, b| compare_columns(a, b));
        assert_eq!(
            cols,
            vec![
                "details_alpha",
                "details_benefits_1_name",
                "details_benefits_2_name",
                "details_benefits_10_name",
            ]
        );
    }

    #[test]
    fn shorter_prefix_sorts_first() {
        assert_eq!(compare_columns("details_a", "details_a_b"), Ordering::Less);
        assert_eq!(compare_columns("details_1", "details_a"), Ordering::Less);
    }
}
