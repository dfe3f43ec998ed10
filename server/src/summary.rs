//! Grouped counts of record attributes, the data behind the dashboard's
//! donut charts.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummarySlice {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummarySeries {
    /// Human readable title of the series.
    pub name: String,
    pub data: Vec<SummarySlice>,
}

/// Count records by `attributes.<attribute>`, most common first.
///
/// Values are normalised with [`format_source`] before grouping. Records
/// without the attribute, or with a falsy value, are left out. Ties keep the
/// order in which the values were first seen.
pub fn summarize(records: &[Value], attribute: &str, label: &str) -> SummarySeries {
    let mut data: Vec<SummarySlice> = vec![];

    for record in records {
        let raw = record
            .get("attributes")
            .and_then(|attributes| attributes.get(attribute))
            .map(source_string)
            .unwrap_or_default();
        if raw.is_empty() {
            continue;
        }
        let formatted = format_source(&raw);

        match data
            .iter_mut()
            .find(|slice| slice.name == raw || slice.name == formatted)
        {
            Some(slice) => slice.count += 1,
            None => data.push(SummarySlice {
                name: formatted,
                count: 1,
            }),
        }
    }

    data.sort_by(|a, b| b.count.cmp(&a.count));

    SummarySeries {
        name: label.to_string(),
        data,
    }
}

/// Make an attribute value readable: commas become line breaks, dashes and
/// underscores become spaces, and the first `fb`/`tw` is upper-cased.
pub fn format_source(raw: &str) -> String {
    raw.replace(',', "\n")
        .replace(&['-', '_'][..], " ")
        .replacen("fb", "FB", 1)
        .replacen("tw", "TW", 1)
        .trim()
        .to_string()
}

/// Falsy values (null, false, 0, "") count as missing.
fn source_string(value: &Value) -> String {
    match value {
        Value::Null | Value::Bool(false) => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) if n.as_f64() == Some(0.0) => String::new(),
        other => other.to_string(),
    }
}
