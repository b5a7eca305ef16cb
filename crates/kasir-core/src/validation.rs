// ABOUTME: Structural and numeric validation of closing records.
// ABOUTME: Checks run over the JSON document form and accumulate every failure instead of stopping at the first.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::model::{ClosingRecord, DISCREPANCY_TOLERANCE};

/// Fields that must be present and non-null, with their document names.
const REQUIRED_FIELDS: [&str; 11] = [
    "id",
    "shiftId",
    "cashierId",
    "cashierName",
    "openedAt",
    "closedAt",
    "openingFloat",
    "grossSales",
    "expectedCash",
    "actualCash",
    "discrepancy",
];

const NON_NEGATIVE_FIELDS: [&str; 3] = ["openingFloat", "grossSales", "actualCash"];

/// A single reason a closing record was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationIssue {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("field {0} is not numeric")]
    NotNumeric(&'static str),

    #[error("field {field} must not be negative (got {value})")]
    Negative { field: &'static str, value: f64 },

    #[error("expected cash {recorded} does not equal opening float plus cash sales ({computed})")]
    ExpectedCashMismatch { recorded: f64, computed: f64 },

    #[error("discrepancy {recorded} does not equal actual cash minus expected cash ({computed})")]
    DiscrepancyMismatch { recorded: f64, computed: f64 },

    #[error("field {field} is not a valid timestamp: {value:?}")]
    UnparsableTimestamp { field: &'static str, value: String },

    #[error("close time {closed_at} is not after open time {opened_at}")]
    CloseNotAfterOpen { opened_at: String, closed_at: String },

    #[error("a discrepancy of {0} requires a remark")]
    MissingRemark(f64),

    #[error("record does not match the closing record shape: {0}")]
    Malformed(String),
}

/// Outcome of validating one record. Valid when no issues were found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Human-readable summary, one issue per clause.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.write_str("valid")
        } else {
            f.write_str(&self.summary())
        }
    }
}

/// Validate a typed closing record.
pub fn validate(record: &ClosingRecord) -> ValidationReport {
    match serde_json::to_value(record) {
        Ok(doc) => validate_document(&doc),
        Err(e) => ValidationReport {
            errors: vec![ValidationIssue::Malformed(e.to_string())],
        },
    }
}

/// Validate a closing record as stored: a JSON object with camelCase keys.
pub fn validate_document(doc: &Value) -> ValidationReport {
    let mut errors = Vec::new();

    let Some(obj) = doc.as_object() else {
        return ValidationReport {
            errors: vec![ValidationIssue::NotAnObject],
        };
    };

    for field in REQUIRED_FIELDS {
        match obj.get(field) {
            None | Some(Value::Null) => errors.push(ValidationIssue::MissingField(field)),
            Some(Value::String(s)) if s.trim().is_empty() => {
                errors.push(ValidationIssue::MissingField(field))
            }
            _ => {}
        }
    }

    for field in NON_NEGATIVE_FIELDS {
        match obj.get(field) {
            None | Some(Value::Null) => {}
            Some(v) => match v.as_f64() {
                Some(n) if n < 0.0 => errors.push(ValidationIssue::Negative { field, value: n }),
                Some(_) => {}
                None => errors.push(ValidationIssue::NotNumeric(field)),
            },
        }
    }

    let number = |field: &str| obj.get(field).and_then(Value::as_f64);
    let discrepancy = number("discrepancy");

    if let (Some(float), Some(cash_sales), Some(recorded)) =
        (number("openingFloat"), number("cashSales"), number("expectedCash"))
    {
        let computed = float + cash_sales;
        if (recorded - computed).abs() > DISCREPANCY_TOLERANCE {
            errors.push(ValidationIssue::ExpectedCashMismatch { recorded, computed });
        }
    }

    if let (Some(actual), Some(expected), Some(recorded)) =
        (number("actualCash"), number("expectedCash"), discrepancy)
    {
        let computed = actual - expected;
        if (recorded - computed).abs() > DISCREPANCY_TOLERANCE {
            errors.push(ValidationIssue::DiscrepancyMismatch { recorded, computed });
        }
    }

    let opened = timestamp_field(obj, "openedAt", &mut errors);
    let closed = timestamp_field(obj, "closedAt", &mut errors);
    if let (Some((opened_at, open_raw)), Some((closed_at, close_raw))) = (opened, closed)
        && closed_at <= opened_at
    {
        errors.push(ValidationIssue::CloseNotAfterOpen {
            opened_at: open_raw,
            closed_at: close_raw,
        });
    }

    if let Some(d) = discrepancy
        && d.abs() > DISCREPANCY_TOLERANCE
    {
        let has_remark = obj
            .get("discrepancyRemark")
            .and_then(Value::as_str)
            .is_some_and(|r| !r.trim().is_empty());
        if !has_remark {
            errors.push(ValidationIssue::MissingRemark(d));
        }
    }

    // Shape problems not covered above, e.g. a negative transaction count.
    if errors.is_empty()
        && let Err(e) = serde_json::from_value::<ClosingRecord>(doc.clone())
    {
        errors.push(ValidationIssue::Malformed(e.to_string()));
    }

    ValidationReport { errors }
}

/// Parse a timestamp field, recording an issue when it is present but unparsable.
/// Absent fields are already reported by the required-field check.
fn timestamp_field(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
    errors: &mut Vec<ValidationIssue>,
) -> Option<(DateTime<Utc>, String)> {
    let value = obj.get(field)?;
    if value.is_null() {
        return None;
    }
    let raw = match value.as_str() {
        Some(s) if s.trim().is_empty() => return None,
        Some(s) => s.to_owned(),
        None => value.to_string(),
    };
    match parse_timestamp(&raw) {
        Some(ts) => Some((ts, raw)),
        None => {
            errors.push(ValidationIssue::UnparsableTimestamp { field, value: raw });
            None
        }
    }
}

/// Accepts RFC 3339, or a naive local timestamp interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|pattern| NaiveDateTime::parse_from_str(raw, pattern).ok())
        .map(|naive| naive.and_utc())
}
