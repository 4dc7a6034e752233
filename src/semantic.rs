//! Semantic text derivation.
//!
//! Turns a source record into a short natural-language description that is
//! fed to the embedding provider. Every field contributes at most one clause,
//! rendered from its [`FieldType`]:
//!
//! ```text
//! ("unit_price", Currency, 12.5)  →  "unit price amount is 12.50"
//! ("tags", MultiSelect, "a,b")    →  "tags includes a, b"
//! ("nc_order", _, 3)              →  (none, reserved)
//! ```
//!
//! The full record text is `"{table} record"` followed by every clause,
//! joined with `". "`. All functions here are pure.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;

use crate::models::{Field, FieldType, Record};

const SYSTEM_PREFIXES: [&str; 2] = ["nc_", "_"];
const LONG_TEXT_LIMIT: usize = 2000;
const STRUCTURED_LIMIT: usize = 500;

/// Derive the clause for a single field, or `None` when the field is reserved
/// or its value is empty.
pub fn field_clause(name: &str, field_type: &FieldType, value: &Value) -> Option<String> {
    if is_reserved(name) || *field_type == FieldType::PrimaryKey || is_empty(value) {
        return None;
    }

    let label = label_for(name);
    let clause = match field_type {
        FieldType::ShortText => format!("{}: {}", label, literal(value)),
        FieldType::LongText => long_text_clause(&label, value),
        FieldType::Number | FieldType::Decimal => match number(value) {
            Some(n) => format!("{} is {}", label, format_number(n)),
            None => fallback(&label, value),
        },
        FieldType::Currency => match number(value) {
            Some(n) => format!("{} amount is {:.2}", label, n),
            None => fallback(&label, value),
        },
        FieldType::Percent => match number(value) {
            Some(n) => format!("{} is {}%", label, format_number(n)),
            None => fallback(&label, value),
        },
        FieldType::Duration => match number(value) {
            Some(secs) => format!("{} lasts {}", label, format_duration(secs)),
            None => format!("{} lasts {}", label, literal(value)),
        },
        FieldType::Rating => match number(value) {
            Some(n) => format!("{} rated {} out of 5", label, format_number(n)),
            None => fallback(&label, value),
        },
        FieldType::Boolean => match truthy(value) {
            Some(true) => format!("{}: yes", label),
            Some(false) => format!("{}: no", label),
            None => fallback(&label, value),
        },
        FieldType::Checkbox => match truthy(value) {
            Some(true) => format!("{} is checked", label),
            Some(false) => format!("{} is not checked", label),
            None => fallback(&label, value),
        },
        FieldType::Date => match value.as_str().and_then(parse_date) {
            Some(d) => format!("{} on {}", label, d.format("%B %-d, %Y")),
            None => format!("{} on {}", label, literal(value)),
        },
        FieldType::DateTime => match value.as_str().and_then(parse_timestamp) {
            Some(ts) => format!("{} at {}", label, ts.format("%B %-d, %Y %H:%M")),
            None => format!("{} at {}", label, literal(value)),
        },
        FieldType::SingleSelect => format!("{} is {}", label, literal(value)),
        FieldType::MultiSelect => {
            let options = select_options(value);
            if options.is_empty() {
                return None;
            }
            format!("{} includes {}", label, options.join(", "))
        }
        FieldType::Attachment => {
            let count = attachment_count(value);
            if count == 1 {
                format!("{} has 1 attachment", label)
            } else {
                format!("{} has {} attachments", label, count)
            }
        }
        FieldType::Barcode | FieldType::QrCode => format!("{} code {}", label, literal(value)),
        FieldType::Geometry => match value.as_str().and_then(parse_lat_lng) {
            Some((lat, lng)) => format!(
                "{} located at latitude {}, longitude {}",
                label, lat, lng
            ),
            None => format!("{} located at {}", label, literal(value)),
        },
        FieldType::Json => {
            let encoded = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{} data: {}", label, truncate(&encoded, STRUCTURED_LIMIT))
        }
        FieldType::PrimaryKey => return None,
        FieldType::Unknown(_) => fallback(&label, value),
    };

    Some(clause)
}

/// Build the semantic text for a whole record.
///
/// Clauses follow schema order, then any record keys the schema does not
/// mention (typed with [`FieldType::DEFAULT`]). Returns `None` when no field
/// produced a clause.
pub fn record_text(table: &str, fields: &[Field], record: &Record) -> Option<String> {
    let mut clauses = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for field in fields {
        seen.insert(field.name.as_str());
        if field.primary_key {
            continue;
        }
        if let Some(value) = record.get(&field.name) {
            if let Some(clause) = field_clause(&field.name, &field.field_type, value) {
                clauses.push(clause);
            }
        }
    }

    for (name, value) in record {
        if seen.contains(name.as_str()) {
            continue;
        }
        if let Some(clause) = field_clause(name, &FieldType::DEFAULT, value) {
            clauses.push(clause);
        }
    }

    if clauses.is_empty() {
        return None;
    }

    let mut text = format!("{} record", label_for(table));
    for clause in clauses {
        text.push_str(". ");
        text.push_str(&clause);
    }
    Some(text)
}

/// Turn a field name into a lowercase, space-separated label.
///
/// `first_name` → `first name`, `unitPrice` → `unit price`,
/// `HTTPStatus` → `http status`.
pub fn label_for(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if matches!(c, '_' | '-' | '.' | '/') {
            out.push(' ');
            continue;
        }
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).map(|n| n.is_lowercase()).unwrap_or(false);
            if prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_lower)
            {
                out.push(' ');
            }
        }
        out.push(c);
    }

    out.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// System-prefixed and primary-key fields never contribute text.
pub fn is_reserved(name: &str) -> bool {
    name.eq_ignore_ascii_case("id") || SYSTEM_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn fallback(label: &str, value: &Value) -> String {
    format!("{}: {}", label, literal(value))
}

fn long_text_clause(label: &str, value: &Value) -> String {
    let collapsed = literal(value)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    format!("{}: {}", label, truncate(&collapsed, LONG_TEXT_LIMIT))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut parts = Vec::new();
    for (amount, unit) in [(hours, "hour"), (minutes, "minute"), (seconds, "second")] {
        if amount > 0 {
            let plural = if amount == 1 { "" } else { "s" };
            parts.push(format!("{} {}{}", amount, unit, plural));
        }
    }
    if parts.is_empty() {
        "0 seconds".to_string()
    } else {
        parts.join(" ")
    }
}

fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "checked" => Some(true),
            "false" | "no" | "0" | "unchecked" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn select_options(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter(|v| !is_empty(v))
            .map(literal)
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect(),
        other => vec![literal(other)],
    }
}

fn attachment_count(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items.len(),
            _ => 1,
        },
        _ => 1,
    }
}

fn parse_lat_lng(s: &str) -> Option<(f64, f64)> {
    let (lat, lng) = s.split_once(';').or_else(|| s.split_once(','))?;
    Some((lat.trim().parse().ok()?, lng.trim().parse().ok()?))
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Parse the timestamp formats the source system emits (RFC 3339, or
/// `YYYY-MM-DD HH:MM:SS` with an optional offset; naive values are UTC).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(ts) = DateTime::parse_from_str(s, fmt) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}
