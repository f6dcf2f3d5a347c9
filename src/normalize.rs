//! Field normalization for heterogeneous mobile-forensic records.
//!
//! Source databases carry no fixed schema, so every logical attribute is
//! resolved through an ordered candidate-field list, and raw values are
//! normalized into canonical identifiers, display names, and timestamps.
//! Nothing here errors: a value that cannot be normalized is returned as-is
//! (timestamps) or yields no identity (actors).

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Seconds between the Unix epoch and 2001-01-01T00:00:00Z. Many mobile
/// databases store seconds (or milliseconds) since the Apple/Cocoa epoch.
pub const APPLE_EPOCH_OFFSET: f64 = 978_307_200.0;

// Candidate-field lists per logical attribute. The order is priority, not
// coincidence: earlier names are more specific in the wild exports we see.
pub const TEXT_FIELDS: &[&str] = &["text", "body", "message", "content", "value", "notes"];
pub const TIMESTAMP_FIELDS: &[&str] = &[
    "timestamp", "date", "created", "sent", "received", "time", "modified",
];
pub const SENDER_FIELDS: &[&str] = &[
    "sender", "from", "author", "handle", "address", "account", "source",
];
pub const RECEIVER_FIELDS: &[&str] = &["receiver", "to", "target", "recipient", "destination"];
pub const CONVERSATION_FIELDS: &[&str] = &["conversation", "thread", "chat", "dialog", "room"];
pub const DIRECTION_FIELDS: &[&str] = &["direction", "is_from_me", "incoming", "outgoing", "type"];
pub const MESSAGE_TYPE_FIELDS: &[&str] = &["type", "message_type", "category", "service"];

pub const DISPLAY_NAME_FIELDS: &[&str] = &["display_name", "name", "full_name", "fullname"];
pub const GIVEN_NAME_FIELDS: &[&str] = &["first", "given", "firstname"];
pub const FAMILY_NAME_FIELDS: &[&str] = &["last", "surname", "lastname"];
pub const PHONE_FIELDS: &[&str] = &[
    "phone", "phone_number", "number", "mobile", "msisdn", "home", "work",
];
pub const EMAIL_FIELDS: &[&str] = &["email", "email_address", "mail"];

/// Return the first non-null, non-empty value from `payload` by the priority
/// order of `fields`. Payload keys are expected to be lowercased already;
/// lookups are effectively case-insensitive because of that contract.
pub fn pick_first_value(payload: &serde_json::Map<String, Value>, fields: &[&str]) -> Option<String> {
    for field in fields {
        if let Some(value) = payload.get(*field) {
            if let Some(text) = value_to_string(value) {
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
    }
    None
}

/// Render a JSON payload cell as text. Null yields nothing; everything else
/// is stringified the way the raw row would print.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Best-effort timestamp normalization to UTC ISO-8601.
///
/// Numeric values are treated as epoch offsets: magnitudes above 1e12 are
/// milliseconds, and anything past the Apple epoch offset is interpreted as
/// seconds since 2001-01-01 (the dominant convention in iOS exports). String
/// values get an ISO-8601 parse, assuming UTC when no offset is present.
/// Unparseable input is returned verbatim.
pub fn normalize_timestamp(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return raw.to_string();
    }

    if let Ok(numeric) = trimmed.parse::<f64>() {
        let mut seconds = numeric;
        if seconds > 1e12 {
            seconds /= 1000.0;
        }
        if seconds > APPLE_EPOCH_OFFSET {
            seconds -= APPLE_EPOCH_OFFSET;
        }
        let whole = seconds.trunc() as i64;
        let nanos = ((seconds - seconds.trunc()) * 1e9).round() as u32;
        return match DateTime::from_timestamp(whole, nanos) {
            Some(parsed) => parsed.to_rfc3339(),
            None => raw.to_string(),
        };
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return parsed.with_timezone(&Utc).to_rfc3339();
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return naive.and_utc().to_rfc3339();
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return naive.and_utc().to_rfc3339();
        }
    }

    raw.to_string()
}

/// Reduce a raw actor value to a canonical identity.
///
/// Emails become lowercased addresses, phone-like values become their digit
/// string (keeping a leading `+`), and anything else falls back to the
/// lowercased trimmed text. Empty input yields no identity.
pub fn canonicalize_actor(raw: Option<&str>) -> Option<String> {
    let mut text = raw?.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(prefix) = text.get(..4) {
        if prefix.eq_ignore_ascii_case("tel:") {
            text = &text[4..];
        }
    }

    if text.contains('@') {
        return Some(text.to_lowercase());
    }

    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        let prefix = if text.trim().starts_with('+') { "+" } else { "" };
        return Some(format!("{prefix}{digits}"));
    }

    Some(text.to_lowercase())
}

/// Join non-empty name parts with a single space.
pub fn compose_display_name(given: Option<&str>, family: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [given, family]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}
