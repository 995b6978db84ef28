//! PII redaction for event payloads.
//!
//! Best-effort pattern matching: string leaves are scanned for emails,
//! card numbers, UK/international phone numbers and UK postcodes, and
//! top-level fields with PII-like names are scrubbed wholesale. Placeholder
//! tokens contain no digits and no `@`, so redacting twice is a no-op.

use regex::Regex;
use serde_json::{Map, Value};

pub const EMAIL_PLACEHOLDER: &str = "[EMAIL_REDACTED]";
pub const PHONE_PLACEHOLDER: &str = "[PHONE_REDACTED]";
pub const CARD_PLACEHOLDER: &str = "[CARD_REDACTED]";
pub const POSTCODE_PLACEHOLDER: &str = "[POSTCODE_REDACTED]";
pub const FIELD_PLACEHOLDER: &str = "[REDACTED]";

/// Field names never scrubbed, at any depth
const SAFE_FIELDS: &[&str] = &[
    "event_id",
    "trace_id",
    "conversation_id",
    "tenant_id",
    "objective_id",
    "sequence_number",
    "timestamp",
    "started_at",
    "ended_at",
    "created_at",
    "status",
    "code",
    "attempts",
    "retry_count",
    "duration_ms",
    "objective_type",
    "tenant_name",
    "escalation",
    "confidence",
    "circuit_state",
    "event_source",
    "version",
    "locale",
];

/// Substrings marking a top-level field as PII regardless of content
const PII_FIELD_MARKERS: &[&str] = &[
    "email", "phone", "mobile", "address", "name", "postcode", "zip", "dob", "birth", "card",
    "ssn", "account",
];

/// Compiled redaction patterns
#[derive(Debug, Clone)]
pub struct PiiRedactor {
    email: Regex,
    card: Regex,
    uk_phone: Regex,
    intl_phone: Regex,
    postcode: Regex,
}

impl PiiRedactor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            email: Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}")?,
            card: Regex::new(r"\b(?:\d[ -]?){12,18}\d\b")?,
            uk_phone: Regex::new(r"(?:\+44[\s-]?|\b0)[1-37](?:[\s-]?\d){8,9}\b")?,
            intl_phone: Regex::new(r"\+\d{1,3}(?:[\s-]?\d){6,12}\b")?,
            postcode: Regex::new(r"(?i)\b[A-Z]{1,2}\d[A-Z\d]?\s*\d[A-Z]{2}\b")?,
        })
    }

    /// Replace recognizable PII inside free text
    pub fn redact_text(&self, text: &str) -> String {
        let text = self.email.replace_all(text, EMAIL_PLACEHOLDER);
        let text = self.card.replace_all(&text, CARD_PLACEHOLDER);
        let text = self.uk_phone.replace_all(&text, PHONE_PLACEHOLDER);
        let text = self.intl_phone.replace_all(&text, PHONE_PLACEHOLDER);
        let text = self.postcode.replace_all(&text, POSTCODE_PLACEHOLDER);
        text.into_owned()
    }

    /// Redact an event payload (top-level field-name scrubbing plus content scan)
    pub fn redact_payload(&self, payload: &Value) -> Value {
        match payload {
            Value::Object(map) => Value::Object(self.redact_top_level(map)),
            other => self.redact_value(other),
        }
    }

    /// Redact a metadata map the same way as a payload object
    pub fn redact_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        self.redact_top_level(map)
    }

    fn redact_top_level(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                let value = if is_safe_field(key) {
                    value.clone()
                } else if is_pii_field(key) && !value.is_null() {
                    Value::String(FIELD_PLACEHOLDER.to_string())
                } else {
                    self.redact_value(value)
                };
                (key.clone(), value)
            })
            .collect()
    }

    fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.redact_text(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| {
                        let value = if is_safe_field(key) {
                            value.clone()
                        } else {
                            self.redact_value(value)
                        };
                        (key.clone(), value)
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn is_safe_field(key: &str) -> bool {
    SAFE_FIELDS.contains(&key)
}

fn is_pii_field(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    PII_FIELD_MARKERS.iter().any(|marker| key.contains(marker))
}
