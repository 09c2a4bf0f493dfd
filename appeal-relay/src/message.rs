use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Columns every uploaded file must carry, whatever its format.
pub const REQUIRED_COLUMNS: [&str; 4] = ["text", "user_id", "external_id", "timestamp"];

const TIMESTAMP_HINT: &str =
    "Use an ISO-8601 instant such as 2024-05-01T12:00:00Z, or leave the field empty";
const TEXT_HINT: &str = "Every appeal needs a non-empty text";

/// One row or API record before validation. Every field is optional at this stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawRecord {
    pub text: Option<String>,
    #[serde(alias = "userId")]
    pub user_id: Option<String>,
    #[serde(alias = "externalId")]
    pub external_id: Option<String>,
    pub timestamp: Option<String>,
}

/// The validated, hash-tagged form of an appeal that travels through the relay.
/// Only [`normalize`] builds one, so the invariants below always hold:
/// `text` is trimmed and non-empty, and `content_hash` matches `(timestamp, text)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    text: String,
    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: DateTime<Utc>,
    content_hash: String,
}

impl CanonicalMessage {
    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&canonical_timestamp(ts))
}

/// The one textual form of an instant used on the wire and inside the hash.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// SHA-256 over the canonical timestamp and the trimmed text, hex encoded.
/// A unit separator keeps `("a", "bc")` and `("ab", "c")` apart.
pub fn content_hash(timestamp: &DateTime<Utc>, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_timestamp(timestamp).as_bytes());
    hasher.update([0x1f]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Validates a raw record, stamping records without a timestamp with the current time.
pub fn normalize(raw: RawRecord) -> Result<CanonicalMessage, ValidationError> {
    normalize_at(raw, Utc::now())
}

pub fn normalize_at(raw: RawRecord, now: DateTime<Utc>) -> Result<CanonicalMessage, ValidationError> {
    let text = raw
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ValidationError::new("text", "text is missing or blank", TEXT_HINT))?
        .to_string();

    let timestamp = match non_blank(raw.timestamp) {
        None => now,
        Some(value) => parse_timestamp(&value).ok_or_else(|| {
            ValidationError::new(
                "timestamp",
                format!("'{value}' is not a valid ISO-8601 instant"),
                TIMESTAMP_HINT,
            )
        })?,
    };

    let content_hash = content_hash(&timestamp, &text);

    Ok(CanonicalMessage {
        external_id: non_blank(raw.external_id),
        user_id: non_blank(raw.user_id),
        text,
        timestamp,
        content_hash,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

const OFFSET_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f %:z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%d %H:%M%:z",
];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parses the ISO-8601 shapes found in exported spreadsheets and JSON dumps.
/// A trailing `Z` means UTC; values without an offset are taken as UTC too.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let value = match value.strip_suffix(['Z', 'z']) {
        Some(stripped) => format!("{stripped}+00:00"),
        None => value.to_string(),
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(&value) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in OFFSET_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(&value, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(&value, format) {
            return Some(ts.and_utc());
        }
    }

    NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}
