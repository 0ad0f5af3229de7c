//! Governed key-value entries and their request/response shapes.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result, audit::AuditEvent, policy::Diagnostic};

pub const MAX_KEY_BYTES: usize = 512;
pub const MAX_VALUE_BYTES: usize = 1024 * 1024;
/// Values in non-`full` listings are cut to this many characters.
pub const PREVIEW_CHARS: usize = 256;
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 1000;

pub fn validate_key(key: &str) -> Result<()> {
  if key.is_empty() {
    return Err(Error::InvalidKey("key must not be empty".into()));
  }
  if key.len() > MAX_KEY_BYTES {
    return Err(Error::InvalidKey(format!("key exceeds {MAX_KEY_BYTES} bytes")));
  }
  if key.chars().any(char::is_control) {
    return Err(Error::InvalidKey("key contains control characters".into()));
  }
  Ok(())
}

pub fn validate_value(value: &str) -> Result<()> {
  if value.len() > MAX_VALUE_BYTES {
    return Err(Error::ValueTooLarge { limit: MAX_VALUE_BYTES });
  }
  Ok(())
}

// ─── Entries ─────────────────────────────────────────────────────────────────

/// A live (unexpired) entry as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
  pub key:        String,
  pub value:      String,
  #[serde(default)]
  pub metadata:   Value,
  /// Bumped on every overwrite, starting at 1.
  pub version:    u64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires_at: Option<DateTime<Utc>>,
  /// The audit event that authorised the last mutation.
  pub audit_id:   Uuid,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub truncated:  bool,
}

impl DataEntry {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| at <= now)
  }

  /// Cut the value down to [`PREVIEW_CHARS`] characters for listings.
  pub fn into_preview(mut self) -> Self {
    if let Some((idx, _)) = self.value.char_indices().nth(PREVIEW_CHARS) {
      self.value.truncate(idx);
      self.truncated = true;
    }
    self
  }
}

/// An entry together with the event that authorised it.
#[derive(Debug, Clone, Serialize)]
pub struct FullEntry {
  pub entry: DataEntry,
  pub audit: AuditEvent,
}

// ─── Writes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DataWrite {
  pub key:      String,
  pub value:    String,
  #[serde(default)]
  pub metadata: Option<Value>,
}

impl DataWrite {
  pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
    Self { key: key.into(), value: value.into(), metadata: None }
  }

  pub fn with_metadata(mut self, metadata: Value) -> Self {
    self.metadata = Some(metadata);
    self
  }

  pub fn validate(&self) -> Result<()> {
    validate_key(&self.key)?;
    validate_value(&self.value)
  }
}

/// Result of a governed write. A policy block is a successful outcome with
/// `allowed == false`, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOutcome {
  pub key:         String,
  pub allowed:     bool,
  pub audit_id:    Uuid,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub blocked_by:  Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason:      Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires_at:  Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_at:  Option<DateTime<Utc>>,
  /// Hash of the audit event recorded for this write.
  pub hash:        String,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub redacted:    bool,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub diagnostics: Vec<Diagnostic>,
}

// ─── Listing ─────────────────────────────────────────────────────────────────

/// Listing parameters. Results are ordered by key, ascending.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataQuery {
  #[serde(default)]
  pub prefix: Option<String>,
  #[serde(default)]
  pub limit:  Option<usize>,
  #[serde(default)]
  pub cursor: Option<String>,
  /// Return whole values instead of previews.
  #[serde(default)]
  pub full:   bool,
}

impl DataQuery {
  pub fn effective_limit(&self) -> usize {
    self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
  }

  /// The key after which the page starts.
  pub fn after_key(&self) -> Result<Option<String>> {
    self.cursor.as_deref().map(decode_cursor).transpose()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPage {
  pub data:        Vec<DataEntry>,
  pub has_more:    bool,
  pub total:       u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_cursor: Option<String>,
}

/// Cursors are the URL-safe base64 of the last key returned.
pub fn encode_cursor(last_key: &str) -> String { URL_SAFE_NO_PAD.encode(last_key) }

pub fn decode_cursor(cursor: &str) -> Result<String> {
  let bytes = URL_SAFE_NO_PAD.decode(cursor).map_err(|_| Error::InvalidCursor)?;
  String::from_utf8(bytes).map_err(|_| Error::InvalidCursor)
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn keys_are_validated() {
    assert!(validate_key("user/prefs/theme").is_ok());
    assert!(validate_key("").is_err());
    assert!(validate_key("bad\nkey").is_err());
    assert!(validate_key(&"k".repeat(MAX_KEY_BYTES + 1)).is_err());
    assert!(validate_value(&"v".repeat(MAX_VALUE_BYTES + 1)).is_err());
  }

  #[test]
  fn cursor_round_trips_and_rejects_garbage() {
    let c = encode_cursor("notes/ünïcode");
    assert_eq!(decode_cursor(&c).unwrap(), "notes/ünïcode");
    assert!(matches!(decode_cursor("***"), Err(Error::InvalidCursor)));
  }

  #[test]
  fn preview_truncates_on_char_boundary() {
    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let entry = DataEntry {
      key:        "k".into(),
      value:      "é".repeat(300),
      metadata:   Value::Null,
      version:    1,
      created_at: ts,
      updated_at: ts,
      expires_at: None,
      audit_id:   Uuid::nil(),
      truncated:  false,
    };
    let preview = entry.clone().into_preview();
    assert!(preview.truncated);
    assert_eq!(preview.value.chars().count(), PREVIEW_CHARS);

    let short = DataEntry { value: "short".into(), ..entry }.into_preview();
    assert!(!short.truncated);
  }
}
