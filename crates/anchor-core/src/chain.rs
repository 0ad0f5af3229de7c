//! The audit hash-chain rule and its incremental verifier.
//!
//! Hash rule, version 1:
//!
//! ```text
//! hash = hex(SHA-256( field(previous_hash) ‖ field(operation) ‖ field(resource)
//!                     ‖ field(result) ‖ field(timestamp) ‖ field(canonical_json(metadata)) ))
//! field(s) = u64_le(len(s)) ‖ utf8(s)
//! ```
//!
//! `timestamp` is RFC 3339 UTC with exactly six fractional digits and a `Z`
//! suffix. `canonical_json` sorts object keys by code point and emits no
//! insignificant whitespace. The `previous_hash` of an agent's first event is
//! [`genesis_hash`]. The rule is public so exported artifacts can be checked
//! offline by anyone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{Error, Result, audit::AuditEvent};

/// Human-readable identifier of the hash rule, embedded in exports.
pub const HASH_RULE: &str = "anchor.audit.v1:sha256(len64le(previous_hash|operation|resource|result|timestamp|canonical_json(metadata)))";

const GENESIS_DOMAIN: &str = "anchor.audit.genesis.v1:";

// ─── Primitives ──────────────────────────────────────────────────────────────

pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
  hex::encode(Sha256::digest(bytes.as_ref()))
}

/// The `previous_hash` of an agent's first audit event.
pub fn genesis_hash(agent_id: &str) -> String {
  sha256_hex(format!("{GENESIS_DOMAIN}{agent_id}"))
}

/// Render a timestamp in the hashed form, e.g. `2024-05-01T12:00:00.000000Z`.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
  dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| Error::InvalidTimestamp(s.to_owned()))
}

/// Serde adapter that keeps event timestamps in the hashed textual form.
pub mod timestamp {
  use chrono::{DateTime, Utc};
  use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

  pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&super::format_timestamp(*dt))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    super::parse_timestamp(&raw).map_err(D::Error::custom)
  }
}

/// Deterministic JSON: object keys sorted, no whitespace.
pub fn canonical_json(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, k) in keys.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        out.push_str(&Value::String(k.clone()).to_string());
        out.push(':');
        write_canonical(&map[k], out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}

/// Apply the hash rule to already-rendered fields.
pub fn compute_hash(
  previous_hash: &str,
  operation: &str,
  resource: &str,
  result: &str,
  timestamp: &str,
  metadata: &Value,
) -> String {
  let metadata = canonical_json(metadata);
  let mut hasher = Sha256::new();
  for field in [previous_hash, operation, resource, result, timestamp, metadata.as_str()] {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
  }
  hex::encode(hasher.finalize())
}

/// The hash an event should carry given its own fields.
pub fn event_hash(event: &AuditEvent) -> String {
  compute_hash(
    &event.previous_hash,
    event.operation.as_str(),
    &event.resource,
    event.result.as_str(),
    &format_timestamp(event.timestamp),
    &event.metadata,
  )
}

// ─── Verification result ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
  /// `previous_hash` (or sequence, or owning agent) does not follow on from
  /// the preceding event.
  BrokenLink,
  /// The stored hash does not match the event's own fields.
  HashMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirstInvalid {
  pub id:                     Uuid,
  #[serde(with = "timestamp")]
  pub timestamp:              DateTime<Utc>,
  pub sequence:               u64,
  pub reason:                 InvalidReason,
  pub expected_previous_hash: String,
  pub actual_previous_hash:   String,
  pub expected_hash:          String,
  pub actual_hash:            String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
  #[serde(with = "timestamp")]
  pub start: DateTime<Utc>,
  #[serde(with = "timestamp")]
  pub end:   DateTime<Utc>,
}

/// Outcome of walking a chain (or a slice of one).
///
/// `chain_start` is the `previous_hash` the verified run was anchored on and
/// `chain_end` the hash of the last event checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
  pub valid:          bool,
  pub events_checked: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub chain_start:    Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub chain_end:      Option<String>,
  #[serde(with = "timestamp")]
  pub verified_at:    DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub time_range:     Option<TimeRange>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub first_invalid:  Option<FirstInvalid>,
}

// ─── Verifier ────────────────────────────────────────────────────────────────

/// What the first event fed to a [`ChainVerifier`] must link to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
  /// The agent's genesis value; used when verifying a whole chain.
  Genesis,
  /// A known hash, e.g. the `anchor_previous_hash` recorded in an export.
  Hash(String),
  /// Trust the first event's own `previous_hash`; used only when the slice was empty when its
  /// start was resolved.
  FirstEvent,
}

/// Where a slice of a chain begins, resolved against the stored chain.
#[derive(Debug, Clone)]
pub enum RangeStart {
  /// The slice begins at sequence 0.
  Genesis,
  /// The slice begins right after this stored event.
  After(AuditEvent),
  /// The slice held no events.
  Empty,
}

impl RangeStart {
  /// A verifier for the slice.
  pub fn verifier(&self, agent_id: &str) -> ChainVerifier {
    match self {
      Self::Genesis => ChainVerifier::from_genesis(agent_id),
      Self::After(predecessor) => ChainVerifier::after(agent_id, predecessor),
      Self::Empty => ChainVerifier::new(agent_id, Anchor::FirstEvent),
    }
  }

  /// The `previous_hash` the slice's first event must carry, if known.
  pub fn anchor_hash(&self, agent_id: &str) -> Option<String> {
    match self {
      Self::Genesis => Some(genesis_hash(agent_id)),
      Self::After(predecessor) => Some(predecessor.hash.clone()),
      Self::Empty => None,
    }
  }
}

/// Incremental chain verifier. Feed events in sequence order; memory use is
/// constant regardless of chain length.
#[derive(Debug, Clone)]
pub struct ChainVerifier {
  agent_id:          String,
  genesis:           String,
  anchor:            Anchor,
  expected_previous: Option<String>,
  expected_sequence: Option<u64>,
  events_checked:    u64,
  chain_start:       Option<String>,
  chain_end:         Option<String>,
  first_ts:          Option<DateTime<Utc>>,
  last_ts:           Option<DateTime<Utc>>,
  first_invalid:     Option<FirstInvalid>,
}

impl ChainVerifier {
  pub fn new(agent_id: impl Into<String>, anchor: Anchor) -> Self {
    let agent_id = agent_id.into();
    let genesis = genesis_hash(&agent_id);
    let expected_previous = match &anchor {
      Anchor::Genesis => Some(genesis.clone()),
      Anchor::Hash(h) => Some(h.clone()),
      Anchor::FirstEvent => None,
    };
    Self {
      agent_id,
      genesis,
      anchor,
      expected_previous,
      expected_sequence: None,
      events_checked: 0,
      chain_start: None,
      chain_end: None,
      first_ts: None,
      last_ts: None,
      first_invalid: None,
    }
  }

  /// Verifier for a complete chain starting at genesis.
  pub fn from_genesis(agent_id: impl Into<String>) -> Self {
    Self::new(agent_id, Anchor::Genesis)
  }

  /// Verifier for the slice that follows `predecessor`.
  ///
  /// The predecessor's own hash is recomputed first. An event edited so that it falls just
  /// outside the slice (a rewritten timestamp, say) is therefore reported here as the first
  /// invalid event instead of being trusted as the anchor.
  pub fn after(agent_id: impl Into<String>, predecessor: &AuditEvent) -> Self {
    let mut verifier = Self::new(agent_id, Anchor::Hash(predecessor.hash.clone()));
    verifier.expected_sequence = Some(predecessor.sequence + 1);

    let expected_hash = event_hash(predecessor);
    let reason = if predecessor.agent_id != verifier.agent_id {
      Some(InvalidReason::BrokenLink)
    } else if predecessor.hash != expected_hash {
      Some(InvalidReason::HashMismatch)
    } else {
      None
    };
    if let Some(reason) = reason {
      verifier.events_checked = 1;
      verifier.first_invalid = Some(FirstInvalid {
        id: predecessor.id,
        timestamp: predecessor.timestamp,
        sequence: predecessor.sequence,
        reason,
        expected_previous_hash: predecessor.previous_hash.clone(),
        actual_previous_hash: predecessor.previous_hash.clone(),
        expected_hash,
        actual_hash: predecessor.hash.clone(),
      });
    }
    verifier
  }

  pub fn is_broken(&self) -> bool { self.first_invalid.is_some() }

  pub fn events_checked(&self) -> u64 { self.events_checked }

  /// Check one event. Returns `false` once the chain is known to be broken;
  /// later events are ignored.
  pub fn feed(&mut self, event: &AuditEvent) -> bool {
    if self.is_broken() {
      return false;
    }

    let first = self.events_checked == 0;
    // A sequence-0 event links to genesis whatever the anchor says.
    let expected_previous = match (&self.expected_previous, event.sequence) {
      (_, 0) => self.genesis.clone(),
      (Some(prev), _) => prev.clone(),
      (None, _) => event.previous_hash.clone(),
    };
    let anchor_ok = self
      .expected_previous
      .as_ref()
      .is_none_or(|prev| *prev == event.previous_hash);

    if first {
      self.chain_start = Some(expected_previous.clone());
    }

    let sequence_ok = self.expected_sequence.is_none_or(|s| s == event.sequence);
    let expected_hash = event_hash(event);
    self.events_checked += 1;

    let reason = if event.previous_hash != expected_previous
      || !anchor_ok
      || !sequence_ok
      || event.agent_id != self.agent_id
    {
      Some(InvalidReason::BrokenLink)
    } else if event.hash != expected_hash {
      Some(InvalidReason::HashMismatch)
    } else {
      None
    };

    if let Some(reason) = reason {
      self.first_invalid = Some(FirstInvalid {
        id: event.id,
        timestamp: event.timestamp,
        sequence: event.sequence,
        reason,
        expected_previous_hash: expected_previous,
        actual_previous_hash: event.previous_hash.clone(),
        expected_hash,
        actual_hash: event.hash.clone(),
      });
      return false;
    }

    self.expected_previous = Some(event.hash.clone());
    self.expected_sequence = Some(event.sequence + 1);
    self.chain_end = Some(event.hash.clone());
    self.first_ts.get_or_insert(event.timestamp);
    self.last_ts = Some(event.timestamp);
    true
  }

  pub fn finish(self, verified_at: DateTime<Utc>) -> Verification {
    let time_range = match (self.first_ts, self.last_ts) {
      (Some(start), Some(end)) => Some(TimeRange { start, end }),
      _ => None,
    };
    let chain_start = self.chain_start.or_else(|| match self.anchor {
      Anchor::Genesis => Some(self.genesis),
      Anchor::Hash(h) => Some(h),
      Anchor::FirstEvent => None,
    });
    Verification {
      valid: self.first_invalid.is_none(),
      events_checked: self.events_checked,
      chain_start,
      chain_end: self.chain_end,
      verified_at,
      time_range,
      first_invalid: self.first_invalid,
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone};
  use serde_json::json;

  use super::*;
  use crate::audit::{AuditResult, NewAuditEvent, Operation};

  fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() }

  fn chain(agent: &str, n: u64) -> Vec<AuditEvent> {
    let mut prev = genesis_hash(agent);
    (0..n)
      .map(|i| {
        let ev = NewAuditEvent::new(Operation::DataWrite, format!("k{i}"), AuditResult::Allowed)
          .with_metadata(json!({ "i": i }))
          .seal(agent, i, prev.clone(), t0() + Duration::seconds(i as i64));
        prev = ev.hash.clone();
        ev
      })
      .collect()
  }

  #[test]
  fn canonical_json_sorts_keys_recursively() {
    let v = json!({ "b": 1, "a": { "z": [1, {"y": null, "x": "s"}], "c": true } });
    assert_eq!(
      canonical_json(&v),
      r#"{"a":{"c":true,"z":[1,{"x":"s","y":null}]},"b":1}"#
    );
  }

  #[test]
  fn timestamp_has_six_fraction_digits() {
    assert_eq!(format_timestamp(t0()), "2024-05-01T12:00:00.000000Z");
    let parsed = parse_timestamp("2024-05-01T12:00:00.000000Z").unwrap();
    assert_eq!(parsed, t0());
  }

  #[test]
  fn length_framing_separates_fields() {
    let m = json!({});
    assert_ne!(
      compute_hash("p", "ab", "c", "r", "t", &m),
      compute_hash("p", "a", "bc", "r", "t", &m)
    );
  }

  #[test]
  fn genesis_differs_per_agent() {
    assert_ne!(genesis_hash("a"), genesis_hash("b"));
    assert_eq!(genesis_hash("a").len(), 64);
  }

  #[test]
  fn intact_chain_verifies() {
    let events = chain("a1", 5);
    let mut v = ChainVerifier::from_genesis("a1");
    assert!(events.iter().all(|e| v.feed(e)));
    let result = v.finish(t0());
    assert!(result.valid);
    assert_eq!(result.events_checked, 5);
    assert_eq!(result.chain_start, Some(genesis_hash("a1")));
    assert_eq!(result.chain_end.as_ref(), Some(&events[4].hash));
    assert_eq!(result.time_range.unwrap().end, t0() + Duration::seconds(4));
  }

  #[test]
  fn edited_field_is_a_hash_mismatch_at_that_event() {
    let mut events = chain("a1", 4);
    events[2].resource = "tampered".into();
    let mut v = ChainVerifier::from_genesis("a1");
    for e in &events {
      v.feed(e);
    }
    let result = v.finish(t0());
    assert!(!result.valid);
    let bad = result.first_invalid.unwrap();
    assert_eq!(bad.id, events[2].id);
    assert_eq!(bad.reason, InvalidReason::HashMismatch);
    assert_eq!(result.events_checked, 3);
  }

  #[test]
  fn removed_event_is_a_broken_link() {
    let mut events = chain("a1", 4);
    events.remove(1);
    let mut v = ChainVerifier::from_genesis("a1");
    for e in &events {
      v.feed(e);
    }
    let bad = v.finish(t0()).first_invalid.unwrap();
    assert_eq!(bad.id, events[1].id);
    assert_eq!(bad.reason, InvalidReason::BrokenLink);
    assert_eq!(bad.actual_previous_hash, events[1].previous_hash);
  }

  #[test]
  fn first_event_anchor_verifies_a_tail() {
    let events = chain("a1", 6);
    let mut v = ChainVerifier::new("a1", Anchor::FirstEvent);
    assert!(events[3..].iter().all(|e| v.feed(e)));
    let result = v.finish(t0());
    assert!(result.valid);
    assert_eq!(result.chain_start.as_ref(), Some(&events[3].previous_hash));
  }

  #[test]
  fn tail_after_predecessor_verifies() {
    let events = chain("a1", 6);
    let mut v = RangeStart::After(events[2].clone()).verifier("a1");
    assert!(events[3..].iter().all(|e| v.feed(e)));
    let result = v.finish(t0());
    assert!(result.valid);
    assert_eq!(result.events_checked, 3);
    assert_eq!(result.chain_start.as_ref(), Some(&events[2].hash));
  }

  #[test]
  fn edited_predecessor_is_the_first_invalid_event() {
    let events = chain("a1", 5);
    let mut moved = events[1].clone();
    moved.timestamp -= Duration::hours(2);
    let mut v = ChainVerifier::after("a1", &moved);
    assert!(v.is_broken());
    assert!(!v.feed(&events[2]));

    let result = v.finish(t0());
    assert!(!result.valid);
    let bad = result.first_invalid.unwrap();
    assert_eq!(bad.id, events[1].id);
    assert_eq!(bad.reason, InvalidReason::HashMismatch);
    assert_eq!(bad.expected_hash, events[1].hash);
  }

  #[test]
  fn tail_must_continue_the_predecessor_sequence() {
    let events = chain("a1", 5);
    let mut v = ChainVerifier::after("a1", &events[1]);
    assert!(!v.feed(&events[3]));
    assert_eq!(v.finish(t0()).first_invalid.unwrap().reason, InvalidReason::BrokenLink);
  }

  #[test]
  fn empty_chain_is_valid() {
    let result = ChainVerifier::from_genesis("a1").finish(t0());
    assert!(result.valid);
    assert_eq!(result.events_checked, 0);
    assert!(result.chain_end.is_none());
  }
}
