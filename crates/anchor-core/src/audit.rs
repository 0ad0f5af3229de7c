//! Audit events: the immutable, hash-chained record of every governed
//! operation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Error, Result, chain};

/// Default page size for audit queries.
pub const DEFAULT_AUDIT_LIMIT: usize = 50;
/// Upper bound on audit query page size.
pub const MAX_AUDIT_LIMIT: usize = 1000;

// ─── Operation ───────────────────────────────────────────────────────────────

/// The operation an event records. Unknown strings survive as `Other` so old
/// chains and foreign artifacts still verify.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Operation {
  DataWrite,
  DataDelete,
  DataExpire,
  CheckpointCreate,
  CheckpointRestore,
  CheckpointDelete,
  ConfigUpdate,
  AgentCreate,
  AgentUpdate,
  AgentSuspend,
  AgentActivate,
  AgentDelete,
  AuditExport,
  Other(String),
}

impl Operation {
  pub fn as_str(&self) -> &str {
    match self {
      Self::DataWrite => "data.write",
      Self::DataDelete => "data.delete",
      Self::DataExpire => "data.expire",
      Self::CheckpointCreate => "checkpoint.create",
      Self::CheckpointRestore => "checkpoint.restore",
      Self::CheckpointDelete => "checkpoint.delete",
      Self::ConfigUpdate => "config.update",
      Self::AgentCreate => "agent.create",
      Self::AgentUpdate => "agent.update",
      Self::AgentSuspend => "agent.suspend",
      Self::AgentActivate => "agent.activate",
      Self::AgentDelete => "agent.delete",
      Self::AuditExport => "audit.export",
      Self::Other(s) => s,
    }
  }
}

impl From<&str> for Operation {
  fn from(s: &str) -> Self {
    match s {
      "data.write" => Self::DataWrite,
      "data.delete" => Self::DataDelete,
      "data.expire" => Self::DataExpire,
      "checkpoint.create" => Self::CheckpointCreate,
      "checkpoint.restore" => Self::CheckpointRestore,
      "checkpoint.delete" => Self::CheckpointDelete,
      "config.update" => Self::ConfigUpdate,
      "agent.create" => Self::AgentCreate,
      "agent.update" => Self::AgentUpdate,
      "agent.suspend" => Self::AgentSuspend,
      "agent.activate" => Self::AgentActivate,
      "agent.delete" => Self::AgentDelete,
      "audit.export" => Self::AuditExport,
      other => Self::Other(other.to_owned()),
    }
  }
}

impl From<String> for Operation {
  fn from(s: String) -> Self { Operation::from(s.as_str()) }
}

impl From<Operation> for String {
  fn from(op: Operation) -> Self { op.as_str().to_owned() }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

// ─── Result ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
  /// A write the policy engine let through.
  Allowed,
  /// A write the policy engine refused. Still recorded.
  Blocked,
  /// Any other completed operation (delete, checkpoint, config change).
  Success,
}

impl AuditResult {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Allowed => "allowed",
      Self::Blocked => "blocked",
      Self::Success => "success",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "allowed" => Ok(Self::Allowed),
      "blocked" => Ok(Self::Blocked),
      "success" => Ok(Self::Success),
      other => Err(Error::UnknownVariant { kind: "audit result", value: other.to_owned() }),
    }
  }
}

// ─── Event ───────────────────────────────────────────────────────────────────

/// One link of an agent's chain. Never updated or deleted once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
  pub id:            Uuid,
  pub agent_id:      String,
  /// Position in the agent's chain, starting at 0.
  pub sequence:      u64,
  pub operation:     Operation,
  pub resource:      String,
  pub result:        AuditResult,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub blocked_by:    Option<String>,
  #[serde(with = "chain::timestamp")]
  pub timestamp:     DateTime<Utc>,
  pub hash:          String,
  pub previous_hash: String,
  #[serde(default)]
  pub metadata:      Value,
}

impl AuditEvent {
  /// Whether the stored hash matches the event's own fields.
  pub fn hash_is_consistent(&self) -> bool { chain::event_hash(self) == self.hash }
}

/// An event before it is placed on a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEvent {
  pub operation:  Operation,
  pub resource:   String,
  pub result:     AuditResult,
  pub blocked_by: Option<String>,
  pub metadata:   Value,
}

impl NewAuditEvent {
  pub fn new(operation: Operation, resource: impl Into<String>, result: AuditResult) -> Self {
    Self {
      operation,
      resource: resource.into(),
      result,
      blocked_by: None,
      metadata: Value::Object(Map::new()),
    }
  }

  /// Replace the metadata. Non-object values are wrapped as `{"value": ..}`
  /// so later inserts always have somewhere to go.
  pub fn with_metadata(mut self, metadata: Value) -> Self {
    self.metadata = match metadata {
      Value::Object(_) => metadata,
      Value::Null => Value::Object(Map::new()),
      other => serde_json::json!({ "value": other }),
    };
    self
  }

  /// Add one metadata field.
  pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
    if let Value::Object(map) = &mut self.metadata {
      map.insert(key.to_owned(), value.into());
    }
    self
  }

  /// Mark the event blocked. `blocked_by` and `reason` are mirrored into the
  /// metadata so the hash covers them.
  pub fn blocked(mut self, blocked_by: impl Into<String>, reason: impl Into<String>) -> Self {
    let blocked_by = blocked_by.into();
    self.result = AuditResult::Blocked;
    self = self
      .with_field("blocked_by", blocked_by.clone())
      .with_field("reason", reason.into());
    self.blocked_by = Some(blocked_by);
    self
  }

  /// Place the event on a chain: assign identity and position and compute
  /// its hash.
  pub fn seal(
    self,
    agent_id: &str,
    sequence: u64,
    previous_hash: String,
    timestamp: DateTime<Utc>,
  ) -> AuditEvent {
    let timestamp = crate::clock::truncate_micros(timestamp);
    let hash = chain::compute_hash(
      &previous_hash,
      self.operation.as_str(),
      &self.resource,
      self.result.as_str(),
      &chain::format_timestamp(timestamp),
      &self.metadata,
    );
    AuditEvent {
      id: Uuid::new_v4(),
      agent_id: agent_id.to_owned(),
      sequence,
      operation: self.operation,
      resource: self.resource,
      result: self.result,
      blocked_by: self.blocked_by,
      timestamp,
      hash,
      previous_hash,
      metadata: self.metadata,
    }
  }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// An inclusive time window over a chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainRange {
  pub start: Option<DateTime<Utc>>,
  pub end:   Option<DateTime<Utc>>,
}

impl ChainRange {
  pub fn contains(&self, ts: DateTime<Utc>) -> bool {
    self.start.is_none_or(|s| ts >= s) && self.end.is_none_or(|e| ts <= e)
  }
}

/// Filter for the newest-first audit listing.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
  /// Empty means every operation.
  pub operations: Vec<Operation>,
  pub range:      ChainRange,
  pub limit:      Option<usize>,
  pub offset:     Option<usize>,
}

impl AuditQuery {
  pub fn effective_limit(&self) -> usize {
    self.limit.unwrap_or(DEFAULT_AUDIT_LIMIT).clamp(1, MAX_AUDIT_LIMIT)
  }

  /// Parse the comma-separated `operations` query parameter.
  pub fn parse_operations(raw: &str) -> Vec<Operation> {
    raw
      .split(',')
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(Operation::from)
      .collect()
  }
}

/// One page of audit events plus the chain's endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
  pub events:      Vec<AuditEvent>,
  pub total:       u64,
  /// Genesis value the agent's chain starts from.
  pub chain_start: Option<String>,
  /// Hash of the agent's most recent event.
  pub chain_end:   Option<String>,
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;
  use serde_json::json;

  use super::*;

  #[test]
  fn operation_round_trips_through_strings() {
    let op: Operation = serde_json::from_value(json!("checkpoint.restore")).unwrap();
    assert_eq!(op, Operation::CheckpointRestore);
    let other: Operation = serde_json::from_value(json!("vendor.thing")).unwrap();
    assert_eq!(other.as_str(), "vendor.thing");
    assert_eq!(serde_json::to_value(&other).unwrap(), json!("vendor.thing"));
  }

  #[test]
  fn blocked_reason_lands_in_metadata() {
    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let ev = NewAuditEvent::new(Operation::DataWrite, "user/ssn", AuditResult::Allowed)
      .blocked("policy:do_not_store", "nope")
      .seal("a1", 0, chain::genesis_hash("a1"), ts);
    assert_eq!(ev.result, AuditResult::Blocked);
    assert_eq!(ev.blocked_by.as_deref(), Some("policy:do_not_store"));
    assert_eq!(ev.metadata["blocked_by"], json!("policy:do_not_store"));
    assert_eq!(ev.metadata["reason"], json!("nope"));
    assert!(ev.hash_is_consistent());
  }

  #[test]
  fn event_json_uses_microsecond_timestamps() {
    let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let ev = NewAuditEvent::new(Operation::DataDelete, "k", AuditResult::Success)
      .seal("a1", 0, chain::genesis_hash("a1"), ts);
    let v = serde_json::to_value(&ev).unwrap();
    assert_eq!(v["timestamp"], json!("2024-01-01T00:00:00.000000Z"));
    assert_eq!(v["operation"], json!("data.delete"));
    let back: AuditEvent = serde_json::from_value(v).unwrap();
    assert_eq!(back, ev);
  }

  #[test]
  fn query_limit_is_clamped() {
    let q = AuditQuery { limit: Some(5000), ..Default::default() };
    assert_eq!(q.effective_limit(), MAX_AUDIT_LIMIT);
    assert_eq!(AuditQuery::default().effective_limit(), DEFAULT_AUDIT_LIMIT);
  }
}
