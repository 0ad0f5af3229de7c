//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps use the microsecond, fixed-width form the hash rule uses.
//! JSON columns hold compact JSON. UUIDs are hyphenated lowercase strings.

use anchor_core::{
  agent::{Agent, AgentConfig, AgentStatus, ConfigVersion},
  audit::{AuditEvent, AuditResult, Operation},
  chain,
  checkpoint::{Checkpoint, SnapshotEntry},
  data::DataEntry,
  export::{ExportFormat, ExportRecord},
  policy::Policy,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { chain::format_timestamp(dt) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  chain::parse_timestamp(s).map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

pub fn encode_json(value: &Value) -> String { value.to_string() }

pub fn decode_json(s: &str) -> Result<Value> { Ok(serde_json::from_str(s)?) }

/// SQLite integers are signed; counters never approach the limit.
pub fn to_u64(n: i64) -> u64 { u64::try_from(n).unwrap_or_default() }

pub fn to_i64(n: u64) -> i64 { i64::try_from(n).unwrap_or(i64::MAX) }

pub fn encode_policy(policy: &Policy) -> Result<String> { Ok(serde_json::to_string(policy)?) }

/// Stored policies were validated on the way in; anything unreadable now is
/// read leniently so it degrades towards blocking rather than failing.
pub fn decode_policy(s: &str, prefix: &str, updated_at: &str) -> Result<Policy> {
  let value = decode_json(s)?;
  let mut sink = Vec::new();
  let mut policy = Policy::from_value_lenient(&value, "workspace", Some(prefix), &mut sink);
  policy.updated_at = Some(decode_dt(updated_at)?);
  Ok(policy)
}

// ─── Agents ──────────────────────────────────────────────────────────────────

pub const AGENT_COLUMNS: &str = "agent_id, workspace_id, name, description, owner, team, \
                                 status, config, tags, version, created_at, updated_at";

pub struct RawAgent {
  pub agent_id:     String,
  pub workspace_id: String,
  pub name:         String,
  pub description:  Option<String>,
  pub owner:        Option<String>,
  pub team:         Option<String>,
  pub status:       String,
  pub config:       String,
  pub tags:         String,
  pub version:      i64,
  pub created_at:   String,
  pub updated_at:   String,
}

impl RawAgent {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      agent_id:     row.get(0)?,
      workspace_id: row.get(1)?,
      name:         row.get(2)?,
      description:  row.get(3)?,
      owner:        row.get(4)?,
      team:         row.get(5)?,
      status:       row.get(6)?,
      config:       row.get(7)?,
      tags:         row.get(8)?,
      version:      row.get(9)?,
      created_at:   row.get(10)?,
      updated_at:   row.get(11)?,
    })
  }

  pub fn into_agent(self) -> Result<Agent> {
    let (config, _) = AgentConfig::from_value_lenient(&decode_json(&self.config)?);
    Ok(Agent {
      agent_id: self.agent_id,
      workspace_id: self.workspace_id,
      name: self.name,
      description: self.description,
      owner: self.owner,
      team: self.team,
      status: AgentStatus::parse(&self.status)?,
      config,
      tags: serde_json::from_str(&self.tags)?,
      version: to_u64(self.version),
      created_at: decode_dt(&self.created_at)?,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }
}

pub struct RawConfigVersion {
  pub agent_id:   String,
  pub version:    i64,
  pub config:     String,
  pub created_at: String,
  pub created_by: Option<String>,
}

pub const CONFIG_VERSION_COLUMNS: &str = "agent_id, version, config, created_at, created_by";

impl RawConfigVersion {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      agent_id:   row.get(0)?,
      version:    row.get(1)?,
      config:     row.get(2)?,
      created_at: row.get(3)?,
      created_by: row.get(4)?,
    })
  }

  pub fn into_config_version(self) -> Result<ConfigVersion> {
    let (config, _) = AgentConfig::from_value_lenient(&decode_json(&self.config)?);
    Ok(ConfigVersion {
      agent_id: self.agent_id,
      version: to_u64(self.version),
      config,
      created_at: decode_dt(&self.created_at)?,
      created_by: self.created_by,
    })
  }
}

// ─── Audit events ────────────────────────────────────────────────────────────

pub const EVENT_COLUMNS: &str = "id, agent_id, sequence, operation, resource, result, \
                                 blocked_by, timestamp, hash, previous_hash, metadata";

pub struct RawEvent {
  pub id:            String,
  pub agent_id:      String,
  pub sequence:      i64,
  pub operation:     String,
  pub resource:      String,
  pub result:        String,
  pub blocked_by:    Option<String>,
  pub timestamp:     String,
  pub hash:          String,
  pub previous_hash: String,
  pub metadata:      String,
}

impl RawEvent {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id:            row.get(0)?,
      agent_id:      row.get(1)?,
      sequence:      row.get(2)?,
      operation:     row.get(3)?,
      resource:      row.get(4)?,
      result:        row.get(5)?,
      blocked_by:    row.get(6)?,
      timestamp:     row.get(7)?,
      hash:          row.get(8)?,
      previous_hash: row.get(9)?,
      metadata:      row.get(10)?,
    })
  }

  pub fn into_event(self) -> Result<AuditEvent> {
    Ok(AuditEvent {
      id:            decode_uuid(&self.id)?,
      agent_id:      self.agent_id,
      sequence:      to_u64(self.sequence),
      operation:     Operation::from(self.operation),
      resource:      self.resource,
      result:        AuditResult::parse(&self.result)?,
      blocked_by:    self.blocked_by,
      timestamp:     decode_dt(&self.timestamp)?,
      hash:          self.hash,
      previous_hash: self.previous_hash,
      metadata:      decode_json(&self.metadata)?,
    })
  }
}

// ─── Data entries ────────────────────────────────────────────────────────────

pub const ENTRY_COLUMNS: &str =
  "key, value, metadata, version, created_at, updated_at, expires_at, audit_id";

pub struct RawEntry {
  pub key:        String,
  pub value:      String,
  pub metadata:   String,
  pub version:    i64,
  pub created_at: String,
  pub updated_at: String,
  pub expires_at: Option<String>,
  pub audit_id:   String,
}

impl RawEntry {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      key:        row.get(0)?,
      value:      row.get(1)?,
      metadata:   row.get(2)?,
      version:    row.get(3)?,
      created_at: row.get(4)?,
      updated_at: row.get(5)?,
      expires_at: row.get(6)?,
      audit_id:   row.get(7)?,
    })
  }

  pub fn into_entry(self) -> Result<DataEntry> {
    Ok(DataEntry {
      key:        self.key,
      value:      self.value,
      metadata:   decode_json(&self.metadata)?,
      version:    to_u64(self.version),
      created_at: decode_dt(&self.created_at)?,
      updated_at: decode_dt(&self.updated_at)?,
      expires_at: decode_opt_dt(self.expires_at)?,
      audit_id:   decode_uuid(&self.audit_id)?,
      truncated:  false,
    })
  }
}

// ─── Checkpoints ─────────────────────────────────────────────────────────────

pub const CHECKPOINT_COLUMNS: &str =
  "checkpoint_id, agent_id, label, metadata, created_at, entry_count";

pub struct RawCheckpoint {
  pub checkpoint_id: String,
  pub agent_id:      String,
  pub label:         Option<String>,
  pub metadata:      String,
  pub created_at:    String,
  pub entry_count:   i64,
}

impl RawCheckpoint {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      checkpoint_id: row.get(0)?,
      agent_id:      row.get(1)?,
      label:         row.get(2)?,
      metadata:      row.get(3)?,
      created_at:    row.get(4)?,
      entry_count:   row.get(5)?,
    })
  }

  pub fn into_checkpoint(self) -> Result<Checkpoint> {
    Ok(Checkpoint {
      checkpoint_id: decode_uuid(&self.checkpoint_id)?,
      agent_id:      self.agent_id,
      label:         self.label,
      metadata:      decode_json(&self.metadata)?,
      created_at:    decode_dt(&self.created_at)?,
      entry_count:   to_u64(self.entry_count),
    })
  }
}

pub struct RawSnapshotEntry {
  pub key:        String,
  pub value:      String,
  pub metadata:   String,
  pub expires_at: Option<String>,
}

impl RawSnapshotEntry {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      key:        row.get(0)?,
      value:      row.get(1)?,
      metadata:   row.get(2)?,
      expires_at: row.get(3)?,
    })
  }

  pub fn into_snapshot_entry(self) -> Result<SnapshotEntry> {
    Ok(SnapshotEntry {
      key:        self.key,
      value:      self.value,
      metadata:   decode_json(&self.metadata)?,
      expires_at: decode_opt_dt(self.expires_at)?,
    })
  }
}

// ─── Export records ──────────────────────────────────────────────────────────

pub const EXPORT_COLUMNS: &str = "export_id, agent_id, workspace_id, format, path, \
                                  event_count, expires_at, created_at, verification";

pub struct RawExport {
  pub export_id:    String,
  pub agent_id:     String,
  pub workspace_id: String,
  pub format:       String,
  pub path:         String,
  pub event_count:  i64,
  pub expires_at:   String,
  pub created_at:   String,
  pub verification: Option<String>,
}

impl RawExport {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      export_id:    row.get(0)?,
      agent_id:     row.get(1)?,
      workspace_id: row.get(2)?,
      format:       row.get(3)?,
      path:         row.get(4)?,
      event_count:  row.get(5)?,
      expires_at:   row.get(6)?,
      created_at:   row.get(7)?,
      verification: row.get(8)?,
    })
  }

  pub fn into_record(self) -> Result<ExportRecord> {
    Ok(ExportRecord {
      export_id:    decode_uuid(&self.export_id)?,
      agent_id:     self.agent_id,
      workspace_id: self.workspace_id,
      format:       ExportFormat::parse(&self.format)?,
      path:         self.path,
      event_count:  to_u64(self.event_count),
      expires_at:   decode_dt(&self.expires_at)?,
      created_at:   decode_dt(&self.created_at)?,
      verification: self
        .verification
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn stored_timestamps_sort_as_strings() {
    let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let b = a + chrono::Duration::microseconds(1);
    let c = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();
    assert!(encode_dt(a) < encode_dt(b));
    assert!(encode_dt(b) < encode_dt(c));
    assert_eq!(decode_dt(&encode_dt(b)).unwrap(), b);
  }

  #[test]
  fn unreadable_stored_policy_degrades_to_malformed() {
    let stamp = encode_dt(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let policy =
      decode_policy(r#"{"subjectPrefix":"pii/","doNotStore":"yes"}"#, "pii/", &stamp).unwrap();
    assert_eq!(policy.subject_prefix, "pii/");
    assert!(policy.updated_at.is_some());
    assert!(policy.malformed.is_some());
  }
}
