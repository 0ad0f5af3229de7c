//! Synchronous building blocks run on the database thread, inside the
//! transaction of the calling store method.
//!
//! Every helper takes a plain `&Connection`; a `Transaction` derefs to one.

use anchor_core::{
  agent::{Agent, AgentStatus},
  audit::{AuditEvent, NewAuditEvent},
  chain,
  data::DataEntry,
  policy::Policy,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};
use serde_json::Value;
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{
    AGENT_COLUMNS, ENTRY_COLUMNS, EVENT_COLUMNS, RawAgent, RawEntry, RawEvent, decode_dt,
    decode_policy, encode_dt, encode_json, encode_uuid, to_i64, to_u64,
  },
};

// ── Agents ───────────────────────────────────────────────────────────────────

/// The agent as stored, whatever its status.
pub fn load_agent(conn: &Connection, workspace_id: &str, agent_id: &str) -> Result<Option<Agent>> {
  let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1 AND workspace_id = ?2");
  let raw = conn
    .query_row(&sql, params![agent_id, workspace_id], RawAgent::from_row)
    .optional()?;
  raw.map(RawAgent::into_agent).transpose()
}

/// An agent that exists and has not been deleted.
pub fn live_agent(conn: &Connection, workspace_id: &str, agent_id: &str) -> Result<Agent> {
  match load_agent(conn, workspace_id, agent_id)? {
    Some(agent) if agent.status != AgentStatus::Deleted => Ok(agent),
    _ => Err(Error::AgentNotFound(agent_id.to_owned())),
  }
}

/// An agent that may accept governed mutations.
pub fn active_agent(conn: &Connection, workspace_id: &str, agent_id: &str) -> Result<Agent> {
  let agent = live_agent(conn, workspace_id, agent_id)?;
  if agent.status == AgentStatus::Suspended {
    return Err(Error::AgentSuspended(agent_id.to_owned()));
  }
  Ok(agent)
}

/// Insert or overwrite an agent row.
pub fn save_agent(conn: &Connection, agent: &Agent) -> Result<()> {
  conn.execute(
    "INSERT INTO agents
       (agent_id, workspace_id, name, description, owner, team,
        status, config, tags, version, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
     ON CONFLICT (agent_id) DO UPDATE SET
       name        = excluded.name,
       description = excluded.description,
       owner       = excluded.owner,
       team        = excluded.team,
       status      = excluded.status,
       config      = excluded.config,
       tags        = excluded.tags,
       version     = excluded.version,
       updated_at  = excluded.updated_at",
    params![
      agent.agent_id,
      agent.workspace_id,
      agent.name,
      agent.description,
      agent.owner,
      agent.team,
      agent.status.as_str(),
      encode_json(&agent.config.to_value()),
      serde_json::to_string(&agent.tags)?,
      to_i64(agent.version),
      encode_dt(agent.created_at),
      encode_dt(agent.updated_at),
    ],
  )?;
  Ok(())
}

pub fn insert_config_version(
  conn: &Connection,
  agent_id: &str,
  version: u64,
  config: &Value,
  created_at: DateTime<Utc>,
  created_by: Option<&str>,
) -> Result<()> {
  conn.execute(
    "INSERT INTO config_versions (agent_id, version, config, created_at, created_by)
     VALUES (?1, ?2, ?3, ?4, ?5)",
    params![agent_id, to_i64(version), encode_json(config), encode_dt(created_at), created_by],
  )?;
  Ok(())
}

// ── Chain ────────────────────────────────────────────────────────────────────

/// The most recent event of a chain.
pub struct Head {
  pub sequence:  u64,
  pub hash:      String,
  pub timestamp: DateTime<Utc>,
}

pub fn chain_head(conn: &Connection, agent_id: &str) -> Result<Option<Head>> {
  let row: Option<(i64, String, String)> = conn
    .query_row(
      "SELECT sequence, hash, timestamp FROM audit_events
       WHERE agent_id = ?1 ORDER BY sequence DESC LIMIT 1",
      params![agent_id],
      |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()?;
  row
    .map(|(sequence, hash, ts)| {
      Ok(Head { sequence: to_u64(sequence), hash, timestamp: decode_dt(&ts)? })
    })
    .transpose()
}

/// Seal `event` onto the end of the agent's chain and persist it.
///
/// The caller holds the write transaction, so the head read here is the head
/// the event links to. Timestamps never run backwards within a chain even if
/// the clock does.
pub fn append(
  conn: &Connection,
  agent_id: &str,
  event: NewAuditEvent,
  now: DateTime<Utc>,
) -> Result<AuditEvent> {
  let (sequence, previous_hash, timestamp) = match chain_head(conn, agent_id)? {
    Some(head) => (head.sequence + 1, head.hash, now.max(head.timestamp)),
    None => (0, chain::genesis_hash(agent_id), now),
  };
  let event = event.seal(agent_id, sequence, previous_hash, timestamp);

  conn
    .execute(
      "INSERT INTO audit_events
         (id, agent_id, sequence, operation, resource, result,
          blocked_by, timestamp, hash, previous_hash, metadata)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
      params![
        encode_uuid(event.id),
        event.agent_id,
        to_i64(event.sequence),
        event.operation.as_str(),
        event.resource,
        event.result.as_str(),
        event.blocked_by,
        encode_dt(event.timestamp),
        event.hash,
        event.previous_hash,
        encode_json(&event.metadata),
      ],
    )
    .map_err(|e| match e {
      rusqlite::Error::SqliteFailure(f, _)
        if f.code == rusqlite::ErrorCode::ConstraintViolation =>
      {
        Error::ChainCorrupt {
          agent_id: agent_id.to_owned(),
          detail:   format!("append at sequence {sequence} collided with an existing event"),
        }
      }
      other => Error::from(other),
    })?;

  Ok(event)
}

pub fn event_by_id(conn: &Connection, agent_id: &str, id: Uuid) -> Result<Option<AuditEvent>> {
  let sql = format!("SELECT {EVENT_COLUMNS} FROM audit_events WHERE id = ?1 AND agent_id = ?2");
  let raw = conn
    .query_row(&sql, params![encode_uuid(id), agent_id], RawEvent::from_row)
    .optional()?;
  raw.map(RawEvent::into_event).transpose()
}

// ── Policies ─────────────────────────────────────────────────────────────────

pub fn workspace_policies(conn: &Connection, workspace_id: &str) -> Result<Vec<Policy>> {
  let mut stmt = conn.prepare(
    "SELECT subject_prefix, policy, updated_at FROM policies
     WHERE workspace_id = ?1 ORDER BY subject_prefix",
  )?;
  let rows = stmt
    .query_map(params![workspace_id], |r| {
      Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  rows
    .iter()
    .map(|(prefix, json, updated_at)| decode_policy(json, prefix, updated_at))
    .collect()
}

// ── Entries ──────────────────────────────────────────────────────────────────

/// The stored entry for `key`, expired or not.
pub fn stored_entry(conn: &Connection, agent_id: &str, key: &str) -> Result<Option<DataEntry>> {
  let sql = format!("SELECT {ENTRY_COLUMNS} FROM data_entries WHERE agent_id = ?1 AND key = ?2");
  let raw = conn
    .query_row(&sql, params![agent_id, key], RawEntry::from_row)
    .optional()?;
  raw.map(RawEntry::into_entry).transpose()
}

/// The entry for `key` unless it has expired at `now`.
pub fn live_entry(
  conn: &Connection,
  agent_id: &str,
  key: &str,
  now: DateTime<Utc>,
) -> Result<Option<DataEntry>> {
  Ok(stored_entry(conn, agent_id, key)?.filter(|e| !e.is_expired(now)))
}

/// Write or overwrite an entry on behalf of `event`. An overwritten entry
/// that had already expired counts as a fresh one.
pub fn put_entry(
  conn: &Connection,
  agent_id: &str,
  key: &str,
  value: &str,
  metadata: &Value,
  expires_at: Option<DateTime<Utc>>,
  event: &AuditEvent,
) -> Result<DataEntry> {
  let previous = live_entry(conn, agent_id, key, event.timestamp)?;
  let (version, created_at) = match &previous {
    Some(p) => (p.version + 1, p.created_at),
    None => (1, event.timestamp),
  };

  conn.execute(
    "INSERT INTO data_entries
       (agent_id, key, value, metadata, version, created_at, updated_at, expires_at, audit_id)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
     ON CONFLICT (agent_id, key) DO UPDATE SET
       value      = excluded.value,
       metadata   = excluded.metadata,
       version    = excluded.version,
       created_at = excluded.created_at,
       updated_at = excluded.updated_at,
       expires_at = excluded.expires_at,
       audit_id   = excluded.audit_id",
    params![
      agent_id,
      key,
      value,
      encode_json(metadata),
      to_i64(version),
      encode_dt(created_at),
      encode_dt(event.timestamp),
      expires_at.map(encode_dt),
      encode_uuid(event.id),
    ],
  )?;

  Ok(DataEntry {
    key: key.to_owned(),
    value: value.to_owned(),
    metadata: metadata.clone(),
    version,
    created_at,
    updated_at: event.timestamp,
    expires_at,
    audit_id: event.id,
    truncated: false,
  })
}

/// Physically remove an entry. Returns whether a row existed.
pub fn remove_entry(conn: &Connection, agent_id: &str, key: &str) -> Result<bool> {
  let n = conn.execute(
    "DELETE FROM data_entries WHERE agent_id = ?1 AND key = ?2",
    params![agent_id, key],
  )?;
  Ok(n > 0)
}

/// Keys of live entries under `prefix`, ascending.
pub fn live_keys(
  conn: &Connection,
  agent_id: &str,
  prefix: &str,
  now: DateTime<Utc>,
) -> Result<Vec<String>> {
  let mut stmt = conn.prepare(
    "SELECT key FROM data_entries
     WHERE agent_id = ?1
       AND substr(key, 1, length(?2)) = ?2
       AND (expires_at IS NULL OR expires_at > ?3)
     ORDER BY key",
  )?;
  let keys = stmt
    .query_map(params![agent_id, prefix, encode_dt(now)], |r| r.get(0))?
    .collect::<rusqlite::Result<Vec<String>>>()?;
  Ok(keys)
}
