//! [`SqliteStore`]: the SQLite implementation of [`GovernanceStore`].

use std::{
  collections::HashSet,
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
  time::Duration,
};

use anchor_core::{
  agent::{
    Agent, AgentConfig, AgentPage, AgentQuery, AgentStatus, AgentUpdate, ConfigVersion,
    ConfigVersionPage, NewAgent,
  },
  audit::{AuditEvent, AuditPage, AuditQuery, AuditResult, ChainRange, NewAuditEvent, Operation},
  chain,
  checkpoint::{Checkpoint, CheckpointPage, NewCheckpoint, RestoreOutcome, SnapshotEntry},
  clock::{Clock, SystemClock},
  data::{
    DEFAULT_LIST_LIMIT, DataEntry, DataPage, DataQuery, DataWrite, FullEntry, MAX_LIST_LIMIT,
    WriteOutcome, encode_cursor,
  },
  detect::Detectors,
  export::ExportRecord,
  policy::{EvaluationInput, Policy, PolicyEngine, PolicySet, PolicyUpdate},
  store::{ErrorKind, GovernanceStore, StoreError as _},
};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, TransactionBehavior, params, params_from_iter};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{
    AGENT_COLUMNS, CHECKPOINT_COLUMNS, CONFIG_VERSION_COLUMNS, ENTRY_COLUMNS, EVENT_COLUMNS,
    EXPORT_COLUMNS, RawAgent, RawCheckpoint, RawConfigVersion, RawEntry, RawEvent, RawExport,
    RawSnapshotEntry, decode_policy, encode_dt, encode_json, encode_policy, encode_uuid, to_i64,
    to_u64,
  },
  schema::SCHEMA,
  tx,
};

/// Expired entries removed per purge transaction.
const PURGE_BATCH: usize = 500;

type SqlValue = rusqlite::types::Value;

// ─── Options ─────────────────────────────────────────────────────────────────

/// Tunables and collaborators for a [`SqliteStore`].
#[derive(Clone)]
pub struct StoreOptions {
  /// Extra attempts for a write that SQLite reports busy or locked.
  pub busy_retries: u32,
  /// How long SQLite itself waits on a lock before reporting busy.
  pub busy_timeout: Duration,
  pub clock:        Arc<dyn Clock>,
  pub detectors:    Detectors,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      busy_retries: 5,
      busy_timeout: Duration::from_secs(5),
      clock:        Arc::new(SystemClock),
      detectors:    Detectors::default(),
    }
  }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// An Anchor store backed by a single SQLite file.
///
/// All writes share one connection, so appends to a chain are serialised
/// without any locking of our own. Reads of a file database go through a
/// second, read-only connection and never wait on a writer.
///
/// Cloning is cheap; connections and the restore registry are shared.
#[derive(Clone)]
pub struct SqliteStore {
  writer:       tokio_rusqlite::Connection,
  reader:       tokio_rusqlite::Connection,
  clock:        Arc<dyn Clock>,
  engine:       PolicyEngine,
  busy_retries: u32,
  restoring:    Arc<Mutex<HashSet<String>>>,
}

impl SqliteStore {
  /// Open (or create) a store at `path` with default options.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with(path, StoreOptions::default()).await
  }

  pub async fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
    let path: PathBuf = path.as_ref().to_owned();
    let timeout = options.busy_timeout;

    let writer = tokio_rusqlite::Connection::open(&path).await?;
    writer
      .call(move |conn| {
        conn.busy_timeout(timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;

    let reader = tokio_rusqlite::Connection::open(&path).await?;
    reader
      .call(move |conn| {
        conn.busy_timeout(timeout)?;
        conn.pragma_update(None, "query_only", true)?;
        Ok(())
      })
      .await?;

    info!(path = %path.display(), "opened sqlite store");
    Ok(Self::assemble(writer, reader, options))
  }

  /// Open an in-memory store; useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    Self::open_in_memory_with(StoreOptions::default()).await
  }

  /// An in-memory database is private to its connection, so reads share the
  /// writer.
  pub async fn open_in_memory_with(options: StoreOptions) -> Result<Self> {
    let writer = tokio_rusqlite::Connection::open_in_memory().await?;
    writer
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    let reader = writer.clone();
    Ok(Self::assemble(writer, reader, options))
  }

  fn assemble(
    writer: tokio_rusqlite::Connection,
    reader: tokio_rusqlite::Connection,
    options: StoreOptions,
  ) -> Self {
    Self {
      writer,
      reader,
      clock: options.clock,
      engine: PolicyEngine::new(options.detectors),
      busy_retries: options.busy_retries,
      restoring: Arc::new(Mutex::new(HashSet::new())),
    }
  }

  /// Run `f` in an immediate transaction on the writer, retrying with
  /// exponential backoff while SQLite reports the database busy.
  ///
  /// `f` may run more than once, so it must not have side effects outside
  /// the transaction.
  async fn write<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: Fn(&rusqlite::Transaction<'_>) -> Result<T> + Send + Sync + 'static,
  {
    let f = Arc::new(f);
    let mut attempt = 0;
    loop {
      let f = Arc::clone(&f);
      let res = self
        .writer
        .call(move |conn| {
          let txn = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
          let out = f(&txn).map_err(Error::into_call)?;
          txn.commit()?;
          Ok(out)
        })
        .await
        .map_err(Error::from);

      match res {
        Err(e) if e.kind() == ErrorKind::Transient && attempt < self.busy_retries => {
          attempt += 1;
          let backoff = Duration::from_millis(10 << attempt.min(8));
          debug!(attempt, ?backoff, "database busy; retrying write");
          tokio::time::sleep(backoff).await;
        }
        Err(e) if e.kind() == ErrorKind::Transient => {
          warn!(attempts = attempt + 1, "database still busy; giving up");
          return Err(e);
        }
        other => return other,
      }
    }
  }

  /// Run `f` against committed state.
  async fn read<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
  {
    Ok(self.reader.call(move |conn| f(conn).map_err(Error::into_call)).await?)
  }

  /// Claim the right to restore `agent_id`; released when the guard drops.
  pub(crate) fn begin_restore(&self, agent_id: &str) -> Result<RestoreGuard> {
    let mut set = self.restoring.lock().unwrap_or_else(|p| p.into_inner());
    if !set.insert(agent_id.to_owned()) {
      return Err(Error::RestoreInProgress(agent_id.to_owned()));
    }
    Ok(RestoreGuard {
      registry: Arc::clone(&self.restoring),
      agent_id: agent_id.to_owned(),
    })
  }

  /// Execute raw SQL on the writer, bypassing every store invariant.
  #[cfg(test)]
  pub(crate) async fn execute_raw(&self, sql: &str) -> Result<()> {
    let sql = sql.to_owned();
    self
      .writer
      .call(move |conn| {
        conn.execute_batch(&sql)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run a single-value query on the writer.
  #[cfg(test)]
  pub(crate) async fn query_scalar(&self, sql: &str) -> Result<i64> {
    let sql = sql.to_owned();
    Ok(self.writer.call(move |conn| Ok(conn.query_row(&sql, [], |r| r.get(0))?)).await?)
  }
}

pub(crate) struct RestoreGuard {
  registry: Arc<Mutex<HashSet<String>>>,
  agent_id: String,
}

impl Drop for RestoreGuard {
  fn drop(&mut self) {
    let mut set = self.registry.lock().unwrap_or_else(|p| p.into_inner());
    set.remove(&self.agent_id);
  }
}

fn page_limit(limit: Option<usize>) -> usize {
  limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

// ─── GovernanceStore impl ────────────────────────────────────────────────────

impl GovernanceStore for SqliteStore {
  type Error = Error;

  fn now(&self) -> DateTime<Utc> { self.clock.now() }

  // ── Agents ────────────────────────────────────────────────────────────────

  async fn create_agent(&self, workspace_id: &str, input: NewAgent) -> Result<Agent> {
    let config = input.validate()?;
    let agent_id = input
      .agent_id
      .clone()
      .unwrap_or_else(|| format!("agent-{}", Uuid::new_v4().simple()));
    let now = self.clock.now();

    let agent = Agent {
      agent_id,
      workspace_id: workspace_id.to_owned(),
      name: input.name,
      description: input.description,
      owner: input.owner,
      team: input.team,
      status: AgentStatus::Active,
      config,
      tags: input.tags,
      version: 1,
      created_at: now,
      updated_at: now,
    };

    let created = agent.clone();
    self
      .write(move |conn| {
        let taken = conn
          .query_row(
            "SELECT 1 FROM agents WHERE agent_id = ?1",
            params![created.agent_id],
            |_| Ok(true),
          )
          .optional()?
          .unwrap_or(false);
        if taken {
          return Err(Error::AgentExists(created.agent_id.clone()));
        }

        tx::save_agent(conn, &created)?;
        tx::insert_config_version(
          conn,
          &created.agent_id,
          created.version,
          &created.config.to_value(),
          now,
          None,
        )?;
        let event = NewAuditEvent::new(
          Operation::AgentCreate,
          created.agent_id.clone(),
          AuditResult::Success,
        )
        .with_metadata(json!({
          "workspace_id": created.workspace_id,
          "name": created.name,
          "version": created.version,
        }));
        tx::append(conn, &created.agent_id, event, now)?;
        Ok(())
      })
      .await?;

    info!(agent_id = %agent.agent_id, workspace_id, "agent created");
    Ok(agent)
  }

  async fn get_agent(&self, workspace_id: &str, agent_id: &str) -> Result<Option<Agent>> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    self.read(move |conn| tx::load_agent(conn, &ws, &id)).await
  }

  async fn list_agents(&self, workspace_id: &str, query: &AgentQuery) -> Result<AgentPage> {
    let limit = page_limit(query.limit);
    let offset = query.offset.unwrap_or(0);

    let mut filter = String::from("workspace_id = ?");
    let mut args = vec![SqlValue::Text(workspace_id.to_owned())];
    match query.status {
      Some(status) => {
        filter.push_str(" AND status = ?");
        args.push(SqlValue::Text(status.as_str().to_owned()));
      }
      None => filter.push_str(" AND status != 'deleted'"),
    }
    if let Some(owner) = &query.owner {
      filter.push_str(" AND owner = ?");
      args.push(SqlValue::Text(owner.clone()));
    }

    let (raws, total): (Vec<RawAgent>, i64) = self
      .read(move |conn| {
        let total: i64 = conn.query_row(
          &format!("SELECT COUNT(*) FROM agents WHERE {filter}"),
          params_from_iter(args.iter()),
          |r| r.get(0),
        )?;
        let mut page_args = args;
        page_args.push(SqlValue::Integer(to_i64(limit as u64)));
        page_args.push(SqlValue::Integer(to_i64(offset as u64)));
        let mut stmt = conn.prepare(&format!(
          "SELECT {AGENT_COLUMNS} FROM agents WHERE {filter}
           ORDER BY created_at, agent_id LIMIT ? OFFSET ?"
        ))?;
        let raws = stmt
          .query_map(params_from_iter(page_args.iter()), RawAgent::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((raws, total))
      })
      .await?;

    let data = raws.into_iter().map(RawAgent::into_agent).collect::<Result<Vec<_>>>()?;
    let total = to_u64(total);
    Ok(AgentPage { has_more: (offset + data.len()) < total as usize, data, total })
  }

  async fn update_agent(
    &self,
    workspace_id: &str,
    agent_id: &str,
    update: AgentUpdate,
    actor: Option<String>,
  ) -> Result<Agent> {
    let new_config = update.validate()?;
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let now = self.clock.now();

    let agent = self
      .write(move |conn| {
        let mut agent = tx::live_agent(conn, &ws, &id)?;
        let fields = update.changed_fields();

        if let Some(name) = &update.name {
          agent.name = name.clone();
        }
        if update.description.is_some() {
          agent.description = update.description.clone();
        }
        if update.owner.is_some() {
          agent.owner = update.owner.clone();
        }
        if update.team.is_some() {
          agent.team = update.team.clone();
        }
        if let Some(tags) = &update.tags {
          agent.tags = tags.clone();
        }

        if !fields.is_empty() {
          let event = NewAuditEvent::new(Operation::AgentUpdate, id.clone(), AuditResult::Success)
            .with_field("fields", fields)
            .with_field("actor", actor.clone());
          tx::append(conn, &id, event, now)?;
        }

        if let Some(config) = &new_config {
          let previous = agent.version;
          agent.version += 1;
          agent.config = config.clone();
          tx::insert_config_version(
            conn,
            &id,
            agent.version,
            &config.to_value(),
            now,
            actor.as_deref(),
          )?;
          let event = NewAuditEvent::new(Operation::ConfigUpdate, id.clone(), AuditResult::Success)
            .with_metadata(json!({
              "version": agent.version,
              "previous_version": previous,
              "actor": actor,
            }));
          tx::append(conn, &id, event, now)?;
        }

        agent.updated_at = now;
        tx::save_agent(conn, &agent)?;
        Ok(agent)
      })
      .await?;

    debug!(agent_id, version = agent.version, "agent updated");
    Ok(agent)
  }

  async fn set_agent_status(
    &self,
    workspace_id: &str,
    agent_id: &str,
    status: AgentStatus,
  ) -> Result<Agent> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let now = self.clock.now();

    let agent = self
      .write(move |conn| {
        let mut agent = tx::live_agent(conn, &ws, &id)?;
        if agent.status == status {
          return Ok(agent);
        }

        let operation = match status {
          AgentStatus::Active => Operation::AgentActivate,
          AgentStatus::Suspended => Operation::AgentSuspend,
          AgentStatus::Deleted => Operation::AgentDelete,
        };
        let mut event = NewAuditEvent::new(operation, id.clone(), AuditResult::Success)
          .with_field("from", agent.status.as_str())
          .with_field("to", status.as_str());

        // Deleting drops the agent's data and snapshots; its chain stays.
        if status == AgentStatus::Deleted {
          let entries =
            conn.execute("DELETE FROM data_entries WHERE agent_id = ?1", params![id])?;
          let checkpoints =
            conn.execute("DELETE FROM checkpoints WHERE agent_id = ?1", params![id])?;
          event = event
            .with_field("removed_entries", entries)
            .with_field("removed_checkpoints", checkpoints);
        }

        tx::append(conn, &id, event, now)?;
        agent.status = status;
        agent.updated_at = now;
        tx::save_agent(conn, &agent)?;
        Ok(agent)
      })
      .await?;

    info!(agent_id, status = agent.status.as_str(), "agent status changed");
    Ok(agent)
  }

  async fn put_agent_config(
    &self,
    workspace_id: &str,
    agent_id: &str,
    config: serde_json::Value,
    actor: Option<String>,
  ) -> Result<ConfigVersion> {
    let parsed = AgentConfig::from_value_strict(&config)?;
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let now = self.clock.now();

    self
      .write(move |conn| {
        let mut agent = tx::live_agent(conn, &ws, &id)?;
        let previous = agent.version;
        agent.version += 1;
        agent.config = parsed.clone();
        agent.updated_at = now;
        tx::save_agent(conn, &agent)?;
        tx::insert_config_version(conn, &id, agent.version, &config, now, actor.as_deref())?;

        let event = NewAuditEvent::new(Operation::ConfigUpdate, id.clone(), AuditResult::Success)
          .with_metadata(json!({
            "version": agent.version,
            "previous_version": previous,
            "actor": actor,
          }));
        tx::append(conn, &id, event, now)?;

        Ok(ConfigVersion {
          agent_id:   id.clone(),
          version:    agent.version,
          config:     parsed.clone(),
          created_at: now,
          created_by: actor.clone(),
        })
      })
      .await
  }

  async fn config_versions(
    &self,
    workspace_id: &str,
    agent_id: &str,
    limit: usize,
  ) -> Result<ConfigVersionPage> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let limit = page_limit(Some(limit));

    let (raws, total): (Vec<RawConfigVersion>, i64) = self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        let total: i64 = conn.query_row(
          "SELECT COUNT(*) FROM config_versions WHERE agent_id = ?1",
          params![id],
          |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
          "SELECT {CONFIG_VERSION_COLUMNS} FROM config_versions
           WHERE agent_id = ?1 ORDER BY version DESC LIMIT ?2"
        ))?;
        let raws = stmt
          .query_map(params![id, to_i64(limit as u64)], RawConfigVersion::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((raws, total))
      })
      .await?;

    let data = raws
      .into_iter()
      .map(RawConfigVersion::into_config_version)
      .collect::<Result<Vec<_>>>()?;
    let total = to_u64(total);
    Ok(ConfigVersionPage { has_more: (data.len() as u64) < total, data, total })
  }

  async fn config_version(
    &self,
    workspace_id: &str,
    agent_id: &str,
    version: u64,
  ) -> Result<Option<ConfigVersion>> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let raw: Option<RawConfigVersion> = self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {CONFIG_VERSION_COLUMNS} FROM config_versions
                 WHERE agent_id = ?1 AND version = ?2"
              ),
              params![id, to_i64(version)],
              RawConfigVersion::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawConfigVersion::into_config_version).transpose()
  }

  async fn rollback_config(
    &self,
    workspace_id: &str,
    agent_id: &str,
    target_version: u64,
    actor: Option<String>,
  ) -> Result<ConfigVersion> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let now = self.clock.now();

    let version = self
      .write(move |conn| {
        let mut agent = tx::live_agent(conn, &ws, &id)?;
        let target = conn
          .query_row(
            &format!(
              "SELECT {CONFIG_VERSION_COLUMNS} FROM config_versions
               WHERE agent_id = ?1 AND version = ?2"
            ),
            params![id, to_i64(target_version)],
            RawConfigVersion::from_row,
          )
          .optional()?
          .ok_or(Error::ConfigVersionNotFound(target_version))?
          .into_config_version()?;

        let rollback_from = agent.version;
        agent.version += 1;
        agent.config = target.config.clone();
        agent.updated_at = now;
        tx::save_agent(conn, &agent)?;
        tx::insert_config_version(
          conn,
          &id,
          agent.version,
          &agent.config.to_value(),
          now,
          actor.as_deref(),
        )?;

        let event = NewAuditEvent::new(Operation::ConfigUpdate, id.clone(), AuditResult::Success)
          .with_metadata(json!({
            "version": agent.version,
            "target_version": target_version,
            "rollback_from": rollback_from,
            "actor": actor,
          }));
        tx::append(conn, &id, event, now)?;

        Ok(ConfigVersion {
          agent_id:   id.clone(),
          version:    agent.version,
          config:     agent.config,
          created_at: now,
          created_by: actor.clone(),
        })
      })
      .await?;

    info!(agent_id, target_version, version = version.version, "config rolled back");
    Ok(version)
  }

  // ── Workspace policies ────────────────────────────────────────────────────

  async fn get_policy(&self, workspace_id: &str, subject_prefix: &str) -> Result<Option<Policy>> {
    let (ws, prefix) = (workspace_id.to_owned(), subject_prefix.to_owned());
    let raw: Option<(String, String)> = self
      .read(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT policy, updated_at FROM policies
               WHERE workspace_id = ?1 AND subject_prefix = ?2",
              params![ws, prefix],
              |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?,
        )
      })
      .await?;
    raw
      .map(|(json, updated_at)| decode_policy(&json, subject_prefix, &updated_at))
      .transpose()
  }

  async fn list_policies(&self, workspace_id: &str) -> Result<Vec<Policy>> {
    let ws = workspace_id.to_owned();
    self.read(move |conn| tx::workspace_policies(conn, &ws)).await
  }

  async fn put_policy(&self, workspace_id: &str, update: PolicyUpdate) -> Result<Policy> {
    let prefix = update.target_prefix()?.to_owned();
    let ws = workspace_id.to_owned();
    let now = self.clock.now();

    let stored_prefix = prefix.clone();
    let policy = self
      .write(move |conn| {
        let existing: Option<(String, String)> = conn
          .query_row(
            "SELECT policy, updated_at FROM policies
             WHERE workspace_id = ?1 AND subject_prefix = ?2",
            params![ws, stored_prefix],
            |r| Ok((r.get(0)?, r.get(1)?)),
          )
          .optional()?;
        let base = match existing {
          Some((json, updated_at)) => decode_policy(&json, &stored_prefix, &updated_at)?,
          None => Policy::new(stored_prefix.clone()),
        };

        let mut policy = update.apply(base)?;
        policy.updated_at = Some(now);
        conn.execute(
          "INSERT INTO policies (workspace_id, subject_prefix, policy, updated_at)
           VALUES (?1, ?2, ?3, ?4)
           ON CONFLICT (workspace_id, subject_prefix) DO UPDATE SET
             policy     = excluded.policy,
             updated_at = excluded.updated_at",
          params![ws, stored_prefix, encode_policy(&policy)?, encode_dt(now)],
        )?;
        Ok(policy)
      })
      .await?;

    info!(workspace_id, subject_prefix = %prefix, "workspace policy updated");
    Ok(policy)
  }

  // ── Governed data ─────────────────────────────────────────────────────────

  async fn write_data(
    &self,
    workspace_id: &str,
    agent_id: &str,
    input: DataWrite,
  ) -> Result<WriteOutcome> {
    input.validate()?;
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let engine = self.engine.clone();
    let now = self.clock.now();

    let outcome = self
      .write(move |conn| {
        let agent = tx::active_agent(conn, &ws, &id)?;
        let set = PolicySet::new(tx::workspace_policies(conn, &ws)?, agent.config.policies);
        let metadata = input.metadata.clone().unwrap_or_else(|| json!({}));

        let decision = engine.evaluate(
          &set,
          EvaluationInput {
            agent_id: &id,
            key:      &input.key,
            value:    &input.value,
            metadata: &metadata,
          },
          now,
        );

        let mut event =
          NewAuditEvent::new(Operation::DataWrite, input.key.clone(), AuditResult::Allowed)
            .with_metadata(decision.audit_metadata())
            .with_field("value_sha256", chain::sha256_hex(&decision.value));
        if let Some(by) = decision.blocked_by {
          event = event.blocked(by.as_str(), decision.reason.clone().unwrap_or_default());
        }
        let event = tx::append(conn, &id, event, now)?;

        let created_at = if decision.allowed {
          let entry = tx::put_entry(
            conn,
            &id,
            &input.key,
            &decision.value,
            &metadata,
            decision.expires_at,
            &event,
          )?;
          Some(entry.created_at)
        } else {
          None
        };

        Ok(WriteOutcome {
          key: input.key.clone(),
          allowed: decision.allowed,
          audit_id: event.id,
          blocked_by: decision.blocked_by.map(|b| b.as_str().to_owned()),
          reason: decision.reason,
          expires_at: decision.expires_at,
          created_at,
          hash: event.hash,
          redacted: decision.redacted,
          diagnostics: decision.diagnostics,
        })
      })
      .await?;

    if outcome.allowed {
      debug!(agent_id, key = %outcome.key, redacted = outcome.redacted, "write allowed");
    } else {
      warn!(
        agent_id,
        key = %outcome.key,
        blocked_by = outcome.blocked_by.as_deref().unwrap_or_default(),
        "write blocked by policy"
      );
    }
    Ok(outcome)
  }

  async fn read_data(
    &self,
    workspace_id: &str,
    agent_id: &str,
    key: &str,
  ) -> Result<Option<DataEntry>> {
    let (ws, id, key) = (workspace_id.to_owned(), agent_id.to_owned(), key.to_owned());
    let now = self.clock.now();
    self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        tx::live_entry(conn, &id, &key, now)
      })
      .await
  }

  async fn read_data_full(
    &self,
    workspace_id: &str,
    agent_id: &str,
    key: &str,
  ) -> Result<Option<FullEntry>> {
    let (ws, id, key) = (workspace_id.to_owned(), agent_id.to_owned(), key.to_owned());
    let now = self.clock.now();
    self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        let Some(entry) = tx::live_entry(conn, &id, &key, now)? else {
          return Ok(None);
        };
        let audit = tx::event_by_id(conn, &id, entry.audit_id)?.ok_or_else(|| {
          Error::ChainCorrupt {
            agent_id: id.clone(),
            detail:   format!("event {} authorising key {key:?} is missing", entry.audit_id),
          }
        })?;
        Ok(Some(FullEntry { entry, audit }))
      })
      .await
  }

  async fn delete_data(&self, workspace_id: &str, agent_id: &str, key: &str) -> Result<AuditEvent> {
    let (ws, id, key) = (workspace_id.to_owned(), agent_id.to_owned(), key.to_owned());
    let now = self.clock.now();

    self
      .write(move |conn| {
        tx::active_agent(conn, &ws, &id)?;
        let entry = tx::live_entry(conn, &id, &key, now)?
          .ok_or_else(|| Error::KeyNotFound(key.clone()))?;
        tx::remove_entry(conn, &id, &key)?;
        let event = NewAuditEvent::new(Operation::DataDelete, key.clone(), AuditResult::Success)
          .with_field("version", entry.version);
        tx::append(conn, &id, event, now)
      })
      .await
  }

  async fn delete_prefix(&self, workspace_id: &str, agent_id: &str, prefix: &str) -> Result<u64> {
    if prefix.is_empty() {
      return Err(anchor_core::Error::InvalidKey("prefix must not be empty".into()).into());
    }
    let (ws, id, prefix) = (workspace_id.to_owned(), agent_id.to_owned(), prefix.to_owned());
    let now = self.clock.now();

    let deleted = self
      .write(move |conn| {
        tx::active_agent(conn, &ws, &id)?;
        let keys = tx::live_keys(conn, &id, &prefix, now)?;
        for key in &keys {
          tx::remove_entry(conn, &id, key)?;
          let event = NewAuditEvent::new(Operation::DataDelete, key.clone(), AuditResult::Success)
            .with_field("prefix", prefix.clone());
          tx::append(conn, &id, event, now)?;
        }
        Ok(keys.len() as u64)
      })
      .await?;

    info!(agent_id, deleted, "prefix deleted");
    Ok(deleted)
  }

  async fn list_data(
    &self,
    workspace_id: &str,
    agent_id: &str,
    query: &DataQuery,
  ) -> Result<DataPage> {
    let after = query.after_key()?.unwrap_or_default();
    let prefix = query.prefix.clone().unwrap_or_default();
    let limit = query.effective_limit();
    let full = query.full;
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let now = encode_dt(self.clock.now());

    let (raws, total): (Vec<RawEntry>, i64) = self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        let live = "agent_id = ?1
                    AND (expires_at IS NULL OR expires_at > ?2)
                    AND substr(key, 1, length(?3)) = ?3";
        let total: i64 = conn.query_row(
          &format!("SELECT COUNT(*) FROM data_entries WHERE {live}"),
          params![id, now, prefix],
          |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
          "SELECT {ENTRY_COLUMNS} FROM data_entries
           WHERE {live} AND key > ?4
           ORDER BY key LIMIT ?5"
        ))?;
        let raws = stmt
          .query_map(
            params![id, now, prefix, after, to_i64(limit as u64 + 1)],
            RawEntry::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((raws, total))
      })
      .await?;

    let mut data = raws.into_iter().map(RawEntry::into_entry).collect::<Result<Vec<_>>>()?;
    let has_more = data.len() > limit;
    data.truncate(limit);
    let next_cursor = has_more.then(|| data.last().map(|e| encode_cursor(&e.key))).flatten();
    if !full {
      data = data.into_iter().map(DataEntry::into_preview).collect();
    }

    Ok(DataPage { data, has_more, total: to_u64(total), next_cursor })
  }

  async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
    let cutoff = encode_dt(now);
    let mut purged = 0u64;

    loop {
      let cutoff = cutoff.clone();
      let at = self.clock.now();
      let batch = self
        .write(move |conn| {
          let mut stmt = conn.prepare(
            "SELECT agent_id, key, expires_at FROM data_entries
             WHERE expires_at IS NOT NULL AND expires_at <= ?1
             ORDER BY agent_id, key LIMIT ?2",
          )?;
          let expired = stmt
            .query_map(params![cutoff, to_i64(PURGE_BATCH as u64)], |r| {
              Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

          for (agent_id, key, expires_at) in &expired {
            tx::remove_entry(conn, agent_id, key)?;
            let event = NewAuditEvent::new(Operation::DataExpire, key.clone(), AuditResult::Success)
              .with_field("expires_at", expires_at.clone());
            tx::append(conn, agent_id, event, at)?;
          }
          Ok(expired.len())
        })
        .await?;

      purged += batch as u64;
      if batch < PURGE_BATCH {
        break;
      }
    }

    if purged > 0 {
      info!(purged, "expired entries purged");
    }
    Ok(purged)
  }

  // ── Audit ledger ──────────────────────────────────────────────────────────

  async fn append_audit(
    &self,
    workspace_id: &str,
    agent_id: &str,
    event: NewAuditEvent,
  ) -> Result<AuditEvent> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let now = self.clock.now();
    self
      .write(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        tx::append(conn, &id, event.clone(), now)
      })
      .await
  }

  async fn query_audit(
    &self,
    workspace_id: &str,
    agent_id: &str,
    query: &AuditQuery,
  ) -> Result<AuditPage> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let limit = query.effective_limit();
    let offset = query.offset.unwrap_or(0);

    let mut filter = String::from("agent_id = ?");
    let mut args = vec![SqlValue::Text(agent_id.to_owned())];
    if !query.operations.is_empty() {
      let marks = vec!["?"; query.operations.len()].join(", ");
      filter.push_str(&format!(" AND operation IN ({marks})"));
      args.extend(query.operations.iter().map(|op| SqlValue::Text(op.as_str().to_owned())));
    }
    if let Some(start) = query.range.start {
      filter.push_str(" AND timestamp >= ?");
      args.push(SqlValue::Text(encode_dt(start)));
    }
    if let Some(end) = query.range.end {
      filter.push_str(" AND timestamp <= ?");
      args.push(SqlValue::Text(encode_dt(end)));
    }

    let (raws, total, head) = self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        let total: i64 = conn.query_row(
          &format!("SELECT COUNT(*) FROM audit_events WHERE {filter}"),
          params_from_iter(args.iter()),
          |r| r.get(0),
        )?;
        let mut page_args = args;
        page_args.push(SqlValue::Integer(to_i64(limit as u64)));
        page_args.push(SqlValue::Integer(to_i64(offset as u64)));
        let mut stmt = conn.prepare(&format!(
          "SELECT {EVENT_COLUMNS} FROM audit_events WHERE {filter}
           ORDER BY sequence DESC LIMIT ? OFFSET ?"
        ))?;
        let raws = stmt
          .query_map(params_from_iter(page_args.iter()), RawEvent::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        let head = tx::chain_head(conn, &id)?.map(|h| h.hash);
        Ok((raws, total, head))
      })
      .await?;

    Ok(AuditPage {
      events:      raws.into_iter().map(RawEvent::into_event).collect::<Result<Vec<_>>>()?,
      total:       to_u64(total),
      chain_start: Some(chain::genesis_hash(agent_id)),
      chain_end:   head,
    })
  }

  async fn get_audit_event(
    &self,
    workspace_id: &str,
    agent_id: &str,
    id: Uuid,
  ) -> Result<Option<AuditEvent>> {
    let (ws, agent) = (workspace_id.to_owned(), agent_id.to_owned());
    self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &agent)?;
        tx::event_by_id(conn, &agent, id)
      })
      .await
  }

  async fn audit_batch(
    &self,
    workspace_id: &str,
    agent_id: &str,
    range: ChainRange,
    after_sequence: Option<u64>,
    limit: usize,
  ) -> Result<Vec<AuditEvent>> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let after = after_sequence.map_or(-1, to_i64);
    let start = range.start.map(encode_dt);
    let end = range.end.map(encode_dt);

    let raws: Vec<RawEvent> = self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        let mut stmt = conn.prepare(&format!(
          "SELECT {EVENT_COLUMNS} FROM audit_events
           WHERE agent_id = ?1 AND sequence > ?2
             AND (?3 IS NULL OR timestamp >= ?3)
             AND (?4 IS NULL OR timestamp <= ?4)
           ORDER BY sequence LIMIT ?5"
        ))?;
        let raws = stmt
          .query_map(params![id, after, start, end, to_i64(limit as u64)], RawEvent::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(raws)
      })
      .await?;

    raws.into_iter().map(RawEvent::into_event).collect()
  }

  // ── Checkpoints ───────────────────────────────────────────────────────────

  async fn create_checkpoint(
    &self,
    workspace_id: &str,
    agent_id: &str,
    input: NewCheckpoint,
  ) -> Result<Checkpoint> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let now = self.clock.now();

    let checkpoint = self
      .write(move |conn| {
        tx::active_agent(conn, &ws, &id)?;
        let checkpoint_id = Uuid::new_v4();
        let id_str = encode_uuid(checkpoint_id);
        let metadata = input.metadata.clone().unwrap_or_else(|| json!({}));

        // Insert the header first so the entries can reference it, then fix
        // the count once the live key set has been copied.
        conn.execute(
          "INSERT INTO checkpoints (checkpoint_id, agent_id, label, metadata, created_at, entry_count)
           VALUES (?1, ?2, ?3, ?4, ?5, 0)",
          params![id_str, id, input.label, encode_json(&metadata), encode_dt(now)],
        )?;
        let captured = conn.execute(
          "INSERT INTO checkpoint_entries (checkpoint_id, key, value, metadata, expires_at)
           SELECT ?1, key, value, metadata, expires_at FROM data_entries
           WHERE agent_id = ?2 AND (expires_at IS NULL OR expires_at > ?3)",
          params![id_str, id, encode_dt(now)],
        )?;
        conn.execute(
          "UPDATE checkpoints SET entry_count = ?2 WHERE checkpoint_id = ?1",
          params![id_str, to_i64(captured as u64)],
        )?;

        let event = NewAuditEvent::new(
          Operation::CheckpointCreate,
          id_str.clone(),
          AuditResult::Success,
        )
        .with_field("label", input.label.clone())
        .with_field("entry_count", captured);
        tx::append(conn, &id, event, now)?;

        Ok(Checkpoint {
          checkpoint_id,
          agent_id: id.clone(),
          label: input.label.clone(),
          metadata,
          created_at: now,
          entry_count: captured as u64,
        })
      })
      .await?;

    info!(
      agent_id,
      checkpoint_id = %checkpoint.checkpoint_id,
      entries = checkpoint.entry_count,
      "checkpoint created"
    );
    Ok(checkpoint)
  }

  async fn list_checkpoints(
    &self,
    workspace_id: &str,
    agent_id: &str,
    limit: usize,
    offset: usize,
  ) -> Result<CheckpointPage> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let limit = page_limit(Some(limit));

    let (raws, total): (Vec<RawCheckpoint>, i64) = self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        let total: i64 = conn.query_row(
          "SELECT COUNT(*) FROM checkpoints WHERE agent_id = ?1",
          params![id],
          |r| r.get(0),
        )?;
        let mut stmt = conn.prepare(&format!(
          "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE agent_id = ?1
           ORDER BY created_at DESC, checkpoint_id LIMIT ?2 OFFSET ?3"
        ))?;
        let raws = stmt
          .query_map(
            params![id, to_i64(limit as u64), to_i64(offset as u64)],
            RawCheckpoint::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((raws, total))
      })
      .await?;

    let data = raws
      .into_iter()
      .map(RawCheckpoint::into_checkpoint)
      .collect::<Result<Vec<_>>>()?;
    let total = to_u64(total);
    Ok(CheckpointPage { has_more: ((offset + data.len()) as u64) < total, data, total })
  }

  async fn get_checkpoint(
    &self,
    workspace_id: &str,
    agent_id: &str,
    checkpoint_id: Uuid,
  ) -> Result<Option<Checkpoint>> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let raw: Option<RawCheckpoint> = self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                 WHERE checkpoint_id = ?1 AND agent_id = ?2"
              ),
              params![encode_uuid(checkpoint_id), id],
              RawCheckpoint::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawCheckpoint::into_checkpoint).transpose()
  }

  async fn delete_checkpoint(
    &self,
    workspace_id: &str,
    agent_id: &str,
    checkpoint_id: Uuid,
  ) -> Result<()> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let now = self.clock.now();

    self
      .write(move |conn| {
        tx::active_agent(conn, &ws, &id)?;
        let id_str = encode_uuid(checkpoint_id);
        let removed = conn.execute(
          "DELETE FROM checkpoints WHERE checkpoint_id = ?1 AND agent_id = ?2",
          params![id_str, id],
        )?;
        if removed == 0 {
          return Err(Error::CheckpointNotFound(checkpoint_id));
        }
        let event =
          NewAuditEvent::new(Operation::CheckpointDelete, id_str, AuditResult::Success);
        tx::append(conn, &id, event, now)?;
        Ok(())
      })
      .await
  }

  async fn restore_checkpoint(
    &self,
    workspace_id: &str,
    agent_id: &str,
    checkpoint_id: Uuid,
  ) -> Result<RestoreOutcome> {
    let _guard = self.begin_restore(agent_id)?;
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let now = self.clock.now();

    let outcome = self
      .write(move |conn| {
        tx::active_agent(conn, &ws, &id)?;
        let id_str = encode_uuid(checkpoint_id);
        let exists = conn
          .query_row(
            "SELECT 1 FROM checkpoints WHERE checkpoint_id = ?1 AND agent_id = ?2",
            params![id_str, id],
            |_| Ok(true),
          )
          .optional()?
          .unwrap_or(false);
        if !exists {
          return Err(Error::CheckpointNotFound(checkpoint_id));
        }

        let mut stmt = conn.prepare(
          "SELECT key, value, metadata, expires_at FROM checkpoint_entries
           WHERE checkpoint_id = ?1 ORDER BY key",
        )?;
        let snapshot = stmt
          .query_map(params![id_str], RawSnapshotEntry::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?
          .into_iter()
          .map(RawSnapshotEntry::into_snapshot_entry)
          .collect::<Result<Vec<SnapshotEntry>>>()?;

        // A restore never extends retention: entries that lapsed since
        // capture stay gone.
        let (restorable, lapsed): (Vec<_>, Vec<_>) = snapshot
          .into_iter()
          .partition(|e| e.expires_at.is_none_or(|at| at > now));
        let keep: HashSet<&str> = restorable.iter().map(|e| e.key.as_str()).collect();

        let mut removed = 0u64;
        for key in tx::live_keys(conn, &id, "", now)? {
          if keep.contains(key.as_str()) {
            continue;
          }
          tx::remove_entry(conn, &id, &key)?;
          let event = NewAuditEvent::new(Operation::DataDelete, key, AuditResult::Success)
            .with_field("cause", "checkpoint.restore")
            .with_field("checkpoint_id", id_str.clone());
          tx::append(conn, &id, event, now)?;
          removed += 1;
        }

        for entry in &restorable {
          let event = NewAuditEvent::new(
            Operation::CheckpointRestore,
            entry.key.clone(),
            AuditResult::Success,
          )
          .with_field("checkpoint_id", id_str.clone())
          .with_field("value_sha256", chain::sha256_hex(&entry.value));
          let event = tx::append(conn, &id, event, now)?;
          tx::put_entry(
            conn,
            &id,
            &entry.key,
            &entry.value,
            &entry.metadata,
            entry.expires_at,
            &event,
          )?;
        }

        let restored = restorable.len() as u64;
        let skipped_expired = lapsed.len() as u64;
        let summary = NewAuditEvent::new(
          Operation::CheckpointRestore,
          id_str.clone(),
          AuditResult::Success,
        )
        .with_metadata(json!({
          "checkpoint_id": id_str,
          "restored": restored,
          "removed": removed,
          "skipped_expired": skipped_expired,
          "summary": true,
        }));
        let summary = tx::append(conn, &id, summary, now)?;

        Ok(RestoreOutcome { restored, removed, skipped_expired, summary_audit_id: summary.id })
      })
      .await?;

    info!(
      agent_id,
      %checkpoint_id,
      restored = outcome.restored,
      removed = outcome.removed,
      "checkpoint restored"
    );
    Ok(outcome)
  }

  // ── Export records ────────────────────────────────────────────────────────

  async fn record_export(&self, record: &ExportRecord) -> Result<()> {
    let record = record.clone();
    let verification = record.verification.as_ref().map(serde_json::to_string).transpose()?;
    self
      .write(move |conn| {
        conn.execute(
          "INSERT INTO audit_exports
             (export_id, agent_id, workspace_id, format, path,
              event_count, expires_at, created_at, verification)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          params![
            encode_uuid(record.export_id),
            record.agent_id,
            record.workspace_id,
            record.format.as_str(),
            record.path,
            to_i64(record.event_count),
            encode_dt(record.expires_at),
            encode_dt(record.created_at),
            verification,
          ],
        )?;
        Ok(())
      })
      .await
  }

  async fn get_export(
    &self,
    workspace_id: &str,
    agent_id: &str,
    export_id: Uuid,
  ) -> Result<Option<ExportRecord>> {
    let (ws, id) = (workspace_id.to_owned(), agent_id.to_owned());
    let raw: Option<RawExport> = self
      .read(move |conn| {
        tx::live_agent(conn, &ws, &id)?;
        Ok(
          conn
            .query_row(
              &format!(
                "SELECT {EXPORT_COLUMNS} FROM audit_exports
                 WHERE export_id = ?1 AND agent_id = ?2 AND workspace_id = ?3"
              ),
              params![encode_uuid(export_id), id, ws],
              RawExport::from_row,
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawExport::into_record).transpose()
  }

  async fn expired_exports(&self, now: DateTime<Utc>) -> Result<Vec<ExportRecord>> {
    let cutoff = encode_dt(now);
    let raws: Vec<RawExport> = self
      .read(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {EXPORT_COLUMNS} FROM audit_exports WHERE expires_at <= ?1 ORDER BY expires_at"
        ))?;
        let raws = stmt
          .query_map(params![cutoff], RawExport::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(raws)
      })
      .await?;
    raws.into_iter().map(RawExport::into_record).collect()
  }

  async fn remove_export(&self, export_id: Uuid) -> Result<()> {
    self
      .write(move |conn| {
        conn.execute(
          "DELETE FROM audit_exports WHERE export_id = ?1",
          params![encode_uuid(export_id)],
        )?;
        Ok(())
      })
      .await
  }
}
