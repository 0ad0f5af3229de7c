//! The `GovernanceStore` trait and backend error classification.
//!
//! The trait is implemented by storage backends (e.g. `anchor-store-sqlite`).
//! The HTTP layer and the generic ledger operations depend on this
//! abstraction, never on a concrete backend.
//!
//! Every method takes the workspace explicitly; there is no ambient session.
//! Agent-scoped methods fail with a `NotFound` error when the agent does not
//! exist in that workspace or has been deleted.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{
  agent::{
    Agent, AgentPage, AgentQuery, AgentStatus, AgentUpdate, ConfigVersion,
    ConfigVersionPage, NewAgent,
  },
  audit::{AuditEvent, AuditPage, AuditQuery, ChainRange, NewAuditEvent},
  checkpoint::{Checkpoint, CheckpointPage, NewCheckpoint, RestoreOutcome},
  data::{DataEntry, DataPage, DataQuery, DataWrite, FullEntry, WriteOutcome},
  export::ExportRecord,
  policy::{Policy, PolicyUpdate},
};

// ─── Error classification ────────────────────────────────────────────────────

/// Backend-independent error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Malformed request; not retried.
  Validation,
  NotFound,
  /// Conflicting concurrent operation, or an operation the agent's state
  /// forbids.
  Conflict,
  /// The audit chain is broken where an operation required it intact.
  ChainIntegrity,
  /// Retryable storage failure that persisted past the retry budget.
  Transient,
  Internal,
}

impl ErrorKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Validation => "validation",
      Self::NotFound => "not_found",
      Self::Conflict => "conflict",
      Self::ChainIntegrity => "chain_integrity",
      Self::Transient => "transient",
      Self::Internal => "internal",
    }
  }
}

pub trait StoreError: std::error::Error + Send + Sync + 'static {
  fn kind(&self) -> ErrorKind;
}

impl StoreError for crate::Error {
  fn kind(&self) -> ErrorKind {
    use crate::Error as E;
    match self {
      E::InvalidAgentId(_)
      | E::InvalidAgent(_)
      | E::InvalidKey(_)
      | E::ValueTooLarge { .. }
      | E::InvalidPolicy(_)
      | E::InvalidConfig(_)
      | E::InvalidCursor
      | E::InvalidTimestamp(_)
      | E::UnknownVariant { .. }
      | E::MalformedExport(_) => ErrorKind::Validation,
      E::Io(_) | E::Serialization(_) => ErrorKind::Internal,
    }
  }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over an Anchor storage backend.
///
/// Every governed mutation appends to the agent's audit chain in the same
/// atomic unit as the mutation itself. Appends for one agent are totally
/// ordered; different agents proceed independently.
///
/// All methods return `Send` futures so the trait can be used behind axum.
pub trait GovernanceStore: Send + Sync {
  type Error: StoreError;

  /// The store's notion of the current time.
  fn now(&self) -> DateTime<Utc>;

  // ── Agents ────────────────────────────────────────────────────────────

  /// Create an agent; appends `agent.create` as the first event of its
  /// chain.
  fn create_agent<'a>(
    &'a self,
    workspace_id: &'a str,
    input: NewAgent,
  ) -> impl Future<Output = Result<Agent, Self::Error>> + Send + 'a;

  /// Fetch an agent, including deleted ones. `None` if unknown.
  fn get_agent<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
  ) -> impl Future<Output = Result<Option<Agent>, Self::Error>> + Send + 'a;

  fn list_agents<'a>(
    &'a self,
    workspace_id: &'a str,
    query: &'a AgentQuery,
  ) -> impl Future<Output = Result<AgentPage, Self::Error>> + Send + 'a;

  /// Apply a partial update. A config change creates a new config version.
  fn update_agent<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    update: AgentUpdate,
    actor: Option<String>,
  ) -> impl Future<Output = Result<Agent, Self::Error>> + Send + 'a;

  /// Suspend, activate or delete an agent.
  fn set_agent_status<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    status: AgentStatus,
  ) -> impl Future<Output = Result<Agent, Self::Error>> + Send + 'a;

  /// Replace an agent's config, creating a new version.
  fn put_agent_config<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    config: Value,
    actor: Option<String>,
  ) -> impl Future<Output = Result<ConfigVersion, Self::Error>> + Send + 'a;

  /// Config versions, newest first.
  fn config_versions<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    limit: usize,
  ) -> impl Future<Output = Result<ConfigVersionPage, Self::Error>> + Send + 'a;

  fn config_version<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    version: u64,
  ) -> impl Future<Output = Result<Option<ConfigVersion>, Self::Error>> + Send + 'a;

  /// Make an old config current again, as a new version.
  fn rollback_config<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    target_version: u64,
    actor: Option<String>,
  ) -> impl Future<Output = Result<ConfigVersion, Self::Error>> + Send + 'a;

  // ── Workspace policies ────────────────────────────────────────────────

  fn get_policy<'a>(
    &'a self,
    workspace_id: &'a str,
    subject_prefix: &'a str,
  ) -> impl Future<Output = Result<Option<Policy>, Self::Error>> + Send + 'a;

  fn list_policies<'a>(
    &'a self,
    workspace_id: &'a str,
  ) -> impl Future<Output = Result<Vec<Policy>, Self::Error>> + Send + 'a;

  /// Create or partially update the policy for `update.subject_prefix`.
  fn put_policy<'a>(
    &'a self,
    workspace_id: &'a str,
    update: PolicyUpdate,
  ) -> impl Future<Output = Result<Policy, Self::Error>> + Send + 'a;

  // ── Governed data ─────────────────────────────────────────────────────

  /// Evaluate and, if allowed, apply a write. Either way exactly one
  /// `data.write` event is appended.
  fn write_data<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    input: DataWrite,
  ) -> impl Future<Output = Result<WriteOutcome, Self::Error>> + Send + 'a;

  /// Read a live entry. Expired entries read as `None`.
  fn read_data<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    key: &'a str,
  ) -> impl Future<Output = Result<Option<DataEntry>, Self::Error>> + Send + 'a;

  fn read_data_full<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    key: &'a str,
  ) -> impl Future<Output = Result<Option<FullEntry>, Self::Error>> + Send + 'a;

  /// Delete one key, returning the `data.delete` event.
  fn delete_data<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    key: &'a str,
  ) -> impl Future<Output = Result<AuditEvent, Self::Error>> + Send + 'a;

  /// Delete every key under `prefix`, one event per key. Returns the count.
  fn delete_prefix<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    prefix: &'a str,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a;

  fn list_data<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    query: &'a DataQuery,
  ) -> impl Future<Output = Result<DataPage, Self::Error>> + Send + 'a;

  /// Physically remove entries expired at `now`, across all workspaces, with
  /// one `data.expire` event each. Returns the count.
  fn purge_expired(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  // ── Audit ledger ──────────────────────────────────────────────────────

  /// Append a non-data event (e.g. `audit.export`) to an agent's chain.
  fn append_audit<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    event: NewAuditEvent,
  ) -> impl Future<Output = Result<AuditEvent, Self::Error>> + Send + 'a;

  /// Newest-first listing.
  fn query_audit<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    query: &'a AuditQuery,
  ) -> impl Future<Output = Result<AuditPage, Self::Error>> + Send + 'a;

  fn get_audit_event<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<AuditEvent>, Self::Error>> + Send + 'a;

  /// Up to `limit` events in `range` with sequence greater than
  /// `after_sequence`, in chain order. Used for keyset-paginated streaming.
  fn audit_batch<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    range: ChainRange,
    after_sequence: Option<u64>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<AuditEvent>, Self::Error>> + Send + 'a;

  // ── Checkpoints ───────────────────────────────────────────────────────

  /// Snapshot the live key set at a single instant.
  fn create_checkpoint<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    input: NewCheckpoint,
  ) -> impl Future<Output = Result<Checkpoint, Self::Error>> + Send + 'a;

  fn list_checkpoints<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    limit: usize,
    offset: usize,
  ) -> impl Future<Output = Result<CheckpointPage, Self::Error>> + Send + 'a;

  fn get_checkpoint<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    checkpoint_id: Uuid,
  ) -> impl Future<Output = Result<Option<Checkpoint>, Self::Error>> + Send + 'a;

  fn delete_checkpoint<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    checkpoint_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Make the live key set equal the snapshot, all or nothing.
  fn restore_checkpoint<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    checkpoint_id: Uuid,
  ) -> impl Future<Output = Result<RestoreOutcome, Self::Error>> + Send + 'a;

  // ── Export records ────────────────────────────────────────────────────

  fn record_export<'a>(
    &'a self,
    record: &'a ExportRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn get_export<'a>(
    &'a self,
    workspace_id: &'a str,
    agent_id: &'a str,
    export_id: Uuid,
  ) -> impl Future<Output = Result<Option<ExportRecord>, Self::Error>> + Send + 'a;

  /// Export records whose artifacts expired at or before `now`.
  fn expired_exports(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<ExportRecord>, Self::Error>> + Send + '_;

  fn remove_export(
    &self,
    export_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
