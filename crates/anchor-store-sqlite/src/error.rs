//! Error type for `anchor-store-sqlite`.

use anchor_core::store::{ErrorKind, StoreError};
use rusqlite::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] anchor_core::Error),

  #[error("database error: {0}")]
  Database(tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("agent not found: {0}")]
  AgentNotFound(String),

  #[error("agent {0} already exists")]
  AgentExists(String),

  #[error("agent {0} is suspended")]
  AgentSuspended(String),

  #[error("key not found: {0}")]
  KeyNotFound(String),

  #[error("checkpoint not found: {0}")]
  CheckpointNotFound(Uuid),

  #[error("config version {0} not found")]
  ConfigVersionNotFound(u64),

  #[error("a restore is already running for agent {0}")]
  RestoreInProgress(String),

  /// The stored chain head could not be extended.
  #[error("audit chain for agent {agent_id} is inconsistent: {detail}")]
  ChainCorrupt { agent_id: String, detail: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  /// Carry a domain error out of a `Connection::call` closure.
  pub(crate) fn into_call(self) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(self))
  }
}

impl From<tokio_rusqlite::Error> for Error {
  fn from(e: tokio_rusqlite::Error) -> Self {
    match e {
      tokio_rusqlite::Error::Other(boxed) => match boxed.downcast::<Error>() {
        Ok(ours) => *ours,
        Err(other) => Error::Database(tokio_rusqlite::Error::Other(other)),
      },
      other => Error::Database(other),
    }
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self { Error::Database(tokio_rusqlite::Error::Rusqlite(e)) }
}

/// SQLite reported the database busy or locked.
pub(crate) fn is_busy(e: &tokio_rusqlite::Error) -> bool {
  matches!(
    e,
    tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(f, _))
      if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
  )
}

impl StoreError for Error {
  fn kind(&self) -> ErrorKind {
    match self {
      Error::Core(e) => e.kind(),
      Error::Database(e) if is_busy(e) => ErrorKind::Transient,
      Error::Database(_) | Error::Json(_) | Error::Uuid(_) | Error::DateParse(_) => {
        ErrorKind::Internal
      }
      Error::AgentNotFound(_)
      | Error::KeyNotFound(_)
      | Error::CheckpointNotFound(_)
      | Error::ConfigVersionNotFound(_) => ErrorKind::NotFound,
      Error::AgentExists(_) | Error::AgentSuspended(_) | Error::RestoreInProgress(_) => {
        ErrorKind::Conflict
      }
      Error::ChainCorrupt { .. } => ErrorKind::ChainIntegrity,
    }
  }
}
