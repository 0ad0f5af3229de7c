//! Error types for `anchor-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid agent id: {0:?}")]
  InvalidAgentId(String),

  #[error("invalid agent: {0}")]
  InvalidAgent(String),

  #[error("invalid key: {0}")]
  InvalidKey(String),

  #[error("value exceeds {limit} bytes")]
  ValueTooLarge { limit: usize },

  #[error("invalid policy: {0}")]
  InvalidPolicy(String),

  #[error("invalid agent config: {0}")]
  InvalidConfig(String),

  #[error("invalid cursor")]
  InvalidCursor,

  #[error("invalid timestamp: {0:?}")]
  InvalidTimestamp(String),

  #[error("unknown {kind}: {value:?}")]
  UnknownVariant { kind: &'static str, value: String },

  #[error("malformed export artifact: {0}")]
  MalformedExport(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
