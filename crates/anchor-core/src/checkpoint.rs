//! Checkpoints: named snapshots of an agent's key set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
  pub checkpoint_id: Uuid,
  pub agent_id:      String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub label:         Option<String>,
  #[serde(default)]
  pub metadata:      Value,
  pub created_at:    DateTime<Utc>,
  /// Number of keys captured.
  pub entry_count:   u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCheckpoint {
  #[serde(default)]
  pub label:    Option<String>,
  #[serde(default)]
  pub metadata: Option<Value>,
}

/// A captured `(key, value, metadata)` triple. The expiry travels with it so
/// a restore never extends retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
  pub key:        String,
  pub value:      String,
  pub metadata:   Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
  /// Keys written back from the snapshot.
  pub restored:         u64,
  /// Keys that did not exist at capture time and were deleted.
  pub removed:          u64,
  /// Captured keys whose retention ran out since capture; not written back.
  pub skipped_expired:  u64,
  pub summary_audit_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointPage {
  pub data:     Vec<Checkpoint>,
  pub has_more: bool,
  pub total:    u64,
}
