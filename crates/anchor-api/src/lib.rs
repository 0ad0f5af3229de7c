//! JSON REST API for Anchor.
//!
//! Exposes an axum [`Router`] backed by any [`GovernanceStore`]. Every route
//! except `/health` is served under `/v1`. Authentication is the caller's
//! responsibility: a middleware in front of this router resolves the
//! request's workspace and inserts a [`Caller`] extension; without one the
//! request runs in the `default` workspace.
//!
//! Keys and prefixes in paths are percent-encoded by clients, so a key such
//! as `notes/today` travels as `notes%2Ftoday` in a single segment.
//!
//! # Mounting
//!
//! ```rust,ignore
//! let app = anchor_api::api_router(ApiState::new(store, exports));
//! ```

pub mod agents;
pub mod audit;
pub mod checkpoints;
pub mod data;
pub mod error;
pub mod export;
pub mod policy;
pub mod workspace;

use std::{path::PathBuf, sync::Arc};

use anchor_core::{ledger::DEFAULT_BATCH_SIZE, store::GovernanceStore};
use axum::{
  Json, Router,
  routing::{delete, get, post},
};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use workspace::Caller;

// ─── State ───────────────────────────────────────────────────────────────────

/// Where and for how long export artifacts are kept.
#[derive(Debug, Clone)]
pub struct ExportSettings {
  /// Directory artifacts are written to; created on first export.
  pub dir:        PathBuf,
  /// Public origin used to build `download_url`, without a trailing slash.
  pub base_url:   String,
  pub ttl:        chrono::Duration,
  /// Events read per batch by verify and export.
  pub batch_size: usize,
}

impl ExportSettings {
  pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
    Self {
      dir:        dir.into(),
      base_url:   base_url.into().trim_end_matches('/').to_owned(),
      ttl:        chrono::Duration::hours(24),
      batch_size: DEFAULT_BATCH_SIZE,
    }
  }
}

/// Shared state threaded through all handlers.
pub struct ApiState<S> {
  pub store:   Arc<S>,
  pub exports: Arc<ExportSettings>,
}

impl<S> ApiState<S> {
  pub fn new(store: Arc<S>, exports: ExportSettings) -> Self {
    Self { store, exports: Arc::new(exports) }
  }
}

impl<S> Clone for ApiState<S> {
  fn clone(&self) -> Self {
    Self { store: Arc::clone(&self.store), exports: Arc::clone(&self.exports) }
  }
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Build the full API router for `state`.
///
/// The returned `Router<()>` can be merged or nested into any parent router.
pub fn api_router<S>(state: ApiState<S>) -> Router<()>
where
  S: GovernanceStore + 'static,
{
  let v1 = Router::new()
    // Agents
    .route("/agents", get(agents::list::<S>).post(agents::create::<S>))
    .route(
      "/agents/{agent_id}",
      get(agents::get_one::<S>).patch(agents::update::<S>).delete(agents::remove::<S>),
    )
    .route("/agents/{agent_id}/suspend", post(agents::suspend::<S>))
    .route("/agents/{agent_id}/activate", post(agents::activate::<S>))
    // Config versions
    .route(
      "/agents/{agent_id}/config",
      get(agents::get_config::<S>).put(agents::put_config::<S>),
    )
    .route("/agents/{agent_id}/config/versions", get(agents::list_versions::<S>))
    .route("/agents/{agent_id}/config/versions/{version}", get(agents::get_version::<S>))
    .route("/agents/{agent_id}/config/rollback", post(agents::rollback::<S>))
    // Governed data
    .route("/agents/{agent_id}/data", get(data::list::<S>).post(data::write::<S>))
    .route("/agents/{agent_id}/data/prefix/{prefix}", delete(data::remove_prefix::<S>))
    .route(
      "/agents/{agent_id}/data/{key}",
      get(data::read::<S>).delete(data::remove::<S>),
    )
    .route("/agents/{agent_id}/data/{key}/full", get(data::read_full::<S>))
    // Audit ledger
    .route("/agents/{agent_id}/audit", get(audit::query::<S>))
    .route("/agents/{agent_id}/audit/verify", get(audit::verify::<S>))
    .route("/agents/{agent_id}/audit/export", post(audit::create_export::<S>))
    .route("/agents/{agent_id}/audit/exports/{export_id}", get(audit::download::<S>))
    .route("/agents/{agent_id}/audit/{audit_id}", get(audit::get_one::<S>))
    // Checkpoints
    .route(
      "/agents/{agent_id}/checkpoints",
      get(checkpoints::list::<S>).post(checkpoints::create::<S>),
    )
    .route(
      "/agents/{agent_id}/checkpoints/{checkpoint_id}",
      get(checkpoints::get_one::<S>).delete(checkpoints::remove::<S>),
    )
    .route(
      "/agents/{agent_id}/checkpoints/{checkpoint_id}/restore",
      post(checkpoints::restore::<S>),
    )
    // Workspace policies
    .route("/policy", get(policy::get_one::<S>).put(policy::update::<S>))
    .route("/policy/list", get(policy::list::<S>));

  Router::new()
    .route("/health", get(health))
    .nest("/v1", v1)
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// `GET /health`
async fn health() -> Json<Value> { Json(json!({ "status": "ok" })) }

#[cfg(test)]
mod tests;
