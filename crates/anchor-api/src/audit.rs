//! Handlers for the audit ledger under `/agents/{id}/audit`.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/audit` | `?operations=a,b&start&end&limit&offset`, newest first |
//! | `GET`  | `/audit/{audit_id}` | Single event |
//! | `GET`  | `/audit/verify` | `?start`; verifies from genesis without it |
//! | `POST` | `/audit/export` | Body: [`ExportRequest`] |
//! | `GET`  | `/audit/exports/{export_id}` | Artifact bytes; 410 once expired |

use anchor_core::{
  audit::{AuditEvent, AuditPage, AuditQuery, ChainRange},
  chain::Verification,
  export::{ExportReceipt, ExportRequest},
  ledger,
  store::GovernanceStore,
};
use axum::{
  Json,
  extract::{Path, Query, State},
  http::header,
  response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::{ApiState, Caller, error::ApiError, export};

// ─── Query ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
  /// Comma-separated operation names.
  pub operations: Option<String>,
  pub start:      Option<DateTime<Utc>>,
  pub end:        Option<DateTime<Utc>>,
  pub limit:      Option<usize>,
  pub offset:     Option<usize>,
}

impl From<QueryParams> for AuditQuery {
  fn from(p: QueryParams) -> Self {
    AuditQuery {
      operations: p.operations.as_deref().map(AuditQuery::parse_operations).unwrap_or_default(),
      range:      ChainRange { start: p.start, end: p.end },
      limit:      p.limit,
      offset:     p.offset,
    }
  }
}

/// `GET /agents/{id}/audit`
pub async fn query<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  Query(params): Query<QueryParams>,
) -> Result<Json<AuditPage>, ApiError> {
  let query = AuditQuery::from(params);
  let page = state
    .store
    .query_audit(&caller.workspace_id, &agent_id, &query)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(page))
}

/// `GET /agents/{id}/audit/{audit_id}`
pub async fn get_one<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path((agent_id, audit_id)): Path<(String, Uuid)>,
) -> Result<Json<AuditEvent>, ApiError> {
  let event = state
    .store
    .get_audit_event(&caller.workspace_id, &agent_id, audit_id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("audit event {audit_id} not found")))?;
  Ok(Json(event))
}

// ─── Verify ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
  pub start: Option<DateTime<Utc>>,
}

/// `GET /agents/{id}/audit/verify[?start=<rfc3339>]`
///
/// A broken chain is reported in the body with status 200; only the request
/// itself failing is an error.
pub async fn verify<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  Query(params): Query<VerifyParams>,
) -> Result<Json<Verification>, ApiError> {
  let verification = ledger::verify_chain(
    state.store.as_ref(),
    &caller.workspace_id,
    &agent_id,
    params.start,
    state.exports.batch_size,
  )
  .await
  .map_err(ApiError::store)?;

  if let Some(first) = &verification.first_invalid {
    warn!(
      agent_id,
      event_id = %first.id,
      sequence = first.sequence,
      reason = ?first.reason,
      "audit chain verification failed"
    );
  }
  Ok(Json(verification))
}

// ─── Export ──────────────────────────────────────────────────────────────────

/// `POST /agents/{id}/audit/export`
pub async fn create_export<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  Json(request): Json<ExportRequest>,
) -> Result<Json<ExportReceipt>, ApiError> {
  let receipt = export::export_chain(
    state.store.as_ref(),
    &state.exports,
    &caller.workspace_id,
    &agent_id,
    &request,
  )
  .await?;
  Ok(Json(receipt))
}

/// `GET /agents/{id}/audit/exports/{export_id}`
pub async fn download<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path((agent_id, export_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
  let (record, bytes) =
    export::read_artifact(state.store.as_ref(), &caller.workspace_id, &agent_id, export_id)
      .await?;
  let disposition = format!(
    "attachment; filename=\"{}-audit-{export_id}.{}\"",
    record.agent_id,
    record.format.as_str()
  );
  Ok((
    [
      (header::CONTENT_TYPE, record.format.content_type().to_owned()),
      (header::CONTENT_DISPOSITION, disposition),
    ],
    bytes,
  ))
}
