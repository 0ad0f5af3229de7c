//! Handlers for `/agents/{id}/checkpoints`.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `GET`    | `/checkpoints` | `?limit&offset`, newest first |
//! | `POST`   | `/checkpoints` | Body: `{label?, metadata?}`; 201 + `{checkpoint}` |
//! | `GET`    | `/checkpoints/{cid}` | `{checkpoint}` |
//! | `DELETE` | `/checkpoints/{cid}` | `{success}` |
//! | `POST`   | `/checkpoints/{cid}/restore` | `{restored, removed, skipped_expired, summary_audit_id}`; 409 while another restore runs |

use anchor_core::{
  checkpoint::{Checkpoint, CheckpointPage, NewCheckpoint, RestoreOutcome},
  data::DEFAULT_LIST_LIMIT,
  store::GovernanceStore,
};
use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{ApiState, Caller, error::ApiError};

#[derive(Debug, Serialize)]
pub struct CheckpointBody {
  pub checkpoint: Checkpoint,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
  pub limit:  Option<usize>,
  pub offset: Option<usize>,
}

/// `GET /agents/{id}/checkpoints`
pub async fn list<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  Query(params): Query<ListParams>,
) -> Result<Json<CheckpointPage>, ApiError> {
  let page = state
    .store
    .list_checkpoints(
      &caller.workspace_id,
      &agent_id,
      params.limit.unwrap_or(DEFAULT_LIST_LIMIT),
      params.offset.unwrap_or(0),
    )
    .await
    .map_err(ApiError::store)?;
  Ok(Json(page))
}

/// `POST /agents/{id}/checkpoints`; the body may be omitted.
pub async fn create<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  body: Option<Json<NewCheckpoint>>,
) -> Result<impl IntoResponse, ApiError> {
  let input = body.map(|Json(b)| b).unwrap_or_default();
  let checkpoint = state
    .store
    .create_checkpoint(&caller.workspace_id, &agent_id, input)
    .await
    .map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(CheckpointBody { checkpoint })))
}

/// `GET /agents/{id}/checkpoints/{cid}`
pub async fn get_one<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path((agent_id, checkpoint_id)): Path<(String, Uuid)>,
) -> Result<Json<CheckpointBody>, ApiError> {
  let checkpoint = state
    .store
    .get_checkpoint(&caller.workspace_id, &agent_id, checkpoint_id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("checkpoint {checkpoint_id} not found")))?;
  Ok(Json(CheckpointBody { checkpoint }))
}

/// `DELETE /agents/{id}/checkpoints/{cid}`
pub async fn remove<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path((agent_id, checkpoint_id)): Path<(String, Uuid)>,
) -> Result<Json<Value>, ApiError> {
  state
    .store
    .delete_checkpoint(&caller.workspace_id, &agent_id, checkpoint_id)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(json!({ "success": true })))
}

/// `POST /agents/{id}/checkpoints/{cid}/restore`
pub async fn restore<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path((agent_id, checkpoint_id)): Path<(String, Uuid)>,
) -> Result<Json<RestoreOutcome>, ApiError> {
  let outcome = state
    .store
    .restore_checkpoint(&caller.workspace_id, &agent_id, checkpoint_id)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(outcome))
}
