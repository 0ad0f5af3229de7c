//! Handlers for governed data under `/agents/{id}/data`.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `POST`   | `/data` | Body: `{key, value, metadata?}`; 200 whether allowed or blocked |
//! | `GET`    | `/data` | `?prefix&limit&cursor&full` |
//! | `GET`    | `/data/{key}` | `{entry}`; 404 if absent or expired |
//! | `GET`    | `/data/{key}/full` | `{entry, audit}` |
//! | `DELETE` | `/data/{key}` | `{success, audit_id}` |
//! | `DELETE` | `/data/prefix/{prefix}` | `{deleted}` |

use anchor_core::{
  data::{DataEntry, DataPage, DataQuery, DataWrite, FullEntry, WriteOutcome},
  store::GovernanceStore,
};
use axum::{
  Json,
  extract::{Path, Query, State},
};
use serde::Serialize;
use uuid::Uuid;

use crate::{ApiState, Caller, error::ApiError};

/// `POST /agents/{id}/data`
pub async fn write<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  Json(body): Json<DataWrite>,
) -> Result<Json<WriteOutcome>, ApiError> {
  let outcome = state
    .store
    .write_data(&caller.workspace_id, &agent_id, body)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(outcome))
}

/// `GET /agents/{id}/data`
pub async fn list<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  Query(query): Query<DataQuery>,
) -> Result<Json<DataPage>, ApiError> {
  let page = state
    .store
    .list_data(&caller.workspace_id, &agent_id, &query)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(page))
}

#[derive(Debug, Serialize)]
pub struct EntryBody {
  pub entry: DataEntry,
}

/// `GET /agents/{id}/data/{key}`
pub async fn read<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path((agent_id, key)): Path<(String, String)>,
) -> Result<Json<EntryBody>, ApiError> {
  let entry = state
    .store
    .read_data(&caller.workspace_id, &agent_id, &key)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("key {key:?} not found")))?;
  Ok(Json(EntryBody { entry }))
}

/// `GET /agents/{id}/data/{key}/full`
pub async fn read_full<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path((agent_id, key)): Path<(String, String)>,
) -> Result<Json<FullEntry>, ApiError> {
  let full = state
    .store
    .read_data_full(&caller.workspace_id, &agent_id, &key)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("key {key:?} not found")))?;
  Ok(Json(full))
}

#[derive(Debug, Serialize)]
pub struct DeletedBody {
  pub success:  bool,
  pub audit_id: Uuid,
}

/// `DELETE /agents/{id}/data/{key}`
pub async fn remove<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path((agent_id, key)): Path<(String, String)>,
) -> Result<Json<DeletedBody>, ApiError> {
  let event = state
    .store
    .delete_data(&caller.workspace_id, &agent_id, &key)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(DeletedBody { success: true, audit_id: event.id }))
}

#[derive(Debug, Serialize)]
pub struct DeletedCount {
  pub deleted: u64,
}

/// `DELETE /agents/{id}/data/prefix/{prefix}`
pub async fn remove_prefix<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path((agent_id, prefix)): Path<(String, String)>,
) -> Result<Json<DeletedCount>, ApiError> {
  let deleted = state
    .store
    .delete_prefix(&caller.workspace_id, &agent_id, &prefix)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(DeletedCount { deleted }))
}
