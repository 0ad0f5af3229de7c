//! Handlers for `/agents` endpoints, including config versions.
//!
//! | Method   | Path | Notes |
//! |----------|------|-------|
//! | `GET`    | `/agents` | `?status&owner&limit&offset`; deleted agents only with `status=deleted` |
//! | `POST`   | `/agents` | Body: [`NewAgent`]; 201 + `{agent}` |
//! | `GET`    | `/agents/{id}` | `{agent}` |
//! | `PATCH`  | `/agents/{id}` | Body: [`AgentUpdate`] |
//! | `DELETE` | `/agents/{id}` | `{success, agent}` |
//! | `POST`   | `/agents/{id}/suspend`, `/activate` | `{agent}` |
//! | `GET`    | `/agents/{id}/config` | Current [`ConfigVersion`] |
//! | `PUT`    | `/agents/{id}/config` | Body: the whole config object |
//! | `GET`    | `/agents/{id}/config/versions` | `?limit`, newest first |
//! | `GET`    | `/agents/{id}/config/versions/{version}` | |
//! | `POST`   | `/agents/{id}/config/rollback` | Body: `{"target_version": n}` |

use anchor_core::{
  agent::{
    Agent, AgentPage, AgentQuery, AgentStatus, AgentUpdate, ConfigVersion, ConfigVersionPage,
    NewAgent,
  },
  data::DEFAULT_LIST_LIMIT,
  store::GovernanceStore,
};
use axum::{
  Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{ApiState, Caller, error::ApiError};

#[derive(Debug, Serialize)]
pub struct AgentBody {
  pub agent: Agent,
}

// ─── Agents ──────────────────────────────────────────────────────────────────

/// `GET /agents`
pub async fn list<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Query(query): Query<AgentQuery>,
) -> Result<Json<AgentPage>, ApiError> {
  let page = state
    .store
    .list_agents(&caller.workspace_id, &query)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(page))
}

/// `POST /agents`
pub async fn create<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Json(body): Json<NewAgent>,
) -> Result<impl IntoResponse, ApiError> {
  let agent = state
    .store
    .create_agent(&caller.workspace_id, body)
    .await
    .map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(AgentBody { agent })))
}

/// `GET /agents/{id}`
pub async fn get_one<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
) -> Result<Json<AgentBody>, ApiError> {
  let agent = state
    .store
    .get_agent(&caller.workspace_id, &agent_id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("agent {agent_id} not found")))?;
  Ok(Json(AgentBody { agent }))
}

/// `PATCH /agents/{id}`
pub async fn update<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  Json(body): Json<AgentUpdate>,
) -> Result<Json<AgentBody>, ApiError> {
  let agent = state
    .store
    .update_agent(&caller.workspace_id, &agent_id, body, caller.actor.clone())
    .await
    .map_err(ApiError::store)?;
  Ok(Json(AgentBody { agent }))
}

#[derive(Debug, Serialize)]
pub struct DeleteBody {
  pub success: bool,
  pub agent:   Agent,
}

/// `DELETE /agents/{id}`
pub async fn remove<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
) -> Result<Json<DeleteBody>, ApiError> {
  let agent = state
    .store
    .set_agent_status(&caller.workspace_id, &agent_id, AgentStatus::Deleted)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(DeleteBody { success: true, agent }))
}

/// `POST /agents/{id}/suspend`
pub async fn suspend<S: GovernanceStore>(
  state: State<ApiState<S>>,
  caller: Caller,
  agent_id: Path<String>,
) -> Result<Json<AgentBody>, ApiError> {
  set_status(state, caller, agent_id, AgentStatus::Suspended).await
}

/// `POST /agents/{id}/activate`
pub async fn activate<S: GovernanceStore>(
  state: State<ApiState<S>>,
  caller: Caller,
  agent_id: Path<String>,
) -> Result<Json<AgentBody>, ApiError> {
  set_status(state, caller, agent_id, AgentStatus::Active).await
}

async fn set_status<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  status: AgentStatus,
) -> Result<Json<AgentBody>, ApiError> {
  let agent = state
    .store
    .set_agent_status(&caller.workspace_id, &agent_id, status)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(AgentBody { agent }))
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// `GET /agents/{id}/config`
pub async fn get_config<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
) -> Result<Json<ConfigVersion>, ApiError> {
  let ws = &caller.workspace_id;
  let agent = state
    .store
    .get_agent(ws, &agent_id)
    .await
    .map_err(ApiError::store)?
    .filter(|a| a.status != AgentStatus::Deleted)
    .ok_or_else(|| ApiError::NotFound(format!("agent {agent_id} not found")))?;
  let current = state
    .store
    .config_version(ws, &agent_id, agent.version)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("config version {} not found", agent.version)))?;
  Ok(Json(current))
}

/// `PUT /agents/{id}/config`
pub async fn put_config<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  Json(config): Json<Value>,
) -> Result<Json<ConfigVersion>, ApiError> {
  let version = state
    .store
    .put_agent_config(&caller.workspace_id, &agent_id, config, caller.actor.clone())
    .await
    .map_err(ApiError::store)?;
  Ok(Json(version))
}

#[derive(Debug, Deserialize)]
pub struct VersionsParams {
  pub limit: Option<usize>,
}

/// `GET /agents/{id}/config/versions[?limit=n]`
pub async fn list_versions<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  Query(params): Query<VersionsParams>,
) -> Result<Json<ConfigVersionPage>, ApiError> {
  let page = state
    .store
    .config_versions(&caller.workspace_id, &agent_id, params.limit.unwrap_or(DEFAULT_LIST_LIMIT))
    .await
    .map_err(ApiError::store)?;
  Ok(Json(page))
}

/// `GET /agents/{id}/config/versions/{version}`
pub async fn get_version<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path((agent_id, version)): Path<(String, u64)>,
) -> Result<Json<ConfigVersion>, ApiError> {
  let found = state
    .store
    .config_version(&caller.workspace_id, &agent_id, version)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("config version {version} not found")))?;
  Ok(Json(found))
}

#[derive(Debug, Deserialize)]
pub struct RollbackBody {
  /// Clients send versions as strings as often as numbers.
  #[serde(deserialize_with = "version_number")]
  pub target_version: u64,
}

fn version_number<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Raw {
    Number(u64),
    Text(String),
  }
  match Raw::deserialize(de)? {
    Raw::Number(n) => Ok(n),
    Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
  }
}

/// `POST /agents/{id}/config/rollback`
pub async fn rollback<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Path(agent_id): Path<String>,
  Json(body): Json<RollbackBody>,
) -> Result<Json<ConfigVersion>, ApiError> {
  let version = state
    .store
    .rollback_config(&caller.workspace_id, &agent_id, body.target_version, caller.actor.clone())
    .await
    .map_err(ApiError::store)?;
  Ok(Json(version))
}
