//! Handlers for workspace policies.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/policy` | `?subjectPrefix=`; the catch-all `""` policy when omitted |
//! | `GET`  | `/policy/list` | `{policies}` |
//! | `PUT`  | `/policy` | Body: partial policy with `subjectPrefix`; `{success, message, policy}` |

use anchor_core::{
  policy::{Policy, PolicyUpdate},
  store::GovernanceStore,
};
use axum::{
  Json,
  extract::{Query, State},
};
use serde::{Deserialize, Serialize};

use crate::{ApiState, Caller, error::ApiError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetParams {
  #[serde(default)]
  pub subject_prefix: String,
}

/// `GET /policy[?subjectPrefix=<prefix>]`
pub async fn get_one<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Query(params): Query<GetParams>,
) -> Result<Json<Policy>, ApiError> {
  let prefix = params.subject_prefix;
  let policy = state
    .store
    .get_policy(&caller.workspace_id, &prefix)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("no policy for prefix {prefix:?}")))?;
  Ok(Json(policy))
}

#[derive(Debug, Serialize)]
pub struct PolicyList {
  pub policies: Vec<Policy>,
}

/// `GET /policy/list`
pub async fn list<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
) -> Result<Json<PolicyList>, ApiError> {
  let policies = state
    .store
    .list_policies(&caller.workspace_id)
    .await
    .map_err(ApiError::store)?;
  Ok(Json(PolicyList { policies }))
}

#[derive(Debug, Serialize)]
pub struct Updated {
  pub success: bool,
  pub message: String,
  pub policy:  Policy,
}

/// `PUT /policy`
pub async fn update<S: GovernanceStore>(
  State(state): State<ApiState<S>>,
  caller: Caller,
  Json(body): Json<PolicyUpdate>,
) -> Result<Json<Updated>, ApiError> {
  let policy = state
    .store
    .put_policy(&caller.workspace_id, body)
    .await
    .map_err(ApiError::store)?;
  let message = format!("policy for {:?} updated", policy.subject_prefix);
  Ok(Json(Updated { success: true, message, policy }))
}
