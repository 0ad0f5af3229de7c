//! The authenticated caller of a request.

use std::convert::Infallible;

use anchor_core::DEFAULT_WORKSPACE;
use axum::{extract::FromRequestParts, http::request::Parts};

/// Who is calling, as resolved by the authentication layer and stored as a
/// request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
  pub workspace_id: String,
  /// Recorded as `actor` on config changes.
  pub actor:        Option<String>,
}

impl Caller {
  pub fn new(workspace_id: impl Into<String>, actor: Option<String>) -> Self {
    Self { workspace_id: workspace_id.into(), actor }
  }

  pub fn anonymous() -> Self { Self::new(DEFAULT_WORKSPACE, None) }
}

impl<St: Send + Sync> FromRequestParts<St> for Caller {
  type Rejection = Infallible;

  async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
    Ok(parts.extensions.get::<Caller>().cloned().unwrap_or_else(Caller::anonymous))
  }
}
