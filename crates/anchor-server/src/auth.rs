//! `X-API-Key` authentication middleware.
//!
//! A presented key is checked against every configured argon2 hash; the first
//! match decides the request's workspace, which is handed to the API as a
//! [`Caller`] extension.

use std::sync::Arc;

use anchor_api::Caller;
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
  Json,
  extract::{Request, State},
  http::{HeaderMap, StatusCode},
  middleware::Next,
  response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::debug;

use crate::config::ApiKey;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
  pub keys:            Vec<ApiKey>,
  /// Let requests without a key through into the `default` workspace.
  pub allow_anonymous: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
  #[error("missing X-API-Key header")]
  Missing,
  #[error("API key not recognised")]
  Rejected,
}

impl IntoResponse for AuthError {
  fn into_response(self) -> Response {
    let body = json!({ "error": "unauthorized", "message": self.to_string() });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
  }
}

/// Resolve the caller for a request's headers.
pub fn authenticate(headers: &HeaderMap, config: &AuthConfig) -> Result<Caller, AuthError> {
  let Some(presented) = headers.get(API_KEY_HEADER) else {
    return if config.allow_anonymous { Ok(Caller::anonymous()) } else { Err(AuthError::Missing) };
  };
  let presented = presented.to_str().map_err(|_| AuthError::Rejected)?.trim();
  if presented.is_empty() {
    return Err(AuthError::Rejected);
  }

  for key in &config.keys {
    // A malformed hash in config matches nothing.
    let Ok(parsed) = PasswordHash::new(&key.key_hash) else { continue };
    if Argon2::default().verify_password(presented.as_bytes(), &parsed).is_ok() {
      return Ok(Caller::new(key.workspace.clone(), key.name.clone()));
    }
  }
  Err(AuthError::Rejected)
}

/// Middleware for `axum::middleware::from_fn_with_state`. `/health` is
/// always let through.
pub async fn require_api_key(
  State(config): State<Arc<AuthConfig>>,
  mut req: Request,
  next: Next,
) -> Response {
  if req.uri().path() == "/health" {
    return next.run(req).await;
  }
  match authenticate(req.headers(), &config) {
    Ok(caller) => {
      req.extensions_mut().insert(caller);
      next.run(req).await
    }
    Err(e) => {
      debug!(path = %req.uri().path(), error = %e, "request rejected");
      e.into_response()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use argon2::{PasswordHasher, password_hash::SaltString};
  use axum::http::HeaderValue;
  use rand_core::OsRng;

  fn hash(key: &str) -> String {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default().hash_password(key.as_bytes(), &salt).unwrap().to_string()
  }

  fn config(allow_anonymous: bool) -> AuthConfig {
    AuthConfig {
      keys: vec![
        ApiKey { workspace: "acme".into(), key_hash: "not-a-phc-string".into(), name: None },
        ApiKey { workspace: "acme".into(), key_hash: hash("ak_live_1"), name: Some("ci".into()) },
        ApiKey { workspace: "globex".into(), key_hash: hash("ak_live_2"), name: None },
      ],
      allow_anonymous,
    }
  }

  fn headers(key: &str) -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(API_KEY_HEADER, HeaderValue::from_str(key).unwrap());
    h
  }

  #[test]
  fn key_selects_its_workspace() {
    let cfg = config(false);
    let caller = authenticate(&headers("ak_live_1"), &cfg).unwrap();
    assert_eq!(caller, Caller::new("acme", Some("ci".into())));
    let caller = authenticate(&headers("ak_live_2"), &cfg).unwrap();
    assert_eq!(caller.workspace_id, "globex");
  }

  #[test]
  fn unknown_key_is_rejected() {
    assert_eq!(authenticate(&headers("nope"), &config(true)), Err(AuthError::Rejected));
  }

  #[test]
  fn missing_key_depends_on_anonymous_access() {
    assert_eq!(authenticate(&HeaderMap::new(), &config(false)), Err(AuthError::Missing));
    assert_eq!(authenticate(&HeaderMap::new(), &config(true)), Ok(Caller::anonymous()));
  }
}
