//! Anchor server: configuration, API-key authentication and the retention
//! sweeper wrapped around [`anchor_api`].

pub mod auth;
pub mod config;
pub mod sweeper;

use std::sync::Arc;

use anchor_api::{ApiState, api_router};
use anchor_core::store::GovernanceStore;
use axum::{Router, middleware};

use crate::{
  auth::AuthConfig,
  config::{ConfigError, ServerConfig},
};

/// The API router with authentication in front of it.
pub fn app<S>(store: Arc<S>, config: &ServerConfig) -> Result<Router, ConfigError>
where
  S: GovernanceStore + 'static,
{
  let exports = config.export_settings()?;
  let auth_config = Arc::new(AuthConfig {
    keys:            config.api_keys.clone(),
    allow_anonymous: config.allow_anonymous,
  });
  Ok(
    api_router(ApiState::new(store, exports))
      .layer(middleware::from_fn_with_state(auth_config, auth::require_api_key)),
  )
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;
  use anchor_store_sqlite::SqliteStore;
  use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
  use axum::{
    body::Body,
    http::{Request, StatusCode},
  };
  use rand_core::OsRng;
  use serde_json::{Value, json};
  use tower::ServiceExt as _;

  use crate::config::ApiKey;

  fn hash(key: &str) -> String {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default().hash_password(key.as_bytes(), &salt).unwrap().to_string()
  }

  async fn make_app(allow_anonymous: bool, dir: &tempfile::TempDir) -> Router {
    let store = SqliteStore::open_in_memory().await.expect("in-memory store");
    let config = ServerConfig {
      export_dir: dir.path().to_path_buf(),
      api_keys: vec![
        ApiKey { workspace: "acme".into(), key_hash: hash("k-acme"), name: Some("ops".into()) },
        ApiKey { workspace: "globex".into(), key_hash: hash("k-globex"), name: None },
      ],
      allow_anonymous,
      ..ServerConfig::default()
    };
    app(Arc::new(store), &config).expect("valid config")
  }

  async fn send(
    app: &Router,
    key: Option<&str>,
    method: &str,
    uri: &str,
    body: Option<Value>,
  ) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
      builder = builder.header(auth::API_KEY_HEADER, key);
    }
    let req = match body {
      Some(v) => builder
        .header("content-type", "application/json")
        .body(Body::from(v.to_string()))
        .unwrap(),
      None => builder.body(Body::empty()).unwrap(),
    };
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, json)
  }

  #[tokio::test]
  async fn health_needs_no_key() {
    let dir = tempfile::tempdir().unwrap();
    let app = make_app(false, &dir).await;
    let (status, body) = send(&app, None, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
  }

  #[tokio::test]
  async fn api_requires_a_valid_key() {
    let dir = tempfile::tempdir().unwrap();
    let app = make_app(false, &dir).await;

    let (status, body) = send(&app, None, "GET", "/v1/agents", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = send(&app, Some("wrong"), "GET", "/v1/agents", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, Some("k-acme"), "GET", "/v1/agents", None).await;
    assert_eq!(status, StatusCode::OK);
  }

  #[tokio::test]
  async fn keys_isolate_workspaces() {
    let dir = tempfile::tempdir().unwrap();
    let app = make_app(false, &dir).await;

    let agent = json!({ "agent_id": "shared-name", "name": "bot" });
    let (status, body) = send(&app, Some("k-acme"), "POST", "/v1/agents", Some(agent)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["agent"]["workspace_id"], "acme");

    let (status, _) = send(&app, Some("k-globex"), "GET", "/v1/agents/shared-name", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, list) = send(&app, Some("k-globex"), "GET", "/v1/agents", None).await;
    assert_eq!(list["total"], 0);
  }

  #[tokio::test]
  async fn key_name_is_recorded_as_config_author() {
    let dir = tempfile::tempdir().unwrap();
    let app = make_app(false, &dir).await;
    let agent = json!({ "agent_id": "a1", "name": "bot" });
    send(&app, Some("k-acme"), "POST", "/v1/agents", Some(agent)).await;

    let config = json!({ "tone": "dry" });
    let (status, version) =
      send(&app, Some("k-acme"), "PUT", "/v1/agents/a1/config", Some(config)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(version["created_by"], "ops");
  }

  #[tokio::test]
  async fn oversized_export_ttl_is_refused() {
    let store = SqliteStore::open_in_memory().await.expect("in-memory store");
    let config = ServerConfig { export_ttl_hours: 10_000_000_000, ..ServerConfig::default() };
    assert!(app(Arc::new(store), &config).is_err());
  }

  #[tokio::test]
  async fn anonymous_access_uses_the_default_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let app = make_app(true, &dir).await;
    let (status, body) =
      send(&app, None, "POST", "/v1/agents", Some(json!({ "agent_id": "a1", "name": "bot" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["agent"]["workspace_id"], "default");
  }
}
