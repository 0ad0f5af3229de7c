//! Router tests driven through `tower::ServiceExt::oneshot` against an
//! in-memory SQLite store, or a file-backed one where a test needs a second
//! connection to the database.

use std::{path::PathBuf, sync::Arc};

use anchor_core::{
  chain,
  clock::{Clock, ManualClock},
  export::verify_artifact,
  store::GovernanceStore as _,
};
use anchor_store_sqlite::{SqliteStore, StoreOptions};
use axum::{
  Router,
  body::Body,
  http::{Request, StatusCode, header},
};
use chrono::{Duration, TimeZone, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt as _;

use crate::{ApiState, Caller, ExportSettings, api_router, export};

struct Harness {
  app:   Router,
  store: Arc<SqliteStore>,
  clock: ManualClock,
  _dir:  TempDir,
}

async fn harness() -> Harness {
  let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
  let options = StoreOptions { clock: Arc::new(clock.clone()), ..StoreOptions::default() };
  let store = Arc::new(
    SqliteStore::open_in_memory_with(options)
      .await
      .expect("in-memory store"),
  );
  let dir = tempfile::tempdir().unwrap();
  let settings = ExportSettings::new(dir.path().join("exports"), "http://anchor.test/");
  let app = api_router(ApiState::new(Arc::clone(&store), settings));
  Harness { app, store, clock, _dir: dir }
}

/// A harness over `anchor.db` in its temp dir, plus a raw connection to the
/// same file.
async fn file_harness() -> (Harness, rusqlite::Connection, PathBuf) {
  let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
  let options = StoreOptions { clock: Arc::new(clock.clone()), ..StoreOptions::default() };
  let dir = tempfile::tempdir().unwrap();
  let db = dir.path().join("anchor.db");
  let store = Arc::new(SqliteStore::open_with(&db, options).await.expect("file store"));
  let exports = dir.path().join("exports");
  let settings = ExportSettings::new(exports.clone(), "http://anchor.test/");
  let app = api_router(ApiState::new(Arc::clone(&store), settings));
  let raw = rusqlite::Connection::open(&db).unwrap();
  (Harness { app, store, clock, _dir: dir }, raw, exports)
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
  let builder = Request::builder().method(method).uri(uri);
  match body {
    Some(v) => builder
      .header(header::CONTENT_TYPE, "application/json")
      .body(Body::from(v.to_string()))
      .unwrap(),
    None => builder.body(Body::empty()).unwrap(),
  }
}

async fn send_raw(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
  let resp = app.clone().oneshot(req).await.unwrap();
  let status = resp.status();
  let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
  (status, bytes.to_vec())
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
  let (status, bytes) = send_raw(app, req).await;
  let json = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
  (status, json)
}

async fn call(h: &Harness, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
  send(&h.app, request(method, uri, body)).await
}

async fn create_agent(h: &Harness, id: &str) {
  let (status, _) =
    call(h, "POST", "/v1/agents", Some(json!({ "agent_id": id, "name": "support bot" }))).await;
  assert_eq!(status, StatusCode::CREATED);
}

async fn write(h: &Harness, agent: &str, key: &str, value: &str) -> Value {
  let uri = format!("/v1/agents/{agent}/data");
  let (status, body) = call(h, "POST", &uri, Some(json!({ "key": key, "value": value }))).await;
  assert_eq!(status, StatusCode::OK, "{body}");
  body
}

// ─── Basics ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_ok() {
  let h = harness().await;
  let (status, body) = call(&h, "GET", "/health", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn unknown_agent_is_a_json_404() {
  let h = harness().await;
  let (status, body) = call(&h, "GET", "/v1/agents/ghost/data", None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
  assert_eq!(body["error"], "not_found");
  assert!(body["message"].is_string());
}

#[tokio::test]
async fn invalid_key_is_a_400() {
  let h = harness().await;
  create_agent(&h, "a1").await;
  let (status, body) =
    call(&h, "POST", "/v1/agents/a1/data", Some(json!({ "key": "", "value": "v" }))).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(body["error"], "validation");
}

#[tokio::test]
async fn caller_workspace_scopes_every_lookup() {
  let h = harness().await;
  create_agent(&h, "a1").await;

  let mut req = request("GET", "/v1/agents/a1", None);
  req.extensions_mut().insert(Caller::new("other", None));
  let (status, _) = send(&h.app, req).await;
  assert_eq!(status, StatusCode::NOT_FOUND);

  let (status, body) = call(&h, "GET", "/v1/agents/a1", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["agent"]["workspace_id"], "default");
}

// ─── Agents and config ───────────────────────────────────────────────────────

#[tokio::test]
async fn agent_lifecycle() {
  let h = harness().await;
  create_agent(&h, "a1").await;

  let (status, body) =
    call(&h, "PATCH", "/v1/agents/a1", Some(json!({ "description": "answers tickets" }))).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["agent"]["description"], "answers tickets");

  let (_, body) = call(&h, "POST", "/v1/agents/a1/suspend", None).await;
  assert_eq!(body["agent"]["status"], "suspended");

  let (status, body) =
    call(&h, "POST", "/v1/agents/a1/data", Some(json!({ "key": "k", "value": "v" }))).await;
  assert_eq!(status, StatusCode::CONFLICT);
  assert_eq!(body["error"], "conflict");

  let (_, body) = call(&h, "POST", "/v1/agents/a1/activate", None).await;
  assert_eq!(body["agent"]["status"], "active");

  let (status, body) = call(&h, "DELETE", "/v1/agents/a1", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["success"], true);

  let (_, body) = call(&h, "GET", "/v1/agents", None).await;
  assert_eq!(body["total"], 0);
}

#[tokio::test]
async fn config_versions_and_rollback() {
  let h = harness().await;
  create_agent(&h, "a1").await;

  let config = json!({ "policies": [{ "subjectPrefix": "tmp/", "retentionDays": 7 }] });
  let (status, body) = call(&h, "PUT", "/v1/agents/a1/config", Some(config)).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["version"], 2);

  let (_, body) = call(&h, "GET", "/v1/agents/a1/config/versions?limit=10", None).await;
  assert_eq!(body["total"], 2);

  // Versions arrive as strings from some clients.
  let (status, body) = call(
    &h,
    "POST",
    "/v1/agents/a1/config/rollback",
    Some(json!({ "target_version": "1" })),
  )
  .await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["version"], 3);

  let (_, current) = call(&h, "GET", "/v1/agents/a1/config", None).await;
  assert_eq!(current["version"], 3);
  assert!(current["config"].get("policies").is_none());

  let (status, _) = call(&h, "GET", "/v1/agents/a1/config/versions/9", None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

// ─── Data ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn blocked_write_is_a_successful_decision() {
  let h = harness().await;
  create_agent(&h, "a1").await;

  let policy = json!({ "subjectPrefix": "secret/", "doNotStore": true });
  let (status, body) = call(&h, "PUT", "/v1/policy", Some(policy)).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["success"], true);
  assert_eq!(body["policy"]["doNotStore"], true);

  let outcome = write(&h, "a1", "secret/x", "v").await;
  assert_eq!(outcome["allowed"], false);
  assert_eq!(outcome["blocked_by"], "policy:do_not_store");
  assert!(outcome["audit_id"].is_string());

  let (status, _) = call(&h, "GET", "/v1/agents/a1/data/secret%2Fx", None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);

  let (_, page) = call(&h, "GET", "/v1/agents/a1/audit?operations=data.write", None).await;
  assert_eq!(page["total"], 1);
  assert_eq!(page["events"][0]["result"], "blocked");
}

#[tokio::test]
async fn encoded_keys_read_and_delete() {
  let h = harness().await;
  create_agent(&h, "a1").await;
  let outcome = write(&h, "a1", "notes/today", "ship it").await;

  let (status, body) = call(&h, "GET", "/v1/agents/a1/data/notes%2Ftoday", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["entry"]["value"], "ship it");

  let (_, full) = call(&h, "GET", "/v1/agents/a1/data/notes%2Ftoday/full", None).await;
  assert_eq!(full["audit"]["id"], outcome["audit_id"]);

  let (status, body) = call(&h, "DELETE", "/v1/agents/a1/data/notes%2Ftoday", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["success"], true);
}

#[tokio::test]
async fn list_and_delete_by_prefix() {
  let h = harness().await;
  create_agent(&h, "a1").await;
  for key in ["tmp/a", "tmp/b", "keep"] {
    write(&h, "a1", key, "v").await;
  }

  let (_, page) = call(&h, "GET", "/v1/agents/a1/data?prefix=tmp%2F&limit=1", None).await;
  assert_eq!(page["total"], 2);
  assert_eq!(page["has_more"], true);
  assert!(page["next_cursor"].is_string());

  let (status, body) = call(&h, "DELETE", "/v1/agents/a1/data/prefix/tmp%2F", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["deleted"], 2);
}

// ─── Audit ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn verify_reports_a_valid_chain() {
  let h = harness().await;
  create_agent(&h, "a1").await;
  write(&h, "a1", "a", "1").await;
  write(&h, "a1", "b", "2").await;

  let (status, v) = call(&h, "GET", "/v1/agents/a1/audit/verify", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(v["valid"], true);
  assert_eq!(v["events_checked"], 3);
  assert!(v.get("first_invalid").is_none() || v["first_invalid"].is_null());
}

#[tokio::test]
async fn single_event_lookup() {
  let h = harness().await;
  create_agent(&h, "a1").await;
  let outcome = write(&h, "a1", "a", "1").await;
  let id = outcome["audit_id"].as_str().unwrap();

  let (status, event) = call(&h, "GET", &format!("/v1/agents/a1/audit/{id}"), None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(event["operation"], "data.write");
  assert_eq!(event["hash"], outcome["hash"]);
}

#[tokio::test]
async fn json_export_downloads_and_verifies_offline() {
  let h = harness().await;
  create_agent(&h, "a1").await;
  for i in 0..4 {
    write(&h, "a1", &format!("k/{i}"), "v").await;
  }

  let (status, receipt) = call(
    &h,
    "POST",
    "/v1/agents/a1/audit/export",
    Some(json!({ "format": "json", "include_verification": true })),
  )
  .await;
  assert_eq!(status, StatusCode::OK, "{receipt}");
  assert_eq!(receipt["event_count"], 5);
  assert_eq!(receipt["verification"]["valid"], true);

  let url = receipt["download_url"].as_str().unwrap();
  let path = url.strip_prefix("http://anchor.test").unwrap();
  let (status, bytes) = send_raw(&h.app, request("GET", path, None)).await;
  assert_eq!(status, StatusCode::OK);

  let report = verify_artifact(&bytes, h.clock.now()).unwrap();
  assert!(report.is_valid());
  assert_eq!(report.event_count, 5);

  // The export itself is logged on the chain.
  let (_, page) = call(&h, "GET", "/v1/agents/a1/audit?operations=audit.export", None).await;
  assert_eq!(page["total"], 1);
}

#[tokio::test]
async fn csv_export_of_a_sub_range_verifies_offline() {
  let h = harness().await;
  create_agent(&h, "a1").await;
  write(&h, "a1", "early", "v").await;
  h.clock.advance(Duration::hours(1));
  let start = h.clock.now();
  write(&h, "a1", "late/1", "v").await;
  write(&h, "a1", "late/2", "v").await;

  let body = json!({ "format": "csv", "start": start.to_rfc3339() });
  let (status, receipt) = call(&h, "POST", "/v1/agents/a1/audit/export", Some(body)).await;
  assert_eq!(status, StatusCode::OK, "{receipt}");
  assert_eq!(receipt["event_count"], 2);

  let path = receipt["download_url"].as_str().unwrap().replace("http://anchor.test", "");
  let (_, bytes) = send_raw(&h.app, request("GET", &path, None)).await;
  let report = verify_artifact(&bytes, h.clock.now()).unwrap();
  assert!(report.is_valid());
  assert_eq!(report.event_count, 2);
}

#[tokio::test]
async fn export_that_cannot_be_logged_leaves_nothing_behind() {
  let (h, raw, exports) = file_harness().await;
  create_agent(&h, "a1").await;
  write(&h, "a1", "k", "v").await;

  raw
    .execute_batch(
      "CREATE TRIGGER refuse_export BEFORE INSERT ON audit_events
       WHEN NEW.operation = 'audit.export'
       BEGIN SELECT RAISE(ABORT, 'refused'); END;",
    )
    .unwrap();

  let (status, body) = call(&h, "POST", "/v1/agents/a1/audit/export", Some(json!({}))).await;
  assert!(!status.is_success(), "{body}");

  assert_eq!(std::fs::read_dir(&exports).unwrap().count(), 0);
  let far_future = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
  assert!(h.store.expired_exports(far_future).await.unwrap().is_empty());
  let (_, page) = call(&h, "GET", "/v1/agents/a1/audit?operations=audit.export", None).await;
  assert_eq!(page["total"], 0);
}

#[tokio::test]
async fn sub_range_export_checks_the_event_before_start() {
  let (h, raw, _) = file_harness().await;
  create_agent(&h, "a1").await;
  write(&h, "a1", "early", "v").await;
  h.clock.advance(Duration::hours(1));
  let start = h.clock.now();
  let moved = write(&h, "a1", "late/1", "v").await;
  write(&h, "a1", "late/2", "v").await;

  let moved_id = moved["audit_id"].as_str().unwrap().to_owned();
  let earlier = chain::format_timestamp(start - Duration::minutes(5));
  raw
    .execute_batch(&format!(
      "DROP TRIGGER audit_events_no_update;
       UPDATE audit_events SET timestamp = '{earlier}' WHERE id = '{moved_id}';"
    ))
    .unwrap();

  let body = json!({ "format": "json", "start": start.to_rfc3339(), "include_verification": true });
  let (status, receipt) = call(&h, "POST", "/v1/agents/a1/audit/export", Some(body)).await;
  assert_eq!(status, StatusCode::OK, "{receipt}");
  assert_eq!(receipt["event_count"], 1);
  assert_eq!(receipt["verification"]["valid"], false);
  assert_eq!(receipt["verification"]["first_invalid"]["id"], moved_id.as_str());

  let uri = format!("/v1/agents/a1/audit/verify?start={}", start.format("%Y-%m-%dT%H:%M:%SZ"));
  let (_, verified) = call(&h, "GET", &uri, None).await;
  assert_eq!(verified["valid"], false);
}

#[tokio::test]
async fn expired_export_is_gone_then_swept() {
  let h = harness().await;
  create_agent(&h, "a1").await;

  let (_, receipt) =
    call(&h, "POST", "/v1/agents/a1/audit/export", Some(json!({}))).await;
  let path = receipt["download_url"].as_str().unwrap().replace("http://anchor.test", "");

  h.clock.advance(Duration::hours(25));
  let (status, body) = call(&h, "GET", &path, None).await;
  assert_eq!(status, StatusCode::GONE);
  assert_eq!(body["error"], "gone");

  let removed = export::remove_expired(h.store.as_ref(), h.clock.now()).await.unwrap();
  assert_eq!(removed, 1);
  let (status, _) = call(&h, "GET", &path, None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn inverted_export_range_is_rejected() {
  let h = harness().await;
  create_agent(&h, "a1").await;
  let body = json!({ "start": "2024-05-02T00:00:00Z", "end": "2024-05-01T00:00:00Z" });
  let (status, _) = call(&h, "POST", "/v1/agents/a1/audit/export", Some(body)).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ─── Checkpoints ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn checkpoint_create_and_restore() {
  let h = harness().await;
  create_agent(&h, "a1").await;
  write(&h, "a1", "a", "1").await;
  write(&h, "a1", "b", "2").await;

  let (status, body) =
    call(&h, "POST", "/v1/agents/a1/checkpoints", Some(json!({ "label": "v1" }))).await;
  assert_eq!(status, StatusCode::CREATED);
  let cid = body["checkpoint"]["checkpoint_id"].as_str().unwrap().to_owned();
  assert_eq!(body["checkpoint"]["entry_count"], 2);

  write(&h, "a1", "a", "changed").await;

  let uri = format!("/v1/agents/a1/checkpoints/{cid}/restore");
  let (status, body) = call(&h, "POST", &uri, None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(body["restored"], 2);

  let (_, entry) = call(&h, "GET", "/v1/agents/a1/data/a", None).await;
  assert_eq!(entry["entry"]["value"], "1");

  let (_, list) = call(&h, "GET", "/v1/agents/a1/checkpoints", None).await;
  assert_eq!(list["total"], 1);

  let (status, _) = call(&h, "DELETE", &format!("/v1/agents/a1/checkpoints/{cid}"), None).await;
  assert_eq!(status, StatusCode::OK);
  let (status, _) = call(&h, "POST", &uri, None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);
}

// ─── Policy ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn policy_get_and_list() {
  let h = harness().await;
  let (status, _) = call(&h, "GET", "/v1/policy?subjectPrefix=pii%2F", None).await;
  assert_eq!(status, StatusCode::NOT_FOUND);

  let update = json!({ "subjectPrefix": "pii/", "piiMode": "redact", "retentionDays": 30 });
  call(&h, "PUT", "/v1/policy", Some(update)).await;

  let (status, policy) = call(&h, "GET", "/v1/policy?subjectPrefix=pii%2F", None).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(policy["piiMode"], "redact");
  assert_eq!(policy["retentionDays"], 30);

  let (_, list) = call(&h, "GET", "/v1/policy/list", None).await;
  assert_eq!(list["policies"].as_array().unwrap().len(), 1);

  let (status, _) =
    call(&h, "PUT", "/v1/policy", Some(json!({ "subjectPrefix": "x/", "retentionDays": -1 })))
      .await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
}
