//! Export artifacts: streaming a chain range to disk, and expiring the files.
//!
//! Events are read in keyset-paginated batches and each batch is encoded
//! into a buffer that is drained to the file before the next read, so memory
//! use does not grow with the chain.

use std::path::{Path, PathBuf};

use anchor_core::{
  audit::{AuditResult, ChainRange, NewAuditEvent, Operation},
  chain::{Verification, format_timestamp},
  export::{ExportEncoder, ExportReceipt, ExportRecord, ExportRequest},
  ledger,
  store::GovernanceStore,
};
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{ExportSettings, error::ApiError};

/// Write the requested range of an agent's chain to a new artifact, log an
/// `audit.export` event on the same chain, then record the artifact.
///
/// The record is what makes an artifact downloadable, so it is only written
/// once the export is on the chain. Any failure removes the file.
pub async fn export_chain<S: GovernanceStore>(
  store: &S,
  settings: &ExportSettings,
  workspace_id: &str,
  agent_id: &str,
  request: &ExportRequest,
) -> Result<ExportReceipt, ApiError> {
  if let (Some(start), Some(end)) = (request.start, request.end)
    && start > end
  {
    return Err(ApiError::BadRequest("start is after end".into()));
  }

  tokio::fs::create_dir_all(&settings.dir).await?;
  let export_id = Uuid::new_v4();
  let path = artifact_path(&settings.dir, export_id, request);

  let written = write_artifact(store, settings, workspace_id, agent_id, request, &path).await;
  let (event_count, verification) = match written {
    Ok(done) => done,
    Err(e) => {
      let _ = tokio::fs::remove_file(&path).await;
      return Err(e);
    }
  };

  let event = NewAuditEvent::new(Operation::AuditExport, export_id.to_string(), AuditResult::Success)
    .with_field("format", request.format.as_str())
    .with_field("event_count", event_count)
    .with_field("start", request.start.map(format_timestamp))
    .with_field("end", request.end.map(format_timestamp))
    .with_field("include_verification", request.include_verification);
  if let Err(e) = store.append_audit(workspace_id, agent_id, event).await {
    warn!(agent_id, %export_id, error = %e, "export not logged; discarding artifact");
    let _ = tokio::fs::remove_file(&path).await;
    return Err(ApiError::store(e));
  }

  let now = store.now();
  let record = ExportRecord {
    export_id,
    agent_id: agent_id.to_owned(),
    workspace_id: workspace_id.to_owned(),
    format: request.format,
    path: path.to_string_lossy().into_owned(),
    event_count,
    expires_at: now + settings.ttl,
    created_at: now,
    verification: verification.clone(),
  };
  if let Err(e) = store.record_export(&record).await {
    let _ = tokio::fs::remove_file(&path).await;
    return Err(ApiError::store(e));
  }

  info!(agent_id, %export_id, event_count, format = request.format.as_str(), "audit exported");

  Ok(ExportReceipt {
    export_id,
    format: request.format,
    download_url: format!(
      "{}/v1/agents/{agent_id}/audit/exports/{export_id}",
      settings.base_url
    ),
    expires_at: record.expires_at,
    event_count,
    verification,
  })
}

fn artifact_path(dir: &Path, export_id: Uuid, request: &ExportRequest) -> PathBuf {
  dir.join(format!("{export_id}.{}", request.format.as_str()))
}

async fn write_artifact<S: GovernanceStore>(
  store: &S,
  settings: &ExportSettings,
  workspace_id: &str,
  agent_id: &str,
  request: &ExportRequest,
  path: &Path,
) -> Result<(u64, Option<Verification>), ApiError> {
  let range = ChainRange { start: request.start, end: request.end };
  let start = ledger::range_start(store, workspace_id, agent_id, range)
    .await
    .map_err(ApiError::store)?;

  let mut file = tokio::fs::File::create(path).await?;
  let mut encoder =
    ExportEncoder::new(Vec::new(), request.format, agent_id, request.include_verification)
      .starting_at(&start);
  let batch_size = settings.batch_size.max(1);

  let mut after = None;
  loop {
    let batch = store
      .audit_batch(workspace_id, agent_id, range, after, batch_size)
      .await
      .map_err(ApiError::store)?;
    encoder.push(&batch)?;

    let buf = encoder.get_mut();
    file.write_all(buf).await?;
    buf.clear();

    if batch.len() < batch_size {
      break;
    }
    after = batch.last().map(|e| e.sequence);
  }

  let event_count = encoder.event_count();
  let (tail, verification) = encoder.finish(store.now())?;
  file.write_all(&tail).await?;
  file.flush().await?;
  Ok((event_count, verification))
}

/// An artifact's bytes, unless its record is missing or it has expired.
pub async fn read_artifact<S: GovernanceStore>(
  store: &S,
  workspace_id: &str,
  agent_id: &str,
  export_id: Uuid,
) -> Result<(ExportRecord, Vec<u8>), ApiError> {
  let record = store
    .get_export(workspace_id, agent_id, export_id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("export {export_id} not found")))?;

  if record.expires_at <= store.now() {
    return Err(ApiError::Gone(format!("export {export_id} has expired")));
  }
  match tokio::fs::read(&record.path).await {
    Ok(bytes) => Ok((record, bytes)),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      Err(ApiError::Gone(format!("export {export_id} is no longer available")))
    }
    Err(e) => Err(e.into()),
  }
}

/// Delete artifacts expired at `now` along with their records. Returns how
/// many were removed.
pub async fn remove_expired<S: GovernanceStore>(
  store: &S,
  now: DateTime<Utc>,
) -> Result<usize, S::Error> {
  let expired = store.expired_exports(now).await?;
  for record in &expired {
    match tokio::fs::remove_file(&record.path).await {
      Ok(()) => debug!(export_id = %record.export_id, "export artifact removed"),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => warn!(export_id = %record.export_id, error = %e, "failed to remove export artifact"),
    }
    store.remove_export(record.export_id).await?;
  }
  Ok(expired.len())
}
