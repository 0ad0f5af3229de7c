//! Compliance export: streaming JSON/CSV encoding of a chain slice and
//! offline re-verification of the resulting artifact.
//!
//! An artifact is self-contained. Besides the events it records the agent,
//! the genesis value, the hash rule and the `anchor_previous_hash` the first
//! exported event links to, which is everything [`verify_artifact`] needs.

use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  audit::{AuditEvent, AuditResult, Operation},
  chain::{
    self, Anchor, ChainVerifier, HASH_RULE, RangeStart, Verification, canonical_json,
    format_timestamp, genesis_hash,
  },
};

/// Version tag written into every artifact.
pub const EXPORT_VERSION: u32 = 1;

const CSV_COLUMNS: [&str; 11] = [
  "id",
  "agent_id",
  "sequence",
  "operation",
  "resource",
  "result",
  "blocked_by",
  "timestamp",
  "previous_hash",
  "hash",
  "metadata",
];

// ─── Requests and records ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
  #[default]
  Json,
  Csv,
}

impl ExportFormat {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Json => "json",
      Self::Csv => "csv",
    }
  }

  pub fn parse(s: &str) -> Result<Self> {
    match s {
      "json" => Ok(Self::Json),
      "csv" => Ok(Self::Csv),
      other => Err(Error::UnknownVariant { kind: "export format", value: other.to_owned() }),
    }
  }

  pub fn content_type(self) -> &'static str {
    match self {
      Self::Json => "application/json",
      Self::Csv => "text/csv; charset=utf-8",
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportRequest {
  #[serde(default)]
  pub format:               ExportFormat,
  #[serde(default)]
  pub start:                Option<DateTime<Utc>>,
  #[serde(default)]
  pub end:                  Option<DateTime<Utc>>,
  #[serde(default)]
  pub include_verification: bool,
}

/// A materialised artifact on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
  pub export_id:    Uuid,
  pub agent_id:     String,
  pub workspace_id: String,
  pub format:       ExportFormat,
  pub path:         String,
  pub event_count:  u64,
  pub expires_at:   DateTime<Utc>,
  pub created_at:   DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub verification: Option<Verification>,
}

/// What `POST /audit/export` returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportReceipt {
  pub export_id:    Uuid,
  pub format:       ExportFormat,
  pub download_url: String,
  pub expires_at:   DateTime<Utc>,
  pub event_count:  u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub verification: Option<Verification>,
}

// ─── Encoder ─────────────────────────────────────────────────────────────────

/// Writes an artifact incrementally. Push events in sequence order in as many
/// batches as needed, then [`finish`](Self::finish).
///
/// The header is emitted with the first event (or at finish for an empty
/// slice) because, unless [`starting_at`](Self::starting_at) fixed it, it
/// carries that event's `previous_hash`.
pub struct ExportEncoder<W: Write> {
  out:         W,
  format:      ExportFormat,
  agent_id:    String,
  anchor:      Option<String>,
  verifier:    Option<ChainVerifier>,
  header_done: bool,
  events:      u64,
}

impl<W: Write> ExportEncoder<W> {
  pub fn new(out: W, format: ExportFormat, agent_id: &str, include_verification: bool) -> Self {
    Self {
      out,
      format,
      agent_id: agent_id.to_owned(),
      anchor: None,
      verifier: include_verification.then(|| ChainVerifier::new(agent_id, Anchor::FirstEvent)),
      header_done: false,
      events: 0,
    }
  }

  /// Anchor the artifact on where the slice starts in the stored chain. The
  /// header records that hash and the embedded verification re-checks the
  /// predecessor.
  pub fn starting_at(mut self, start: &RangeStart) -> Self {
    self.anchor = start.anchor_hash(&self.agent_id);
    if self.verifier.is_some() {
      self.verifier = Some(start.verifier(&self.agent_id));
    }
    self
  }

  /// The underlying writer, e.g. to drain a `Vec<u8>` buffer between
  /// batches.
  pub fn get_mut(&mut self) -> &mut W { &mut self.out }

  pub fn event_count(&self) -> u64 { self.events }

  pub fn push(&mut self, events: &[AuditEvent]) -> Result<()> {
    for event in events {
      if !self.header_done {
        let anchor = self.anchor.clone().unwrap_or_else(|| event.previous_hash.clone());
        self.write_header(Some(&anchor))?;
      }
      self.write_event(event)?;
      if let Some(v) = &mut self.verifier {
        v.feed(event);
      }
      self.events += 1;
    }
    Ok(())
  }

  /// Close the document. Returns the writer and the embedded verification,
  /// if one was requested.
  pub fn finish(mut self, verified_at: DateTime<Utc>) -> Result<(W, Option<Verification>)> {
    if !self.header_done {
      let anchor = self.anchor.clone();
      self.write_header(anchor.as_deref())?;
    }
    let verification = self.verifier.take().map(|v| v.finish(verified_at));

    match self.format {
      ExportFormat::Json => {
        if self.events > 0 {
          self.out.write_all(b"\n")?;
        }
        self.out.write_all(b"]")?;
        if let Some(v) = &verification {
          self.out.write_all(b",\"verification\":")?;
          serde_json::to_writer(&mut self.out, v)?;
        }
        self.out.write_all(b"}\n")?;
      }
      ExportFormat::Csv => {
        writeln!(self.out, "# event_count={}", self.events)?;
        if let Some(v) = &verification {
          writeln!(self.out, "# verification={}", serde_json::to_string(v)?)?;
        }
      }
    }
    self.out.flush()?;
    Ok((self.out, verification))
  }

  fn write_header(&mut self, anchor_previous_hash: Option<&str>) -> Result<()> {
    self.header_done = true;
    let genesis = genesis_hash(&self.agent_id);
    match self.format {
      ExportFormat::Json => {
        write!(self.out, "{{\"anchor_export\":{EXPORT_VERSION},\"agent_id\":")?;
        serde_json::to_writer(&mut self.out, &self.agent_id)?;
        write!(self.out, ",\"genesis_hash\":\"{genesis}\",\"hash_rule\":")?;
        serde_json::to_writer(&mut self.out, HASH_RULE)?;
        self.out.write_all(b",\"anchor_previous_hash\":")?;
        serde_json::to_writer(&mut self.out, &anchor_previous_hash)?;
        self.out.write_all(b",\"events\":[")?;
      }
      ExportFormat::Csv => {
        writeln!(self.out, "# anchor_export={EXPORT_VERSION}")?;
        writeln!(self.out, "# agent_id={}", self.agent_id)?;
        writeln!(self.out, "# genesis_hash={genesis}")?;
        writeln!(self.out, "# hash_rule={HASH_RULE}")?;
        writeln!(
          self.out,
          "# anchor_previous_hash={}",
          anchor_previous_hash.unwrap_or_default()
        )?;
        writeln!(self.out, "{}", CSV_COLUMNS.join(","))?;
      }
    }
    Ok(())
  }

  fn write_event(&mut self, event: &AuditEvent) -> Result<()> {
    match self.format {
      ExportFormat::Json => {
        let sep: &[u8] = if self.events == 0 { b"\n" } else { b",\n" };
        self.out.write_all(sep)?;
        serde_json::to_writer(&mut self.out, event)?;
      }
      ExportFormat::Csv => {
        let fields = [
          event.id.to_string(),
          event.agent_id.clone(),
          event.sequence.to_string(),
          event.operation.as_str().to_owned(),
          event.resource.clone(),
          event.result.as_str().to_owned(),
          event.blocked_by.clone().unwrap_or_default(),
          format_timestamp(event.timestamp),
          event.previous_hash.clone(),
          event.hash.clone(),
          canonical_json(&event.metadata),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
        writeln!(self.out, "{}", row.join(","))?;
      }
    }
    Ok(())
  }
}

fn csv_escape(field: &str) -> String {
  if field.contains([',', '"', '\n', '\r']) {
    format!("\"{}\"", field.replace('"', "\"\""))
  } else {
    field.to_owned()
  }
}

// ─── Offline verification ────────────────────────────────────────────────────

/// Result of re-verifying an artifact from its bytes alone.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactReport {
  pub format:              ExportFormat,
  pub agent_id:            String,
  pub event_count:         u64,
  pub verification:        Verification,
  /// The verification embedded at export time, if any.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub embedded:            Option<Verification>,
  /// Whether the embedded verification agrees with the recomputed one.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub embedded_consistent: Option<bool>,
}

impl ArtifactReport {
  pub fn is_valid(&self) -> bool {
    self.verification.valid && self.embedded_consistent.unwrap_or(true)
  }
}

struct Artifact {
  format:               ExportFormat,
  agent_id:             String,
  genesis_hash:         String,
  hash_rule:            String,
  anchor_previous_hash: Option<String>,
  events:               Vec<AuditEvent>,
  verification:         Option<Verification>,
}

#[derive(Deserialize)]
struct JsonArtifact {
  anchor_export:        u32,
  agent_id:             String,
  genesis_hash:         String,
  hash_rule:            String,
  #[serde(default)]
  anchor_previous_hash: Option<String>,
  events:               Vec<AuditEvent>,
  #[serde(default)]
  verification:         Option<Verification>,
}

/// Re-verify an exported artifact using only its contents. The format is
/// detected from the first non-blank byte.
pub fn verify_artifact(bytes: &[u8], verified_at: DateTime<Utc>) -> Result<ArtifactReport> {
  let artifact = match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
    Some(b'{') => parse_json(bytes)?,
    Some(b'#') => parse_csv(bytes)?,
    _ => return Err(Error::MalformedExport("unrecognised artifact format".into())),
  };

  if artifact.hash_rule != HASH_RULE {
    return Err(Error::MalformedExport(format!(
      "unsupported hash rule {:?}",
      artifact.hash_rule
    )));
  }
  if artifact.genesis_hash != genesis_hash(&artifact.agent_id) {
    return Err(Error::MalformedExport(
      "genesis hash does not belong to the exported agent".into(),
    ));
  }

  let anchor = match &artifact.anchor_previous_hash {
    Some(h) => Anchor::Hash(h.clone()),
    None => Anchor::FirstEvent,
  };
  let mut verifier = ChainVerifier::new(artifact.agent_id.as_str(), anchor);
  for event in &artifact.events {
    if !verifier.feed(event) {
      break;
    }
  }
  let verification = verifier.finish(verified_at);

  let embedded_consistent = artifact.verification.as_ref().map(|e| {
    e.valid == verification.valid
      && e.events_checked == verification.events_checked
      && e.chain_end == verification.chain_end
  });

  Ok(ArtifactReport {
    format: artifact.format,
    agent_id: artifact.agent_id,
    event_count: artifact.events.len() as u64,
    verification,
    embedded: artifact.verification,
    embedded_consistent,
  })
}

fn parse_json(bytes: &[u8]) -> Result<Artifact> {
  let doc: JsonArtifact = serde_json::from_slice(bytes)
    .map_err(|e| Error::MalformedExport(format!("json: {e}")))?;
  if doc.anchor_export != EXPORT_VERSION {
    return Err(Error::MalformedExport(format!(
      "unsupported export version {}",
      doc.anchor_export
    )));
  }
  Ok(Artifact {
    format:               ExportFormat::Json,
    agent_id:             doc.agent_id,
    genesis_hash:         doc.genesis_hash,
    hash_rule:            doc.hash_rule,
    anchor_previous_hash: doc.anchor_previous_hash,
    events:               doc.events,
    verification:         doc.verification,
  })
}

fn parse_csv(bytes: &[u8]) -> Result<Artifact> {
  let text = std::str::from_utf8(bytes)
    .map_err(|_| Error::MalformedExport("csv is not valid UTF-8".into()))?;

  let mut headers: Vec<(String, String)> = Vec::new();
  let mut rows: Vec<Vec<String>> = Vec::new();
  for line in csv_records(text)? {
    match line {
      CsvLine::Comment(c) => {
        if let Some((k, v)) = c.split_once('=') {
          headers.push((k.trim().to_owned(), v.to_owned()));
        }
      }
      CsvLine::Record(fields) => rows.push(fields),
    }
  }

  let header = |name: &str| {
    headers
      .iter()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v.clone())
      .ok_or_else(|| Error::MalformedExport(format!("missing header {name}")))
  };

  let version = header("anchor_export")?;
  if version.trim() != EXPORT_VERSION.to_string() {
    return Err(Error::MalformedExport(format!("unsupported export version {version}")));
  }

  let mut rows = rows.into_iter();
  match rows.next() {
    Some(cols) if cols == CSV_COLUMNS => {}
    _ => return Err(Error::MalformedExport("missing or unexpected column header".into())),
  }
  let events = rows.map(csv_event).collect::<Result<Vec<_>>>()?;

  let verification = match header("verification") {
    Ok(json) => Some(
      serde_json::from_str(&json)
        .map_err(|e| Error::MalformedExport(format!("verification: {e}")))?,
    ),
    Err(_) => None,
  };

  Ok(Artifact {
    format: ExportFormat::Csv,
    agent_id: header("agent_id")?,
    genesis_hash: header("genesis_hash")?,
    hash_rule: header("hash_rule")?,
    anchor_previous_hash: Some(header("anchor_previous_hash")?).filter(|h| !h.is_empty()),
    events,
    verification,
  })
}

fn csv_event(fields: Vec<String>) -> Result<AuditEvent> {
  let malformed = |what: &str| Error::MalformedExport(format!("csv row: bad {what}"));
  let [id, agent_id, sequence, operation, resource, result, blocked_by, timestamp, previous_hash, hash, metadata]: [String; 11] =
    fields.try_into().map_err(|_| malformed("column count"))?;

  Ok(AuditEvent {
    id: Uuid::parse_str(&id).map_err(|_| malformed("id"))?,
    agent_id,
    sequence: sequence.parse().map_err(|_| malformed("sequence"))?,
    operation: Operation::from(operation),
    resource,
    result: AuditResult::parse(&result)?,
    blocked_by: Some(blocked_by).filter(|b| !b.is_empty()),
    timestamp: chain::parse_timestamp(&timestamp)?,
    hash,
    previous_hash,
    metadata: serde_json::from_str(&metadata).map_err(|_| malformed("metadata"))?,
  })
}

enum CsvLine {
  Comment(String),
  Record(Vec<String>),
}

/// RFC 4180 records, plus `#` comment lines at record boundaries.
fn csv_records(text: &str) -> Result<Vec<CsvLine>> {
  let mut out = Vec::new();
  let mut chars = text.chars().peekable();

  while chars.peek().is_some() {
    if chars.peek() == Some(&'#') {
      chars.next();
      let comment: String = chars.by_ref().take_while(|c| *c != '\n').collect();
      out.push(CsvLine::Comment(comment.trim_start().trim_end_matches('\r').to_owned()));
      continue;
    }
    if matches!(chars.peek(), Some(&('\n' | '\r'))) {
      chars.next();
      continue;
    }

    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    loop {
      match (quoted, chars.next()) {
        (true, Some('"')) => {
          if chars.peek() == Some(&'"') {
            chars.next();
            field.push('"');
          } else {
            quoted = false;
          }
        }
        (true, Some(c)) => field.push(c),
        (true, None) => {
          return Err(Error::MalformedExport("unterminated quoted field".into()));
        }
        (false, Some('"')) if field.is_empty() => quoted = true,
        (false, Some(',')) => fields.push(std::mem::take(&mut field)),
        (false, Some('\r')) => {}
        (false, Some('\n') | None) => {
          fields.push(std::mem::take(&mut field));
          break;
        }
        (false, Some(c)) => field.push(c),
      }
    }
    out.push(CsvLine::Record(fields));
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use chrono::{Duration, TimeZone};
  use serde_json::json;

  use super::*;
  use crate::audit::NewAuditEvent;

  fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() }

  fn chain_of(n: u64) -> Vec<AuditEvent> {
    let mut prev = genesis_hash("agent-1");
    (0..n)
      .map(|i| {
        let ev = NewAuditEvent::new(
          Operation::DataWrite,
          format!("notes/{i}, \"quoted\"\nline"),
          AuditResult::Allowed,
        )
        .with_metadata(json!({ "n": i, "text": "a,b" }))
        .seal("agent-1", i, prev.clone(), t0() + Duration::seconds(i as i64));
        prev = ev.hash.clone();
        ev
      })
      .collect()
  }

  fn export(format: ExportFormat, events: &[AuditEvent]) -> Vec<u8> {
    let mut enc = ExportEncoder::new(Vec::new(), format, "agent-1", true);
    for batch in events.chunks(2) {
      enc.push(batch).unwrap();
    }
    enc.finish(t0()).unwrap().0
  }

  #[test]
  fn sub_range_json_export_verifies_offline() {
    let events = chain_of(6);
    let bytes = export(ExportFormat::Json, &events[2..5]);
    let report = verify_artifact(&bytes, t0()).unwrap();
    assert!(report.is_valid());
    assert_eq!(report.event_count, 3);
    assert_eq!(report.verification.chain_start.as_ref(), Some(&events[1].hash));
    assert_eq!(report.embedded_consistent, Some(true));
  }

  #[test]
  fn anchored_export_records_the_predecessor_hash() {
    let events = chain_of(5);
    let mut enc = ExportEncoder::new(Vec::new(), ExportFormat::Json, "agent-1", true)
      .starting_at(&RangeStart::After(events[1].clone()));
    enc.push(&events[2..]).unwrap();
    let (bytes, embedded) = enc.finish(t0()).unwrap();
    assert!(embedded.unwrap().valid);

    let report = verify_artifact(&bytes, t0()).unwrap();
    assert!(report.is_valid());
    assert_eq!(report.verification.chain_start.as_ref(), Some(&events[1].hash));
  }

  #[test]
  fn edited_predecessor_shows_in_embedded_verification() {
    let events = chain_of(5);
    let mut moved = events[1].clone();
    moved.timestamp -= Duration::days(1);
    let mut enc = ExportEncoder::new(Vec::new(), ExportFormat::Csv, "agent-1", true)
      .starting_at(&RangeStart::After(moved));
    enc.push(&events[2..]).unwrap();
    let (bytes, embedded) = enc.finish(t0()).unwrap();
    let embedded = embedded.unwrap();
    assert!(!embedded.valid);
    assert_eq!(embedded.first_invalid.unwrap().id, events[1].id);

    // The artifact alone cannot see the predecessor, so it disagrees with the embedded result.
    let report = verify_artifact(&bytes, t0()).unwrap();
    assert!(report.verification.valid);
    assert_eq!(report.embedded_consistent, Some(false));
    assert!(!report.is_valid());
  }

  #[test]
  fn csv_export_survives_awkward_fields() {
    let events = chain_of(4);
    let bytes = export(ExportFormat::Csv, &events);
    let report = verify_artifact(&bytes, t0()).unwrap();
    assert_eq!(report.format, ExportFormat::Csv);
    assert!(report.is_valid());
    assert_eq!(report.verification.events_checked, 4);
  }

  #[test]
  fn tampered_artifact_fails() {
    let events = chain_of(3);
    let bytes = export(ExportFormat::Json, &events);
    let text = String::from_utf8(bytes).unwrap().replace("\"n\":1", "\"n\":9");
    let report = verify_artifact(text.as_bytes(), t0()).unwrap();
    assert!(!report.verification.valid);
    assert_eq!(report.verification.first_invalid.as_ref().unwrap().id, events[1].id);
    assert!(!report.is_valid());
  }

  #[test]
  fn empty_export_is_valid() {
    let bytes = export(ExportFormat::Json, &[]);
    let report = verify_artifact(&bytes, t0()).unwrap();
    assert!(report.is_valid());
    assert_eq!(report.event_count, 0);
  }

  #[test]
  fn garbage_is_rejected() {
    assert!(matches!(
      verify_artifact(b"hello", t0()),
      Err(Error::MalformedExport(_))
    ));
  }
}
