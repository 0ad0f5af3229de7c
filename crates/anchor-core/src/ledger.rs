//! Backend-agnostic ledger operations built on [`GovernanceStore`].

use chrono::{DateTime, Utc};

use crate::{
  audit::{AuditEvent, ChainRange},
  chain::{RangeStart, Verification},
  store::GovernanceStore,
};

/// Default number of events read per batch when walking a chain.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Walk `range` of an agent's chain in keyset-paginated batches, handing
/// each batch to `visit`. Stops early when `visit` returns `false`.
///
/// Holds no lock between batches, so concurrent appends are never blocked;
/// dropping the future cancels the walk.
pub async fn walk_chain<S, F>(
  store: &S,
  workspace_id: &str,
  agent_id: &str,
  range: ChainRange,
  batch_size: usize,
  mut visit: F,
) -> Result<(), S::Error>
where
  S: GovernanceStore,
  F: FnMut(&[AuditEvent]) -> bool,
{
  let batch_size = batch_size.max(1);
  let mut after = None;
  loop {
    let batch = store
      .audit_batch(workspace_id, agent_id, range, after, batch_size)
      .await?;
    if batch.is_empty() || !visit(&batch) || batch.len() < batch_size {
      return Ok(());
    }
    after = batch.last().map(|e| e.sequence);
  }
}

/// Resolve what the first event of `range` links to.
///
/// Without a start the slice begins at genesis. Otherwise the stored event one sequence before
/// the first in-range event is loaded by sequence, never by time, so an event whose timestamp
/// was rewritten to fall before `start` still anchors the slice. A missing predecessor falls
/// back to genesis, which the first in-range event then fails to link to.
pub async fn range_start<S: GovernanceStore>(
  store: &S,
  workspace_id: &str,
  agent_id: &str,
  range: ChainRange,
) -> Result<RangeStart, S::Error> {
  if range.start.is_none() {
    return Ok(RangeStart::Genesis);
  }
  let first = store.audit_batch(workspace_id, agent_id, range, None, 1).await?;
  let Some(first) = first.into_iter().next() else {
    return Ok(RangeStart::Empty);
  };
  let Some(wanted) = first.sequence.checked_sub(1) else {
    return Ok(RangeStart::Genesis);
  };

  let predecessor = store
    .audit_batch(workspace_id, agent_id, ChainRange::default(), wanted.checked_sub(1), 1)
    .await?
    .into_iter()
    .next()
    .filter(|e| e.sequence == wanted);
  Ok(predecessor.map_or(RangeStart::Genesis, RangeStart::After))
}

/// Verify an agent's chain from genesis, or from the first event at or after `start`, anchored
/// on the re-verified stored event before it.
pub async fn verify_chain<S: GovernanceStore>(
  store: &S,
  workspace_id: &str,
  agent_id: &str,
  start: Option<DateTime<Utc>>,
  batch_size: usize,
) -> Result<Verification, S::Error> {
  let range = ChainRange { start, end: None };
  let mut verifier = range_start(store, workspace_id, agent_id, range).await?.verifier(agent_id);

  walk_chain(store, workspace_id, agent_id, range, batch_size, |batch| {
    batch.iter().all(|event| verifier.feed(event))
  })
  .await?;

  Ok(verifier.finish(store.now()))
}
