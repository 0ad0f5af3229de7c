//! Periodic retention sweep.
//!
//! Each pass physically removes data entries whose retention has lapsed (the
//! store logs a `data.expire` event per entry) and deletes expired export
//! artifacts along with their records.

use std::{sync::Arc, time::Duration};

use anchor_core::store::GovernanceStore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
  pub entries_purged:  u64,
  pub exports_removed: usize,
}

/// One pass at the store's current time.
pub async fn sweep_once<S: GovernanceStore>(store: &S) -> Result<SweepReport, S::Error> {
  let now = store.now();
  let entries_purged = store.purge_expired(now).await?;
  let exports_removed = anchor_api::export::remove_expired(store, now).await?;
  Ok(SweepReport { entries_purged, exports_removed })
}

/// Run [`sweep_once`] every `every` until the task is aborted. A failed pass
/// is logged and retried on the next tick.
pub fn spawn<S>(store: Arc<S>, every: Duration) -> JoinHandle<()>
where
  S: GovernanceStore + 'static,
{
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      match sweep_once(store.as_ref()).await {
        Ok(report) if report == SweepReport::default() => debug!("retention sweep: nothing to do"),
        Ok(report) => info!(
          entries_purged = report.entries_purged,
          exports_removed = report.exports_removed,
          "retention sweep"
        ),
        Err(e) => warn!(error = %e, "retention sweep failed"),
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use anchor_core::{
    agent::NewAgent,
    audit::{AuditQuery, Operation},
    clock::ManualClock,
    data::DataWrite,
    policy::PolicyUpdate,
  };
  use anchor_store_sqlite::{SqliteStore, StoreOptions};
  use chrono::{TimeZone, Utc};

  const WS: &str = "default";

  async fn store(clock: &ManualClock) -> SqliteStore {
    let options = StoreOptions { clock: Arc::new(clock.clone()), ..StoreOptions::default() };
    SqliteStore::open_in_memory_with(options).await.expect("in-memory store")
  }

  #[tokio::test]
  async fn lapsed_entries_are_purged_and_logged() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let s = store(&clock).await;
    s.create_agent(WS, NewAgent { agent_id: Some("a1".into()), ..NewAgent::named("bot") })
      .await
      .unwrap();
    s.put_policy(
      WS,
      PolicyUpdate {
        subject_prefix: Some("tmp/".into()),
        retention_days: Some(Some(1)),
        ..PolicyUpdate::default()
      },
    )
    .await
    .unwrap();
    s.write_data(WS, "a1", DataWrite::new("tmp/x", "v")).await.unwrap();
    s.write_data(WS, "a1", DataWrite::new("keep", "v")).await.unwrap();

    assert_eq!(sweep_once(&s).await.unwrap(), SweepReport::default());

    clock.advance(chrono::Duration::days(2));
    let report = sweep_once(&s).await.unwrap();
    assert_eq!(report.entries_purged, 1);

    let query = AuditQuery { operations: vec![Operation::DataExpire], ..AuditQuery::default() };
    let page = s.query_audit(WS, "a1", &query).await.unwrap();
    assert_eq!(page.total, 1);
  }
}
