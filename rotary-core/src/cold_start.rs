//! Cold-start guard: rebuilds coordination state after store loss.
//!
//! When the coordination store comes up empty for a campaign, the lease set
//! is reconstructed from the persistent call store (the ground truth for
//! in-flight calls) and promotions are blocked for a grace window. Rebuilt
//! leases carry the `recovered` sentinel token: live calls renew them
//! through their heartbeats until they complete or the grace window expires
//! and the janitor reclaims the leftovers.

use std::sync::Arc;

use tracing::{info, warn};

use call_store::CallStore;
use redis_coordination::{CampaignId, ColdStart, CoordinationResult, CoordinationStore};

use crate::metrics;

#[derive(Debug, Clone)]
pub struct ColdStartGuard {
    store: Arc<dyn CoordinationStore>,
    calls: Arc<dyn CallStore>,
}

impl ColdStartGuard {
    pub fn new(store: Arc<dyn CoordinationStore>, calls: Arc<dyn CallStore>) -> Self {
        Self { store, calls }
    }

    /// Invoked on lease-operation paths. Returns the campaign's effective
    /// cold-start state, reconstructing the lease set first if the store has
    /// no memory of this campaign.
    pub async fn ensure_ready(&self, cid: &CampaignId) -> CoordinationResult<ColdStart> {
        match self.store.cold_start_state(cid).await? {
            ColdStart::Done => Ok(ColdStart::Done),
            ColdStart::Blocking => Ok(ColdStart::Blocking),
            ColdStart::Unknown => self.reconstruct(cid).await,
        }
    }

    async fn reconstruct(&self, cid: &CampaignId) -> CoordinationResult<ColdStart> {
        // progressive unblock: existing members mean the store kept state
        let counts = self.store.slot_counts(cid).await?;
        if counts.leases > 0 {
            self.store.set_cold_start(cid, ColdStart::Done).await?;
            return Ok(ColdStart::Done);
        }

        self.store.set_cold_start(cid, ColdStart::Blocking).await?;
        metrics::COLD_START_REBUILDS.inc();

        let active = match self.calls.active_calls(cid).await {
            Ok(active) => active,
            Err(err) => {
                warn!(campaign = %cid, %err, "cold-start rebuild could not read the call store");
                return Ok(ColdStart::Blocking);
            }
        };
        for record in &active {
            self.store.rebuild_lease(cid, &record.id).await?;
        }
        metrics::COLD_START_RECOVERED_LEASES.inc_by(active.len() as u64);
        info!(
            campaign = %cid,
            recovered = active.len(),
            "cold-start rebuilt lease set from the call store"
        );
        Ok(ColdStart::Blocking)
    }

    /// Called after any successful upgrade by a live worker: the campaign
    /// has demonstrably working admission again.
    pub async fn mark_warm(&self, cid: &CampaignId) -> CoordinationResult<()> {
        if self.store.cold_start_state(cid).await?.is_blocking() {
            info!(campaign = %cid, "cold-start unblocked by live upgrade");
            self.store.set_cold_start(cid, ColdStart::Done).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;
    use call_store::{CallRecord, CallStatus, MemoryCallStore};
    use config::CoreTunables;
    use redis_coordination::{CallId, MemoryStore};
    use std::time::Duration;

    fn record(call: &str, cid: &str, status: CallStatus) -> CallRecord {
        let mut r = CallRecord::new(
            CallId::from(call),
            CampaignId::from(cid),
            "contact",
            "agent-a",
            "+15550100",
            "+15550199",
            0,
        );
        r.status = status;
        r
    }

    fn guard() -> (ColdStartGuard, Arc<MemoryStore>, Arc<MemoryCallStore>) {
        let tunables = CoreTunables {
            cold_start_blocking: Duration::from_millis(80),
            cold_start_grace: Duration::from_millis(160),
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new(tunables));
        let calls = Arc::new(MemoryCallStore::new());
        (
            ColdStartGuard::new(store.clone(), calls.clone()),
            store,
            calls,
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn rebuilds_from_in_flight_calls_and_blocks() {
        let (guard, store, calls) = guard();
        let cid = CampaignId::from("k");
        calls
            .upsert(&record("p", "k", CallStatus::InProgress))
            .await
            .unwrap();
        calls
            .upsert(&record("q", "k", CallStatus::Ringing))
            .await
            .unwrap();
        calls
            .upsert(&record("done", "k", CallStatus::Completed))
            .await
            .unwrap();

        let state = guard.ensure_ready(&cid).await.unwrap();
        assert_eq!(state, ColdStart::Blocking);
        assert_eq!(store.slot_counts(&cid).await.unwrap().leases, 2);
        assert_eq!(store.recovered_members(&cid).await.unwrap().len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn existing_members_unblock_immediately() {
        let (guard, store, _calls) = guard();
        let cid = CampaignId::from("k");
        store
            .acquire_pre(&cid, &CallId::from("x"), 3)
            .await
            .unwrap()
            .unwrap();

        let state = guard.ensure_ready(&cid).await.unwrap();
        assert_eq!(state, ColdStart::Done);
    }

    #[tokio::test]
    #[traced_test]
    async fn live_upgrade_marks_warm() {
        let (guard, store, calls) = guard();
        let cid = CampaignId::from("k");
        calls
            .upsert(&record("p", "k", CallStatus::InProgress))
            .await
            .unwrap();
        assert_eq!(
            guard.ensure_ready(&cid).await.unwrap(),
            ColdStart::Blocking
        );

        guard.mark_warm(&cid).await.unwrap();
        assert_eq!(guard.ensure_ready(&cid).await.unwrap(), ColdStart::Done);
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_store_and_no_calls_blocks_briefly() {
        let (guard, store, _calls) = guard();
        let cid = CampaignId::from("k");
        assert_eq!(
            guard.ensure_ready(&cid).await.unwrap(),
            ColdStart::Blocking
        );
        assert_eq!(store.slot_counts(&cid).await.unwrap().leases, 0);

        // blocking flag expires on its own, after which reconstruction runs
        // again (and finds nothing)
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            guard.ensure_ready(&cid).await.unwrap(),
            ColdStart::Blocking
        );
    }
}
