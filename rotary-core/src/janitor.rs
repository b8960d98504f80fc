//! Lease janitor: the safety net under the atomic admission scripts.
//!
//! Three sweeps per campaign: reclaim lease members whose proof-of-holding
//! key expired (worker crashes), reap reservations whose broker job is gone
//! (promoter crashes), and flag waitlist/broker divergence. The janitor is
//! not authoritative; it only repairs what the TTLs have already decided.

use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use config::CoreTunables;
use redis_coordination::{CampaignId, CoordinationStore, Priority};

use crate::broker::Broker;
use crate::campaign::CampaignDirectory;
use crate::metrics;

/// How deep into each waitlist the divergence check looks.
const RECONCILE_PEEK_DEPTH: usize = 10;

/// Statistics returned by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorStats {
    pub expired_leases: u64,
    pub orphaned_reservations: u64,
    pub waitlist_divergence: u64,
}

#[derive(Debug, Clone)]
pub struct LeaseJanitor {
    store: Arc<dyn CoordinationStore>,
    broker: Arc<dyn Broker>,
    directory: Arc<dyn CampaignDirectory>,
    tunables: CoreTunables,
}

impl LeaseJanitor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        broker: Arc<dyn Broker>,
        directory: Arc<dyn CampaignDirectory>,
        tunables: CoreTunables,
    ) -> Self {
        Self {
            store,
            broker,
            directory,
            tunables,
        }
    }

    /// One full sweep for a campaign.
    pub async fn sweep(&self, cid: &CampaignId) -> Result<JanitorStats> {
        let mut stats = JanitorStats::default();

        // 1. members whose lease key TTL'd out
        for member in self.store.lease_members(cid).await? {
            if !self.store.lease_exists(cid, &member).await?
                && self.store.remove_lease_member(cid, &member).await?
            {
                stats.expired_leases += 1;
                metrics::EXPIRED_LEASES_RECLAIMED.inc();
                debug!(campaign = %cid, member, "reclaimed expired lease");
            }
        }
        if stats.expired_leases > 0 {
            // slots opened up; wake the promoter
            self.store.publish_slot_available(cid).await?;
        }

        let outstanding: HashSet<String> = self
            .broker
            .outstanding_job_ids()
            .await
            .map_err(|e| anyhow::anyhow!("broker listing failed: {e}"))?
            .into_iter()
            .collect();

        // 2. reservations past their TTL with no job left to claim them
        let stale = self
            .store
            .ledger_entries_older_than(cid, self.tunables.reservation_ttl)
            .await?;
        for entry in stale {
            if outstanding.contains(entry.job_id()) {
                continue;
            }
            if self.store.reap_ledger_entry(cid, &entry.member).await? {
                stats.orphaned_reservations += 1;
                metrics::ORPHANED_RESERVATIONS_RECOVERED.inc();
                warn!(campaign = %cid, member = %entry.member, "reaped orphaned reservation");
            }
        }
        if stats.orphaned_reservations > 0 {
            self.store.publish_slot_available(cid).await?;
        }

        // 3. waitlist heads that are simultaneously outstanding broker jobs.
        // The promoter's duplicate-enqueue path repairs these on admission;
        // here we only surface the divergence.
        for priority in [Priority::High, Priority::Normal] {
            for item in self
                .store
                .waitlist_peek(cid, priority, RECONCILE_PEEK_DEPTH)
                .await?
            {
                let job_id =
                    redis_coordination::dial_job_id(cid, &item.call_id, item.retry_count);
                if outstanding.contains(&job_id) {
                    stats.waitlist_divergence += 1;
                    metrics::BROKER_WAITLIST_REBUILT.inc();
                    warn!(campaign = %cid, call = %item.call_id, "waitlisted contact already has a broker job");
                }
            }
        }

        Ok(stats)
    }

    /// Janitor loop over every known campaign.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tunables.janitor_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("janitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    for cid in self.directory.all_campaigns().await {
                        match self.sweep(&cid).await {
                            Ok(stats) if stats == JanitorStats::default() => {}
                            Ok(stats) => {
                                debug!(
                                    campaign = %cid,
                                    expired = stats.expired_leases,
                                    orphaned = stats.orphaned_reservations,
                                    divergent = stats.waitlist_divergence,
                                    "janitor sweep completed"
                                );
                            }
                            Err(err) => warn!(campaign = %cid, %err, "janitor sweep failed"),
                        }
                    }
                }
            }
        }
    }
}
