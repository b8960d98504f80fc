//! Promoter: moves waitlisted contacts into broker jobs.
//!
//! One promoter pass per campaign may run at a time across the whole
//! deployment, enforced by the store's promote gate. Passes are triggered by
//! a sub-second timer, by slot-available pub/sub wakeups, and by contact
//! enqueues; every trigger is coalescable because the pass itself decides
//! how much to admit.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use call_store::{CallStatus, CallStore};
use config::CoreTunables;
use redis_coordination::{CampaignId, CoordinationStore};

use crate::breaker::CircuitBreaker;
use crate::broker::{Broker, JobEnvelope, JobPayload};
use crate::campaign::{CampaignDirectory, DialJob};
use crate::cold_start::ColdStartGuard;
use crate::metrics;

/// Outcome of one promoter pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotePass {
    /// Another promoter holds the gate.
    Conflict,
    /// Cold-start blocking; nothing admitted.
    ColdBlocked,
    /// Campaign unknown, paused, or otherwise not promotable.
    Inactive,
    /// Pass completed.
    Admitted { count: usize, pushed_back: usize },
}

#[derive(Debug, Clone)]
pub struct Promoter {
    store: Arc<dyn CoordinationStore>,
    broker: Arc<dyn Broker>,
    calls: Arc<dyn CallStore>,
    directory: Arc<dyn CampaignDirectory>,
    breaker: CircuitBreaker,
    guard: ColdStartGuard,
    tunables: CoreTunables,
}

impl Promoter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        broker: Arc<dyn Broker>,
        calls: Arc<dyn CallStore>,
        directory: Arc<dyn CampaignDirectory>,
        breaker: CircuitBreaker,
        guard: ColdStartGuard,
        tunables: CoreTunables,
    ) -> Self {
        Self {
            store,
            broker,
            calls,
            directory,
            breaker,
            guard,
            tunables,
        }
    }

    /// One single-flight promotion pass for a campaign.
    pub async fn tick(&self, cid: &CampaignId) -> Result<PromotePass> {
        let Some(gate) = self.store.acquire_promote_gate(cid).await? else {
            metrics::PROMOTER_CONFLICT.inc();
            return Ok(PromotePass::Conflict);
        };
        let result = self.promote_locked(cid).await;
        if let Err(err) = self.store.release_promote_gate(cid, &gate).await {
            // gate TTL covers us
            warn!(campaign = %cid, %err, "failed to release promote gate");
        }
        result
    }

    async fn promote_locked(&self, cid: &CampaignId) -> Result<PromotePass> {
        if self.guard.ensure_ready(cid).await?.is_blocking() {
            metrics::PROMOTER_COLD_BLOCKED.inc();
            return Ok(PromotePass::ColdBlocked);
        }
        let Some(def) = self.directory.campaign(cid).await else {
            return Ok(PromotePass::Inactive);
        };
        if !def.state.allows_promotion() {
            return Ok(PromotePass::Inactive);
        }
        // the operator may have changed the limit since the last pass
        self.store.set_limit(cid, def.concurrent_limit).await?;

        let batch_size = self
            .breaker
            .batch_size(cid, self.tunables.default_promote_batch)
            .await;
        let batch = self.store.reserve_promote(cid, batch_size).await?;

        let mut count = 0usize;
        for promoted in &batch.promoted {
            let job = DialJob::from_item(cid, &promoted.item, promoted.promote_seq);
            let job_id = job.job_id();
            let envelope = JobEnvelope::new(job_id.clone(), JobPayload::Dial(job));
            match self.broker.enqueue(envelope, None).await {
                Ok(true) => {
                    count += 1;
                    metrics::PROMOTED_JOBS.inc();
                    if let Err(err) = self
                        .calls
                        .set_status(&promoted.item.call_id, CallStatus::Queued)
                        .await
                    {
                        warn!(campaign = %cid, call = %promoted.item.call_id, %err,
                            "failed to mark call queued");
                    }
                }
                Ok(false) => {
                    // this attempt is already in the broker; credit the
                    // reservation straight back
                    metrics::DUPLICATE_ENQUEUE.inc();
                    debug!(campaign = %cid, job = %job_id, "duplicate enqueue rejected by broker");
                    if let Err(err) = self.store.claim_reservation(cid, &job_id).await {
                        warn!(campaign = %cid, job = %job_id, %err,
                            "failed to credit back a duplicate reservation");
                    }
                }
                Err(err) => {
                    // orphaned reservation; the janitor reaps it after the TTL
                    warn!(campaign = %cid, job = %job_id, %err,
                        "broker enqueue failed, leaving reservation for the janitor");
                }
            }
        }

        let pushed_back = batch.push_back.len();
        if pushed_back > 0 {
            metrics::PROMOTE_PUSH_BACK.inc_by(pushed_back as u64);
            self.store.push_back_front(cid, &batch.push_back).await?;
        }
        Ok(PromotePass::Admitted { count, pushed_back })
    }

    /// Promoter loop: periodic ticks over active campaigns plus
    /// slot-available wakeups.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut events = match self.store.subscribe_slot_available().await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(%err, "promoter could not subscribe to slot-available events");
                return;
            }
        };
        let mut ticker = tokio::time::interval(self.tunables.promote_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("promoter stopping");
                    return;
                }
                _ = ticker.tick() => {
                    for cid in self.directory.active_campaigns().await {
                        if let Err(err) = self.tick(&cid).await {
                            warn!(campaign = %cid, %err, "promoter pass failed");
                        }
                    }
                }
                Some(cid) = events.recv() => {
                    if let Err(err) = self.tick(&cid).await {
                        warn!(campaign = %cid, %err, "promoter wakeup pass failed");
                    }
                }
            }
        }
    }
}
