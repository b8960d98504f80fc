//! Engine: constructs the services and supervises their tasks.
//!
//! One engine per process. Every service gets its dependencies injected
//! here; none of them hold globals. `start` spawns the promoter, the
//! janitor, the dispatch workers, and the metrics exporter under one
//! cancellation token.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use call_store::{CallRecord, CallStore};
use config::CoreTunables;
use redis_coordination::{CallId, CampaignId, CoordinationStore, WaitlistItem};

use crate::breaker::CircuitBreaker;
use crate::broker::Broker;
use crate::campaign::CampaignDirectory;
use crate::cold_start::ColdStartGuard;
use crate::dispatch::{DispatchWorker, RetryScheduler};
use crate::janitor::LeaseJanitor;
use crate::metrics;
use crate::promoter::Promoter;
use crate::reconciler::ReleaseReconciler;
use crate::telephony::TelephonyProvider;

#[derive(Debug)]
pub struct Engine {
    store: Arc<dyn CoordinationStore>,
    calls: Arc<dyn CallStore>,
    directory: Arc<dyn CampaignDirectory>,
    tunables: CoreTunables,
    promoter: Arc<Promoter>,
    janitor: Arc<LeaseJanitor>,
    reconciler: Arc<ReleaseReconciler>,
    workers: Vec<Arc<DispatchWorker>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        broker: Arc<dyn Broker>,
        calls: Arc<dyn CallStore>,
        telephony: Arc<dyn TelephonyProvider>,
        directory: Arc<dyn CampaignDirectory>,
        tunables: CoreTunables,
    ) -> Self {
        let breaker = CircuitBreaker::new(store.clone());
        let guard = ColdStartGuard::new(store.clone(), calls.clone());
        let retry = RetryScheduler::new(broker.clone(), calls.clone());

        let promoter = Arc::new(Promoter::new(
            store.clone(),
            broker.clone(),
            calls.clone(),
            directory.clone(),
            breaker.clone(),
            guard.clone(),
            tunables.clone(),
        ));
        let janitor = Arc::new(LeaseJanitor::new(
            store.clone(),
            broker.clone(),
            directory.clone(),
            tunables.clone(),
        ));
        let reconciler = Arc::new(ReleaseReconciler::new(
            store.clone(),
            calls.clone(),
            directory.clone(),
            retry.clone(),
        ));
        let workers = (0..tunables.dispatch_workers.max(1))
            .map(|worker_id| {
                Arc::new(DispatchWorker::new(
                    store.clone(),
                    broker.clone(),
                    calls.clone(),
                    telephony.clone(),
                    directory.clone(),
                    breaker.clone(),
                    guard.clone(),
                    retry.clone(),
                    tunables.clone(),
                    worker_id,
                ))
            })
            .collect();

        Self {
            store,
            calls,
            directory,
            tunables,
            promoter,
            janitor,
            reconciler,
            workers,
        }
    }

    /// The webhook/stream-end surface hands its events to this.
    pub fn reconciler(&self) -> Arc<ReleaseReconciler> {
        self.reconciler.clone()
    }

    pub fn promoter(&self) -> Arc<Promoter> {
        self.promoter.clone()
    }

    /// Register a contact for dialing: create its call record and put it on
    /// the campaign waitlist. The call id is derived from the campaign and
    /// contact identity so a double submission cannot dial twice.
    pub async fn enqueue_contact(
        &self,
        cid: &CampaignId,
        contact_ref: &str,
        to_number: &str,
    ) -> Result<CallId> {
        let def = self
            .directory
            .campaign(cid)
            .await
            .with_context(|| format!("unknown campaign {cid}"))?;
        if !def.state.accepts_contacts() {
            bail!("campaign {cid} is {} and accepts no contacts", def.state);
        }

        let call_id = derive_call_id(cid, contact_ref);
        let record = match self.calls.get(&call_id).await? {
            // re-run of a finished contact gets a fresh record
            Some(existing) if existing.status.is_terminal() => CallRecord::new(
                call_id.clone(),
                cid.clone(),
                contact_ref,
                &def.agent_ref,
                &def.phone_ref,
                to_number,
                0,
            ),
            Some(existing) => existing,
            None => CallRecord::new(
                call_id.clone(),
                cid.clone(),
                contact_ref,
                &def.agent_ref,
                &def.phone_ref,
                to_number,
                0,
            ),
        };
        self.calls.upsert(&record).await?;

        let item = WaitlistItem {
            call_id: call_id.clone(),
            contact_ref: contact_ref.to_owned(),
            agent_ref: def.agent_ref.clone(),
            phone_ref: def.phone_ref.clone(),
            retry_count: record.retry_count,
            priority: def.priority_for(record.retry_count),
            enqueued_at: Utc::now(),
        };
        if self.store.enqueue_waitlist(cid, &item).await? {
            // wake the promoter; an enqueue onto an empty waitlist would
            // otherwise wait out a full tick
            self.store.publish_slot_available(cid).await?;
            debug!(campaign = %cid, call = %call_id, "contact waitlisted");
        } else {
            debug!(campaign = %cid, call = %call_id, "contact already waitlisted or in flight");
        }
        Ok(call_id)
    }

    /// Spawn all background tasks. The returned handles finish when `token`
    /// is cancelled or a worker gives up.
    pub fn start(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            workers = self.workers.len(),
            "starting campaign dispatch engine"
        );
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            self.promoter.clone().run(token.clone()),
        ));
        handles.push(tokio::spawn(self.janitor.clone().run(token.clone())));
        for worker in &self.workers {
            let worker = worker.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = worker.run(token.clone()).await {
                    error!(%err, "dispatch worker exited with error");
                    // a dead worker means degraded dispatch; stop the rest
                    token.cancel();
                }
            }));
        }
        handles.push(tokio::spawn(Self::export_metrics(
            self.store.clone(),
            self.directory.clone(),
            self.tunables.clone(),
            token,
        )));
        handles
    }

    async fn export_metrics(
        store: Arc<dyn CoordinationStore>,
        directory: Arc<dyn CampaignDirectory>,
        tunables: CoreTunables,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(tunables.metrics_export_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("metrics exporter stopping");
                    return;
                }
                _ = ticker.tick() => {
                    metrics::UPTIME.set(metrics::START_TIME.elapsed().as_secs() as i64);
                    for cid in directory.all_campaigns().await {
                        match store.slot_counts(&cid).await {
                            Ok(counts) => {
                                metrics::SLOTS_IN_FLIGHT
                                    .with_label_values(&[cid.as_str()])
                                    .set(counts.leases as i64);
                                metrics::SLOTS_RESERVED
                                    .with_label_values(&[cid.as_str()])
                                    .set(counts.reserved as i64);
                            }
                            Err(err) => warn!(campaign = %cid, %err, "occupancy read failed"),
                        }
                    }
                }
            }
        }
    }
}

/// Stable call id for one campaign-contact pairing. Retries reuse it; the
/// broker job id (which appends the attempt counter) stays unique.
fn derive_call_id(cid: &CampaignId, contact_ref: &str) -> CallId {
    let ns = Uuid::NAMESPACE_OID;
    let name = format!("{cid}/{contact_ref}");
    CallId::from(Uuid::new_v5(&ns, name.as_bytes()).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_stable_per_contact() {
        let cid = CampaignId::from("k");
        let a = derive_call_id(&cid, "+15550199");
        let b = derive_call_id(&cid, "+15550199");
        let c = derive_call_id(&cid, "+15550200");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let other = derive_call_id(&CampaignId::from("k2"), "+15550199");
        assert_ne!(a, other);
    }
}
