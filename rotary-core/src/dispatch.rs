//! Dispatch worker: consumes broker jobs and drives the telephony call.
//!
//! The worker's whole job is the two-phase lease dance: claim the
//! reservation, hold a pre-dial lease across the telephony API call, then
//! upgrade to an active lease once the provider accepts. Every contended
//! outcome is a value, so the worker is plain sequential code that either
//! finishes a job or puts it somewhere the system can pick it up again.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use call_store::{CallRecord, CallStatus, CallStore};
use config::CoreTunables;
use redis_coordination::{CampaignId, CoordinationStore, LeaseKind, LeaseToken, WaitlistItem};

use crate::breaker::CircuitBreaker;
use crate::broker::{Broker, JobEnvelope, JobPayload, RequeueJob};
use crate::campaign::{CampaignDefinition, CampaignDirectory, DialJob};
use crate::cold_start::ColdStartGuard;
use crate::metrics;
use crate::telephony::{CallMetadata, TelephonyProvider};

/// Repair attempts for jobs that arrive without a promote sequence.
const GATE_REPAIR_RETRIES: u32 = 3;
/// Backoff between gate-repair attempts.
const GATE_REPAIR_BACKOFF: Duration = Duration::from_millis(200);
/// Delay before retrying a job whose reservation was reclaimed.
const RECLAIMED_REQUEUE_DELAY: Duration = Duration::from_secs(5);
/// Reclaim redeliveries before the contact goes back through the waitlist.
const MAX_RECLAIM_REQUEUES: u32 = 3;
/// Consecutive job failures before the worker gives up so the deployment
/// can restart it.
const MAX_CONSECUTIVE_FAILURES: u32 = 25;

/// Schedules retry attempts for recoverable call outcomes, per campaign
/// policy. Shared by the dispatch worker and the release reconciler.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    broker: Arc<dyn Broker>,
    calls: Arc<dyn CallStore>,
}

impl RetryScheduler {
    pub fn new(broker: Arc<dyn Broker>, calls: Arc<dyn CallStore>) -> Self {
        Self { broker, calls }
    }

    fn is_recoverable(def: &CampaignDefinition, status: CallStatus) -> bool {
        match status {
            CallStatus::Failed | CallStatus::NoAnswer | CallStatus::Busy => true,
            CallStatus::Voicemail => !def.retry.exclude_voicemail,
            _ => false,
        }
    }

    /// Apply the campaign retry policy to a finished attempt. Returns true
    /// when a retry was scheduled.
    pub async fn maybe_schedule(
        &self,
        def: &CampaignDefinition,
        record: &CallRecord,
        status: CallStatus,
    ) -> Result<bool> {
        if !def.retry.retry_failed || !Self::is_recoverable(def, status) {
            return Ok(false);
        }
        let next_attempt = record.retry_count + 1;
        if next_attempt >= def.retry.max_retry_attempts {
            debug!(call = %record.id, attempts = next_attempt, "retry attempts exhausted");
            return Ok(false);
        }
        let delay = def.retry.retry_delay;
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.calls
            .mark_retry(&record.id, next_attempt, next_retry_at)
            .await?;

        let item = WaitlistItem {
            call_id: record.id.clone(),
            contact_ref: record.contact_ref.clone(),
            agent_ref: record.agent_ref.clone(),
            phone_ref: record.phone_ref.clone(),
            retry_count: next_attempt,
            priority: def.priority_for(next_attempt),
            enqueued_at: Utc::now(),
        };
        let envelope = JobEnvelope::new(
            format!("requeue:{}:{}:{next_attempt}", def.id, record.id),
            JobPayload::Requeue(RequeueJob {
                campaign_id: def.id.clone(),
                item,
            }),
        );
        self.broker
            .enqueue(envelope, Some(delay))
            .await
            .map_err(|e| anyhow::anyhow!("retry enqueue failed: {e}"))?;
        info!(call = %record.id, attempt = next_attempt, ?delay, "retry scheduled");
        Ok(true)
    }
}

#[derive(Debug)]
pub struct DispatchWorker {
    store: Arc<dyn CoordinationStore>,
    broker: Arc<dyn Broker>,
    calls: Arc<dyn CallStore>,
    telephony: Arc<dyn TelephonyProvider>,
    directory: Arc<dyn CampaignDirectory>,
    breaker: CircuitBreaker,
    guard: ColdStartGuard,
    retry: RetryScheduler,
    tunables: CoreTunables,
    worker_id: usize,
}

impl DispatchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        broker: Arc<dyn Broker>,
        calls: Arc<dyn CallStore>,
        telephony: Arc<dyn TelephonyProvider>,
        directory: Arc<dyn CampaignDirectory>,
        breaker: CircuitBreaker,
        guard: ColdStartGuard,
        retry: RetryScheduler,
        tunables: CoreTunables,
        worker_id: usize,
    ) -> Self {
        Self {
            store,
            broker,
            calls,
            telephony,
            directory,
            breaker,
            guard,
            retry,
            tunables,
            worker_id,
        }
    }

    /// Consume loop. Returns when cancelled, when the broker closes, or
    /// after too many consecutive failures (so the deployment restarts us).
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let mut consecutive_failures = 0u32;
        loop {
            let job = tokio::select! {
                _ = token.cancelled() => {
                    debug!(worker = self.worker_id, "dispatch worker stopping");
                    return Ok(());
                }
                job = self.broker.next_job() => job,
            };
            let Some(envelope) = job.map_err(|e| anyhow::anyhow!("broker receive: {e}"))? else {
                debug!(worker = self.worker_id, "broker closed");
                return Ok(());
            };
            match self.handle(envelope).await {
                Ok(()) => consecutive_failures = 0,
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(worker = self.worker_id, %err, consecutive_failures, "job failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(
                            worker = self.worker_id,
                            "too many consecutive failures, stopping so the deployment can restart us"
                        );
                        anyhow::bail!("dispatch worker {} gave up", self.worker_id);
                    }
                }
            }
        }
    }

    async fn handle(&self, envelope: JobEnvelope) -> Result<()> {
        match envelope.payload.clone() {
            JobPayload::Dial(job) => self.dispatch(envelope, job).await,
            JobPayload::Requeue(req) => self.requeue_to_waitlist(req).await,
        }
    }

    /// Retry jobs re-enter through the waitlist, with a fresh admission.
    async fn requeue_to_waitlist(&self, req: RequeueJob) -> Result<()> {
        let cid = req.campaign_id;
        if self.store.enqueue_waitlist(&cid, &req.item).await? {
            self.calls
                .set_status(&req.item.call_id, CallStatus::Pending)
                .await?;
            self.store.publish_slot_available(&cid).await?;
        } else {
            debug!(campaign = %cid, call = %req.item.call_id, "retry already waitlisted or in flight");
        }
        Ok(())
    }

    async fn dispatch(&self, envelope: JobEnvelope, job: DialJob) -> Result<()> {
        let cid = job.campaign_id.clone();
        let call = job.call_id.clone();
        let job_id = job.job_id();

        let claimed = self.store.claim_reservation(&cid, &job_id).await?;

        let Some(def) = self.directory.campaign(&cid).await else {
            warn!(campaign = %cid, job = %job_id, "job for unknown campaign dropped");
            return Ok(());
        };

        let pre_token = if job.promote_seq.is_some() {
            if claimed == 0 && envelope.requeued == 0 {
                // replay of a job another worker already handled
                metrics::DUPLICATE_ENQUEUE.inc();
                debug!(campaign = %cid, job = %job_id, "duplicate dispatch acknowledged");
                return Ok(());
            }
            self.guard.ensure_ready(&cid).await?;
            match self
                .store
                .acquire_pre(&cid, &call, def.concurrent_limit)
                .await?
            {
                Some(token) => token,
                None => {
                    // the janitor or cold-start reclaimed our slot
                    metrics::RESERVATION_RECLAIMED.inc();
                    self.reschedule_reclaimed(envelope, &job).await?;
                    return Ok(());
                }
            }
        } else {
            self.repair_admission(&cid, &call, def.concurrent_limit)
                .await?
        };

        // campaign may have been paused or cancelled while we were queued
        if !def.state.allows_promotion() {
            info!(campaign = %cid, call = %call, state = %def.state, "campaign not dialable, dropping");
            self.store
                .release(&cid, &call, &pre_token, LeaseKind::PreDial, true)
                .await?;
            self.calls.set_status(&call, CallStatus::Skipped).await?;
            return Ok(());
        }

        let Some(record) = self.calls.get(&call).await? else {
            warn!(campaign = %cid, call = %call, "no call record, releasing slot");
            self.store
                .release(&cid, &call, &pre_token, LeaseKind::PreDial, true)
                .await?;
            return Ok(());
        };

        self.calls.set_status(&call, CallStatus::Dialing).await?;
        let started = std::time::Instant::now();
        let metadata = CallMetadata {
            campaign_id: cid.clone(),
            call_id: call.clone(),
            agent_ref: job.agent_ref.clone(),
        };
        let dialed = self
            .dial_with_heartbeat(&cid, &call, &pre_token, &job.phone_ref, &record.to_number, metadata)
            .await;

        match dialed {
            Ok(provider_call_id) => {
                // store the correlation before anything else so a racing
                // webhook can always find us
                self.calls
                    .set_provider(&call, &provider_call_id, &pre_token)
                    .await?;
                match self.store.upgrade(&cid, &call, &pre_token).await? {
                    Some(active_token) => {
                        self.calls.set_active_token(&call, &active_token).await?;
                        self.calls.set_status(&call, CallStatus::Ringing).await?;
                        self.guard.mark_warm(&cid).await?;
                        self.breaker.record_success(&cid).await?;
                        metrics::DIAL_OUTCOME.connected.inc();
                        metrics::DIAL_DURATION
                            .with_label_values(&["connected"])
                            .observe(started.elapsed().as_secs_f64());
                        self.spawn_active_heartbeat(cid, call, active_token);
                        Ok(())
                    }
                    None => {
                        // pre-dial lease vanished mid-dial; hang up rather
                        // than run over the campaign limit
                        warn!(campaign = %cid, call = %call, "upgrade lost its pre-dial lease, hanging up");
                        if let Err(err) = self.telephony.hangup(&provider_call_id).await {
                            warn!(call = %call, %err, "hangup after lost upgrade failed");
                        }
                        self.finish_failed_dial(&def, &record, started).await
                    }
                }
            }
            Err(err) => {
                self.store
                    .release(&cid, &call, &pre_token, LeaseKind::PreDial, true)
                    .await?;
                if err.is_terminal() {
                    info!(campaign = %cid, call = %call, %err, "terminal provider rejection");
                    self.calls.set_status(&call, CallStatus::Failed).await?;
                    self.breaker.record_failure(&cid).await?;
                    metrics::DIAL_OUTCOME.failed.inc();
                    metrics::DIAL_DURATION
                        .with_label_values(&["failed"])
                        .observe(started.elapsed().as_secs_f64());
                    Ok(())
                } else {
                    warn!(campaign = %cid, call = %call, %err, "transient provider failure");
                    self.finish_failed_dial(&def, &record, started).await
                }
            }
        }
    }

    async fn finish_failed_dial(
        &self,
        def: &CampaignDefinition,
        record: &CallRecord,
        started: std::time::Instant,
    ) -> Result<()> {
        self.calls.set_status(&record.id, CallStatus::Failed).await?;
        self.breaker.record_failure(&def.id).await?;
        metrics::DIAL_OUTCOME.failed.inc();
        metrics::DIAL_DURATION
            .with_label_values(&["failed"])
            .observe(started.elapsed().as_secs_f64());
        self.retry
            .maybe_schedule(def, record, CallStatus::Failed)
            .await?;
        Ok(())
    }

    /// A job whose reservation was reclaimed tries again shortly without
    /// burning a retry attempt; after a few rounds the contact goes back
    /// through the waitlist for a fresh admission.
    async fn reschedule_reclaimed(&self, mut envelope: JobEnvelope, job: &DialJob) -> Result<()> {
        let cid = &job.campaign_id;
        if envelope.requeued < MAX_RECLAIM_REQUEUES {
            envelope.requeued += 1;
            debug!(campaign = %cid, call = %job.call_id, round = envelope.requeued,
                "reservation reclaimed, requeueing");
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1_000));
            self.broker
                .requeue(envelope, RECLAIMED_REQUEUE_DELAY + jitter)
                .await
                .map_err(|e| anyhow::anyhow!("requeue failed: {e}"))?;
            return Ok(());
        }
        // the campaign stayed full; release the job id and line up again
        info!(campaign = %cid, call = %job.call_id, "reclaim requeues exhausted, re-entering waitlist");
        self.broker
            .forget(&envelope.job_id)
            .await
            .map_err(|e| anyhow::anyhow!("forget failed: {e}"))?;
        let item = WaitlistItem {
            call_id: job.call_id.clone(),
            contact_ref: job.contact_ref.clone(),
            agent_ref: job.agent_ref.clone(),
            phone_ref: job.phone_ref.clone(),
            retry_count: job.retry_count,
            priority: job.priority,
            enqueued_at: Utc::now(),
        };
        if self.store.enqueue_waitlist(cid, &item).await? {
            self.store.publish_slot_available(cid).await?;
        }
        Ok(())
    }

    /// Repair path for jobs missing their promote sequence: try to win a
    /// slot the normal way a few times, then admit unconditionally.
    async fn repair_admission(
        &self,
        cid: &CampaignId,
        call: &redis_coordination::CallId,
        limit: u32,
    ) -> Result<LeaseToken> {
        metrics::GATE_VIOLATION.inc();
        warn!(campaign = %cid, call = %call, "job missing promote sequence, attempting repair");
        self.guard.ensure_ready(cid).await?;
        for attempt in 0..GATE_REPAIR_RETRIES {
            if let Some(token) = self.store.acquire_pre(cid, call, limit).await? {
                return Ok(token);
            }
            debug!(campaign = %cid, call = %call, attempt, "gate repair acquire contended");
            tokio::time::sleep(GATE_REPAIR_BACKOFF).await;
        }
        metrics::GATE_HARD_SYNC.inc();
        error!(
            campaign = %cid,
            call = %call,
            "gate repair exhausted, admitting unconditionally"
        );
        Ok(self.store.hard_sync_pre(cid, call).await?)
    }

    /// Run the telephony call while renewing the pre-dial lease, capped at
    /// the hard pre-dial maximum.
    async fn dial_with_heartbeat(
        &self,
        cid: &CampaignId,
        call: &redis_coordination::CallId,
        token: &LeaseToken,
        from: &str,
        to: &str,
        metadata: CallMetadata,
    ) -> crate::telephony::TelephonyResult<String> {
        let dial = self.telephony.create_call(from, to, metadata);
        tokio::pin!(dial);
        let period = (self.tunables.pre_dial_ttl / 3).max(Duration::from_millis(250));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // first tick is immediate
        loop {
            tokio::select! {
                result = &mut dial => return result,
                _ = ticker.tick() => {
                    match self.store.renew_pre_capped(cid, call, token).await {
                        Ok(true) => {}
                        Ok(false) => {
                            // at the cap; keep dialing and let the lease lapse
                            debug!(campaign = %cid, call = %call, "pre-dial renewal refused at cap");
                        }
                        Err(err) => warn!(campaign = %cid, call = %call, %err, "pre-dial renewal failed"),
                    }
                }
            }
        }
    }

    /// Renew the active lease until the call ends and the lease is gone.
    fn spawn_active_heartbeat(
        &self,
        cid: CampaignId,
        call: redis_coordination::CallId,
        token: LeaseToken,
    ) {
        let store = self.store.clone();
        let ttl = self.tunables.active_ttl;
        let period = (ttl / 3).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.renew(&cid, &call, &token, LeaseKind::Active, ttl).await {
                    Ok(true) => {}
                    Ok(false) => break, // released or reclaimed
                    Err(err) => {
                        warn!(campaign = %cid, call = %call, %err, "active renewal failed");
                    }
                }
            }
            debug!(campaign = %cid, call = %call, "active heartbeat ended");
        });
    }
}
