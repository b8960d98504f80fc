//! Release reconciler: frees slots on terminal call events.
//!
//! Two independent sources fire on the normal path: the telephony webhook
//! and the voice-stream disconnect. Both are idempotent here; the store's
//! token checks make a double release a no-op. Terminal status is written
//! durably before the slot frees, so a crash between the two leaves a
//! held slot (self-healing via TTL) rather than a phantom free slot.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use call_store::{CallRecord, CallStatus, CallStore};
use redis_coordination::{CallId, CoordinationStore, LeaseKind};

use crate::campaign::CampaignDirectory;
use crate::dispatch::RetryScheduler;
use crate::metrics;
use crate::telephony::ProviderEvent;

#[derive(Debug, Clone)]
pub struct ReleaseReconciler {
    store: Arc<dyn CoordinationStore>,
    calls: Arc<dyn CallStore>,
    directory: Arc<dyn CampaignDirectory>,
    retry: RetryScheduler,
}

impl ReleaseReconciler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        calls: Arc<dyn CallStore>,
        directory: Arc<dyn CampaignDirectory>,
        retry: RetryScheduler,
    ) -> Self {
        Self {
            store,
            calls,
            directory,
            retry,
        }
    }

    /// Telephony webhook path.
    pub async fn on_provider_event(&self, event: &ProviderEvent) -> Result<()> {
        let Some(record) = self.calls.find_by_provider(&event.provider_call_id).await? else {
            warn!(provider_call = %event.provider_call_id, status = %event.status,
                "webhook for unknown call");
            return Ok(());
        };
        if !event.status.is_terminal() {
            self.calls
                .set_status(&record.id, event.status.record_status())
                .await?;
            return Ok(());
        }
        self.finish(record, event.status.record_status()).await
    }

    /// Voice-stream disconnect path. A stream ending on a non-terminal
    /// record means the conversation completed.
    pub async fn on_stream_end(&self, call_id: &CallId) -> Result<()> {
        let Some(record) = self.calls.get(call_id).await? else {
            warn!(call = %call_id, "stream end for unknown call");
            return Ok(());
        };
        if record.status.is_terminal() {
            // the webhook got here first; release is the idempotent backstop
            self.release_slots(&record).await?;
            return Ok(());
        }
        self.finish(record, CallStatus::Completed).await
    }

    /// Audio pipeline connected its socket; the conversation is live.
    pub async fn on_stream_connected(&self, call_id: &CallId) -> Result<()> {
        let Some(record) = self.calls.get(call_id).await? else {
            warn!(call = %call_id, "stream connect for unknown call");
            return Ok(());
        };
        if !record.status.is_terminal() {
            self.calls
                .set_status(&record.id, CallStatus::InProgress)
                .await?;
        }
        Ok(())
    }

    /// Answering-machine detection from the audio pipeline.
    pub async fn on_voicemail(&self, call_id: &CallId) -> Result<()> {
        let Some(record) = self.calls.get(call_id).await? else {
            warn!(call = %call_id, "voicemail signal for unknown call");
            return Ok(());
        };
        if record.status.is_terminal() {
            self.release_slots(&record).await?;
            return Ok(());
        }
        self.finish(record, CallStatus::Voicemail).await
    }

    async fn finish(&self, record: CallRecord, status: CallStatus) -> Result<()> {
        // durable terminal write comes before the slot frees
        self.calls.set_status(&record.id, status).await?;
        self.release_slots(&record).await?;
        record_outcome(status);
        info!(
            campaign = %record.campaign_id,
            call = %record.id,
            %status,
            "call finished"
        );
        if let Some(def) = self.directory.campaign(&record.campaign_id).await {
            self.retry.maybe_schedule(&def, &record, status).await?;
        }
        Ok(())
    }

    /// Release whatever lease this call still holds: active token first,
    /// then pre-dial, then the tokenless fallback for records that lost the
    /// race to persist their tokens.
    async fn release_slots(&self, record: &CallRecord) -> Result<()> {
        let cid = &record.campaign_id;
        let call = &record.id;
        if let Some(token) = &record.active_token {
            if self
                .store
                .release(cid, call, token, LeaseKind::Active, true)
                .await?
            {
                return Ok(());
            }
        }
        if let Some(token) = &record.pre_token {
            if self
                .store
                .release(cid, call, token, LeaseKind::PreDial, true)
                .await?
            {
                return Ok(());
            }
        }
        match self.store.force_release(cid, call).await? {
            Some(kind) => debug!(campaign = %cid, call = %call, %kind, "force-released lease"),
            None => debug!(campaign = %cid, call = %call, "no lease left to release"),
        }
        Ok(())
    }
}

fn record_outcome(status: CallStatus) {
    match status {
        CallStatus::Completed => metrics::DIAL_OUTCOME.completed.inc(),
        CallStatus::Failed => metrics::DIAL_OUTCOME.failed.inc(),
        CallStatus::NoAnswer => metrics::DIAL_OUTCOME.no_answer.inc(),
        CallStatus::Busy => metrics::DIAL_OUTCOME.busy.inc(),
        CallStatus::Voicemail => metrics::DIAL_OUTCOME.voicemail.inc(),
        CallStatus::Canceled => metrics::DIAL_OUTCOME.canceled.inc(),
        _ => {}
    }
}
