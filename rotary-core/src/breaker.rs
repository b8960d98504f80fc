//! Per-campaign dispatch circuit breaker.
//!
//! State lives in the coordination store so every promoter in the
//! deployment sees the same breaker. This service is the typed face over
//! those keys plus the batch-size policy.

use std::sync::Arc;

use tracing::{debug, warn};

use redis_coordination::{CampaignId, CoordinationResult, CoordinationStore};

use crate::metrics;

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn CoordinationStore>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Record a successful dispatch; drains the failure window and closes
    /// the circuit.
    pub async fn record_success(&self, cid: &CampaignId) -> CoordinationResult<()> {
        self.store.breaker_record_success(cid).await?;
        metrics::CIRCUIT_STATE.with_label_values(&[cid.as_str()]).set(0);
        Ok(())
    }

    /// Record a failed dispatch.
    pub async fn record_failure(&self, cid: &CampaignId) -> CoordinationResult<()> {
        if self.store.breaker_record_failure(cid).await? {
            warn!(campaign = %cid, "circuit breaker opened, quartering promotion batches");
            metrics::CIRCUIT_STATE.with_label_values(&[cid.as_str()]).set(1);
        }
        Ok(())
    }

    /// Effective promotion batch size: `default` while closed, quartered
    /// (but at least 1) while open. A store error counts as closed so an
    /// unreachable breaker never halts promotion on its own.
    pub async fn batch_size(&self, cid: &CampaignId, default: u32) -> u32 {
        match self.store.breaker_is_open(cid).await {
            Ok(true) => std::cmp::max(1, default / 4),
            Ok(false) => default,
            Err(err) => {
                debug!(campaign = %cid, %err, "breaker state unavailable, assuming closed");
                default
            }
        }
    }
}
