//! Job broker seam and in-process implementation.
//!
//! The core needs four things from a broker: delayed enqueue, FIFO order,
//! per-job uniqueness by caller-supplied id with retention, and the ability
//! to push a job back to delayed state from inside the consumer. The
//! [`MemoryBroker`] supplies all four with a dedup table and a timer map,
//! which is also the documented fallback for external brokers lacking
//! native uniqueness or delay.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use redis_coordination::{CampaignId, WaitlistItem};

use crate::campaign::DialJob;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Error type for broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker has shut down and will yield no more jobs.
    #[error("broker closed")]
    Closed,

    /// Transport or storage failure in an external broker.
    #[error("broker error: {0}")]
    Internal(String),
}

/// Re-enqueue request: puts a contact back on the waitlist after a retry
/// delay, without holding a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueJob {
    pub campaign_id: CampaignId,
    pub item: WaitlistItem,
}

/// The payloads the dispatch workers consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Dial(DialJob),
    Requeue(RequeueJob),
}

/// One broker job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Uniqueness key; duplicates within the retention window are rejected.
    pub job_id: String,
    pub payload: JobPayload,
    /// Times this job was moved back to delayed after losing its
    /// reservation. Zero for first delivery.
    #[serde(default)]
    pub requeued: u32,
}

impl JobEnvelope {
    pub fn new(job_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            job_id: job_id.into(),
            payload,
            requeued: 0,
        }
    }
}

/// Broker seam.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug + 'static {
    /// Enqueue a job, optionally delayed. Returns `false` when the job id
    /// was already seen within the retention window.
    async fn enqueue(&self, job: JobEnvelope, delay: Option<Duration>) -> BrokerResult<bool>;

    /// Wait for the next ready job. `None` means the broker closed.
    async fn next_job(&self) -> BrokerResult<Option<JobEnvelope>>;

    /// Move a job back to delayed state from inside the consumer, without
    /// consuming a uniqueness slot or a retry attempt.
    async fn requeue(&self, job: JobEnvelope, delay: Duration) -> BrokerResult<()>;

    /// Drop a job id from the uniqueness window (and any queued copy), so
    /// the same attempt can be promoted again.
    async fn forget(&self, job_id: &str) -> BrokerResult<()>;

    /// Ids of all jobs currently ready or delayed; janitor reconciliation.
    async fn outstanding_job_ids(&self) -> BrokerResult<Vec<String>>;
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: VecDeque<JobEnvelope>,
    delayed: BTreeMap<(Instant, u64), JobEnvelope>,
    seen: HashMap<String, Instant>,
    seq: u64,
    closed: bool,
}

impl BrokerState {
    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let job = entry.remove();
            self.ready.push_back(job);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|(due, _)| *due)
    }
}

/// In-process broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    retention: Duration,
}

impl MemoryBroker {
    pub fn new(retention: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            retention,
        }
    }

    /// Stop yielding jobs; waiting consumers observe `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    fn push(&self, job: JobEnvelope, delay: Option<Duration>) {
        let mut state = self.state.lock();
        match delay {
            Some(delay) if !delay.is_zero() => {
                state.seq += 1;
                let key = (Instant::now() + delay, state.seq);
                state.delayed.insert(key, job);
            }
            _ => state.ready.push_back(job),
        }
        drop(state);
        self.notify.notify_one();
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, job: JobEnvelope, delay: Option<Duration>) -> BrokerResult<bool> {
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            let retention = self.retention;
            state.seen.retain(|_, at| now.duration_since(*at) < retention);
            if state.seen.contains_key(&job.job_id) {
                return Ok(false);
            }
            state.seen.insert(job.job_id.clone(), now);
        }
        self.push(job, delay);
        Ok(true)
    }

    async fn next_job(&self) -> BrokerResult<Option<JobEnvelope>> {
        loop {
            let next_due = {
                let mut state = self.state.lock();
                state.promote_due(Instant::now());
                if let Some(job) = state.ready.pop_front() {
                    if !state.ready.is_empty() {
                        // other consumers may be waiting for the rest
                        self.notify.notify_one();
                    }
                    return Ok(Some(job));
                }
                if state.closed {
                    return Ok(None);
                }
                state.next_due()
            };
            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(due)) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    async fn requeue(&self, job: JobEnvelope, delay: Duration) -> BrokerResult<()> {
        self.push(job, Some(delay));
        Ok(())
    }

    async fn forget(&self, job_id: &str) -> BrokerResult<()> {
        let mut state = self.state.lock();
        state.seen.remove(job_id);
        state.ready.retain(|j| j.job_id != job_id);
        state.delayed.retain(|_, j| j.job_id != job_id);
        Ok(())
    }

    async fn outstanding_job_ids(&self) -> BrokerResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .ready
            .iter()
            .map(|j| j.job_id.clone())
            .chain(state.delayed.values().map(|j| j.job_id.clone()))
            .collect())
    }
}
