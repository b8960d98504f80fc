//! # call-store
//!
//! `call-store` defines a trait [`CallStore`] for reading & updating call
//! records in durable storage.
//!
//! The call store is the system of record for terminal call state: the
//! release reconciler writes a terminal status here before it publishes a
//! slot-available wakeup, and the cold-start guard rebuilds the coordination
//! lease set from the in-flight records it finds here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use redis_coordination::{CallId, CampaignId, LeaseToken};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCallStore;
pub use sqlite::SqliteCallStore;

/// Result type for call-store operations.
pub type CallStoreResult<T> = Result<T, CallStoreError>;

/// Error type for call-store operations.
#[derive(Debug, Error)]
pub enum CallStoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be interpreted.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Lifecycle status of one call record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Contact not yet admitted.
    Pending,
    /// Admitted and waiting for a dispatch worker.
    Queued,
    /// Telephony create-call issued.
    Dialing,
    /// Provider reports ringing.
    Ringing,
    /// Live conversation.
    InProgress,
    Completed,
    Failed,
    NoAnswer,
    Busy,
    Voicemail,
    Canceled,
    /// Dropped without dialing (campaign paused/cancelled).
    Skipped,
}

impl CallStatus {
    /// Statuses that hold a slot; cold-start rebuilds leases from these.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            CallStatus::Dialing | CallStatus::Ringing | CallStatus::InProgress
        )
    }

    /// Statuses after which the record never changes again (except retry
    /// re-queueing, which creates a new attempt).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Failed
                | CallStatus::NoAnswer
                | CallStatus::Busy
                | CallStatus::Voicemail
                | CallStatus::Canceled
                | CallStatus::Skipped
        )
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallStatus::Pending => "pending",
            CallStatus::Queued => "queued",
            CallStatus::Dialing => "dialing",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no_answer",
            CallStatus::Busy => "busy",
            CallStatus::Voicemail => "voicemail",
            CallStatus::Canceled => "canceled",
            CallStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => CallStatus::Pending,
            "queued" => CallStatus::Queued,
            "dialing" => CallStatus::Dialing,
            "ringing" => CallStatus::Ringing,
            "in_progress" => CallStatus::InProgress,
            "completed" => CallStatus::Completed,
            "failed" => CallStatus::Failed,
            "no_answer" => CallStatus::NoAnswer,
            "busy" => CallStatus::Busy,
            "voicemail" => CallStatus::Voicemail,
            "canceled" => CallStatus::Canceled,
            "skipped" => CallStatus::Skipped,
            other => return Err(format!("unknown call status {other:?}")),
        })
    }
}

/// One call attempt record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    pub campaign_id: CampaignId,
    pub contact_ref: String,
    pub agent_ref: String,
    pub phone_ref: String,
    pub to_number: String,
    /// Provider identifier, set the moment telephony accepts the call.
    pub provider_call_id: Option<String>,
    /// Pre-dial lease token, stored so webhook handlers can release.
    pub pre_token: Option<LeaseToken>,
    /// Active lease token, stored after upgrade.
    pub active_token: Option<LeaseToken>,
    pub status: CallStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    /// Fresh record for a new attempt.
    pub fn new(
        id: CallId,
        campaign_id: CampaignId,
        contact_ref: impl Into<String>,
        agent_ref: impl Into<String>,
        phone_ref: impl Into<String>,
        to_number: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            campaign_id,
            contact_ref: contact_ref.into(),
            agent_ref: agent_ref.into(),
            phone_ref: phone_ref.into(),
            to_number: to_number.into(),
            provider_call_id: None,
            pre_token: None,
            active_token: None,
            status: CallStatus::Pending,
            retry_count,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable call-record storage.
#[async_trait]
pub trait CallStore: Send + Sync + std::fmt::Debug + 'static {
    /// Insert or replace a record by id.
    async fn upsert(&self, record: &CallRecord) -> CallStoreResult<()>;

    async fn get(&self, id: &CallId) -> CallStoreResult<Option<CallRecord>>;

    /// Look up by the provider's call identifier, for webhook paths.
    async fn find_by_provider(&self, provider_call_id: &str)
        -> CallStoreResult<Option<CallRecord>>;

    /// Record the provider call id and pre-dial token as soon as telephony
    /// returns, so a webhook racing the worker can still force-release.
    async fn set_provider(
        &self,
        id: &CallId,
        provider_call_id: &str,
        pre_token: &LeaseToken,
    ) -> CallStoreResult<()>;

    /// Store the active lease token after a successful upgrade.
    async fn set_active_token(&self, id: &CallId, token: &LeaseToken) -> CallStoreResult<()>;

    /// Durable status update. Terminal statuses must be written before the
    /// caller publishes slot-available.
    async fn set_status(&self, id: &CallId, status: CallStatus) -> CallStoreResult<()>;

    /// Record a retry decision on a failed attempt.
    async fn mark_retry(
        &self,
        id: &CallId,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> CallStoreResult<()>;

    /// All in-flight calls for a campaign; cold-start ground truth.
    async fn active_calls(&self, campaign_id: &CampaignId) -> CallStoreResult<Vec<CallRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            CallStatus::Pending,
            CallStatus::Queued,
            CallStatus::Dialing,
            CallStatus::Ringing,
            CallStatus::InProgress,
            CallStatus::Completed,
            CallStatus::Failed,
            CallStatus::NoAnswer,
            CallStatus::Busy,
            CallStatus::Voicemail,
            CallStatus::Canceled,
            CallStatus::Skipped,
        ] {
            let parsed: CallStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<CallStatus>().is_err());
    }

    #[test]
    fn in_flight_and_terminal_partition() {
        assert!(CallStatus::Dialing.is_in_flight());
        assert!(CallStatus::InProgress.is_in_flight());
        assert!(!CallStatus::Queued.is_in_flight());
        assert!(!CallStatus::Completed.is_in_flight());
        assert!(CallStatus::NoAnswer.is_terminal());
        assert!(CallStatus::Skipped.is_terminal());
        assert!(!CallStatus::Dialing.is_terminal());
    }
}
