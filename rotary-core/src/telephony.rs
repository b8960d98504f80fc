//! Abstract telephony-provider interface.
//!
//! The core consumes three primitives: create a call, hang one up, and a
//! stream of status transitions delivered by webhook. Everything else about
//! the provider SDK stays outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use call_store::CallStatus;
use redis_coordination::{CallId, CampaignId};

/// Result type for provider operations.
pub type TelephonyResult<T> = Result<T, TelephonyError>;

/// Error type splitting provider failures the way the retry policy needs.
#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    /// 5xx, timeout, rate limit: the campaign retry policy decides.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Invalid number, rejected destination: the contact is done.
    #[error("terminal provider error: {0}")]
    Terminal(String),
}

impl TelephonyError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TelephonyError::Terminal(_))
    }
}

/// Status transitions delivered by the provider webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderCallStatus {
    Queued,
    Ringing,
    InProgress,
    Completed,
    Failed,
    NoAnswer,
    Busy,
    Canceled,
}

impl ProviderCallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderCallStatus::Completed
                | ProviderCallStatus::Failed
                | ProviderCallStatus::NoAnswer
                | ProviderCallStatus::Busy
                | ProviderCallStatus::Canceled
        )
    }

    /// The call-record status this transition maps onto.
    pub fn record_status(&self) -> CallStatus {
        match self {
            ProviderCallStatus::Queued => CallStatus::Dialing,
            ProviderCallStatus::Ringing => CallStatus::Ringing,
            ProviderCallStatus::InProgress => CallStatus::InProgress,
            ProviderCallStatus::Completed => CallStatus::Completed,
            ProviderCallStatus::Failed => CallStatus::Failed,
            ProviderCallStatus::NoAnswer => CallStatus::NoAnswer,
            ProviderCallStatus::Busy => CallStatus::Busy,
            ProviderCallStatus::Canceled => CallStatus::Canceled,
        }
    }
}

impl std::fmt::Display for ProviderCallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderCallStatus::Queued => "queued",
            ProviderCallStatus::Ringing => "ringing",
            ProviderCallStatus::InProgress => "in-progress",
            ProviderCallStatus::Completed => "completed",
            ProviderCallStatus::Failed => "failed",
            ProviderCallStatus::NoAnswer => "no-answer",
            ProviderCallStatus::Busy => "busy",
            ProviderCallStatus::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// One webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub provider_call_id: String,
    pub status: ProviderCallStatus,
}

/// Metadata attached to an outbound call so webhook handlers can correlate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    pub campaign_id: CampaignId,
    pub call_id: CallId,
    pub agent_ref: String,
}

/// The provider seam.
#[async_trait]
pub trait TelephonyProvider: Send + Sync + std::fmt::Debug + 'static {
    /// Start an outbound call; returns the provider call identifier.
    async fn create_call(
        &self,
        from: &str,
        to: &str,
        metadata: CallMetadata,
    ) -> TelephonyResult<String>;

    /// Best-effort hangup of a live call.
    async fn hangup(&self, provider_call_id: &str) -> TelephonyResult<()>;
}
