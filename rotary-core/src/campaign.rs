//! Campaign domain types: runtime definitions, job payloads, and the
//! directory seam to whatever owns campaign CRUD.
//!
//! Contact-level state lives on [`call_store::CallRecord`]; the enums here
//! cover the campaign lifecycle and the explicit job descriptor that travels
//! through the broker.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use config::{CampaignConfig, DialerConfig, PriorityMode, RetryPolicy};
use redis_coordination::{dial_job_id, CallId, CampaignId, Priority, WaitlistItem};

/// Current dial-job payload version.
pub const DIAL_JOB_VERSION: u32 = 1;

/// Campaign lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignState {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignState {
    /// Whether the promoter may admit new contacts.
    pub fn allows_promotion(&self) -> bool {
        matches!(self, CampaignState::Active)
    }

    /// Whether new contacts may still be enqueued.
    pub fn accepts_contacts(&self) -> bool {
        !matches!(self, CampaignState::Cancelled | CampaignState::Completed)
    }

    /// Legal operator transitions.
    pub fn can_transition_to(&self, next: CampaignState) -> bool {
        use CampaignState::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Cancelled)
                | (Paused, Active)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for CampaignState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CampaignState::Draft => "draft",
            CampaignState::Active => "active",
            CampaignState::Paused => "paused",
            CampaignState::Completed => "completed",
            CampaignState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Runtime view of one campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignDefinition {
    pub id: CampaignId,
    pub name: String,
    pub agent_ref: String,
    pub phone_ref: String,
    pub state: CampaignState,
    pub concurrent_limit: u32,
    pub retry: RetryPolicy,
    pub priority_mode: PriorityMode,
}

impl CampaignDefinition {
    pub fn from_config(cfg: &CampaignConfig) -> Self {
        Self {
            id: CampaignId::from(cfg.id.as_str()),
            name: cfg.name.clone(),
            agent_ref: cfg.agent.clone(),
            phone_ref: cfg.from_number.clone(),
            // config-defined campaigns start dialable
            state: CampaignState::Active,
            concurrent_limit: cfg.concurrent_limit,
            retry: RetryPolicy::from(cfg),
            priority_mode: cfg.priority_mode,
        }
    }

    /// Waitlist class for an attempt with the given retry count.
    pub fn priority_for(&self, retry_count: u32) -> Priority {
        match self.priority_mode {
            PriorityMode::Normal => Priority::Normal,
            PriorityMode::High => Priority::High,
            PriorityMode::RetriesHigh => {
                if retry_count > 0 {
                    Priority::High
                } else {
                    Priority::Normal
                }
            }
        }
    }
}

/// The explicit, versioned payload of one dispatch job. Everything the
/// worker needs travels on the job; nothing is looked up by ambient context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialJob {
    pub version: u32,
    pub campaign_id: CampaignId,
    pub call_id: CallId,
    pub contact_ref: String,
    pub agent_ref: String,
    pub phone_ref: String,
    pub retry_count: u32,
    pub priority: Priority,
    /// Monotonic admission stamp; absence is a gate violation.
    pub promote_seq: Option<u64>,
}

impl DialJob {
    pub fn from_item(cid: &CampaignId, item: &WaitlistItem, promote_seq: u64) -> Self {
        Self {
            version: DIAL_JOB_VERSION,
            campaign_id: cid.clone(),
            call_id: item.call_id.clone(),
            contact_ref: item.contact_ref.clone(),
            agent_ref: item.agent_ref.clone(),
            phone_ref: item.phone_ref.clone(),
            retry_count: item.retry_count,
            priority: item.priority,
            promote_seq: Some(promote_seq),
        }
    }

    /// Broker job id; matches the reservation-ledger spelling.
    pub fn job_id(&self) -> String {
        dial_job_id(&self.campaign_id, &self.call_id, self.retry_count)
    }
}

/// Seam to the campaign CRUD surface, which is outside this crate.
#[async_trait]
pub trait CampaignDirectory: Send + Sync + std::fmt::Debug + 'static {
    async fn campaign(&self, id: &CampaignId) -> Option<CampaignDefinition>;

    /// Campaigns the promoter should tick over.
    async fn active_campaigns(&self) -> Vec<CampaignId>;

    /// Every known campaign; paused campaigns still need janitor sweeps.
    async fn all_campaigns(&self) -> Vec<CampaignId>;
}

/// Directory backed by the parsed config file, with in-process state
/// transitions for operator pause/cancel.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    inner: Arc<Mutex<HashMap<CampaignId, CampaignDefinition>>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &DialerConfig) -> Self {
        let dir = Self::new();
        for camp in cfg.campaigns() {
            dir.insert(CampaignDefinition::from_config(camp));
        }
        dir
    }

    pub fn insert(&self, def: CampaignDefinition) {
        self.inner.lock().insert(def.id.clone(), def);
    }

    /// Apply an operator state change; ignored when illegal.
    pub fn set_state(&self, id: &CampaignId, next: CampaignState) -> bool {
        let mut map = self.inner.lock();
        match map.get_mut(id) {
            Some(def) if def.state.can_transition_to(next) => {
                def.state = next;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl CampaignDirectory for StaticDirectory {
    async fn campaign(&self, id: &CampaignId) -> Option<CampaignDefinition> {
        self.inner.lock().get(id).cloned()
    }

    async fn active_campaigns(&self) -> Vec<CampaignId> {
        self.inner
            .lock()
            .values()
            .filter(|def| def.state.allows_promotion())
            .map(|def| def.id.clone())
            .collect()
    }

    async fn all_campaigns(&self) -> Vec<CampaignId> {
        self.inner.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn definition(mode: PriorityMode) -> CampaignDefinition {
        CampaignDefinition {
            id: CampaignId::from("k"),
            name: "test".into(),
            agent_ref: "agent-a".into(),
            phone_ref: "+15550100".into(),
            state: CampaignState::Active,
            concurrent_limit: 3,
            retry: RetryPolicy {
                retry_failed: true,
                max_retry_attempts: 3,
                retry_delay: std::time::Duration::from_secs(60),
                exclude_voicemail: false,
            },
            priority_mode: mode,
        }
    }

    #[test]
    fn campaign_state_transitions() {
        use CampaignState::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Draft.can_transition_to(Paused));
    }

    #[test]
    fn priority_mode_mapping() {
        assert_eq!(
            definition(PriorityMode::Normal).priority_for(0),
            Priority::Normal
        );
        assert_eq!(
            definition(PriorityMode::High).priority_for(0),
            Priority::High
        );
        let retries_high = definition(PriorityMode::RetriesHigh);
        assert_eq!(retries_high.priority_for(0), Priority::Normal);
        assert_eq!(retries_high.priority_for(1), Priority::High);
    }

    #[test]
    fn dial_job_roundtrip_and_id() {
        let cid = CampaignId::from("k");
        let item = WaitlistItem {
            call_id: CallId::from("c1"),
            contact_ref: "contact-1".into(),
            agent_ref: "agent-a".into(),
            phone_ref: "+15550100".into(),
            retry_count: 2,
            priority: Priority::High,
            enqueued_at: Utc::now(),
        };
        let job = DialJob::from_item(&cid, &item, 9);
        assert_eq!(job.version, DIAL_JOB_VERSION);
        assert_eq!(job.promote_seq, Some(9));
        assert_eq!(job.job_id(), "dial:k:c1:2");

        let json = serde_json::to_string(&job).unwrap();
        let back: DialJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    #[tokio::test]
    async fn static_directory_state_changes() {
        let dir = StaticDirectory::new();
        dir.insert(definition(PriorityMode::Normal));
        let cid = CampaignId::from("k");

        assert_eq!(dir.active_campaigns().await, vec![cid.clone()]);
        assert!(dir.set_state(&cid, CampaignState::Paused));
        assert!(dir.active_campaigns().await.is_empty());
        // illegal transition refused
        assert!(!dir.set_state(&cid, CampaignState::Completed));
        assert!(dir.set_state(&cid, CampaignState::Active));
    }
}
