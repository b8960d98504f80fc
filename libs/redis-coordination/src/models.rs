//! Typed models for coordination-store payloads.
//!
//! Waitlist items travel through the store as JSON; the field names here are
//! shared with the server-side admission script, so changes must be made in
//! both places.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Campaign identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CampaignId(String);

/// Call identifier, one per contact attempt lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CallId(String);

macro_rules! string_id {
    ($ty:ident) => {
        impl $ty {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
        impl From<String> for $ty {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(CampaignId);
string_id!(CallId);

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// Sentinel token written onto leases rebuilt by the cold-start guard.
pub const RECOVERED_TOKEN: &str = "recovered";

/// Opaque proof-of-holding for one lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    /// Fresh opaque token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The cold-start sentinel.
    pub fn recovered() -> Self {
        Self(RECOVERED_TOKEN.to_owned())
    }

    pub fn is_recovered(&self) -> bool {
        self.0 == RECOVERED_TOKEN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LeaseToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two lease phases a slot passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKind {
    /// Held between admission and telephony accept.
    PreDial,
    /// Held for the duration of a connected call.
    Active,
}

impl std::fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseKind::PreDial => write!(f, "pre-dial"),
            LeaseKind::Active => write!(f, "active"),
        }
    }
}

/// Stored value of one lease key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseValue {
    pub token: LeaseToken,
    /// First-acquisition timestamp, the base for the pre-dial renewal cap.
    pub acquired_at_ms: i64,
}

// ---------------------------------------------------------------------------
// Waitlist
// ---------------------------------------------------------------------------

/// Admission priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
}

impl Priority {
    /// Ledger-member origin prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            Priority::High => "H",
            Priority::Normal => "N",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
        }
    }
}

/// A contact waiting for a slot. This is the explicit, versioned descriptor
/// that travels through the waitlist and onto broker jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistItem {
    /// Call id for the attempt this item will become.
    pub call_id: CallId,
    /// Contact reference in the persistent store.
    pub contact_ref: String,
    /// Conversational agent reference.
    pub agent_ref: String,
    /// Source phone identity.
    pub phone_ref: String,
    /// Zero-based attempt counter.
    pub retry_count: u32,
    /// Admission class.
    pub priority: Priority,
    /// Enqueue timestamp.
    pub enqueued_at: DateTime<Utc>,
}

/// Broker job id for one dial attempt. Stable across promoter and worker so
/// the broker's per-job uniqueness and the reservation ledger agree.
pub fn dial_job_id(cid: &CampaignId, call_id: &CallId, retry_count: u32) -> String {
    format!("dial:{cid}:{call_id}:{retry_count}")
}

/// Ledger member for a promoted job: origin prefix plus job id.
pub fn ledger_member(priority: Priority, job_id: &str) -> String {
    format!("{}:{job_id}", priority.prefix())
}

/// One outstanding entry in the reservation ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// `<origin>:<jobId>` member string.
    pub member: String,
    /// Reservation timestamp, milliseconds since epoch.
    pub scored_at_ms: i64,
}

impl LedgerEntry {
    /// The job id without the origin prefix.
    pub fn job_id(&self) -> &str {
        self.member.splitn(2, ':').nth(1).unwrap_or(&self.member)
    }

    /// The origin class, if the prefix is well formed.
    pub fn origin(&self) -> Option<Priority> {
        match self.member.split(':').next() {
            Some("H") => Some(Priority::High),
            Some("N") => Some(Priority::Normal),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Promotion
// ---------------------------------------------------------------------------

/// One admitted job with its monotonic promotion sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotedJob {
    pub item: WaitlistItem,
    pub promote_seq: u64,
}

/// Result of one `reserve_promote` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromoteBatch {
    /// Highest promote sequence observed in this pass.
    pub seq: u64,
    /// Jobs to submit to the broker, reservation already debited.
    pub promoted: Vec<PromotedJob>,
    /// Items that failed post-pop validity checks; the caller re-pushes
    /// these to the head of their waitlist.
    pub push_back: Vec<WaitlistItem>,
}

impl PromoteBatch {
    pub fn count(&self) -> usize {
        self.promoted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.push_back.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Slot accounting & cold start
// ---------------------------------------------------------------------------

/// Occupancy snapshot for one campaign.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotCounts {
    /// Cardinality of the leases set (pre-dial plus active members).
    pub leases: u32,
    /// Promoted-but-unclaimed reservations.
    pub reserved: u32,
}

impl SlotCounts {
    pub fn in_flight(&self) -> u32 {
        self.leases + self.reserved
    }
}

/// Cold-start flag states. `Unknown` means the key is absent, i.e. the store
/// has no memory of this campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdStart {
    Unknown,
    Blocking,
    Done,
}

impl ColdStart {
    pub fn is_blocking(&self) -> bool {
        matches!(self, ColdStart::Blocking)
    }
}

impl std::fmt::Display for ColdStart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColdStart::Unknown => write!(f, "unknown"),
            ColdStart::Blocking => write!(f, "blocking"),
            ColdStart::Done => write!(f, "done"),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

/// Encode a model value to a JSON string for store transport.
pub fn encode<T: Serialize>(value: &T) -> CoordinationResult<String> {
    serde_json::to_string(value).map_err(|e| CoordinationError::Codec(e.to_string()))
}

/// Decode a JSON string from store transport into a typed model.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &str) -> CoordinationResult<T> {
    serde_json::from_str(data).map_err(|e| CoordinationError::Codec(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
