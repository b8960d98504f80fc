//! Per-campaign key builder.
//!
//! All coordination keys for one campaign live under `campaign:{<id>}`; the
//! brace token is the redis cluster hash tag, grouping the keys onto one
//! shard so server-side scripts that touch several of them stay atomic. No
//! key strings are assembled anywhere else in runtime paths.

use crate::models::{CampaignId, LeaseKind};

/// Builder for every coordination key of one campaign.
#[derive(Debug, Clone)]
pub struct CampaignKeys {
    base: String,
    id: CampaignId,
}

impl CampaignKeys {
    pub fn new(id: &CampaignId) -> Self {
        Self {
            base: format!("campaign:{{{id}}}"),
            id: id.clone(),
        }
    }

    pub fn campaign_id(&self) -> &CampaignId {
        &self.id
    }

    /// Max simultaneous calls, an integer.
    pub fn limit(&self) -> String {
        format!("{}:limit", self.base)
    }

    /// Set of in-flight members (`<callId>` active, `pre-<callId>` pre-dial).
    pub fn leases(&self) -> String {
        format!("{}:leases", self.base)
    }

    /// Proof-of-holding key for one member.
    pub fn lease(&self, member: &str) -> String {
        format!("{}:lease:{member}", self.base)
    }

    /// Prefix of all lease keys, for lookups driven by set members.
    pub fn lease_prefix(&self) -> String {
        format!("{}:lease:", self.base)
    }

    /// Count of promoted-but-unclaimed slots.
    pub fn reserved(&self) -> String {
        format!("{}:reserved", self.base)
    }

    /// Ordered set auditing outstanding reservations.
    pub fn ledger(&self) -> String {
        format!("{}:reserved:ledger", self.base)
    }

    /// High-priority waitlist.
    pub fn waitlist_high(&self) -> String {
        format!("{}:waitlist:high", self.base)
    }

    /// Normal-priority waitlist.
    pub fn waitlist_normal(&self) -> String {
        format!("{}:waitlist:normal", self.base)
    }

    /// Index of call ids currently waitlisted, for idempotent enqueue.
    pub fn waitlist_ids(&self) -> String {
        format!("{}:waitlist:ids", self.base)
    }

    /// Weighted-interleave position.
    pub fn fairness(&self) -> String {
        format!("{}:fairness", self.base)
    }

    /// Single-flight promotion gate.
    pub fn promote_gate(&self) -> String {
        format!("{}:promote-gate", self.base)
    }

    /// Monotonic sequence stamped onto each promoted job.
    pub fn promote_seq(&self) -> String {
        format!("{}:promote-gate:seq", self.base)
    }

    /// Cold-start flag: `blocking` or `done`.
    pub fn cold_start(&self) -> String {
        format!("{}:cold-start", self.base)
    }

    /// Circuit-breaker open flag.
    pub fn circuit(&self) -> String {
        format!("{}:circuit", self.base)
    }

    /// Circuit-breaker sliding failure counter.
    pub fn circuit_failures(&self) -> String {
        format!("{}:cb:fail", self.base)
    }
}

/// Pub/sub channel for slot-available wakeups. Channels are not sharded, so
/// no hash tag here.
pub fn slot_channel(id: &CampaignId) -> String {
    format!("campaign:{id}:slot-available")
}

/// Pattern matching every campaign's slot-available channel.
pub const SLOT_CHANNEL_PATTERN: &str = "campaign:*:slot-available";

/// Extract the campaign id from a slot-available channel name.
pub fn parse_slot_channel(channel: &str) -> Option<CampaignId> {
    let rest = channel.strip_prefix("campaign:")?;
    let id = rest.strip_suffix(":slot-available")?;
    if id.is_empty() {
        None
    } else {
        Some(CampaignId::from(id))
    }
}

/// Member name in the leases set for one call and lease kind.
pub fn lease_member(kind: LeaseKind, call_id: &crate::models::CallId) -> String {
    match kind {
        LeaseKind::PreDial => format!("pre-{call_id}"),
        LeaseKind::Active => call_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CallId;

    #[test]
    fn keys_share_the_hash_tag() {
        let keys = CampaignKeys::new(&CampaignId::from("camp-1"));
        assert_eq!(keys.limit(), "campaign:{camp-1}:limit");
        assert_eq!(keys.leases(), "campaign:{camp-1}:leases");
        assert_eq!(keys.lease("pre-x"), "campaign:{camp-1}:lease:pre-x");
        assert_eq!(keys.ledger(), "campaign:{camp-1}:reserved:ledger");
        assert_eq!(keys.promote_seq(), "campaign:{camp-1}:promote-gate:seq");
        assert_eq!(keys.circuit_failures(), "campaign:{camp-1}:cb:fail");
    }

    #[test]
    fn members_by_kind() {
        let call = CallId::from("abc");
        assert_eq!(lease_member(LeaseKind::PreDial, &call), "pre-abc");
        assert_eq!(lease_member(LeaseKind::Active, &call), "abc");
    }

    #[test]
    fn slot_channel_roundtrip() {
        let cid = CampaignId::from("camp-9");
        let chan = slot_channel(&cid);
        assert_eq!(chan, "campaign:camp-9:slot-available");
        assert_eq!(parse_slot_channel(&chan), Some(cid));
        assert_eq!(parse_slot_channel("campaign::slot-available"), None);
        assert_eq!(parse_slot_channel("other:x:slot-available"), None);
    }
}
