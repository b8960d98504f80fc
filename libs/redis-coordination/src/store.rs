//! The coordination-store interface.
//!
//! Each method is one atomic unit: backends must guarantee that no other
//! store client can observe an intermediate state of a single call. That is
//! what makes the admission invariant (`card(leases) + reserved <= limit`)
//! enforceable with plain sequential client code.
//!
//! Contended outcomes are values (`None`, `false`, `0`), never errors.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::CoordinationResult;
use crate::models::{
    CallId, CampaignId, ColdStart, LeaseKind, LeaseToken, LedgerEntry, Priority, PromoteBatch,
    SlotCounts, WaitlistItem,
};

/// Atomic per-campaign coordination operations.
///
/// Implemented by [`MemoryStore`](crate::memory::MemoryStore) for
/// single-process deployments and tests, and by
/// [`RedisStore`](crate::redis::RedisStore) for distributed deployments.
#[async_trait]
pub trait CoordinationStore: Send + Sync + std::fmt::Debug + 'static {
    // --- lease manager -----------------------------------------------------

    /// Seed the campaign limit if absent and, if a slot is free, add the
    /// pre-dial member and write its lease key. Returns the fresh token, or
    /// `None` when the campaign is full or the call already holds a lease.
    async fn acquire_pre(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        limit: u32,
    ) -> CoordinationResult<Option<LeaseToken>>;

    /// Swap the pre-dial member for the active member and return the fresh
    /// active token. Idempotent: if the active lease for this call already
    /// exists its token is returned. `None` means the pre-dial lease is gone
    /// (lost race or reclaimed).
    async fn upgrade(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        pre_token: &LeaseToken,
    ) -> CoordinationResult<Option<LeaseToken>>;

    /// Token-checked release. Returns `false` when the token does not match
    /// (double release, or the lease was reclaimed). Publishes a
    /// slot-available wakeup when `publish` is set and a slot was freed.
    async fn release(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        token: &LeaseToken,
        kind: LeaseKind,
        publish: bool,
    ) -> CoordinationResult<bool>;

    /// Tokenless release for webhook paths: tries the active member first,
    /// then pre-dial. Always publishes on success.
    async fn force_release(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
    ) -> CoordinationResult<Option<LeaseKind>>;

    /// Extend a lease TTL iff the token matches. The recovered sentinel is
    /// accepted only while the campaign's cold-start flag is blocking.
    async fn renew(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        token: &LeaseToken,
        kind: LeaseKind,
        ttl: Duration,
    ) -> CoordinationResult<bool>;

    /// Renew a pre-dial lease without ever extending it past the hard
    /// pre-dial cap measured from first acquisition.
    async fn renew_pre_capped(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        token: &LeaseToken,
    ) -> CoordinationResult<bool>;

    /// Unconditional pre-dial admission, bypassing the limit check. Last
    /// resort for jobs that repeatedly fail gate repair; the caller is
    /// expected to log and count every use.
    async fn hard_sync_pre(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
    ) -> CoordinationResult<LeaseToken>;

    // --- reservation ledger ------------------------------------------------

    /// Remove both origin spellings of a job from the ledger and credit
    /// `reserved` back, clamped at zero. Returns the number of entries
    /// removed; `0` means replay.
    async fn claim_reservation(&self, cid: &CampaignId, job_id: &str) -> CoordinationResult<u32>;

    /// Unconditional clamped decrement of `reserved`. Janitor and
    /// reclaimed-reservation paths only.
    async fn decr_reserved(&self, cid: &CampaignId, n: u32) -> CoordinationResult<()>;

    // --- waitlist ----------------------------------------------------------

    /// Append to the tail of the item's priority queue. Idempotent by call
    /// id across waitlists, ledger, and leases; returns `false` on duplicate.
    async fn enqueue_waitlist(
        &self,
        cid: &CampaignId,
        item: &WaitlistItem,
    ) -> CoordinationResult<bool>;

    /// The admission script: pop up to `min(max_batch, free_slots)` items in
    /// the configured weighted interleave, debit `reserved`, stamp each with
    /// a promote sequence, and record ledger entries.
    async fn reserve_promote(
        &self,
        cid: &CampaignId,
        max_batch: u32,
    ) -> CoordinationResult<PromoteBatch>;

    /// Re-queue items at the head of their priority queues, preserving order.
    async fn push_back_front(
        &self,
        cid: &CampaignId,
        items: &[WaitlistItem],
    ) -> CoordinationResult<()>;

    async fn waitlist_len(&self, cid: &CampaignId, priority: Priority) -> CoordinationResult<u64>;

    /// Non-destructive read of the first `n` items of one queue.
    async fn waitlist_peek(
        &self,
        cid: &CampaignId,
        priority: Priority,
        n: usize,
    ) -> CoordinationResult<Vec<WaitlistItem>>;

    // --- promotion gate ----------------------------------------------------

    /// Set-if-absent acquisition of the single-flight promotion gate.
    async fn acquire_promote_gate(&self, cid: &CampaignId)
        -> CoordinationResult<Option<LeaseToken>>;

    /// Release the gate iff the token matches.
    async fn release_promote_gate(
        &self,
        cid: &CampaignId,
        token: &LeaseToken,
    ) -> CoordinationResult<bool>;

    // --- limit & occupancy -------------------------------------------------

    /// Operator-driven limit update. Lowering below current occupancy does
    /// not evict; it only blocks new admissions until drained.
    async fn set_limit(&self, cid: &CampaignId, limit: u32) -> CoordinationResult<()>;

    async fn slot_counts(&self, cid: &CampaignId) -> CoordinationResult<SlotCounts>;

    // --- cold start --------------------------------------------------------

    async fn cold_start_state(&self, cid: &CampaignId) -> CoordinationResult<ColdStart>;

    async fn set_cold_start(&self, cid: &CampaignId, state: ColdStart) -> CoordinationResult<()>;

    /// Re-add a member with the recovered sentinel during reconstruction.
    async fn rebuild_lease(&self, cid: &CampaignId, call_id: &CallId) -> CoordinationResult<()>;

    /// Members still carrying the recovered sentinel.
    async fn recovered_members(&self, cid: &CampaignId) -> CoordinationResult<Vec<String>>;

    // --- janitor -----------------------------------------------------------

    async fn lease_members(&self, cid: &CampaignId) -> CoordinationResult<Vec<String>>;

    /// Whether the proof-of-holding key for a member still exists.
    async fn lease_exists(&self, cid: &CampaignId, member: &str) -> CoordinationResult<bool>;

    /// Remove a member and its key, without a token check. Janitor only.
    async fn remove_lease_member(&self, cid: &CampaignId, member: &str)
        -> CoordinationResult<bool>;

    async fn ledger_entries_older_than(
        &self,
        cid: &CampaignId,
        age: Duration,
    ) -> CoordinationResult<Vec<LedgerEntry>>;

    /// Remove one ledger entry and credit `reserved` back. Returns `false`
    /// if the entry was already gone.
    async fn reap_ledger_entry(&self, cid: &CampaignId, member: &str) -> CoordinationResult<bool>;

    // --- circuit breaker ---------------------------------------------------

    /// Record one dispatch failure. Returns `true` when this failure opened
    /// the circuit.
    async fn breaker_record_failure(&self, cid: &CampaignId) -> CoordinationResult<bool>;

    /// Drain the failure window and close the circuit.
    async fn breaker_record_success(&self, cid: &CampaignId) -> CoordinationResult<()>;

    async fn breaker_is_open(&self, cid: &CampaignId) -> CoordinationResult<bool>;

    // --- pub/sub -----------------------------------------------------------

    /// Wake promoters for this campaign.
    async fn publish_slot_available(&self, cid: &CampaignId) -> CoordinationResult<()>;

    /// Subscribe to slot-available wakeups for all campaigns. Deliveries are
    /// coalescable: any message means "run a promoter pass".
    async fn subscribe_slot_available(&self)
        -> CoordinationResult<mpsc::Receiver<CampaignId>>;
}
