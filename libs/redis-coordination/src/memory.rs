//! In-memory coordination store.
//!
//! Single-process backend for standalone deployments and tests. Every trait
//! method runs as one critical section under a single mutex, which gives the
//! same atomicity the redis backend gets from server-side scripts. Key TTLs
//! are evaluated lazily against `Instant::now()` on each operation, the same
//! observable behavior as redis key expiry: an expired lease key disappears
//! while its set member stays behind for the janitor.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use config::CoreTunables;

use crate::error::CoordinationResult;
use crate::keys::lease_member;
use crate::models::{
    dial_job_id, ledger_member, CallId, CampaignId, ColdStart, LeaseKind, LeaseToken, LedgerEntry,
    Priority, PromoteBatch, PromotedJob, SlotCounts, WaitlistItem,
};
use crate::store::CoordinationStore;

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
struct LeaseVal {
    token: LeaseToken,
    expires_at: Instant,
    acquired_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct Shard {
    limit: Option<u32>,
    /// Set members; survive key expiry until the janitor removes them.
    members: HashSet<String>,
    /// Proof-of-holding keys, member -> value.
    lease_keys: HashMap<String, LeaseVal>,
    reserved: u32,
    /// `<origin>:<jobId>` scored by reservation timestamp.
    ledger: Vec<LedgerEntry>,
    wl_high: VecDeque<WaitlistItem>,
    wl_normal: VecDeque<WaitlistItem>,
    wl_ids: HashSet<CallId>,
    fairness_pos: u32,
    promote_seq: u64,
    gate: Option<(LeaseToken, Instant)>,
    cold_start: Option<(ColdStart, Instant)>,
    breaker_failures: Option<(u32, Instant)>,
    breaker_open_until: Option<Instant>,
}

impl Shard {
    fn purge(&mut self, now: Instant) {
        self.lease_keys.retain(|_, v| v.expires_at > now);
        if matches!(self.gate, Some((_, exp)) if exp <= now) {
            self.gate = None;
        }
        if matches!(self.cold_start, Some((_, exp)) if exp <= now) {
            self.cold_start = None;
        }
        if matches!(self.breaker_failures, Some((_, exp)) if exp <= now) {
            self.breaker_failures = None;
        }
        if matches!(self.breaker_open_until, Some(exp) if exp <= now) {
            self.breaker_open_until = None;
        }
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<WaitlistItem> {
        match priority {
            Priority::High => &mut self.wl_high,
            Priority::Normal => &mut self.wl_normal,
        }
    }

    fn ledger_has_job(&self, job_id: &str) -> bool {
        let h = ledger_member(Priority::High, job_id);
        let n = ledger_member(Priority::Normal, job_id);
        self.ledger.iter().any(|e| e.member == h || e.member == n)
    }

    fn ledger_has_call(&self, cid: &CampaignId, call_id: &CallId) -> bool {
        let needle = format!(":{cid}:{call_id}:");
        self.ledger.iter().any(|e| e.member.contains(&needle))
    }

    fn call_in_flight(&self, cid: &CampaignId, item: &WaitlistItem) -> bool {
        let pre = lease_member(LeaseKind::PreDial, &item.call_id);
        let active = lease_member(LeaseKind::Active, &item.call_id);
        if self.members.contains(&pre) || self.members.contains(&active) {
            return true;
        }
        let job_id = dial_job_id(cid, &item.call_id, item.retry_count);
        self.ledger_has_job(&job_id)
    }
}

/// Single-process in-memory implementation of [`CoordinationStore`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shards: Arc<Mutex<HashMap<CampaignId, Shard>>>,
    events: broadcast::Sender<CampaignId>,
    tunables: CoreTunables,
}

impl MemoryStore {
    pub fn new(tunables: CoreTunables) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            shards: Arc::new(Mutex::new(HashMap::new())),
            events,
            tunables,
        }
    }

    fn with_shard<T>(&self, cid: &CampaignId, f: impl FnOnce(&mut Shard) -> T) -> T {
        let mut shards = self.shards.lock();
        let shard = shards.entry(cid.clone()).or_default();
        shard.purge(Instant::now());
        f(shard)
    }

    fn notify(&self, cid: &CampaignId) {
        // nobody listening is fine
        let _ = self.events.send(cid.clone());
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn acquire_pre(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        limit: u32,
    ) -> CoordinationResult<Option<LeaseToken>> {
        let ttl = self.tunables.pre_dial_ttl;
        Ok(self.with_shard(cid, |shard| {
            shard.limit.get_or_insert(limit);
            let pre = lease_member(LeaseKind::PreDial, call_id);
            let active = lease_member(LeaseKind::Active, call_id);
            if shard.members.contains(&pre) || shard.members.contains(&active) {
                return None;
            }
            let limit = shard.limit.unwrap_or(0);
            if shard.members.len() as u32 + shard.reserved >= limit {
                return None;
            }
            let token = LeaseToken::generate();
            let now = Instant::now();
            shard.members.insert(pre.clone());
            shard.lease_keys.insert(
                pre,
                LeaseVal {
                    token: token.clone(),
                    expires_at: now + ttl,
                    acquired_at: now,
                },
            );
            Some(token)
        }))
    }

    async fn upgrade(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        pre_token: &LeaseToken,
    ) -> CoordinationResult<Option<LeaseToken>> {
        let active_ttl = self.tunables.active_ttl;
        Ok(self.with_shard(cid, |shard| {
            let pre = lease_member(LeaseKind::PreDial, call_id);
            let active = lease_member(LeaseKind::Active, call_id);
            if let Some(existing) = shard.lease_keys.get(&active) {
                // already upgraded; treat as success
                return Some(existing.token.clone());
            }
            match shard.lease_keys.get(&pre) {
                Some(val) if val.token == *pre_token => {}
                _ => return None,
            }
            shard.members.remove(&pre);
            shard.lease_keys.remove(&pre);
            let token = LeaseToken::generate();
            let now = Instant::now();
            shard.members.insert(active.clone());
            shard.lease_keys.insert(
                active,
                LeaseVal {
                    token: token.clone(),
                    expires_at: now + active_ttl,
                    acquired_at: now,
                },
            );
            Some(token)
        }))
    }

    async fn release(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        token: &LeaseToken,
        kind: LeaseKind,
        publish: bool,
    ) -> CoordinationResult<bool> {
        let released = self.with_shard(cid, |shard| {
            let member = lease_member(kind, call_id);
            match shard.lease_keys.get(&member) {
                Some(val) if val.token == *token => {
                    shard.lease_keys.remove(&member);
                    shard.members.remove(&member);
                    true
                }
                _ => false,
            }
        });
        if released && publish {
            self.notify(cid);
        }
        Ok(released)
    }

    async fn force_release(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
    ) -> CoordinationResult<Option<LeaseKind>> {
        let released = self.with_shard(cid, |shard| {
            for kind in [LeaseKind::Active, LeaseKind::PreDial] {
                let member = lease_member(kind, call_id);
                if shard.members.remove(&member) {
                    shard.lease_keys.remove(&member);
                    return Some(kind);
                }
            }
            None
        });
        if released.is_some() {
            self.notify(cid);
        }
        Ok(released)
    }

    async fn renew(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        token: &LeaseToken,
        kind: LeaseKind,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        Ok(self.with_shard(cid, |shard| {
            let member = lease_member(kind, call_id);
            let blocking = matches!(shard.cold_start, Some((ColdStart::Blocking, _)));
            match shard.lease_keys.get_mut(&member) {
                Some(val) if val.token == *token => {
                    if token.is_recovered() && !blocking {
                        return false;
                    }
                    val.expires_at = Instant::now() + ttl;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn renew_pre_capped(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        token: &LeaseToken,
    ) -> CoordinationResult<bool> {
        let ttl = self.tunables.pre_dial_ttl;
        let cap = self.tunables.pre_dial_ttl_max;
        Ok(self.with_shard(cid, |shard| {
            let member = lease_member(LeaseKind::PreDial, call_id);
            match shard.lease_keys.get_mut(&member) {
                Some(val) if val.token == *token => {
                    let now = Instant::now();
                    let target = std::cmp::min(now + ttl, val.acquired_at + cap);
                    if target <= now {
                        return false;
                    }
                    val.expires_at = target;
                    true
                }
                _ => false,
            }
        }))
    }

    async fn hard_sync_pre(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
    ) -> CoordinationResult<LeaseToken> {
        let ttl = self.tunables.pre_dial_ttl;
        Ok(self.with_shard(cid, |shard| {
            let pre = lease_member(LeaseKind::PreDial, call_id);
            let token = LeaseToken::generate();
            let now = Instant::now();
            shard.members.insert(pre.clone());
            shard.lease_keys.insert(
                pre,
                LeaseVal {
                    token: token.clone(),
                    expires_at: now + ttl,
                    acquired_at: now,
                },
            );
            token
        }))
    }

    async fn claim_reservation(&self, cid: &CampaignId, job_id: &str) -> CoordinationResult<u32> {
        Ok(self.with_shard(cid, |shard| {
            let h = ledger_member(Priority::High, job_id);
            let n = ledger_member(Priority::Normal, job_id);
            let before = shard.ledger.len();
            shard.ledger.retain(|e| e.member != h && e.member != n);
            let removed = (before - shard.ledger.len()) as u32;
            shard.reserved = shard.reserved.saturating_sub(removed);
            removed
        }))
    }

    async fn decr_reserved(&self, cid: &CampaignId, n: u32) -> CoordinationResult<()> {
        self.with_shard(cid, |shard| {
            shard.reserved = shard.reserved.saturating_sub(n);
        });
        Ok(())
    }

    async fn enqueue_waitlist(
        &self,
        cid: &CampaignId,
        item: &WaitlistItem,
    ) -> CoordinationResult<bool> {
        Ok(self.with_shard(cid, |shard| {
            let pre = lease_member(LeaseKind::PreDial, &item.call_id);
            let active = lease_member(LeaseKind::Active, &item.call_id);
            if shard.wl_ids.contains(&item.call_id)
                || shard.members.contains(&pre)
                || shard.members.contains(&active)
                || shard.ledger_has_call(cid, &item.call_id)
            {
                return false;
            }
            shard.wl_ids.insert(item.call_id.clone());
            shard.queue_mut(item.priority).push_back(item.clone());
            true
        }))
    }

    async fn reserve_promote(
        &self,
        cid: &CampaignId,
        max_batch: u32,
    ) -> CoordinationResult<PromoteBatch> {
        let f_high = self.tunables.fairness_high;
        let f_normal = self.tunables.fairness_normal;
        Ok(self.with_shard(cid, |shard| {
            let mut batch = PromoteBatch {
                seq: shard.promote_seq,
                ..Default::default()
            };
            let limit = shard.limit.unwrap_or(0);
            let occupied = shard.members.len() as u32 + shard.reserved;
            if occupied >= limit {
                return batch;
            }
            let free = limit - occupied;
            let quota = std::cmp::min(max_batch, free) as usize;
            let cycle = f_high + f_normal;
            let mut pos = shard.fairness_pos % cycle;
            let mut pops = 0usize;
            let avail = shard.wl_high.len() + shard.wl_normal.len();
            let now_ms = Utc::now().timestamp_millis();

            while batch.promoted.len() < quota && pops < avail {
                let item = if pos < f_high {
                    shard
                        .wl_high
                        .pop_front()
                        .or_else(|| shard.wl_normal.pop_front())
                } else {
                    shard
                        .wl_normal
                        .pop_front()
                        .or_else(|| shard.wl_high.pop_front())
                };
                let Some(item) = item else { break };
                pops += 1;
                if shard.call_in_flight(cid, &item) {
                    batch.push_back.push(item);
                    continue;
                }
                shard.promote_seq += 1;
                let seq = shard.promote_seq;
                shard.reserved += 1;
                let job_id = dial_job_id(cid, &item.call_id, item.retry_count);
                shard.ledger.push(LedgerEntry {
                    member: ledger_member(item.priority, &job_id),
                    scored_at_ms: now_ms,
                });
                shard.wl_ids.remove(&item.call_id);
                pos = (pos + 1) % cycle;
                batch.seq = seq;
                batch.promoted.push(PromotedJob {
                    item,
                    promote_seq: seq,
                });
            }
            shard.fairness_pos = pos;
            trace!(
                campaign = %cid,
                admitted = batch.promoted.len(),
                pushed_back = batch.push_back.len(),
                "reserve_promote pass"
            );
            batch
        }))
    }

    async fn push_back_front(
        &self,
        cid: &CampaignId,
        items: &[WaitlistItem],
    ) -> CoordinationResult<()> {
        self.with_shard(cid, |shard| {
            for item in items.iter().rev() {
                shard.queue_mut(item.priority).push_front(item.clone());
            }
        });
        Ok(())
    }

    async fn waitlist_len(&self, cid: &CampaignId, priority: Priority) -> CoordinationResult<u64> {
        Ok(self.with_shard(cid, |shard| shard.queue_mut(priority).len() as u64))
    }

    async fn waitlist_peek(
        &self,
        cid: &CampaignId,
        priority: Priority,
        n: usize,
    ) -> CoordinationResult<Vec<WaitlistItem>> {
        Ok(self.with_shard(cid, |shard| {
            shard.queue_mut(priority).iter().take(n).cloned().collect()
        }))
    }

    async fn acquire_promote_gate(
        &self,
        cid: &CampaignId,
    ) -> CoordinationResult<Option<LeaseToken>> {
        let ttl = self.tunables.gate_ttl;
        Ok(self.with_shard(cid, |shard| {
            if shard.gate.is_some() {
                return None;
            }
            let token = LeaseToken::generate();
            shard.gate = Some((token.clone(), Instant::now() + ttl));
            Some(token)
        }))
    }

    async fn release_promote_gate(
        &self,
        cid: &CampaignId,
        token: &LeaseToken,
    ) -> CoordinationResult<bool> {
        Ok(self.with_shard(cid, |shard| match &shard.gate {
            Some((held, _)) if held == token => {
                shard.gate = None;
                true
            }
            _ => false,
        }))
    }

    async fn set_limit(&self, cid: &CampaignId, limit: u32) -> CoordinationResult<()> {
        self.with_shard(cid, |shard| {
            shard.limit = Some(limit);
        });
        Ok(())
    }

    async fn slot_counts(&self, cid: &CampaignId) -> CoordinationResult<SlotCounts> {
        Ok(self.with_shard(cid, |shard| SlotCounts {
            leases: shard.members.len() as u32,
            reserved: shard.reserved,
        }))
    }

    async fn cold_start_state(&self, cid: &CampaignId) -> CoordinationResult<ColdStart> {
        Ok(self.with_shard(cid, |shard| match shard.cold_start {
            Some((state, _)) => state,
            None => ColdStart::Unknown,
        }))
    }

    async fn set_cold_start(&self, cid: &CampaignId, state: ColdStart) -> CoordinationResult<()> {
        let ttl = match state {
            ColdStart::Blocking => self.tunables.cold_start_blocking,
            ColdStart::Done => self.tunables.cold_start_done,
            ColdStart::Unknown => Duration::ZERO,
        };
        self.with_shard(cid, |shard| {
            shard.cold_start = match state {
                ColdStart::Unknown => None,
                state => Some((state, Instant::now() + ttl)),
            };
        });
        Ok(())
    }

    async fn rebuild_lease(&self, cid: &CampaignId, call_id: &CallId) -> CoordinationResult<()> {
        // sentinel leases survive the grace window, then expire on their own
        let ttl = self.tunables.cold_start_grace;
        self.with_shard(cid, |shard| {
            let member = lease_member(LeaseKind::Active, call_id);
            let now = Instant::now();
            shard.members.insert(member.clone());
            shard.lease_keys.insert(
                member,
                LeaseVal {
                    token: LeaseToken::recovered(),
                    expires_at: now + ttl,
                    acquired_at: now,
                },
            );
        });
        Ok(())
    }

    async fn recovered_members(&self, cid: &CampaignId) -> CoordinationResult<Vec<String>> {
        Ok(self.with_shard(cid, |shard| {
            shard
                .members
                .iter()
                .filter(|m| {
                    shard
                        .lease_keys
                        .get(*m)
                        .map(|v| v.token.is_recovered())
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        }))
    }

    async fn lease_members(&self, cid: &CampaignId) -> CoordinationResult<Vec<String>> {
        Ok(self.with_shard(cid, |shard| shard.members.iter().cloned().collect()))
    }

    async fn lease_exists(&self, cid: &CampaignId, member: &str) -> CoordinationResult<bool> {
        Ok(self.with_shard(cid, |shard| shard.lease_keys.contains_key(member)))
    }

    async fn remove_lease_member(
        &self,
        cid: &CampaignId,
        member: &str,
    ) -> CoordinationResult<bool> {
        Ok(self.with_shard(cid, |shard| {
            shard.lease_keys.remove(member);
            shard.members.remove(member)
        }))
    }

    async fn ledger_entries_older_than(
        &self,
        cid: &CampaignId,
        age: Duration,
    ) -> CoordinationResult<Vec<LedgerEntry>> {
        let cutoff = Utc::now().timestamp_millis() - age.as_millis() as i64;
        Ok(self.with_shard(cid, |shard| {
            shard
                .ledger
                .iter()
                .filter(|e| e.scored_at_ms <= cutoff)
                .cloned()
                .collect()
        }))
    }

    async fn reap_ledger_entry(&self, cid: &CampaignId, member: &str) -> CoordinationResult<bool> {
        Ok(self.with_shard(cid, |shard| {
            let before = shard.ledger.len();
            shard.ledger.retain(|e| e.member != member);
            let removed = before != shard.ledger.len();
            if removed {
                shard.reserved = shard.reserved.saturating_sub(1);
            }
            removed
        }))
    }

    async fn breaker_record_failure(&self, cid: &CampaignId) -> CoordinationResult<bool> {
        let threshold = self.tunables.circuit_threshold;
        let window = self.tunables.circuit_window;
        let cooldown = self.tunables.circuit_cooldown;
        Ok(self.with_shard(cid, |shard| {
            let now = Instant::now();
            let count = match &mut shard.breaker_failures {
                Some((count, _)) => {
                    *count += 1;
                    *count
                }
                None => {
                    shard.breaker_failures = Some((1, now + window));
                    1
                }
            };
            if count >= threshold && shard.breaker_open_until.is_none() {
                shard.breaker_open_until = Some(now + cooldown);
                return true;
            }
            false
        }))
    }

    async fn breaker_record_success(&self, cid: &CampaignId) -> CoordinationResult<()> {
        self.with_shard(cid, |shard| {
            shard.breaker_failures = None;
            shard.breaker_open_until = None;
        });
        Ok(())
    }

    async fn breaker_is_open(&self, cid: &CampaignId) -> CoordinationResult<bool> {
        Ok(self.with_shard(cid, |shard| shard.breaker_open_until.is_some()))
    }

    async fn publish_slot_available(&self, cid: &CampaignId) -> CoordinationResult<()> {
        self.notify(cid);
        Ok(())
    }

    async fn subscribe_slot_available(&self) -> CoordinationResult<mpsc::Receiver<CampaignId>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    // coalescable wakeups; a full channel loses nothing
                    Ok(cid) => {
                        if tx.try_send(cid).is_err() && tx.is_closed() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }
}
