//! Redis-backed coordination store.
//!
//! Every multi-key transition is one Lua script, and all keys for a campaign
//! share the `campaign:{<id>}` hash tag, so each script executes on a single
//! shard and is atomic with respect to every other client. `redis::Script`
//! sends `EVALSHA` and transparently reloads the script source on `NOSCRIPT`,
//! which covers server restarts.
//!
//! Waitlist items and lease values are JSON; the scripts decode them with
//! `cjson` and must agree with the field names in [`crate::models`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use config::CoreTunables;

use crate::error::{CoordinationError, CoordinationResult};
use crate::keys::{
    lease_member, parse_slot_channel, slot_channel, CampaignKeys, SLOT_CHANNEL_PATTERN,
};
use crate::models::{
    decode, dial_job_id, encode, ledger_member, CallId, CampaignId, ColdStart, LeaseKind,
    LeaseToken, LeaseValue, LedgerEntry, Priority, PromoteBatch, PromotedJob, SlotCounts,
    WaitlistItem, RECOVERED_TOKEN,
};
use crate::store::CoordinationStore;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Keep the ledger and sequence keys alive well past any reservation TTL;
/// they are refreshed on every promotion pass.
const BOOKKEEPING_TTL_MS: i64 = 24 * 60 * 60 * 1000;

// --- scripts ---------------------------------------------------------------

/// KEYS: limit, leases, reserved, lease_pre
/// ARGV: limit_seed, pre_member, active_member, value_json, ttl_ms
const ACQUIRE_PRE: &str = r#"
redis.call('SET', KEYS[1], ARGV[1], 'NX')
if redis.call('SISMEMBER', KEYS[2], ARGV[2]) == 1
    or redis.call('SISMEMBER', KEYS[2], ARGV[3]) == 1 then
  return 0
end
local limit = tonumber(redis.call('GET', KEYS[1]))
local card = redis.call('SCARD', KEYS[2])
local reserved = tonumber(redis.call('GET', KEYS[3]) or '0')
if card + reserved >= limit then
  return 0
end
redis.call('SADD', KEYS[2], ARGV[2])
redis.call('SET', KEYS[4], ARGV[4], 'PX', ARGV[5])
return 1
"#;

/// KEYS: leases, lease_pre, lease_active
/// ARGV: pre_member, active_member, pre_token, new_value_json, active_ttl_ms
const UPGRADE: &str = r#"
local active = redis.call('GET', KEYS[3])
if active then
  return cjson.decode(active).token
end
local pre = redis.call('GET', KEYS[2])
if not pre then
  return false
end
if cjson.decode(pre).token ~= ARGV[3] then
  return false
end
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('DEL', KEYS[2])
redis.call('SADD', KEYS[1], ARGV[2])
redis.call('SET', KEYS[3], ARGV[4], 'PX', ARGV[5])
return cjson.decode(ARGV[4]).token
"#;

/// KEYS: leases, lease_key
/// ARGV: member, token, publish, channel
const RELEASE: &str = r#"
local val = redis.call('GET', KEYS[2])
if not val or cjson.decode(val).token ~= ARGV[2] then
  return 0
end
redis.call('DEL', KEYS[2])
redis.call('SREM', KEYS[1], ARGV[1])
if ARGV[3] == '1' then
  redis.call('PUBLISH', ARGV[4], '1')
end
return 1
"#;

/// KEYS: leases, lease_active, lease_pre
/// ARGV: active_member, pre_member, channel
const FORCE_RELEASE: &str = r#"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  redis.call('SREM', KEYS[1], ARGV[1])
  redis.call('DEL', KEYS[2])
  redis.call('PUBLISH', ARGV[3], '1')
  return 'active'
end
if redis.call('SISMEMBER', KEYS[1], ARGV[2]) == 1 then
  redis.call('SREM', KEYS[1], ARGV[2])
  redis.call('DEL', KEYS[3])
  redis.call('PUBLISH', ARGV[3], '1')
  return 'pre'
end
return false
"#;

/// KEYS: lease_key, cold_start
/// ARGV: token, ttl_ms, recovered_sentinel
const RENEW: &str = r#"
local val = redis.call('GET', KEYS[1])
if not val then
  return 0
end
local cur = cjson.decode(val)
if ARGV[1] == ARGV[3] then
  if redis.call('GET', KEYS[2]) ~= 'blocking' or cur.token ~= ARGV[3] then
    return 0
  end
elseif cur.token ~= ARGV[1] then
  return 0
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#;

/// KEYS: lease_key
/// ARGV: token, ttl_ms, cap_ms, now_ms
const RENEW_PRE_CAPPED: &str = r#"
local val = redis.call('GET', KEYS[1])
if not val then
  return 0
end
local cur = cjson.decode(val)
if cur.token ~= ARGV[1] then
  return 0
end
local now = tonumber(ARGV[4])
local target = now + tonumber(ARGV[2])
local cap = cur.acquired_at_ms + tonumber(ARGV[3])
if cap < target then
  target = cap
end
if target <= now then
  return 0
end
redis.call('PEXPIREAT', KEYS[1], target)
return 1
"#;

/// KEYS: ledger, reserved
/// ARGV: h_member, n_member
const CLAIM: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1]) + redis.call('ZREM', KEYS[1], ARGV[2])
if removed > 0 then
  if redis.call('DECRBY', KEYS[2], removed) < 0 then
    redis.call('SET', KEYS[2], '0')
  end
end
return removed
"#;

/// KEYS: reserved
/// ARGV: n
const DECR_RESERVED: &str = r#"
if redis.call('DECRBY', KEYS[1], ARGV[1]) < 0 then
  redis.call('SET', KEYS[1], '0')
end
return 1
"#;

/// KEYS: wl_high, wl_normal, wl_ids, ledger, leases
/// ARGV: item_json, call_id, priority, pre_member, active_member, call_needle
const ENQUEUE: &str = r#"
if redis.call('SISMEMBER', KEYS[3], ARGV[2]) == 1 then
  return 0
end
if redis.call('SISMEMBER', KEYS[5], ARGV[4]) == 1
    or redis.call('SISMEMBER', KEYS[5], ARGV[5]) == 1 then
  return 0
end
for _, m in ipairs(redis.call('ZRANGE', KEYS[4], 0, -1)) do
  if string.find(m, ARGV[6], 1, true) then
    return 0
  end
end
if ARGV[3] == 'high' then
  redis.call('RPUSH', KEYS[1], ARGV[1])
else
  redis.call('RPUSH', KEYS[2], ARGV[1])
end
redis.call('SADD', KEYS[3], ARGV[2])
return 1
"#;

/// KEYS: limit, leases, reserved, ledger, wl_high, wl_normal, wl_ids,
///       fairness, promote_seq
/// ARGV: max_batch, now_ms, f_high, f_normal, campaign_id, bookkeeping_ttl_ms
///
/// Returns the whole batch as one JSON document assembled by concatenating
/// the already-JSON item payloads, so empty arrays stay arrays.
const RESERVE_PROMOTE: &str = r#"
local last_seq = tonumber(redis.call('GET', KEYS[9]) or '0')
local promoted = {}
local push_back = {}
local limit = tonumber(redis.call('GET', KEYS[1]) or '0')
local card = redis.call('SCARD', KEYS[2])
local reserved = tonumber(redis.call('GET', KEYS[3]) or '0')
local free = limit - card - reserved
if free > 0 then
  local quota = tonumber(ARGV[1])
  if free < quota then quota = free end
  local fh = tonumber(ARGV[3])
  local cycle = fh + tonumber(ARGV[4])
  local pos = tonumber(redis.call('GET', KEYS[8]) or '0') % cycle
  local avail = redis.call('LLEN', KEYS[5]) + redis.call('LLEN', KEYS[6])
  local admitted = 0
  local pops = 0
  while admitted < quota and pops < avail do
    local item_json
    if pos < fh then
      item_json = redis.call('LPOP', KEYS[5]) or redis.call('LPOP', KEYS[6])
    else
      item_json = redis.call('LPOP', KEYS[6]) or redis.call('LPOP', KEYS[5])
    end
    if not item_json then break end
    pops = pops + 1
    local item = cjson.decode(item_json)
    local call = item.call_id
    local job_id = 'dial:' .. ARGV[5] .. ':' .. call .. ':' .. tostring(item.retry_count)
    local in_flight = redis.call('SISMEMBER', KEYS[2], call) == 1
        or redis.call('SISMEMBER', KEYS[2], 'pre-' .. call) == 1
        or redis.call('ZSCORE', KEYS[4], 'H:' .. job_id)
        or redis.call('ZSCORE', KEYS[4], 'N:' .. job_id)
    if in_flight then
      table.insert(push_back, item_json)
    else
      local seq = redis.call('INCR', KEYS[9])
      redis.call('INCRBY', KEYS[3], 1)
      local prefix = 'N'
      if item.priority == 'high' then prefix = 'H' end
      redis.call('ZADD', KEYS[4], tonumber(ARGV[2]), prefix .. ':' .. job_id)
      redis.call('SREM', KEYS[7], call)
      admitted = admitted + 1
      pos = (pos + 1) % cycle
      last_seq = seq
      table.insert(promoted, '{"promote_seq":' .. tostring(seq) .. ',"item":' .. item_json .. '}')
    end
  end
  redis.call('SET', KEYS[8], tostring(pos))
end
redis.call('PEXPIRE', KEYS[4], ARGV[6])
redis.call('PEXPIRE', KEYS[9], ARGV[6])
return '{"seq":' .. tostring(last_seq)
    .. ',"promoted":[' .. table.concat(promoted, ',')
    .. '],"push_back":[' .. table.concat(push_back, ',') .. ']}'
"#;

/// KEYS: wl_high, wl_normal
/// ARGV: priority_1, item_1, priority_2, item_2, ... (already reversed)
const PUSH_BACK_FRONT: &str = r#"
for i = 1, #ARGV, 2 do
  if ARGV[i] == 'high' then
    redis.call('LPUSH', KEYS[1], ARGV[i + 1])
  else
    redis.call('LPUSH', KEYS[2], ARGV[i + 1])
  end
end
return 1
"#;

/// KEYS: gate
/// ARGV: token
const RELEASE_GATE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// KEYS: leases, lease_active
/// ARGV: member, value_json, ttl_ms
const REBUILD_LEASE: &str = r#"
redis.call('SADD', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[3])
return 1
"#;

/// KEYS: leases
/// ARGV: lease_key_prefix, recovered_sentinel
///
/// Lease keys are derived from set members; they all carry the campaign hash
/// tag, so the derived reads stay on this shard.
const RECOVERED_MEMBERS: &str = r#"
local out = {}
for _, m in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local v = redis.call('GET', ARGV[1] .. m)
  if v and cjson.decode(v).token == ARGV[2] then
    table.insert(out, m)
  end
end
return out
"#;

/// KEYS: leases, lease_key
/// ARGV: member
const REMOVE_MEMBER: &str = r#"
redis.call('DEL', KEYS[2])
return redis.call('SREM', KEYS[1], ARGV[1])
"#;

/// KEYS: ledger, reserved
/// ARGV: member
const REAP_LEDGER: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 1 then
  if redis.call('DECRBY', KEYS[2], 1) < 0 then
    redis.call('SET', KEYS[2], '0')
  end
end
return removed
"#;

/// KEYS: cb_fail, circuit
/// ARGV: threshold, window_ms, cooldown_ms
const BREAKER_FAILURE: &str = r#"
local n = redis.call('INCR', KEYS[1])
if n == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
if n >= tonumber(ARGV[1]) and redis.call('EXISTS', KEYS[2]) == 0 then
  redis.call('SET', KEYS[2], 'open', 'PX', ARGV[3])
  return 1
end
return 0
"#;

/// KEYS: leases, reserved
const SLOT_COUNTS: &str = r#"
return { redis.call('SCARD', KEYS[1]), tonumber(redis.call('GET', KEYS[2]) or '0') }
"#;

// --- wire shapes -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PromotedWire {
    promote_seq: u64,
    item: WaitlistItem,
}

#[derive(Debug, Deserialize)]
struct PromoteBatchWire {
    seq: u64,
    promoted: Vec<PromotedWire>,
    push_back: Vec<WaitlistItem>,
}

// --- store -----------------------------------------------------------------

/// Distributed implementation of [`CoordinationStore`] on redis.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    tunables: CoreTunables,
    response_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

fn transport(e: redis::RedisError) -> CoordinationError {
    CoordinationError::Transport(e.to_string())
}

impl RedisStore {
    /// Connect to redis and build the store.
    pub async fn connect(
        url: &str,
        response_timeout: Duration,
        tunables: CoreTunables,
    ) -> CoordinationResult<Self> {
        let client =
            Client::open(url).map_err(|e| CoordinationError::Config(format!("redis url: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(transport)?;
        debug!("redis coordination store connected");
        Ok(Self {
            client,
            conn,
            tunables,
            response_timeout,
        })
    }

    async fn run<T, F>(&self, what: &str, fut: F) -> CoordinationResult<T>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.response_timeout, fut).await {
            Ok(res) => res.map_err(transport),
            Err(_) => Err(CoordinationError::Timeout(format!(
                "{what} exceeded {:?}",
                self.response_timeout
            ))),
        }
    }

    fn lease_value_json(&self, token: &LeaseToken) -> CoordinationResult<String> {
        encode(&LeaseValue {
            token: token.clone(),
            acquired_at_ms: Utc::now().timestamp_millis(),
        })
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn acquire_pre(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        limit: u32,
    ) -> CoordinationResult<Option<LeaseToken>> {
        let keys = CampaignKeys::new(cid);
        let pre = lease_member(LeaseKind::PreDial, call_id);
        let active = lease_member(LeaseKind::Active, call_id);
        let token = LeaseToken::generate();
        let value = self.lease_value_json(&token)?;
        let mut conn = self.conn.clone();
        let script = Script::new(ACQUIRE_PRE);
        let granted: i64 = self
            .run(
                "acquire_pre",
                script
                    .key(keys.limit())
                    .key(keys.leases())
                    .key(keys.reserved())
                    .key(keys.lease(&pre))
                    .arg(limit)
                    .arg(&pre)
                    .arg(&active)
                    .arg(&value)
                    .arg(self.tunables.pre_dial_ttl.as_millis() as u64)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok((granted == 1).then_some(token))
    }

    async fn upgrade(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        pre_token: &LeaseToken,
    ) -> CoordinationResult<Option<LeaseToken>> {
        let keys = CampaignKeys::new(cid);
        let pre = lease_member(LeaseKind::PreDial, call_id);
        let active = lease_member(LeaseKind::Active, call_id);
        let token = LeaseToken::generate();
        let value = self.lease_value_json(&token)?;
        let mut conn = self.conn.clone();
        let script = Script::new(UPGRADE);
        let granted: Option<String> = self
            .run(
                "upgrade",
                script
                    .key(keys.leases())
                    .key(keys.lease(&pre))
                    .key(keys.lease(&active))
                    .arg(&pre)
                    .arg(&active)
                    .arg(pre_token.as_str())
                    .arg(&value)
                    .arg(self.tunables.active_ttl.as_millis() as u64)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(granted.map(|t| LeaseToken::from(t.as_str())))
    }

    async fn release(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        token: &LeaseToken,
        kind: LeaseKind,
        publish: bool,
    ) -> CoordinationResult<bool> {
        let keys = CampaignKeys::new(cid);
        let member = lease_member(kind, call_id);
        let mut conn = self.conn.clone();
        let script = Script::new(RELEASE);
        let released: i64 = self
            .run(
                "release",
                script
                    .key(keys.leases())
                    .key(keys.lease(&member))
                    .arg(&member)
                    .arg(token.as_str())
                    .arg(if publish { "1" } else { "0" })
                    .arg(slot_channel(cid))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(released == 1)
    }

    async fn force_release(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
    ) -> CoordinationResult<Option<LeaseKind>> {
        let keys = CampaignKeys::new(cid);
        let pre = lease_member(LeaseKind::PreDial, call_id);
        let active = lease_member(LeaseKind::Active, call_id);
        let mut conn = self.conn.clone();
        let script = Script::new(FORCE_RELEASE);
        let released: Option<String> = self
            .run(
                "force_release",
                script
                    .key(keys.leases())
                    .key(keys.lease(&active))
                    .key(keys.lease(&pre))
                    .arg(&active)
                    .arg(&pre)
                    .arg(slot_channel(cid))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(match released.as_deref() {
            Some("active") => Some(LeaseKind::Active),
            Some("pre") => Some(LeaseKind::PreDial),
            Some(other) => {
                return Err(CoordinationError::Protocol(format!(
                    "force_release returned {other:?}"
                )))
            }
            None => None,
        })
    }

    async fn renew(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        token: &LeaseToken,
        kind: LeaseKind,
        ttl: Duration,
    ) -> CoordinationResult<bool> {
        let keys = CampaignKeys::new(cid);
        let member = lease_member(kind, call_id);
        let mut conn = self.conn.clone();
        let script = Script::new(RENEW);
        let renewed: i64 = self
            .run(
                "renew",
                script
                    .key(keys.lease(&member))
                    .key(keys.cold_start())
                    .arg(token.as_str())
                    .arg(ttl.as_millis() as u64)
                    .arg(RECOVERED_TOKEN)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(renewed == 1)
    }

    async fn renew_pre_capped(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
        token: &LeaseToken,
    ) -> CoordinationResult<bool> {
        let keys = CampaignKeys::new(cid);
        let member = lease_member(LeaseKind::PreDial, call_id);
        let mut conn = self.conn.clone();
        let script = Script::new(RENEW_PRE_CAPPED);
        let renewed: i64 = self
            .run(
                "renew_pre_capped",
                script
                    .key(keys.lease(&member))
                    .arg(token.as_str())
                    .arg(self.tunables.pre_dial_ttl.as_millis() as u64)
                    .arg(self.tunables.pre_dial_ttl_max.as_millis() as u64)
                    .arg(Utc::now().timestamp_millis())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(renewed == 1)
    }

    async fn hard_sync_pre(
        &self,
        cid: &CampaignId,
        call_id: &CallId,
    ) -> CoordinationResult<LeaseToken> {
        let keys = CampaignKeys::new(cid);
        let member = lease_member(LeaseKind::PreDial, call_id);
        let token = LeaseToken::generate();
        let value = self.lease_value_json(&token)?;
        let mut conn = self.conn.clone();
        let script = Script::new(REBUILD_LEASE);
        let _: i64 = self
            .run(
                "hard_sync_pre",
                script
                    .key(keys.leases())
                    .key(keys.lease(&member))
                    .arg(&member)
                    .arg(&value)
                    .arg(self.tunables.pre_dial_ttl.as_millis() as u64)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(token)
    }

    async fn claim_reservation(&self, cid: &CampaignId, job_id: &str) -> CoordinationResult<u32> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let script = Script::new(CLAIM);
        let removed: i64 = self
            .run(
                "claim_reservation",
                script
                    .key(keys.ledger())
                    .key(keys.reserved())
                    .arg(ledger_member(Priority::High, job_id))
                    .arg(ledger_member(Priority::Normal, job_id))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(removed as u32)
    }

    async fn decr_reserved(&self, cid: &CampaignId, n: u32) -> CoordinationResult<()> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let script = Script::new(DECR_RESERVED);
        let _: i64 = self
            .run(
                "decr_reserved",
                script
                    .key(keys.reserved())
                    .arg(n)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn enqueue_waitlist(
        &self,
        cid: &CampaignId,
        item: &WaitlistItem,
    ) -> CoordinationResult<bool> {
        let keys = CampaignKeys::new(cid);
        let payload = encode(item)?;
        let pre = lease_member(LeaseKind::PreDial, &item.call_id);
        let active = lease_member(LeaseKind::Active, &item.call_id);
        let needle = format!(":{cid}:{}:", item.call_id);
        let mut conn = self.conn.clone();
        let script = Script::new(ENQUEUE);
        let queued: i64 = self
            .run(
                "enqueue_waitlist",
                script
                    .key(keys.waitlist_high())
                    .key(keys.waitlist_normal())
                    .key(keys.waitlist_ids())
                    .key(keys.ledger())
                    .key(keys.leases())
                    .arg(&payload)
                    .arg(item.call_id.as_str())
                    .arg(item.priority.to_string())
                    .arg(&pre)
                    .arg(&active)
                    .arg(&needle)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(queued == 1)
    }

    async fn reserve_promote(
        &self,
        cid: &CampaignId,
        max_batch: u32,
    ) -> CoordinationResult<PromoteBatch> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let script = Script::new(RESERVE_PROMOTE);
        let raw: String = self
            .run(
                "reserve_promote",
                script
                    .key(keys.limit())
                    .key(keys.leases())
                    .key(keys.reserved())
                    .key(keys.ledger())
                    .key(keys.waitlist_high())
                    .key(keys.waitlist_normal())
                    .key(keys.waitlist_ids())
                    .key(keys.fairness())
                    .key(keys.promote_seq())
                    .arg(max_batch)
                    .arg(Utc::now().timestamp_millis())
                    .arg(self.tunables.fairness_high)
                    .arg(self.tunables.fairness_normal)
                    .arg(cid.as_str())
                    .arg(BOOKKEEPING_TTL_MS)
                    .invoke_async(&mut conn),
            )
            .await?;
        let wire: PromoteBatchWire = decode(&raw)?;
        Ok(PromoteBatch {
            seq: wire.seq,
            promoted: wire
                .promoted
                .into_iter()
                .map(|p| PromotedJob {
                    item: p.item,
                    promote_seq: p.promote_seq,
                })
                .collect(),
            push_back: wire.push_back,
        })
    }

    async fn push_back_front(
        &self,
        cid: &CampaignId,
        items: &[WaitlistItem],
    ) -> CoordinationResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let script = Script::new(PUSH_BACK_FRONT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(keys.waitlist_high())
            .key(keys.waitlist_normal());
        // reversed so LPUSH restores original order
        for item in items.iter().rev() {
            invocation.arg(item.priority.to_string()).arg(encode(item)?);
        }
        let _: i64 = self
            .run("push_back_front", invocation.invoke_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn waitlist_len(&self, cid: &CampaignId, priority: Priority) -> CoordinationResult<u64> {
        let keys = CampaignKeys::new(cid);
        let key = match priority {
            Priority::High => keys.waitlist_high(),
            Priority::Normal => keys.waitlist_normal(),
        };
        let mut conn = self.conn.clone();
        self.run("waitlist_len", conn.llen(key)).await
    }

    async fn waitlist_peek(
        &self,
        cid: &CampaignId,
        priority: Priority,
        n: usize,
    ) -> CoordinationResult<Vec<WaitlistItem>> {
        let keys = CampaignKeys::new(cid);
        let key = match priority {
            Priority::High => keys.waitlist_high(),
            Priority::Normal => keys.waitlist_normal(),
        };
        let mut conn = self.conn.clone();
        let raw: Vec<String> = self
            .run(
                "waitlist_peek",
                conn.lrange(key, 0, n.saturating_sub(1) as isize),
            )
            .await?;
        raw.iter().map(|s| decode(s)).collect()
    }

    async fn acquire_promote_gate(
        &self,
        cid: &CampaignId,
    ) -> CoordinationResult<Option<LeaseToken>> {
        let keys = CampaignKeys::new(cid);
        let token = LeaseToken::generate();
        let mut conn = self.conn.clone();
        let set: Option<String> = self
            .run(
                "acquire_promote_gate",
                redis::cmd("SET")
                    .arg(keys.promote_gate())
                    .arg(token.as_str())
                    .arg("NX")
                    .arg("PX")
                    .arg(self.tunables.gate_ttl.as_millis() as u64)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(set.map(|_| token))
    }

    async fn release_promote_gate(
        &self,
        cid: &CampaignId,
        token: &LeaseToken,
    ) -> CoordinationResult<bool> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let script = Script::new(RELEASE_GATE);
        let released: i64 = self
            .run(
                "release_promote_gate",
                script
                    .key(keys.promote_gate())
                    .arg(token.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(released == 1)
    }

    async fn set_limit(&self, cid: &CampaignId, limit: u32) -> CoordinationResult<()> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        self.run("set_limit", conn.set(keys.limit(), limit)).await
    }

    async fn slot_counts(&self, cid: &CampaignId) -> CoordinationResult<SlotCounts> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let script = Script::new(SLOT_COUNTS);
        let (leases, reserved): (u32, u32) = self
            .run(
                "slot_counts",
                script
                    .key(keys.leases())
                    .key(keys.reserved())
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(SlotCounts { leases, reserved })
    }

    async fn cold_start_state(&self, cid: &CampaignId) -> CoordinationResult<ColdStart> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let state: Option<String> = self
            .run("cold_start_state", conn.get(keys.cold_start()))
            .await?;
        Ok(match state.as_deref() {
            None => ColdStart::Unknown,
            Some("blocking") => ColdStart::Blocking,
            Some("done") => ColdStart::Done,
            Some(other) => {
                warn!(campaign = %cid, value = other, "unrecognized cold-start flag, treating as blocking");
                ColdStart::Blocking
            }
        })
    }

    async fn set_cold_start(&self, cid: &CampaignId, state: ColdStart) -> CoordinationResult<()> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        match state {
            ColdStart::Unknown => self.run("set_cold_start", conn.del(keys.cold_start())).await,
            ColdStart::Blocking => {
                let ttl = self.tunables.cold_start_blocking.as_millis() as u64;
                self.run(
                    "set_cold_start",
                    conn.pset_ex(keys.cold_start(), "blocking", ttl),
                )
                .await
            }
            ColdStart::Done => {
                let ttl = self.tunables.cold_start_done.as_millis() as u64;
                self.run("set_cold_start", conn.pset_ex(keys.cold_start(), "done", ttl))
                    .await
            }
        }
    }

    async fn rebuild_lease(&self, cid: &CampaignId, call_id: &CallId) -> CoordinationResult<()> {
        let keys = CampaignKeys::new(cid);
        let member = lease_member(LeaseKind::Active, call_id);
        let value = self.lease_value_json(&LeaseToken::recovered())?;
        let mut conn = self.conn.clone();
        let script = Script::new(REBUILD_LEASE);
        let _: i64 = self
            .run(
                "rebuild_lease",
                script
                    .key(keys.leases())
                    .key(keys.lease(&member))
                    .arg(&member)
                    .arg(&value)
                    // sentinel leases survive the grace window, then expire
                    .arg(self.tunables.cold_start_grace.as_millis() as u64)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn recovered_members(&self, cid: &CampaignId) -> CoordinationResult<Vec<String>> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let script = Script::new(RECOVERED_MEMBERS);
        self.run(
            "recovered_members",
            script
                .key(keys.leases())
                .arg(keys.lease_prefix())
                .arg(RECOVERED_TOKEN)
                .invoke_async(&mut conn),
        )
        .await
    }

    async fn lease_members(&self, cid: &CampaignId) -> CoordinationResult<Vec<String>> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        self.run("lease_members", conn.smembers(keys.leases())).await
    }

    async fn lease_exists(&self, cid: &CampaignId, member: &str) -> CoordinationResult<bool> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        self.run("lease_exists", conn.exists(keys.lease(member)))
            .await
    }

    async fn remove_lease_member(
        &self,
        cid: &CampaignId,
        member: &str,
    ) -> CoordinationResult<bool> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let script = Script::new(REMOVE_MEMBER);
        let removed: i64 = self
            .run(
                "remove_lease_member",
                script
                    .key(keys.leases())
                    .key(keys.lease(member))
                    .arg(member)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn ledger_entries_older_than(
        &self,
        cid: &CampaignId,
        age: Duration,
    ) -> CoordinationResult<Vec<LedgerEntry>> {
        let keys = CampaignKeys::new(cid);
        let cutoff = Utc::now().timestamp_millis() - age.as_millis() as i64;
        let mut conn = self.conn.clone();
        let raw: Vec<(String, i64)> = self
            .run(
                "ledger_entries_older_than",
                conn.zrangebyscore_withscores(keys.ledger(), i64::MIN, cutoff),
            )
            .await?;
        Ok(raw
            .into_iter()
            .map(|(member, scored_at_ms)| LedgerEntry {
                member,
                scored_at_ms,
            })
            .collect())
    }

    async fn reap_ledger_entry(&self, cid: &CampaignId, member: &str) -> CoordinationResult<bool> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let script = Script::new(REAP_LEDGER);
        let removed: i64 = self
            .run(
                "reap_ledger_entry",
                script
                    .key(keys.ledger())
                    .key(keys.reserved())
                    .arg(member)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn breaker_record_failure(&self, cid: &CampaignId) -> CoordinationResult<bool> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        let script = Script::new(BREAKER_FAILURE);
        let opened: i64 = self
            .run(
                "breaker_record_failure",
                script
                    .key(keys.circuit_failures())
                    .key(keys.circuit())
                    .arg(self.tunables.circuit_threshold)
                    .arg(self.tunables.circuit_window.as_millis() as u64)
                    .arg(self.tunables.circuit_cooldown.as_millis() as u64)
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(opened == 1)
    }

    async fn breaker_record_success(&self, cid: &CampaignId) -> CoordinationResult<()> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        self.run(
            "breaker_record_success",
            conn.del((keys.circuit_failures(), keys.circuit())),
        )
        .await
    }

    async fn breaker_is_open(&self, cid: &CampaignId) -> CoordinationResult<bool> {
        let keys = CampaignKeys::new(cid);
        let mut conn = self.conn.clone();
        self.run("breaker_is_open", conn.exists(keys.circuit())).await
    }

    async fn publish_slot_available(&self, cid: &CampaignId) -> CoordinationResult<()> {
        let mut conn = self.conn.clone();
        self.run("publish_slot_available", conn.publish(slot_channel(cid), 1))
            .await
    }

    async fn subscribe_slot_available(&self) -> CoordinationResult<mpsc::Receiver<CampaignId>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(transport)?;
        pubsub
            .psubscribe(SLOT_CHANNEL_PATTERN)
            .await
            .map_err(transport)?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Some(cid) = parse_slot_channel(msg.get_channel_name()) else {
                    continue;
                };
                // coalescable wakeups; a full channel loses nothing
                if tx.try_send(cid).is_err() && tx.is_closed() {
                    return;
                }
            }
            debug!("slot-available pubsub stream ended");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn promote_batch_wire_parses_script_output() {
        let raw = r#"{"seq":7,"promoted":[{"promote_seq":7,"item":{"call_id":"c1","contact_ref":"x","agent_ref":"a","phone_ref":"+1","retry_count":0,"priority":"high","enqueued_at":"2026-01-01T00:00:00Z"}}],"push_back":[]}"#;
        let wire: PromoteBatchWire = decode(raw).unwrap();
        assert_eq!(wire.seq, 7);
        assert_eq!(wire.promoted.len(), 1);
        assert_eq!(wire.promoted[0].promote_seq, 7);
        assert_eq!(wire.promoted[0].item.call_id, CallId::from("c1"));
        assert!(wire.push_back.is_empty());
    }

    #[test]
    #[traced_test]
    fn empty_batch_wire_parses() {
        let raw = r#"{"seq":0,"promoted":[],"push_back":[]}"#;
        let wire: PromoteBatchWire = decode(raw).unwrap();
        assert_eq!(wire.seq, 0);
        assert!(wire.promoted.is_empty());
    }

    #[test]
    #[traced_test]
    fn bad_url_is_config_error() {
        let err = Client::open("not-a-url").map(|_| ()).unwrap_err();
        // mapped in connect(); direct check of the redis error path
        assert!(err.to_string().to_lowercase().contains("url")
            || !err.to_string().is_empty());
    }

    #[test]
    #[traced_test]
    fn scripts_reference_only_declared_keys() {
        // spot-check that scripts use KEYS/ARGV placeholders, not literals
        for script in [
            ACQUIRE_PRE,
            UPGRADE,
            RELEASE,
            FORCE_RELEASE,
            RENEW,
            RENEW_PRE_CAPPED,
            CLAIM,
            ENQUEUE,
            RESERVE_PROMOTE,
            REAP_LEDGER,
            BREAKER_FAILURE,
        ] {
            assert!(script.contains("KEYS[1]"));
            assert!(!script.contains("campaign:"));
        }
    }
}
