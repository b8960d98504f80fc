//! On-disk configuration format.
//!
//! Everything here is the serde image of the config file. Defaults are
//! expressed as `default_*` functions so a minimal file stays minimal.
//! Typed views (with real `Duration`s) live in the crate root.

use serde::{Deserialize, Serialize};

/// Coordination backend mode: standalone (in-process, default) or redis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Single-process mode with the in-memory coordination store (default).
    #[default]
    Standalone,
    /// Distributed mode coordinating through redis.
    Redis,
}

/// Which waitlist class a campaign's contacts enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    /// All contacts enter the normal queue (default).
    #[default]
    Normal,
    /// All contacts enter the high queue.
    High,
    /// First attempts enter normal; retries enter high.
    RetriesHigh,
}

/// Top-level config file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Coordination backend selector.
    #[serde(default)]
    pub backend: BackendMode,
    /// Core dispatcher tunables.
    #[serde(default)]
    pub core: CoreConfig,
    /// Redis connection settings, required when `backend = redis`.
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    /// Campaign definitions.
    #[serde(default)]
    pub campaigns: Vec<CampaignConfig>,
}

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Per-command response timeout in milliseconds.
    #[serde(default = "default_redis_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn default_redis_timeout_ms() -> u64 {
    2_000
}

/// Core dispatcher tunables, all durations in the unit named by the field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CoreConfig {
    /// Pre-dial lease TTL in seconds. Bounds a slot held while dialing.
    #[serde(default = "default_pre_dial_ttl_secs")]
    pub pre_dial_ttl_secs: u64,
    /// Hard cap on cumulative pre-dial renewal, in seconds.
    #[serde(default = "default_pre_dial_ttl_max_secs")]
    pub pre_dial_ttl_max_secs: u64,
    /// Active lease TTL in seconds. Bounds worst-case call length.
    #[serde(default = "default_active_ttl_secs")]
    pub active_ttl_secs: u64,
    /// How long a promoted-but-unclaimed reservation stays debited, seconds.
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
    /// Promote gate TTL in milliseconds.
    #[serde(default = "default_gate_ttl_ms")]
    pub gate_ttl_ms: u64,
    /// Cold-start blocking window in seconds.
    #[serde(default = "default_cold_start_blocking_secs")]
    pub cold_start_blocking_secs: u64,
    /// Grace window after which recovered-sentinel leases are swept, seconds.
    #[serde(default = "default_cold_start_grace_secs")]
    pub cold_start_grace_secs: u64,
    /// Lifetime of the done flag once a campaign has warmed up, seconds.
    #[serde(default = "default_cold_start_done_secs")]
    pub cold_start_done_secs: u64,
    /// Weighted admission ratio, high side.
    #[serde(default = "default_fairness_high")]
    pub fairness_high: u32,
    /// Weighted admission ratio, normal side.
    #[serde(default = "default_fairness_normal")]
    pub fairness_normal: u32,
    /// Promotion batch size when the circuit is closed.
    #[serde(default = "default_promote_batch")]
    pub default_promote_batch: u32,
    /// Dispatch failures within the window before the circuit opens.
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,
    /// Circuit failure-counting window in seconds.
    #[serde(default = "default_circuit_window_secs")]
    pub circuit_window_secs: u64,
    /// Circuit cooldown once open, in seconds.
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
    /// Janitor sweep interval in seconds.
    #[serde(default = "default_janitor_interval_secs")]
    pub janitor_interval_secs: u64,
    /// Promoter tick interval in milliseconds.
    #[serde(default = "default_promote_interval_ms")]
    pub promote_interval_ms: u64,
    /// Metrics export interval in seconds.
    #[serde(default = "default_metrics_export_interval_secs")]
    pub metrics_export_interval_secs: u64,
    /// Dispatch workers per process.
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        // serde_json round-trip of `{}` would do the same; spell it out
        Self {
            pre_dial_ttl_secs: default_pre_dial_ttl_secs(),
            pre_dial_ttl_max_secs: default_pre_dial_ttl_max_secs(),
            active_ttl_secs: default_active_ttl_secs(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
            gate_ttl_ms: default_gate_ttl_ms(),
            cold_start_blocking_secs: default_cold_start_blocking_secs(),
            cold_start_grace_secs: default_cold_start_grace_secs(),
            cold_start_done_secs: default_cold_start_done_secs(),
            fairness_high: default_fairness_high(),
            fairness_normal: default_fairness_normal(),
            default_promote_batch: default_promote_batch(),
            circuit_threshold: default_circuit_threshold(),
            circuit_window_secs: default_circuit_window_secs(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
            janitor_interval_secs: default_janitor_interval_secs(),
            promote_interval_ms: default_promote_interval_ms(),
            metrics_export_interval_secs: default_metrics_export_interval_secs(),
            dispatch_workers: default_dispatch_workers(),
        }
    }
}

fn default_pre_dial_ttl_secs() -> u64 {
    20
}
fn default_pre_dial_ttl_max_secs() -> u64 {
    60
}
fn default_active_ttl_secs() -> u64 {
    4 * 60 * 60
}
fn default_reservation_ttl_secs() -> u64 {
    60
}
fn default_gate_ttl_ms() -> u64 {
    5_000
}
fn default_cold_start_blocking_secs() -> u64 {
    60
}
fn default_cold_start_grace_secs() -> u64 {
    120
}
fn default_cold_start_done_secs() -> u64 {
    7 * 24 * 60 * 60
}
fn default_fairness_high() -> u32 {
    3
}
fn default_fairness_normal() -> u32 {
    1
}
fn default_promote_batch() -> u32 {
    20
}
fn default_circuit_threshold() -> u32 {
    5
}
fn default_circuit_window_secs() -> u64 {
    60
}
fn default_circuit_cooldown_secs() -> u64 {
    60
}
fn default_janitor_interval_secs() -> u64 {
    30
}
fn default_promote_interval_ms() -> u64 {
    500
}
fn default_metrics_export_interval_secs() -> u64 {
    60
}
fn default_dispatch_workers() -> usize {
    2
}

/// A single campaign definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CampaignConfig {
    /// Campaign identifier, unique per deployment.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Conversational agent reference handed to the audio pipeline.
    pub agent: String,
    /// Source phone identity used as the caller id.
    pub from_number: String,
    /// Max simultaneous in-flight calls for this campaign.
    #[serde(default = "default_concurrent_limit")]
    pub concurrent_limit: u32,
    /// Whether recoverable failures are retried.
    #[serde(default = "default_retry_failed")]
    pub retry_failed: bool,
    /// Max dial attempts per contact (first attempt included).
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Delay before a retry attempt re-enters the waitlist, seconds.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Treat voicemail as terminal rather than retryable.
    #[serde(default)]
    pub exclude_voicemail: bool,
    /// Waitlist class policy for this campaign's contacts.
    #[serde(default)]
    pub priority_mode: PriorityMode,
}

fn default_concurrent_limit() -> u32 {
    3
}
fn default_retry_failed() -> bool {
    true
}
fn default_max_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    300
}
