pub mod wire;

use std::{path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use tracing::debug;

pub use wire::{BackendMode, CampaignConfig, PriorityMode, RedisConfig};

/// Parsed dispatcher config with typed views over the wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct DialerConfig {
    inner: wire::Config,
}

impl DialerConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        Self::parse_str(&s)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let inner: wire::Config = decode(s.as_ref())?;
        debug!(?inner);
        let cfg = Self { inner };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.inner.backend == BackendMode::Redis && self.inner.redis.is_none() {
            bail!("backend = redis requires a [redis] section");
        }
        for camp in &self.inner.campaigns {
            if camp.id.is_empty() {
                bail!("campaign with empty id");
            }
            if camp.concurrent_limit == 0 {
                bail!("campaign {} has concurrent_limit 0", camp.id);
            }
        }
        let core = &self.inner.core;
        if core.fairness_high == 0 && core.fairness_normal == 0 {
            bail!("fairness ratio cannot be 0:0");
        }
        if core.pre_dial_ttl_max_secs < core.pre_dial_ttl_secs {
            bail!("pre_dial_ttl_max must be >= pre_dial_ttl");
        }
        Ok(())
    }

    pub fn backend(&self) -> BackendMode {
        self.inner.backend
    }

    pub fn redis(&self) -> Option<&RedisConfig> {
        self.inner.redis.as_ref()
    }

    pub fn campaigns(&self) -> &[CampaignConfig] {
        &self.inner.campaigns
    }

    pub fn campaign(&self, id: &str) -> Option<&CampaignConfig> {
        self.inner.campaigns.iter().find(|c| c.id == id)
    }

    /// Typed core tunables.
    pub fn tunables(&self) -> CoreTunables {
        let c = &self.inner.core;
        CoreTunables {
            pre_dial_ttl: Duration::from_secs(c.pre_dial_ttl_secs),
            pre_dial_ttl_max: Duration::from_secs(c.pre_dial_ttl_max_secs),
            active_ttl: Duration::from_secs(c.active_ttl_secs),
            reservation_ttl: Duration::from_secs(c.reservation_ttl_secs),
            gate_ttl: Duration::from_millis(c.gate_ttl_ms),
            cold_start_blocking: Duration::from_secs(c.cold_start_blocking_secs),
            cold_start_grace: Duration::from_secs(c.cold_start_grace_secs),
            cold_start_done: Duration::from_secs(c.cold_start_done_secs),
            fairness_high: c.fairness_high,
            fairness_normal: c.fairness_normal,
            default_promote_batch: c.default_promote_batch,
            circuit_threshold: c.circuit_threshold,
            circuit_window: Duration::from_secs(c.circuit_window_secs),
            circuit_cooldown: Duration::from_secs(c.circuit_cooldown_secs),
            janitor_interval: Duration::from_secs(c.janitor_interval_secs),
            promote_interval: Duration::from_millis(c.promote_interval_ms),
            metrics_export_interval: Duration::from_secs(c.metrics_export_interval_secs),
            dispatch_workers: c.dispatch_workers,
        }
    }
}

/// Core tunables with real durations, handed to every service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreTunables {
    pub pre_dial_ttl: Duration,
    pub pre_dial_ttl_max: Duration,
    pub active_ttl: Duration,
    pub reservation_ttl: Duration,
    pub gate_ttl: Duration,
    pub cold_start_blocking: Duration,
    pub cold_start_grace: Duration,
    pub cold_start_done: Duration,
    pub fairness_high: u32,
    pub fairness_normal: u32,
    pub default_promote_batch: u32,
    pub circuit_threshold: u32,
    pub circuit_window: Duration,
    pub circuit_cooldown: Duration,
    pub janitor_interval: Duration,
    pub promote_interval: Duration,
    pub metrics_export_interval: Duration,
    pub dispatch_workers: usize,
}

impl Default for CoreTunables {
    fn default() -> Self {
        DialerConfig {
            inner: wire::Config {
                backend: BackendMode::Standalone,
                core: Default::default(),
                redis: None,
                campaigns: vec![],
            },
        }
        .tunables()
    }
}

/// Retry policy view of a campaign config, consumed by the dispatch worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_failed: bool,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    pub exclude_voicemail: bool,
}

impl From<&CampaignConfig> for RetryPolicy {
    fn from(c: &CampaignConfig) -> Self {
        Self {
            retry_failed: c.retry_failed,
            max_retry_attempts: c.max_retry_attempts,
            retry_delay: Duration::from_secs(c.retry_delay_secs),
            exclude_voicemail: c.exclude_voicemail,
        }
    }
}

fn decode<T: DeserializeOwned>(s: &str) -> Result<T> {
    match serde_json::from_str::<T>(s) {
        Ok(v) => Ok(v),
        Err(json_err) => serde_yaml::from_str::<T>(s).map_err(|yaml_err| {
            anyhow::anyhow!("config is neither JSON ({json_err}) nor YAML ({yaml_err})")
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SAMPLE: &str = r#"
backend: standalone
core:
  pre_dial_ttl_secs: 10
  janitor_interval_secs: 5
campaigns:
  - id: camp-1
    name: spring outreach
    agent: agent-a
    from_number: "+15550100"
    concurrent_limit: 5
    retry_delay_secs: 60
"#;

    #[test]
    fn parses_yaml_and_types_durations() {
        let cfg = DialerConfig::parse_str(SAMPLE).unwrap();
        let tun = cfg.tunables();
        assert_eq!(tun.pre_dial_ttl, Duration::from_secs(10));
        assert_eq!(tun.janitor_interval, Duration::from_secs(5));
        // untouched fields keep defaults
        assert_eq!(tun.default_promote_batch, 20);
        let camp = cfg.campaign("camp-1").unwrap();
        assert_eq!(camp.concurrent_limit, 5);
        let policy = RetryPolicy::from(camp);
        assert_eq!(policy.retry_delay, Duration::from_secs(60));
        assert_eq!(policy.max_retry_attempts, 3);
    }

    #[test]
    fn parses_json_too() {
        let cfg = DialerConfig::parse_str(
            r#"{"campaigns":[{"id":"c","agent":"a","from_number":"+1"}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.campaigns().len(), 1);
    }

    #[test]
    fn rejects_redis_backend_without_section() {
        let err = DialerConfig::parse_str("backend: redis\n").unwrap_err();
        assert!(err.to_string().contains("requires"));
    }

    #[test]
    fn rejects_zero_limit() {
        let err = DialerConfig::parse_str(
            r#"
campaigns:
  - id: c
    agent: a
    from_number: "+1"
    concurrent_limit: 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("concurrent_limit"));
    }
}
