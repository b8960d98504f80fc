#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! contains statistics for dispatcher metrics
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum DialOutcome {
        connected,
        completed,
        failed,
        no_answer,
        busy,
        voicemail,
        canceled,
    }
    pub struct DialOutcomeStats: IntCounter {
        "outcome" => DialOutcome
    }
}

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();

    /// server uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "server uptime (seconds)").unwrap();

    // promotion metrics

    /// promoter passes that lost the single-flight gate
    pub static ref PROMOTER_CONFLICT: IntCounter =
        register_int_counter!("promoter_conflict", "count of promoter passes skipped on gate contention").unwrap();
    /// promoter passes skipped while cold-start blocking
    pub static ref PROMOTER_COLD_BLOCKED: IntCounter =
        register_int_counter!("promoter_cold_blocked", "count of promoter passes skipped during cold-start blocking").unwrap();
    /// contacts admitted from the waitlist into broker jobs
    pub static ref PROMOTED_JOBS: IntCounter =
        register_int_counter!("promoted_jobs", "count of contacts promoted into dispatch jobs").unwrap();
    /// items pushed back to the waitlist head after failing validity checks
    pub static ref PROMOTE_PUSH_BACK: IntCounter =
        register_int_counter!("promote_push_back", "count of items pushed back to the waitlist head").unwrap();

    // dispatch metrics

    /// jobs that arrived with no claimable reservation
    pub static ref DUPLICATE_ENQUEUE: IntCounter =
        register_int_counter!("duplicate_enqueue", "count of dispatch jobs acknowledged as duplicates").unwrap();
    /// jobs missing their promote sequence
    pub static ref GATE_VIOLATION: IntCounter =
        register_int_counter!("gate_violation", "count of dispatch jobs missing a promote sequence").unwrap();
    /// unconditional admissions after repeated gate-repair failures
    pub static ref GATE_HARD_SYNC: IntCounter =
        register_int_counter!("gate_hard_sync", "count of unconditional admissions after failed gate repair").unwrap();
    /// dispatch jobs requeued because the slot was reclaimed
    pub static ref RESERVATION_RECLAIMED: IntCounter =
        register_int_counter!("reservation_reclaimed", "count of jobs requeued after losing their reservation").unwrap();

    // janitor metrics

    /// lease members removed after their key expired
    pub static ref EXPIRED_LEASES_RECLAIMED: IntCounter =
        register_int_counter!("expired_leases_reclaimed", "count of lease members reclaimed after TTL expiry").unwrap();
    /// reservations reaped with no outstanding broker job
    pub static ref ORPHANED_RESERVATIONS_RECOVERED: IntCounter =
        register_int_counter!("orphaned_reservations_recovered", "count of orphaned reservations reaped").unwrap();
    /// waitlist/broker divergences detected
    pub static ref BROKER_WAITLIST_REBUILT: IntCounter =
        register_int_counter!("broker_waitlist_rebuilt", "count of waitlist/broker divergences repaired").unwrap();

    // cold start metrics

    /// cold-start reconstructions performed
    pub static ref COLD_START_REBUILDS: IntCounter =
        register_int_counter!("cold_start_rebuilds", "count of cold-start lease reconstructions").unwrap();
    /// leases rebuilt with the recovered sentinel
    pub static ref COLD_START_RECOVERED_LEASES: IntCounter =
        register_int_counter!("cold_start_recovered_leases", "count of leases rebuilt from the call store").unwrap();

    // circuit breaker

    /// current breaker state per campaign (1=open)
    pub static ref CIRCUIT_STATE: IntGaugeVec = register_int_gauge_vec!(
        "circuit_state",
        "circuit breaker state per campaign (1=open, 0=closed)",
        &["campaign"]
    )
    .unwrap();

    // occupancy

    /// leases held per campaign
    pub static ref SLOTS_IN_FLIGHT: IntGaugeVec = register_int_gauge_vec!(
        "slots_in_flight",
        "lease-set cardinality per campaign",
        &["campaign"]
    )
    .unwrap();
    /// reservations outstanding per campaign
    pub static ref SLOTS_RESERVED: IntGaugeVec = register_int_gauge_vec!(
        "slots_reserved",
        "promoted-but-unclaimed reservations per campaign",
        &["campaign"]
    )
    .unwrap();

    // dial outcomes

    pub static ref DIAL_OUTCOME_VEC: IntCounterVec = register_int_counter_vec!(
        "dial_outcome_counts",
        "Dial Outcome Counts",
        &["outcome"]
    )
    .unwrap();

    /// aggregate count of all dial outcomes
    pub static ref DIAL_OUTCOME: DialOutcomeStats = DialOutcomeStats::from(&DIAL_OUTCOME_VEC);

    /// histogram of time from claim to telephony accept
    pub static ref DIAL_DURATION: HistogramVec = register_histogram_vec!(
        "dial_duration",
        "dial duration (seconds)",
        &["outcome"]
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::{DIAL_DURATION, DIAL_OUTCOME};

    #[test]
    fn metrics_are_registered_and_exposed() {
        DIAL_OUTCOME.connected.inc();
        DIAL_DURATION.with_label_values(&["connected"]).observe(0.001);

        let families = gather();
        let names = families
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();

        assert!(
            names.contains("dial_outcome_counts"),
            "registered metric families: {names:?}"
        );
        assert!(
            names.contains("dial_duration"),
            "registered metric families: {names:?}"
        );
    }
}
