//! Property-style checks on the admission protocol.

mod common;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use common::{test_tunables, TestBed};

use config::{CoreTunables, PriorityMode};
use redis_coordination::{CallId, CoordinationStore, LeaseKind, Priority, WaitlistItem};

fn item(call: &str, priority: Priority) -> WaitlistItem {
    WaitlistItem {
        call_id: CallId::from(call),
        contact_ref: format!("contact-{call}"),
        agent_ref: "agent-a".into(),
        phone_ref: "+15550100".into(),
        retry_count: 0,
        priority,
        enqueued_at: Utc::now(),
    }
}

/// `card(leases) + reserved <= limit` holds at every observable instant,
/// under a storm of concurrent acquire/upgrade/release from many tasks.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_never_exceeds_limit_under_contention() {
    const LIMIT: u32 = 3;
    let tunables = CoreTunables {
        pre_dial_ttl: Duration::from_secs(5),
        active_ttl: Duration::from_secs(5),
        ..Default::default()
    };
    let bed = TestBed::new(tunables);
    let cid = bed.campaign("k", LIMIT, PriorityMode::Normal);

    let violated = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    // sampler watches occupancy while the storm runs
    let sampler = {
        let store = bed.store.clone();
        let cid = cid.clone();
        let violated = violated.clone();
        let done = done.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::Relaxed) {
                let counts = store.slot_counts(&cid).await.unwrap();
                if counts.leases + counts.reserved > LIMIT {
                    violated.store(true, Ordering::Relaxed);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let mut tasks = Vec::new();
    for task_id in 0..16 {
        let store = bed.store.clone();
        let cid = cid.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..25 {
                let call = CallId::from(format!("c-{task_id}-{round}").as_str());
                let Some(pre) = store.acquire_pre(&cid, &call, LIMIT).await.unwrap() else {
                    tokio::task::yield_now().await;
                    continue;
                };
                if round % 2 == 0 {
                    let active = store.upgrade(&cid, &call, &pre).await.unwrap().unwrap();
                    tokio::task::yield_now().await;
                    assert!(store
                        .release(&cid, &call, &active, LeaseKind::Active, false)
                        .await
                        .unwrap());
                } else {
                    tokio::task::yield_now().await;
                    assert!(store
                        .release(&cid, &call, &pre, LeaseKind::PreDial, false)
                        .await
                        .unwrap());
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    done.store(true, Ordering::Relaxed);
    sampler.await.unwrap();

    assert!(!violated.load(Ordering::Relaxed), "occupancy exceeded the limit");
    // everything was released
    let counts = bed.store.slot_counts(&cid).await.unwrap();
    assert_eq!(counts.leases, 0);
    assert_eq!(counts.reserved, 0);
}

/// Acquire/upgrade/release leaves no residue behind.
#[tokio::test]
async fn lease_roundtrip_leaves_no_residue() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 3, PriorityMode::Normal);
    let call = CallId::from("c1");

    let before = bed.store.slot_counts(&cid).await.unwrap();
    let pre = bed
        .store
        .acquire_pre(&cid, &call, 3)
        .await
        .unwrap()
        .unwrap();
    let active = bed.store.upgrade(&cid, &call, &pre).await.unwrap().unwrap();
    assert_ne!(pre, active, "upgrade must mint a fresh token");
    assert!(bed
        .store
        .release(&cid, &call, &active, LeaseKind::Active, true)
        .await
        .unwrap());

    let after = bed.store.slot_counts(&cid).await.unwrap();
    assert_eq!(before.leases, after.leases);
    assert!(bed.store.lease_members(&cid).await.unwrap().is_empty());
    assert!(!bed.store.lease_exists(&cid, "c1").await.unwrap());
    assert!(!bed.store.lease_exists(&cid, "pre-c1").await.unwrap());
}

/// FIFO within a priority class survives promotion.
#[tokio::test]
async fn waitlist_fifo_within_class() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 10, PriorityMode::Normal);
    for i in 0..5 {
        assert!(bed
            .store
            .enqueue_waitlist(&cid, &item(&format!("n{i}"), Priority::Normal))
            .await
            .unwrap());
    }
    let batch = bed.store.reserve_promote(&cid, 10).await.unwrap();
    let order: Vec<String> = batch
        .promoted
        .iter()
        .map(|p| p.item.call_id.to_string())
        .collect();
    assert_eq!(order, ["n0", "n1", "n2", "n3", "n4"]);
}

/// With both classes backlogged, every window of four consecutive
/// admissions contains exactly one normal item (3:1 ratio).
#[tokio::test]
async fn fairness_every_window_of_four() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 40, PriorityMode::Normal);
    for i in 0..40 {
        bed.store
            .enqueue_waitlist(&cid, &item(&format!("h{i:02}"), Priority::High))
            .await
            .unwrap();
        bed.store
            .enqueue_waitlist(&cid, &item(&format!("n{i:02}"), Priority::Normal))
            .await
            .unwrap();
    }
    let batch = bed.store.reserve_promote(&cid, 40).await.unwrap();
    assert_eq!(batch.count(), 40);
    let admissions: Vec<Priority> = batch.promoted.iter().map(|p| p.item.priority).collect();
    for window in admissions.chunks(4) {
        let normal = window
            .iter()
            .filter(|p| **p == Priority::Normal)
            .count();
        assert_eq!(normal, 1, "window {window:?} breaks the 3:1 ratio");
    }
}

/// Lowering the limit below current occupancy evicts nothing but blocks
/// new admissions until the campaign drains.
#[tokio::test]
async fn lowered_limit_blocks_until_drained() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 3, PriorityMode::Normal);

    let mut tokens = Vec::new();
    for i in 0..3 {
        let call = CallId::from(format!("c{i}").as_str());
        let pre = bed
            .store
            .acquire_pre(&cid, &call, 3)
            .await
            .unwrap()
            .unwrap();
        tokens.push((call, pre));
    }
    bed.store.set_limit(&cid, 1).await.unwrap();

    // the three in-flight calls keep their slots
    assert_eq!(bed.store.slot_counts(&cid).await.unwrap().leases, 3);
    // but nothing new gets in
    assert!(bed
        .store
        .acquire_pre(&cid, &CallId::from("extra"), 1)
        .await
        .unwrap()
        .is_none());

    // still over the new limit after one release
    let (call, token) = tokens.pop().unwrap();
    bed.store
        .release(&cid, &call, &token, LeaseKind::PreDial, false)
        .await
        .unwrap();
    assert!(bed
        .store
        .acquire_pre(&cid, &CallId::from("extra"), 1)
        .await
        .unwrap()
        .is_none());

    // drained below the limit; one slot opens
    for (call, token) in tokens {
        bed.store
            .release(&cid, &call, &token, LeaseKind::PreDial, false)
            .await
            .unwrap();
    }
    assert!(bed
        .store
        .acquire_pre(&cid, &CallId::from("extra"), 1)
        .await
        .unwrap()
        .is_some());
    assert!(bed
        .store
        .acquire_pre(&cid, &CallId::from("extra2"), 1)
        .await
        .unwrap()
        .is_none());
}

/// A reservation that ages past its TTL is reaped exactly once and frees
/// exactly one slot.
#[tokio::test]
async fn reservation_expiry_reaps_exactly_one() {
    let mut tunables = test_tunables();
    tunables.reservation_ttl = Duration::from_millis(80);
    let bed = TestBed::new(tunables);
    let cid = bed.campaign("k", 2, PriorityMode::Normal);

    bed.store
        .enqueue_waitlist(&cid, &item("a", Priority::Normal))
        .await
        .unwrap();
    bed.store
        .enqueue_waitlist(&cid, &item("b", Priority::Normal))
        .await
        .unwrap();
    let batch = bed.store.reserve_promote(&cid, 2).await.unwrap();
    assert_eq!(batch.count(), 2);
    assert_eq!(bed.store.slot_counts(&cid).await.unwrap().reserved, 2);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let stats = bed.janitor().sweep(&cid).await.unwrap();
    assert_eq!(stats.orphaned_reservations, 2);
    assert_eq!(bed.store.slot_counts(&cid).await.unwrap().reserved, 0);

    let stats = bed.janitor().sweep(&cid).await.unwrap();
    assert_eq!(stats.orphaned_reservations, 0);
}

/// Duplicate enqueues of one contact are rejected while any attempt is in
/// flight, across waitlist, ledger, and leases.
#[tokio::test]
async fn contact_appears_at_most_once() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 3, PriorityMode::Normal);

    // waitlisted
    assert!(bed
        .store
        .enqueue_waitlist(&cid, &item("a", Priority::Normal))
        .await
        .unwrap());
    assert!(!bed
        .store
        .enqueue_waitlist(&cid, &item("a", Priority::High))
        .await
        .unwrap());

    // reserved in the ledger
    let batch = bed.store.reserve_promote(&cid, 3).await.unwrap();
    assert_eq!(batch.count(), 1);
    assert!(!bed
        .store
        .enqueue_waitlist(&cid, &item("a", Priority::Normal))
        .await
        .unwrap());

    // holding a lease
    let job_id = redis_coordination::dial_job_id(&cid, &CallId::from("a"), 0);
    assert_eq!(bed.store.claim_reservation(&cid, &job_id).await.unwrap(), 1);
    bed.store
        .acquire_pre(&cid, &CallId::from("a"), 3)
        .await
        .unwrap()
        .unwrap();
    assert!(!bed
        .store
        .enqueue_waitlist(&cid, &item("a", Priority::Normal))
        .await
        .unwrap());
}
