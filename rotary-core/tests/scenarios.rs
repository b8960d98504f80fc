//! End-to-end scenarios for the campaign concurrency core, driven against
//! the in-memory backends.

mod common;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing_test::traced_test;
use common::{eventually, test_tunables, DialBehavior, TestBed};

use call_store::{CallRecord, CallStatus, CallStore};
use config::PriorityMode;
use redis_coordination::{
    CallId, ColdStart, CoordinationStore, Priority, WaitlistItem,
};
use rotary_core::{
    promoter::PromotePass,
    telephony::{ProviderCallStatus, ProviderEvent},
    tokio_util::sync::CancellationToken,
};

fn waitlist_item(call: &str, priority: Priority, retry: u32) -> WaitlistItem {
    WaitlistItem {
        call_id: CallId::from(call),
        contact_ref: format!("contact-{call}"),
        agent_ref: "agent-a".into(),
        phone_ref: "+15550100".into(),
        retry_count: retry,
        priority,
        enqueued_at: Utc::now(),
    }
}

fn record_for(bed_cid: &redis_coordination::CampaignId, call: &str) -> CallRecord {
    CallRecord::new(
        CallId::from(call),
        bed_cid.clone(),
        format!("contact-{call}"),
        "agent-a",
        "+15550100",
        "+15550199",
        0,
    )
}

/// Scenario: baseline admission. Three slots fill, the fourth contact waits
/// at the head of the waitlist, and a release admits it.
#[tokio::test]
#[traced_test]
async fn baseline_admission_and_release() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 3, PriorityMode::High);
    let engine = bed.engine();
    let token = CancellationToken::new();
    let _handles = engine.start(token.clone());

    let mut ids = Vec::new();
    for contact in ["a", "b", "c", "d"] {
        ids.push(
            engine
                .enqueue_contact(&cid, &format!("contact-{contact}"), "+15550199")
                .await
                .unwrap(),
        );
    }

    // a, b, c fill the campaign; all three upgrade to active
    eventually("three active calls", || async {
        let counts = bed.store.slot_counts(&cid).await.unwrap();
        let ringing = count_ringing(&bed, &ids).await;
        counts.leases == 3 && counts.reserved == 0 && ringing == 3
    })
    .await;

    // d is still waiting its turn
    assert_eq!(
        bed.store
            .waitlist_len(&cid, Priority::High)
            .await
            .unwrap(),
        1
    );
    let d = ids[3].clone();
    let d_status = bed.calls.get(&d).await.unwrap().unwrap().status;
    assert!(!d_status.is_in_flight(), "d should not be dialing yet");

    // one call ends; d gets the freed slot
    let first = ids[0].clone();
    bed.reconciler().on_stream_end(&first).await.unwrap();

    eventually("d admitted after release", || async {
        let status = bed.calls.get(&d).await.unwrap().unwrap().status;
        status == CallStatus::Ringing
    })
    .await;
    let counts = bed.store.slot_counts(&cid).await.unwrap();
    assert_eq!(counts.leases, 3);

    token.cancel();
}

async fn count_ringing(bed: &TestBed, ids: &[CallId]) -> usize {
    let mut n = 0;
    for id in ids {
        if let Some(record) = bed.calls.get(id).await.unwrap() {
            if record.status == CallStatus::Ringing {
                n += 1;
            }
        }
    }
    n
}

/// Scenario: pre-dial crash. A worker dies holding a pre-dial lease; the
/// janitor reclaims the slot after the TTL and the contact can run again.
#[tokio::test]
#[traced_test]
async fn pre_dial_crash_is_reclaimed() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 3, PriorityMode::High);
    let call = CallId::from("x");
    bed.calls.upsert(&record_for(&cid, "x")).await.unwrap();

    // crashed worker: acquires and never comes back
    bed.store
        .acquire_pre(&cid, &call, 3)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bed.store.slot_counts(&cid).await.unwrap().leases, 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let stats = bed.janitor().sweep(&cid).await.unwrap();
    assert_eq!(stats.expired_leases, 1);
    assert_eq!(bed.store.slot_counts(&cid).await.unwrap().leases, 0);

    // the contact can now be enqueued and dialed for real
    assert!(bed
        .store
        .enqueue_waitlist(&cid, &waitlist_item("x", Priority::High, 0))
        .await
        .unwrap());
    match bed.promoter().tick(&cid).await.unwrap() {
        PromotePass::Admitted { count, .. } => assert_eq!(count, 1),
        other => panic!("unexpected pass outcome {other:?}"),
    }

    let token = CancellationToken::new();
    let worker = Arc::new(bed.worker(0));
    let worker_task = tokio::spawn(worker.run(token.clone()));

    eventually("x dialed after reclaim", || async {
        bed.calls.get(&call).await.unwrap().unwrap().status == CallStatus::Ringing
    })
    .await;
    let counts = bed.store.slot_counts(&cid).await.unwrap();
    assert_eq!(counts.leases, 1);
    assert_eq!(counts.reserved, 0);

    token.cancel();
    let _ = worker_task.await;
}

/// Scenario: webhook race. The worker dies after upgrade but before the
/// active token is persisted; the terminal webhook still frees the slot.
#[tokio::test]
#[traced_test]
async fn webhook_race_force_release() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 3, PriorityMode::Normal);
    let call = CallId::from("y");
    bed.calls.upsert(&record_for(&cid, "y")).await.unwrap();

    let pre = bed
        .store
        .acquire_pre(&cid, &call, 3)
        .await
        .unwrap()
        .unwrap();
    bed.calls.set_provider(&call, "PA77", &pre).await.unwrap();
    // upgraded, then killed before set_active_token
    bed.store.upgrade(&cid, &call, &pre).await.unwrap().unwrap();
    let before = bed.store.slot_counts(&cid).await.unwrap();
    assert_eq!(before.leases, 1);

    bed.reconciler()
        .on_provider_event(&ProviderEvent {
            provider_call_id: "PA77".into(),
            status: ProviderCallStatus::Completed,
        })
        .await
        .unwrap();

    let counts = bed.store.slot_counts(&cid).await.unwrap();
    assert_eq!(counts.leases, 0);
    assert_eq!(counts.reserved, 0);
    assert_eq!(
        bed.calls.get(&call).await.unwrap().unwrap().status,
        CallStatus::Completed
    );
}

/// Scenario: cold start with two live calls. The lease set is rebuilt from
/// the call store, promotions block, a live upgrade unblocks, and leftover
/// sentinels are reaped after the grace window.
#[tokio::test]
#[traced_test]
async fn cold_start_with_two_live_calls() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 3, PriorityMode::Normal);

    for call in ["p", "q"] {
        let mut record = record_for(&cid, call);
        record.status = CallStatus::InProgress;
        bed.calls.upsert(&record).await.unwrap();
    }

    // store lost its state; first lease-path touch rebuilds
    let guard = bed.guard();
    assert_eq!(guard.ensure_ready(&cid).await.unwrap(), ColdStart::Blocking);
    assert_eq!(bed.store.slot_counts(&cid).await.unwrap().leases, 2);
    assert_eq!(bed.store.recovered_members(&cid).await.unwrap().len(), 2);

    // promoter refuses while blocking
    assert_eq!(
        bed.promoter().tick(&cid).await.unwrap(),
        PromotePass::ColdBlocked
    );

    // lease ops still function: one free slot admits a live call, whose
    // upgrade clears the blocking flag
    let call = CallId::from("fresh");
    let pre = bed
        .store
        .acquire_pre(&cid, &call, 3)
        .await
        .unwrap()
        .unwrap();
    bed.store.upgrade(&cid, &call, &pre).await.unwrap().unwrap();
    guard.mark_warm(&cid).await.unwrap();
    assert_eq!(guard.ensure_ready(&cid).await.unwrap(), ColdStart::Done);
    assert!(matches!(
        bed.promoter().tick(&cid).await.unwrap(),
        PromotePass::Admitted { .. }
    ));

    // p and q never rejoined; after the grace window the janitor reaps them
    tokio::time::sleep(Duration::from_millis(650)).await;
    let stats = bed.janitor().sweep(&cid).await.unwrap();
    assert_eq!(stats.expired_leases, 2);
    let counts = bed.store.slot_counts(&cid).await.unwrap();
    assert_eq!(counts.leases, 1); // the fresh call remains
}

/// Scenario: circuit breaker. Six failures quarter the promotion batch;
/// one success restores it.
#[tokio::test]
#[traced_test]
async fn circuit_breaker_quarters_batch() {
    let mut tunables = test_tunables();
    tunables.circuit_threshold = 5;
    tunables.circuit_window = Duration::from_secs(60);
    tunables.circuit_cooldown = Duration::from_secs(60);
    tunables.default_promote_batch = 20;
    let bed = TestBed::new(tunables);
    let cid = bed.campaign("k", 20, PriorityMode::Normal);

    for i in 0..20 {
        assert!(bed
            .store
            .enqueue_waitlist(&cid, &waitlist_item(&format!("c{i}"), Priority::Normal, 0))
            .await
            .unwrap());
    }

    let breaker = bed.breaker();
    for _ in 0..6 {
        breaker.record_failure(&cid).await.unwrap();
    }
    assert_eq!(breaker.batch_size(&cid, 20).await, 5);

    match bed.promoter().tick(&cid).await.unwrap() {
        PromotePass::Admitted { count, .. } => assert_eq!(count, 5),
        other => panic!("unexpected pass outcome {other:?}"),
    }

    // a success drains the window and the next pass takes the rest
    breaker.record_success(&cid).await.unwrap();
    match bed.promoter().tick(&cid).await.unwrap() {
        PromotePass::Admitted { count, .. } => assert_eq!(count, 15),
        other => panic!("unexpected pass outcome {other:?}"),
    }
}

/// Paused campaigns keep their in-flight calls but admit nothing new.
#[tokio::test]
#[traced_test]
async fn pause_stops_promotions_but_keeps_calls() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 3, PriorityMode::Normal);

    let live = CallId::from("live");
    let pre = bed
        .store
        .acquire_pre(&cid, &live, 3)
        .await
        .unwrap()
        .unwrap();
    bed.store.upgrade(&cid, &live, &pre).await.unwrap().unwrap();

    bed.store
        .enqueue_waitlist(&cid, &waitlist_item("waiting", Priority::Normal, 0))
        .await
        .unwrap();

    bed.directory
        .set_state(&cid, rotary_core::campaign::CampaignState::Paused);
    assert_eq!(
        bed.promoter().tick(&cid).await.unwrap(),
        PromotePass::Inactive
    );
    assert_eq!(bed.store.slot_counts(&cid).await.unwrap().leases, 1);

    // resume restores promotion
    bed.directory
        .set_state(&cid, rotary_core::campaign::CampaignState::Active);
    match bed.promoter().tick(&cid).await.unwrap() {
        PromotePass::Admitted { count, .. } => assert_eq!(count, 1),
        other => panic!("unexpected pass outcome {other:?}"),
    }
}

/// Transient dial failures release the slot and schedule a retry through
/// the delayed requeue path.
#[tokio::test]
#[traced_test]
async fn transient_failure_retries_through_waitlist() {
    let bed = TestBed::new(test_tunables());
    let cid = bed.campaign("k", 3, PriorityMode::Normal);
    bed.telephony.set_behavior(DialBehavior::FailTransient);

    let engine = bed.engine();
    let token = CancellationToken::new();
    let _handles = engine.start(token.clone());

    let call = engine
        .enqueue_contact(&cid, "contact-1", "+15550199")
        .await
        .unwrap();

    // first attempt fails and the retry is recorded
    eventually("first attempt failed", || async {
        bed.calls
            .get(&call)
            .await
            .unwrap()
            .map(|r| r.retry_count == 1)
            .unwrap_or(false)
    })
    .await;

    // no slot is held while the retry waits
    let counts = bed.store.slot_counts(&cid).await.unwrap();
    assert_eq!(counts.leases, 0);

    // let it succeed on the retry
    bed.telephony.set_behavior(DialBehavior::Accept);
    eventually("retry connects", || async {
        bed.calls.get(&call).await.unwrap().unwrap().status == CallStatus::Ringing
    })
    .await;

    token.cancel();
}
