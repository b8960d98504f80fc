//! Shared fixture for the dispatcher integration tests: in-memory backends,
//! a scriptable telephony mock, and constructors for each service.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use call_store::{CallStore, MemoryCallStore};
use config::{CoreTunables, PriorityMode, RetryPolicy};
use redis_coordination::{CampaignId, CoordinationStore, MemoryStore};
use rotary_core::{
    async_trait,
    breaker::CircuitBreaker,
    broker::{Broker, MemoryBroker},
    campaign::{CampaignDefinition, CampaignDirectory, CampaignState, StaticDirectory},
    cold_start::ColdStartGuard,
    dispatch::{DispatchWorker, RetryScheduler},
    janitor::LeaseJanitor,
    promoter::Promoter,
    reconciler::ReleaseReconciler,
    telephony::{CallMetadata, TelephonyError, TelephonyProvider, TelephonyResult},
    Engine,
};

/// What the mock does with the next create-call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialBehavior {
    Accept,
    FailTransient,
    FailTerminal,
}

#[derive(Debug)]
pub struct MockTelephony {
    behavior: Mutex<DialBehavior>,
    counter: AtomicU64,
    created: Mutex<Vec<(String, String, String)>>, // (provider_id, from, to)
    hangups: Mutex<Vec<String>>,
}

impl Default for MockTelephony {
    fn default() -> Self {
        Self {
            behavior: Mutex::new(DialBehavior::Accept),
            counter: AtomicU64::new(0),
            created: Mutex::new(Vec::new()),
            hangups: Mutex::new(Vec::new()),
        }
    }
}

impl MockTelephony {
    pub fn set_behavior(&self, behavior: DialBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn created(&self) -> Vec<(String, String, String)> {
        self.created.lock().clone()
    }

    pub fn hangups(&self) -> Vec<String> {
        self.hangups.lock().clone()
    }
}

#[async_trait]
impl TelephonyProvider for MockTelephony {
    async fn create_call(
        &self,
        from: &str,
        to: &str,
        _metadata: CallMetadata,
    ) -> TelephonyResult<String> {
        match *self.behavior.lock() {
            DialBehavior::Accept => {
                let id = format!("PA{:08}", self.counter.fetch_add(1, Ordering::Relaxed));
                self.created
                    .lock()
                    .push((id.clone(), from.to_owned(), to.to_owned()));
                Ok(id)
            }
            DialBehavior::FailTransient => Err(TelephonyError::Transient("503".into())),
            DialBehavior::FailTerminal => Err(TelephonyError::Terminal("invalid number".into())),
        }
    }

    async fn hangup(&self, provider_call_id: &str) -> TelephonyResult<()> {
        self.hangups.lock().push(provider_call_id.to_owned());
        Ok(())
    }
}

/// Fast tunables for tests; individual tests override fields.
pub fn test_tunables() -> CoreTunables {
    CoreTunables {
        pre_dial_ttl: Duration::from_millis(200),
        pre_dial_ttl_max: Duration::from_millis(600),
        active_ttl: Duration::from_secs(30),
        reservation_ttl: Duration::from_millis(300),
        gate_ttl: Duration::from_millis(500),
        cold_start_blocking: Duration::from_millis(300),
        cold_start_grace: Duration::from_millis(600),
        promote_interval: Duration::from_millis(50),
        janitor_interval: Duration::from_millis(100),
        metrics_export_interval: Duration::from_secs(60),
        dispatch_workers: 2,
        ..Default::default()
    }
}

pub struct TestBed {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MemoryBroker>,
    pub calls: Arc<MemoryCallStore>,
    pub telephony: Arc<MockTelephony>,
    pub directory: Arc<StaticDirectory>,
    pub tunables: CoreTunables,
}

impl TestBed {
    pub fn new(tunables: CoreTunables) -> Self {
        Self {
            store: Arc::new(MemoryStore::new(tunables.clone())),
            broker: Arc::new(MemoryBroker::default()),
            calls: Arc::new(MemoryCallStore::new()),
            telephony: Arc::new(MockTelephony::default()),
            directory: Arc::new(StaticDirectory::new()),
            tunables,
        }
    }

    pub fn campaign(&self, id: &str, limit: u32, priority_mode: PriorityMode) -> CampaignId {
        let cid = CampaignId::from(id);
        self.directory.insert(CampaignDefinition {
            id: cid.clone(),
            name: id.to_owned(),
            agent_ref: "agent-a".into(),
            phone_ref: "+15550100".into(),
            state: CampaignState::Active,
            concurrent_limit: limit,
            retry: RetryPolicy {
                retry_failed: true,
                max_retry_attempts: 3,
                retry_delay: Duration::from_millis(50),
                exclude_voicemail: false,
            },
            priority_mode,
        });
        cid
    }

    fn dyn_store(&self) -> Arc<dyn CoordinationStore> {
        self.store.clone()
    }

    fn dyn_broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    fn dyn_calls(&self) -> Arc<dyn CallStore> {
        self.calls.clone()
    }

    fn dyn_directory(&self) -> Arc<dyn CampaignDirectory> {
        self.directory.clone()
    }

    pub fn breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(self.dyn_store())
    }

    pub fn guard(&self) -> ColdStartGuard {
        ColdStartGuard::new(self.dyn_store(), self.dyn_calls())
    }

    pub fn retry(&self) -> RetryScheduler {
        RetryScheduler::new(self.dyn_broker(), self.dyn_calls())
    }

    pub fn promoter(&self) -> Promoter {
        Promoter::new(
            self.dyn_store(),
            self.dyn_broker(),
            self.dyn_calls(),
            self.dyn_directory(),
            self.breaker(),
            self.guard(),
            self.tunables.clone(),
        )
    }

    pub fn janitor(&self) -> LeaseJanitor {
        LeaseJanitor::new(
            self.dyn_store(),
            self.dyn_broker(),
            self.dyn_directory(),
            self.tunables.clone(),
        )
    }

    pub fn worker(&self, worker_id: usize) -> DispatchWorker {
        DispatchWorker::new(
            self.dyn_store(),
            self.dyn_broker(),
            self.dyn_calls(),
            self.telephony.clone(),
            self.dyn_directory(),
            self.breaker(),
            self.guard(),
            self.retry(),
            self.tunables.clone(),
            worker_id,
        )
    }

    pub fn reconciler(&self) -> ReleaseReconciler {
        ReleaseReconciler::new(
            self.dyn_store(),
            self.dyn_calls(),
            self.dyn_directory(),
            self.retry(),
        )
    }

    pub fn engine(&self) -> Engine {
        Engine::new(
            self.dyn_store(),
            self.dyn_broker(),
            self.dyn_calls(),
            self.telephony.clone(),
            self.dyn_directory(),
            self.tunables.clone(),
        )
    }
}

/// Poll until `f` returns true or a few seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if f().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
