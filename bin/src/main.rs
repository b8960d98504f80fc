#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

mod startup_health;

use config::{BackendMode, DialerConfig};
use rotary_core::{
    async_trait,
    broker::MemoryBroker,
    campaign::StaticDirectory,
    config::{
        cli::{self, Parser},
        trace,
    },
    telephony::{CallMetadata, TelephonyProvider, TelephonyResult},
    tokio::{self, runtime::Builder, signal},
    tokio_util::sync::CancellationToken,
    tracing::*,
    Engine,
};

use call_store::SqliteCallStore;
use redis_coordination::{CoordinationStore, MemoryStore, RedisStore};
use startup_health::verify_background_task_running;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.rotary_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    let rt = builder.build()?;

    rt.block_on(async move {
        match rotary_core::tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start dispatcher"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let rotary_id = config.rotary_id.clone();
    info!(?rotary_id, "using id");

    debug!("parsing dispatcher config");
    let dialer_cfg = DialerConfig::parse(&config.config_path)?;
    let tunables = dialer_cfg.tunables();

    let backend = dialer_cfg.backend();
    info!(?backend, "coordination backend mode");
    let store: Arc<dyn CoordinationStore> = match backend {
        BackendMode::Standalone => {
            info!("starting in standalone mode (in-memory coordination)");
            Arc::new(MemoryStore::new(tunables.clone()))
        }
        BackendMode::Redis => {
            let redis_cfg = dialer_cfg
                .redis()
                .ok_or_else(|| anyhow!("redis mode requires redis configuration"))?;
            let url = config.redis_url.as_deref().unwrap_or(&redis_cfg.url);
            info!("connecting to redis for coordination");
            let store = RedisStore::connect(
                url,
                std::time::Duration::from_millis(redis_cfg.response_timeout_ms),
                tunables.clone(),
            )
            .await
            .map_err(|e| anyhow!("redis connection failed: {e}"))?;
            info!("redis connection established");
            Arc::new(store)
        }
    };

    info!(database_url = %config.database_url, "starting call database");
    let calls = Arc::new(
        SqliteCallStore::new(&config.database_url)
            .await
            .context("call database failed to open")?,
    );

    let directory = Arc::new(StaticDirectory::from_config(&dialer_cfg));
    let broker = Arc::new(MemoryBroker::default());

    // deployments wire their provider SDK here
    warn!("no telephony SDK configured, using the simulated provider");
    let telephony = Arc::new(SimulatedProvider::default());

    let engine = Engine::new(
        store,
        broker,
        calls,
        telephony,
        directory,
        tunables,
    );

    let token = CancellationToken::new();
    let mut handles = engine.start(token.clone());

    // Keep going only if all engine tasks survive startup.
    for (idx, handle) in handles.iter_mut().enumerate() {
        if let Err(err) = verify_background_task_running("engine task", handle).await {
            error!(task = idx, ?err, "startup check failed");
            token.cancel();
            return Err(err);
        }
    }
    info!("dispatcher running");

    shutdown_signal(token).await?;
    for handle in handles {
        if let Err(err) = handle.await {
            error!(?err, "error waiting for engine task");
        }
    }
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}

/// Stand-in provider: accepts every call and never delivers webhooks. Real
/// deployments replace this with their telephony SDK adapter.
#[derive(Debug, Default)]
struct SimulatedProvider {
    counter: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl TelephonyProvider for SimulatedProvider {
    async fn create_call(
        &self,
        from: &str,
        to: &str,
        metadata: CallMetadata,
    ) -> TelephonyResult<String> {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(%from, %to, call = %metadata.call_id, "simulated call created");
        Ok(format!("SIM{n:08}"))
    }

    async fn hangup(&self, provider_call_id: &str) -> TelephonyResult<()> {
        info!(%provider_call_id, "simulated hangup");
        Ok(())
    }
}
