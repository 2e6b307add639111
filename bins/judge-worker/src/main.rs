mod config;
mod docker;
mod executor;
mod health;
mod matcher;
mod metrics;
mod pool;
mod reconciler;
mod runtime;
mod verdict;
mod watchdog;

use anyhow::Context;
use config::{SandboxConfig, StoreBackend, WorkerConfig};
use docker::DockerRuntime;
use executor::SandboxExecutor;
use health::HealthState;
use judge_common::store::{MemoryStore, RedisStore};
use judge_common::{JobStore, RequestStore};
use pool::WorkerPool;
use reconciler::Reconciler;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

async fn open_store(backend: StoreBackend) -> anyhow::Result<(Arc<dyn JobStore>, Arc<dyn RequestStore>)> {
    match backend {
        StoreBackend::Redis => {
            let config = judge_common::Config::from_env();
            let store = Arc::new(
                RedisStore::connect(&config)
                    .await
                    .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?,
            );
            info!("Connected to Redis: {} (prefix {})", config.redis_url, config.key_prefix);
            let jobs: Arc<dyn JobStore> = store.clone();
            let requests: Arc<dyn RequestStore> = store;
            Ok((jobs, requests))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store, queue state is lost on exit");
            let store = Arc::new(MemoryStore::new());
            let jobs: Arc<dyn JobStore> = store.clone();
            let requests: Arc<dyn RequestStore> = store;
            Ok((jobs, requests))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let worker_config = WorkerConfig::from_env()?;
    init_tracing(worker_config.json_logs);

    info!("Judge worker booting...");
    metrics::init_metrics();

    let sandbox_config = SandboxConfig::load_or_default(&worker_config.sandbox_config_path).map_err(|e| {
        error!("Failed to load sandbox configuration: {:#}", e);
        e
    })?;
    info!(
        build_image = %sandbox_config.build.image,
        judge_image = %sandbox_config.judge.image,
        cpuset = %sandbox_config.cpuset,
        "Sandbox configuration loaded"
    );

    let (jobs, requests) = open_store(worker_config.store_backend).await?;

    let runtime = Arc::new(DockerRuntime::connect()?);
    let executor = Arc::new(SandboxExecutor::new(runtime, Arc::new(sandbox_config)));
    executor.check_images().await.map_err(|e| {
        error!("Sandbox images are missing: {:#}", e);
        e
    })?;

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let reconciler = Arc::new(Reconciler::new(
        jobs.clone(),
        requests,
        worker_config.stale_after,
        worker_config.drain_batch,
    ));
    {
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        let interval = worker_config.reclaim_interval;
        tasks.spawn(async move {
            reconciler.run_reclaim_loop(interval, cancel).await;
            Ok(())
        });
    }
    if worker_config.drain_enabled {
        let reconciler = reconciler.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            reconciler.run_drain_loop(cancel).await;
            Ok(())
        });
    } else {
        info!("Drain loop disabled");
    }

    tasks.spawn(health::serve(
        worker_config.health_addr,
        Arc::new(HealthState { store: jobs.clone() }),
        cancel.clone(),
    ));

    let pool = WorkerPool::new(jobs, executor, worker_config.pool_size, worker_config.poll_interval);
    tasks.spawn(pool.run(cancel.clone()));

    info!(workers = worker_config.pool_size, "Judge worker ready");

    tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            warn!("Received shutdown signal, stopping workers...");
        }
        Some(joined) = tasks.join_next() => {
            error!("A background task exited early: {:?}", joined);
        }
    }
    cancel.cancel();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Task failed during shutdown: {:#}", e),
            Err(e) => error!("Task panicked during shutdown: {}", e),
        }
    }

    info!("Judge worker shutdown complete");
    Ok(())
}
