#![allow(clippy::cognitive_complexity)]
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};

mod startup_health;

use config::{IpamConfig, wire::BackendMode};
use external_api::{ExternalApi, Health};
use ip_manager::{
    Allocator, LeaseStore, memory::MemoryStore, metrics::STORE_AVAILABLE, redis::RedisStore,
};
use ipam_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    metrics::SWEEP_FAILURES,
    tokio::{
        self,
        runtime::Builder,
        signal,
        sync::mpsc,
        task::JoinHandle,
        time::{self, MissedTickBehavior},
    },
    tracing::*,
};
use startup_health::{verify_background_task_running, verify_startup_subsystems};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    if let Err(err) = dotenv::dotenv() {
        eprintln!(".env file not loaded: {err}");
    }
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.ipam_log)?;
    debug!(?config, ?trace_config);

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => {
                error!(?err, "failed to start server");
                Err(anyhow!(err))
            }
            Ok(Err(err)) => {
                error!(?err, "exited with error");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!("exiting...");
                Ok(())
            }
        }
    })
}

async fn start(config: cli::Config) -> Result<()> {
    info!(ipam_id = ?config.ipam_id, "using id");

    debug!("parsing ipam config");
    let ipam_cfg = Arc::new(IpamConfig::parse(&config.config_path)?);
    let space = ipam_cfg.address_space();
    info!(
        network = ipam_cfg.network_name(),
        subnet = %space.subnet(),
        range = ?space.range(),
        gateway = %space.gateway(),
        allocatable = space.allocatable_size(),
        "loaded address space"
    );

    let backend_mode = ipam_cfg.backend_mode();
    info!(?backend_mode, "lease backend mode");

    match backend_mode {
        BackendMode::Memory => {
            warn!("memory backend selected, leases are not shared between hosts");
            run(config, ipam_cfg, MemoryStore::new()).await
        }
        BackendMode::Redis => {
            let store_cfg = ipam_cfg.store();
            info!(host = %store_cfg.host, port = store_cfg.port, db = store_cfg.db, "connecting to redis");
            let store = RedisStore::new(
                ipam_cfg.redis_url(),
                &store_cfg.key_prefix,
                ipam_cfg.network_name(),
            )
            .await
            .context("failed to connect to redis lease store")?;
            run(config, ipam_cfg, store).await
        }
    }
}

/// serve the admin api over `store` until ctrl-c
async fn run<S: LeaseStore>(config: cli::Config, ipam_cfg: Arc<IpamConfig>, store: S) -> Result<()> {
    let alloc = Arc::new(Allocator::new(store, &ipam_cfg).with_timeout(config.store_timeout()));
    alloc
        .ping()
        .await
        .context("lease store unreachable at startup")?;
    STORE_AVAILABLE.set(1);

    let api = ExternalApi::new(config.ipam_addr, Arc::clone(&ipam_cfg), Arc::clone(&alloc))
        .with_timeout(config.api_timeout());

    let token = CancellationToken::new();
    let api_sender = api.sender();
    let mut api_task = api.start(token.clone());

    let mut sweep_task = config
        .sweep_interval()
        .map(|interval| spawn_sweep_task(Arc::clone(&alloc), interval, token.clone()));
    if sweep_task.is_none() {
        warn!("expired lease sweep disabled");
    }
    let mut monitor_task = spawn_store_monitor_task(
        Arc::clone(&alloc),
        api_sender.clone(),
        config.monitor_interval(),
        token.clone(),
    );

    // Keep health BAD until all startup-critical tasks are confirmed running.
    if let Err(err) = verify_startup_subsystems(&mut api_task, &mut monitor_task).await {
        token.cancel();
        return Err(err);
    }
    if let Some(task) = sweep_task.as_mut()
        && let Err(err) = verify_background_task_running("expired lease sweep", task).await
    {
        token.cancel();
        return Err(err);
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let res = tokio::select! {
        res = shutdown_signal(token.clone()) => res,
        res = &mut api_task => {
            token.cancel();
            Err(anyhow!("admin API exited unexpectedly: {res:?}"))
        }
    };

    if let Err(err) = monitor_task.await {
        error!(?err, "error waiting for store monitor task");
    }
    if let Some(task) = sweep_task
        && let Err(err) = task.await
    {
        error!(?err, "error waiting for expired lease sweep task");
    }
    if !api_task.is_finished()
        && let Err(err) = api_task.await
    {
        error!(?err, "error waiting for web server API");
    }
    res
}

fn spawn_sweep_task<S: LeaseStore>(
    alloc: Arc<Allocator<S>>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("expired lease sweep task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match alloc.sweep_expired().await {
                        Ok(reclaimed) => {
                            failures = 0;
                            SWEEP_FAILURES.set(0);
                            debug!(reclaimed, "expired lease sweep completed");
                        }
                        Err(err) => {
                            failures += 1;
                            SWEEP_FAILURES.set(failures);
                            warn!(?err, failures, "expired lease sweep failed");
                        }
                    }
                }
            }
        }
    })
}

/// pings the store and reports transitions as health changes
fn spawn_store_monitor_task<S: LeaseStore>(
    alloc: Arc<Allocator<S>>,
    health: mpsc::Sender<Health>,
    poll_interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the store answered a ping right before this task started
        let mut was_available = true;
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("store monitor task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let res = alloc.ping().await;
                    let is_available = res.is_ok();
                    if is_available == was_available {
                        continue;
                    }
                    was_available = is_available;
                    if is_available {
                        info!("lease store reachable again");
                        STORE_AVAILABLE.set(1);
                        let _ = health.send(Health::Good).await;
                    } else {
                        warn!(err = ?res.err(), "lease store unreachable");
                        STORE_AVAILABLE.set(0);
                        let _ = health.send(Health::Bad).await;
                    }
                }
            }
        }
    })
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    info!("shutdown requested");
    token.cancel();
    ret
}
