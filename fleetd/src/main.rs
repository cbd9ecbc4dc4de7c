//! `fleetd`: the fleet control plane daemon.
//!
//! Wires the store/orchestration layers to the HTTP surface and runs the
//! background sweeps (liveness, rollout tick, job timeouts, event
//! partition maintenance) alongside the listener: one `main` that builds
//! state, spawns workers, and drains them on shutdown.

mod applications;
mod config;
mod db;
mod dberror;
mod event_log;
mod http;
mod id_allocator;
mod jobs;
mod liveness;
mod metrics;
mod rollout;
mod state_store;
mod webhook;

use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use applications::ApplicationStore;
use config::Config;
use event_log::EventLog;
use http::AppState;
use id_allocator::IdAllocator;
use jobs::JobDispatcher;
use liveness::LivenessMonitor;
use rollout::{HealthChecker, PolicyStore, RollbackManager, RolloutOrchestrator};
use state_store::StateStore;

#[derive(Parser, Debug)]
#[command(name = "fleetd", about = "Fleet control plane daemon")]
struct Cli {
    /// Run pending migrations and exit, without starting the server.
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(errors) => {
            for e in &errors {
                error!(error = %e, "invalid configuration");
            }
            return ExitCode::FAILURE;
        }
    };

    let pool = match db::connect(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to connect to database");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = db::migrate(&pool).await {
        error!(error = %e, "failed to run migrations");
        return ExitCode::FAILURE;
    }

    if cli.migrate_only {
        info!("migrations applied, exiting (--migrate-only)");
        return ExitCode::SUCCESS;
    }

    metrics::register();

    let events = EventLog::new(pool.clone());
    let state_store = StateStore::new(pool.clone(), events.clone());
    let id_allocator = IdAllocator::new(pool.clone());
    let applications = ApplicationStore::new(pool.clone());
    let policies = PolicyStore::new(pool.clone());
    let health = HealthChecker::new(state_store.clone());
    let rollback = RollbackManager::new(pool.clone(), state_store.clone(), events.clone());
    let orchestrator = RolloutOrchestrator::new(
        pool.clone(),
        state_store.clone(),
        events.clone(),
        policies.clone(),
        health,
        rollback.clone(),
    );
    let jobs = JobDispatcher::new(pool.clone(), events.clone());

    let state = AppState {
        pool: pool.clone(),
        events: events.clone(),
        state_store: state_store.clone(),
        id_allocator,
        applications,
        policies: policies.clone(),
        orchestrator: orchestrator.clone(),
        rollback,
        jobs: jobs.clone(),
        webhook_secret: config.webhook_secret.clone(),
        api_version: config.api_version.clone(),
        started_at: Instant::now(),
        heartbeat_tick: config.heartbeat_tick,
        offline_threshold: config.offline_threshold,
    };

    let router = http::create_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = Vec::new();
    if config.heartbeat_enabled {
        workers.push(tokio::spawn(run_liveness_loop(
            LivenessMonitor::new(
                pool.clone(),
                events.clone(),
                config.heartbeat_tick,
                config.offline_threshold,
            ),
            config.heartbeat_tick,
            shutdown_rx.clone(),
        )));
    }
    workers.push(tokio::spawn(run_rollout_tick_loop(
        orchestrator,
        config.rollout_tick,
        shutdown_rx.clone(),
    )));
    workers.push(tokio::spawn(run_job_sweep_loop(
        jobs,
        config.job_sweep_interval,
        shutdown_rx.clone(),
    )));
    workers.push(tokio::spawn(run_partition_maintenance_loop(
        events,
        config.partition_maintenance_interval,
        config.event_retention_days,
        shutdown_rx.clone(),
    )));

    info!(addr = %config.bind_addr, "fleetd listening");
    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await;

    if let Err(e) = serve_result {
        error!(error = %e, "server exited with error");
    }

    let _ = shutdown_tx.send(true);
    let drain = tokio::time::timeout(config.shutdown_drain, futures::future::join_all(workers)).await;
    if drain.is_err() {
        warn!("background workers did not drain within the shutdown window");
    }

    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

async fn run_liveness_loop(monitor: LivenessMonitor, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = monitor.run_once().await {
                    warn!(error = %e.message, "liveness sweep failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_rollout_tick_loop(
    orchestrator: RolloutOrchestrator,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = orchestrator.tick().await {
                    warn!(error = %e.message, "rollout tick failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_job_sweep_loop(jobs: JobDispatcher, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = jobs.sweep_timeouts().await {
                    warn!(error = %e.message, "job timeout sweep failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_partition_maintenance_loop(
    events: EventLog,
    interval: std::time::Duration,
    retention_days: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = events.maintain_partitions(7, retention_days).await {
                    warn!(error = %e.message, "event partition maintenance failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
