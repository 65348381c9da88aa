mod anomaly;
mod api;
mod chain;
mod config;
mod notify;
mod rpc;
mod scheduler;
mod store;

use std::path::Path;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::notify::Mailer;
use crate::scheduler::{Monitor, SchedulerSettings};
use crate::store::MonitorStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "chainsentry.toml".to_string());
    let config = Config::load(Path::new(&config_path))?;

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        networks = config.networks.len(),
        wallets = config.wallets.len(),
        contracts = config.contracts.len(),
        "chainsentry starting"
    );

    // --- Valkey document store ---
    let mut store = MonitorStore::connect(&config.store.url, &config.store.prefix).await?;
    store.ping().await?;

    // --- SMTP escalation (optional) ---
    let mailer = Mailer::from_config(&config.smtp)?;

    let monitor = Arc::new(Mutex::new(Monitor::new(
        &config,
        store.clone(),
        mailer.clone(),
    )));

    let cancel = CancellationToken::new();
    let last_cycle = Arc::new(AtomicI64::new(0));

    let initial = SchedulerSettings {
        interval_secs: config.scheduler.interval_secs,
        networks: config.networks.keys().cloned().collect(),
    };
    // The sender must outlive the scheduler loop even when the API is off;
    // a closed settings channel reads as a shutdown.
    let (settings_tx, settings_rx) = watch::channel(initial);
    let settings_tx = Arc::new(settings_tx);

    // --- Scheduler ---
    let mut scheduler_handle = tokio::spawn(scheduler::run(
        monitor.clone(),
        settings_rx,
        cancel.clone(),
        last_cycle.clone(),
    ));

    // --- Health check ---
    tokio::spawn(scheduler::run_health_check(
        store.clone(),
        mailer.clone(),
        config.scheduler.clone(),
        last_cycle.clone(),
        cancel.clone(),
    ));

    // --- Control API ---
    if config.api.enabled {
        if config.api.bearer_token.is_empty() {
            warn!("SENTRY_API_TOKEN not set - control endpoints will reject all requests");
        }
        let state = api::ApiState {
            monitor: monitor.clone(),
            store: Arc::new(Mutex::new(store.clone())),
            settings: settings_tx.clone(),
            bearer_token: config.api.bearer_token.clone(),
            started_at: Instant::now(),
            last_cycle: last_cycle.clone(),
        };
        let bind = config.api.bind.clone();
        let api_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, &bind, api_cancel).await {
                error!(error = %e, "control API failed");
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            cancel.cancel();
        }
        result = &mut scheduler_handle => {
            let reason = match result {
                Ok(()) => "scheduler loop exited unexpectedly".to_string(),
                Err(e) => format!("scheduler task failed: {e}"),
            };
            monitor.lock().await.announce_crash(&reason).await;
            cancel.cancel();
            anyhow::bail!(reason);
        }
    }

    // Give an in-flight cycle a bounded window to finish, then leave.
    let grace = Duration::from_secs(config.scheduler.shutdown_grace_secs);
    if tokio::time::timeout(grace, &mut scheduler_handle)
        .await
        .is_err()
    {
        warn!(grace_secs = config.scheduler.shutdown_grace_secs, "cycle still running after grace period");
    }

    info!("chainsentry stopped");
    Ok(())
}
