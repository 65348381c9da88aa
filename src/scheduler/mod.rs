//! Poll-cycle scheduler and state cache.
//!
//! One cycle: resolve endpoints → poll balances and contracts → anomaly
//! rules against the previous cycle's observations → persist (deduped) →
//! escalate → update cache → status doc → system log. Cycles never overlap:
//! the `Monitor` lives behind a `tokio::sync::Mutex` shared with the control
//! API, and both the timer loop and the API's trigger endpoints run a cycle
//! only while holding it.
//!
//! A separate health-check task watches the last-cycle timestamp and raises
//! `service_health_warning` when the scheduler has been silent too long.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::anomaly::{Alert, AnomalyEngine, Severity};
use crate::chain::types::{BalanceSnapshot, ContractStat};
use crate::chain::{balance, contracts, Session};
use crate::config::{Config, ContractConfig, NetworkConfig, SchedulerConfig, WalletConfig};
use crate::notify::Mailer;
use crate::rpc::EndpointPool;
use crate::store::{MonitorStore, StatusDoc, SystemLogEntry};

/// Bound on a best-effort lifecycle email during shutdown/crash paths.
const NOTICE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime-adjustable settings, pushed from the control API over a watch
/// channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub interval_secs: u64,
    pub networks: Vec<String>,
}

/// Previous observation per entity key. At most one value per key; the
/// anomaly rules diff against exactly that value.
#[derive(Default)]
struct StateCache {
    balances: HashMap<String, BalanceSnapshot>,
    contracts: HashMap<String, ContractStat>,
}

/// Summary of one completed cycle, returned to the API trigger endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub balances: usize,
    pub contracts: usize,
    pub alerts: usize,
    pub skipped_writes: usize,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

/// Owns everything a cycle touches. Lives behind a shared mutex that doubles
/// as the no-overlap guard.
pub struct Monitor {
    all_networks: BTreeMap<String, NetworkConfig>,
    pool: EndpointPool,
    wallets: Vec<WalletConfig>,
    watches: Vec<ContractConfig>,
    engine: AnomalyEngine,
    store: MonitorStore,
    mailer: Option<Mailer>,
    cache: StateCache,
    cfg: SchedulerConfig,
    cycle_count: u64,
    failure_counts: BTreeMap<String, u32>,
}

impl Monitor {
    pub fn new(config: &Config, store: MonitorStore, mailer: Option<Mailer>) -> Self {
        let pool = EndpointPool::new(
            &config.networks,
            Duration::from_secs(config.scheduler.rpc_timeout_secs),
        );
        Self {
            all_networks: config.networks.clone(),
            pool,
            wallets: config.wallets.clone(),
            watches: config.contracts.clone(),
            engine: AnomalyEngine::new(config.thresholds.clone()),
            store,
            mailer,
            cache: StateCache::default(),
            cfg: config.scheduler.clone(),
            cycle_count: 0,
            failure_counts: BTreeMap::new(),
        }
    }

    /// Swap the active network set. Unknown names are dropped with a
    /// warning; endpoint failover state restarts from the primary URL.
    pub fn set_networks(&mut self, names: &[String]) {
        let mut active = BTreeMap::new();
        for name in names {
            match self.all_networks.get(name) {
                Some(cfg) => {
                    active.insert(name.clone(), cfg.clone());
                }
                None => warn!(network = %name, "unknown network in settings update, ignored"),
            }
        }
        if active.is_empty() {
            warn!("settings update matched no configured networks, keeping current set");
            return;
        }
        self.failure_counts.retain(|k, _| active.contains_key(k));
        self.pool = EndpointPool::new(&active, Duration::from_secs(self.cfg.rpc_timeout_secs));
        info!(networks = ?active.keys().collect::<Vec<_>>(), "active network set updated");
    }

    pub fn active_networks(&self) -> Vec<String> {
        let mut names = self.pool.network_names();
        names.sort();
        names
    }

    /// Run one full poll cycle. Errors are contained: per-pair failures
    /// become entries in `errors`, persistence failures are logged and the
    /// data retried naturally next cycle.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let started = Instant::now();
        let mut errors = Vec::new();

        // Resolve one session per active network, with failover.
        let mut sessions = Vec::new();
        for network in self.active_networks() {
            match self.pool.resolve(&network).await {
                Ok(ep) => {
                    self.failure_counts.remove(&network);
                    let currency = self
                        .all_networks
                        .get(&network)
                        .map(|c| c.currency.clone())
                        .unwrap_or_default();
                    debug!(network = %network, url = %ep.url, "session established");
                    sessions.push(Session {
                        network: ep.network,
                        currency,
                        provider: ep.provider,
                    });
                }
                Err(e) => {
                    *self.failure_counts.entry(network.clone()).or_insert(0) += 1;
                    warn!(network = %network, error = %e, "network skipped this cycle");
                    errors.push(e.to_string());
                }
            }
        }

        let call_timeout = Duration::from_secs(self.cfg.rpc_timeout_secs);
        let ((snapshots, balance_errors), (stats, contract_errors)) = tokio::join!(
            balance::poll_balances(
                &sessions,
                &self.wallets,
                call_timeout,
                self.cfg.max_concurrent_polls
            ),
            contracts::poll_contracts(
                &sessions,
                &self.watches,
                call_timeout,
                self.cfg.max_concurrent_polls
            ),
        );
        errors.extend(balance_errors);
        errors.extend(contract_errors);

        // Rules run against the cache before it is updated.
        let mut alerts: Vec<Alert> = Vec::new();
        for snap in &snapshots {
            if let Some(alert) = self.engine.check_low_balance(snap) {
                alerts.push(alert);
            }
            let previous = self.cache.balances.get(&snap.doc_key());
            alerts.extend(self.engine.evaluate_balance(snap, previous));
        }
        for stat in &stats {
            let previous = self.cache.contracts.get(&stat.doc_key());
            let elapsed = previous
                .map(|p| hours_between(p.observed_at, stat.observed_at))
                .unwrap_or(0.0);
            alerts.extend(self.engine.evaluate_contract(stat, previous, elapsed));
        }

        // Persist partial results regardless of what failed above.
        let mut skipped_writes = 0usize;
        for snap in &snapshots {
            match self.store.put_balance(snap).await {
                Ok(true) => {}
                Ok(false) => skipped_writes += 1,
                Err(e) => warn!(doc_key = %snap.doc_key(), error = %e, "balance write failed"),
            }
        }
        for stat in &stats {
            match self.store.put_contract(stat).await {
                Ok(true) => {}
                Ok(false) => skipped_writes += 1,
                Err(e) => warn!(doc_key = %stat.doc_key(), error = %e, "contract write failed"),
            }
        }

        for alert in &alerts {
            if let Err(e) = self.store.push_alert(alert).await {
                warn!(alert_id = %alert.id, error = %e, "alert write failed");
            }
            if alert.should_escalate() {
                self.escalate(alert).await;
            }
        }

        for snap in snapshots.iter().cloned() {
            self.cache.balances.insert(snap.doc_key(), snap);
        }
        for stat in stats.iter().cloned() {
            self.cache.contracts.insert(stat.doc_key(), stat);
        }

        self.cycle_count += 1;
        self.write_status(true).await;

        let outcome = CycleOutcome {
            balances: snapshots.len(),
            contracts: stats.len(),
            alerts: alerts.len(),
            skipped_writes,
            errors,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        let entry = SystemLogEntry::new(
            "cycle_completed",
            json!({
                "cycle": self.cycle_count,
                "balances": outcome.balances,
                "contracts": outcome.contracts,
                "alerts": outcome.alerts,
                "skippedWrites": outcome.skipped_writes,
                "errors": outcome.errors.len(),
                "elapsedMs": outcome.elapsed_ms,
            }),
            "scheduler",
        );
        if let Err(e) = self.store.log_system(&entry).await {
            warn!(error = %e, "system log write failed");
        }
        info!(
            cycle = self.cycle_count,
            balances = outcome.balances,
            contracts = outcome.contracts,
            alerts = outcome.alerts,
            errors = outcome.errors.len(),
            elapsed_ms = outcome.elapsed_ms,
            "cycle completed"
        );
        outcome
    }

    /// Email an alert and flip its persisted `notified` flag on success.
    async fn escalate(&mut self, alert: &Alert) {
        let Some(mailer) = &self.mailer else { return };
        match mailer.send_alert(alert).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_notified(&alert.id).await {
                    warn!(alert_id = %alert.id, error = %e, "notified flag not persisted");
                }
            }
            Err(e) => warn!(alert_id = %alert.id, error = %e, "alert email failed"),
        }
    }

    async fn write_status(&mut self, running: bool) {
        let status = StatusDoc {
            running,
            last_cycle_at: if self.cycle_count > 0 {
                Some(Utc::now())
            } else {
                None
            },
            cycle_count: self.cycle_count,
            networks: self.active_networks(),
            failure_counts: self.failure_counts.clone(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.store.set_status(&status).await {
            warn!(error = %e, "status write failed");
        }
    }

    /// Reset the running flag without restarting the process.
    pub async fn reset_running(&mut self) {
        self.write_status(true).await;
    }

    pub async fn announce_startup(&mut self) {
        let entry = SystemLogEntry::new(
            "service_started",
            json!({
                "networks": self.active_networks(),
                "wallets": self.wallets.len(),
                "contracts": self.watches.len(),
            }),
            "scheduler",
        );
        if let Err(e) = self.store.log_system(&entry).await {
            warn!(error = %e, "startup log write failed");
        }
        if let Some(mailer) = &self.mailer {
            if let Err(e) = mailer
                .send_notice("monitor started", "fleet monitoring is up")
                .await
            {
                warn!(error = %e, "startup email failed");
            }
        }
    }

    pub async fn announce_shutdown(&mut self) {
        self.write_status(false).await;
        let entry = SystemLogEntry::new(
            "service_stopped",
            json!({ "cycles": self.cycle_count }),
            "scheduler",
        );
        if let Err(e) = self.store.log_system(&entry).await {
            warn!(error = %e, "shutdown log write failed");
        }
        if let Some(mailer) = &self.mailer {
            let send = mailer.send_notice("monitor stopped", "fleet monitoring shut down");
            if let Some(reason) = notice_failure(tokio::time::timeout(NOTICE_TIMEOUT, send).await)
            {
                warn!(reason = %reason, "shutdown email failed");
            }
        }
    }

    /// Last-resort reporting for a fatal error escaping the run loop. The
    /// process exits non-zero after this.
    pub async fn announce_crash(&mut self, reason: &str) {
        error!(reason = reason, "service crashed");
        self.write_status(false).await;
        let alert = Alert::lifecycle(
            Severity::Critical,
            format!("monitor crashed: {reason}"),
            json!({ "reason": reason }),
        );
        if let Err(e) = self.store.push_alert(&alert).await {
            warn!(error = %e, "crash alert write failed");
        }
        let entry =
            SystemLogEntry::new("service_crashed", json!({ "reason": reason }), "scheduler");
        if let Err(e) = self.store.log_system(&entry).await {
            warn!(error = %e, "crash log write failed");
        }
        if let Some(mailer) = &self.mailer {
            let send = mailer.send_notice("monitor crashed", reason);
            if let Some(why) = notice_failure(tokio::time::timeout(NOTICE_TIMEOUT, send).await) {
                warn!(reason = %why, "crash email failed");
            }
        }
    }
}

/// Timer-driven run loop. Settings changes rebuild the timer immediately;
/// cancellation stops the loop between cycles (an in-flight cycle always
/// completes first because it runs inside the select arm).
pub async fn run(
    monitor: Arc<Mutex<Monitor>>,
    mut settings: watch::Receiver<SchedulerSettings>,
    cancel: CancellationToken,
    last_cycle: Arc<AtomicI64>,
) {
    let mut interval_secs = settings.borrow().interval_secs;
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    monitor.lock().await.announce_startup().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let outcome = monitor.lock().await.run_cycle().await;
                last_cycle.store(Utc::now().timestamp(), Ordering::SeqCst);
                if !outcome.errors.is_empty() {
                    warn!(errors = outcome.errors.len(), "cycle finished with errors");
                }
            }
            changed = settings.changed() => {
                if changed.is_err() {
                    break;
                }
                let new = settings.borrow_and_update().clone();
                monitor.lock().await.set_networks(&new.networks);
                if new.interval_secs != interval_secs {
                    interval_secs = new.interval_secs;
                    ticker = rescheduled_ticker(interval_secs);
                    info!(interval_secs = interval_secs, "cycle interval updated");
                }
            }
        }
    }

    monitor.lock().await.announce_shutdown().await;
    info!("scheduler stopped");
}

/// Watches the last-cycle timestamp and raises a health warning when the
/// scheduler goes silent. One alert per stale episode, not per check.
pub async fn run_health_check(
    mut store: MonitorStore,
    mailer: Option<Mailer>,
    cfg: SchedulerConfig,
    last_cycle: Arc<AtomicI64>,
    cancel: CancellationToken,
) {
    let started_at = Utc::now().timestamp();
    let mut ticker =
        tokio::time::interval(Duration::from_secs(cfg.health_check_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut was_stale = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let last = match last_cycle.load(Ordering::SeqCst) {
                    0 => started_at,
                    ts => ts,
                };
                let now = Utc::now().timestamp();
                let stale = is_stale(last, now, cfg.stale_after_secs);
                if stale && !was_stale {
                    let silent_secs = now - last;
                    let alert = Alert::new(
                        crate::anomaly::AlertKind::ServiceHealthWarning,
                        Severity::Warning,
                        format!("no completed cycle for {silent_secs}s (threshold {}s)", cfg.stale_after_secs),
                        json!({
                            "silentSeconds": silent_secs,
                            "staleAfterSeconds": cfg.stale_after_secs,
                        }),
                    );
                    if let Err(e) = store.push_alert(&alert).await {
                        warn!(error = %e, "health alert write failed");
                    }
                    if let Some(mailer) = &mailer {
                        match mailer.send_alert(&alert).await {
                            Ok(()) => {
                                if let Err(e) = store.mark_notified(&alert.id).await {
                                    warn!(error = %e, "notified flag not persisted");
                                }
                            }
                            Err(e) => warn!(error = %e, "health email failed"),
                        }
                    }
                    let entry = SystemLogEntry::new(
                        "service_health_warning",
                        json!({ "silentSeconds": silent_secs }),
                        "health_check",
                    );
                    if let Err(e) = store.log_system(&entry).await {
                        warn!(error = %e, "health log write failed");
                    }
                } else if !stale && was_stale {
                    info!("scheduler recovered, cycles completing again");
                }
                was_stale = stale;
            }
        }
    }
}

/// Ticker for a changed interval. The first tick lands a full period out —
/// a settings update reschedules the cycle, it does not run one.
fn rescheduled_ticker(interval_secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(interval_secs.max(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Failure description for a bounded best-effort notice send, if any.
/// Both an SMTP error inside the window and the window expiring count.
fn notice_failure(
    result: Result<anyhow::Result<()>, tokio::time::error::Elapsed>,
) -> Option<String> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(format!("timed out after {NOTICE_TIMEOUT:?}")),
    }
}

fn hours_between(prev: DateTime<Utc>, cur: DateTime<Utc>) -> f64 {
    (cur - prev).num_milliseconds() as f64 / 3_600_000.0
}

fn is_stale(last_cycle_unix: i64, now_unix: i64, stale_after_secs: u64) -> bool {
    now_unix.saturating_sub(last_cycle_unix) > stale_after_secs as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_after_threshold() {
        // Last cycle 11 minutes ago, threshold 10 minutes — stale.
        assert!(is_stale(1_000, 1_000 + 660, 600));
        // Exactly at the threshold is still fresh.
        assert!(!is_stale(1_000, 1_000 + 600, 600));
        assert!(!is_stale(1_000, 1_000 + 30, 600));
    }

    #[test]
    fn test_hours_between() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::minutes(90);
        let h = hours_between(t0, t1);
        assert!((h - 1.5).abs() < 1e-9);
        // Clock skew backwards yields a negative value, which the rate
        // rules then discard.
        assert!(hours_between(t1, t0) < 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduled_ticker_waits_a_full_period() {
        let mut ticker = rescheduled_ticker(300);
        // Nothing before the new period elapses — an interval change must
        // not run an extra cycle on the spot.
        assert!(
            tokio::time::timeout(Duration::from_secs(299), ticker.tick())
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_secs(2), ticker.tick())
                .await
                .is_ok()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_notice_failure_reports_send_errors_and_timeouts() {
        assert_eq!(notice_failure(Ok(Ok(()))), None);
        assert_eq!(
            notice_failure(Ok(Err(anyhow::anyhow!("relay refused")))),
            Some("relay refused".to_string())
        );

        // A send that outlives the window reads as a timeout.
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .expect_err("pending future must time out");
        let why = notice_failure(Err(elapsed)).expect("timeout is a failure");
        assert!(why.contains("timed out"), "got: {why}");
    }

    #[test]
    fn test_settings_equality_drives_watch_updates() {
        let a = SchedulerSettings {
            interval_secs: 300,
            networks: vec!["polygon".to_string()],
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
