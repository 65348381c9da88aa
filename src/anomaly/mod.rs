//! Anomaly engine: compares current observations against the previous cycle
//! and a static threshold table, producing alerts.
//!
//! Rules, each independently evaluated:
//!
//! - **Balance relative drop**: current under half of previous (warning),
//!   under 30% of previous (critical, emailed)
//! - **Low balance floor**: absolute minimum regardless of history (warning)
//! - **Claim rate**: reward claims per hour above limit
//! - **Job creation rate**: escrow jobs per hour above limit
//! - **Cancellation ratio**: cancelled/total jobs above limit (error, emailed)
//! - **Distribution rate**: tokens distributed per hour above limit
//! - **Low reserve**: distributor available balance under floor (error, emailed)
//!
//! The engine is stateless — previous observations come from the scheduler's
//! state cache, never from module-level storage.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::chain::types::{BalanceSnapshot, ContractStat, FamilyCounters};
use crate::config::ThresholdConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Absolute low-balance floor breached.
    WalletBalance,
    /// Relative balance drop between cycles.
    BalanceAlert,
    /// Reward claims arriving faster than the hourly limit.
    ClaimRateAlert,
    /// Escrow jobs created faster than the hourly limit.
    InstantjobsCreationRate,
    /// Cancelled/total job ratio above limit.
    InstantjobsHighCancellation,
    /// Token distribution faster than the hourly limit.
    DistributionRateAlert,
    /// Distributor reserve below the floor.
    DistributorLowReserve,
    /// No completed cycle within the stale threshold.
    ServiceHealthWarning,
    /// Scheduler lifecycle: startup, shutdown, crash.
    ServiceLifecycle,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::WalletBalance => write!(f, "wallet_balance"),
            AlertKind::BalanceAlert => write!(f, "balance_alert"),
            AlertKind::ClaimRateAlert => write!(f, "claim_rate_alert"),
            AlertKind::InstantjobsCreationRate => write!(f, "instantjobs_creation_rate"),
            AlertKind::InstantjobsHighCancellation => {
                write!(f, "instantjobs_high_cancellation")
            }
            AlertKind::DistributionRateAlert => write!(f, "distribution_rate_alert"),
            AlertKind::DistributorLowReserve => write!(f, "distributor_low_reserve"),
            AlertKind::ServiceHealthWarning => write!(f, "service_health_warning"),
            AlertKind::ServiceLifecycle => write!(f, "service_lifecycle"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A raised alert. Write-once: after persistence only the `resolved` and
/// `notified` flags may change, never the message or severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub details: serde_json::Value,
    pub raised_at: DateTime<Utc>,
    pub resolved: bool,
    pub notified: bool,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        static SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let raised_at = Utc::now();
        let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let alert = Self {
            id: format!("{}_{}_{}", kind, raised_at.timestamp_millis(), seq),
            kind,
            severity,
            message: message.into(),
            details,
            raised_at,
            resolved: false,
            notified: false,
        };
        info!(
            kind = %alert.kind,
            severity = %alert.severity,
            message = %alert.message,
            "ALERT"
        );
        alert
    }

    pub fn lifecycle(severity: Severity, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::new(AlertKind::ServiceLifecycle, severity, message, details)
    }

    /// Whether this alert is also emailed. Reserved for severe drops,
    /// error/critical contract conditions, and service lifecycle/health.
    pub fn should_escalate(&self) -> bool {
        matches!(
            self.kind,
            AlertKind::ServiceLifecycle | AlertKind::ServiceHealthWarning
        ) || self.severity >= Severity::Error
    }
}

/// Stateless rule evaluator over (current, previous) observation pairs.
pub struct AnomalyEngine {
    thresholds: ThresholdConfig,
}

impl AnomalyEngine {
    pub fn new(thresholds: ThresholdConfig) -> Self {
        Self { thresholds }
    }

    /// Absolute floor check — independent of history, fires on the snapshot
    /// alone.
    pub fn check_low_balance(&self, snap: &BalanceSnapshot) -> Option<Alert> {
        if snap.amount >= self.thresholds.low_balance_floor {
            return None;
        }
        Some(Alert::new(
            AlertKind::WalletBalance,
            Severity::Warning,
            format!(
                "low balance for {} on {}: {} {} (floor {})",
                snap.label, snap.network, snap.amount, snap.currency, self.thresholds.low_balance_floor
            ),
            json!({
                "network": snap.network,
                "wallet": snap.wallet,
                "label": snap.label,
                "amount": snap.amount.to_string(),
                "currency": snap.currency,
                "floor": self.thresholds.low_balance_floor.to_string(),
            }),
        ))
    }

    /// Relative drop check against the previous cycle's snapshot. One alert
    /// at most: warning under the soft threshold, upgraded to critical under
    /// the hard one.
    pub fn evaluate_balance(
        &self,
        current: &BalanceSnapshot,
        previous: Option<&BalanceSnapshot>,
    ) -> Vec<Alert> {
        let previous = match previous {
            Some(p) if p.amount > Decimal::ZERO => p,
            _ => return Vec::new(),
        };

        if current.amount >= previous.amount * self.thresholds.balance_drop_warning {
            return Vec::new();
        }

        let severity = if current.amount < previous.amount * self.thresholds.balance_drop_critical
        {
            Severity::Critical
        } else {
            Severity::Warning
        };

        let drop_pct = ((previous.amount - current.amount) / previous.amount
            * Decimal::from(100))
        .round_dp(1);

        vec![Alert::new(
            AlertKind::BalanceAlert,
            severity,
            format!(
                "balance dropped {}% for {} on {} (prev={} now={} {})",
                drop_pct, current.label, current.network, previous.amount, current.amount,
                current.currency
            ),
            json!({
                "network": current.network,
                "wallet": current.wallet,
                "label": current.label,
                "previous": previous.amount.to_string(),
                "current": current.amount.to_string(),
                "dropPercentage": drop_pct.to_string(),
                "currency": current.currency,
            }),
        )]
    }

    /// Per-family contract rules. Rate rules need a previous stat and a
    /// strictly positive elapsed time; the first observation of an entity
    /// never raises a rate alert. Ratio and reserve rules fire on the
    /// current observation alone.
    pub fn evaluate_contract(
        &self,
        current: &ContractStat,
        previous: Option<&ContractStat>,
        elapsed_hours: f64,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        match &current.counters {
            FamilyCounters::RewardClaim { total_claims, .. } => {
                if let Some(rate) = counter_rate(
                    *total_claims,
                    previous.and_then(|p| match &p.counters {
                        FamilyCounters::RewardClaim { total_claims, .. } => *total_claims,
                        _ => None,
                    }),
                    elapsed_hours,
                ) {
                    if rate > self.thresholds.claim_rate_per_hour {
                        alerts.push(Alert::new(
                            AlertKind::ClaimRateAlert,
                            Severity::Warning,
                            format!(
                                "reward claims at {:.1}/h on {} (limit {}/h)",
                                rate, current.network, self.thresholds.claim_rate_per_hour
                            ),
                            json!({
                                "network": current.network,
                                "contract": current.address,
                                "claimsPerHour": format!("{:.1}", rate),
                                "limit": self.thresholds.claim_rate_per_hour,
                            }),
                        ));
                    }
                }
            }

            FamilyCounters::JobEscrow {
                total_jobs,
                cancelled_jobs,
                ..
            } => {
                let prev_jobs = previous.and_then(|p| match &p.counters {
                    FamilyCounters::JobEscrow { total_jobs, .. } => *total_jobs,
                    _ => None,
                });
                if let Some(rate) = counter_rate(*total_jobs, prev_jobs, elapsed_hours) {
                    if rate > self.thresholds.job_rate_per_hour {
                        alerts.push(Alert::new(
                            AlertKind::InstantjobsCreationRate,
                            Severity::Warning,
                            format!(
                                "jobs created at {:.1}/h on {} (limit {}/h)",
                                rate, current.network, self.thresholds.job_rate_per_hour
                            ),
                            json!({
                                "network": current.network,
                                "contract": current.address,
                                "jobsPerHour": format!("{:.1}", rate),
                                "limit": self.thresholds.job_rate_per_hour,
                            }),
                        ));
                    }
                }

                if let (Some(total), Some(cancelled)) = (total_jobs, cancelled_jobs) {
                    if *total > 0 {
                        let ratio = *cancelled as f64 / *total as f64;
                        if ratio > self.thresholds.cancellation_ratio {
                            alerts.push(Alert::new(
                                AlertKind::InstantjobsHighCancellation,
                                Severity::Error,
                                format!(
                                    "{:.2}% of jobs cancelled on {} ({}/{})",
                                    ratio * 100.0,
                                    current.network,
                                    cancelled,
                                    total
                                ),
                                json!({
                                    "network": current.network,
                                    "contract": current.address,
                                    "totalJobs": total,
                                    "cancelledJobs": cancelled,
                                    "cancelledPercentage": format!("{:.2}", ratio * 100.0),
                                }),
                            ));
                        }
                    }
                }
            }

            FamilyCounters::TokenDistributor {
                total_distributed,
                available_balance,
                ..
            } => {
                let prev_distributed = previous.and_then(|p| match &p.counters {
                    FamilyCounters::TokenDistributor {
                        total_distributed, ..
                    } => *total_distributed,
                    _ => None,
                });
                if let Some(rate) =
                    decimal_rate(*total_distributed, prev_distributed, elapsed_hours)
                {
                    if rate > self.thresholds.distribution_rate_per_hour {
                        alerts.push(Alert::new(
                            AlertKind::DistributionRateAlert,
                            Severity::Warning,
                            format!(
                                "tokens distributed at {:.0}/h on {} (limit {}/h)",
                                rate, current.network, self.thresholds.distribution_rate_per_hour
                            ),
                            json!({
                                "network": current.network,
                                "contract": current.address,
                                "distributedPerHour": format!("{:.0}", rate),
                                "limit": self.thresholds.distribution_rate_per_hour,
                            }),
                        ));
                    }
                }

                if let Some(available) = available_balance {
                    if *available < self.thresholds.distributor_min_reserve {
                        alerts.push(Alert::new(
                            AlertKind::DistributorLowReserve,
                            Severity::Error,
                            format!(
                                "distributor reserve {} on {} below floor {}",
                                available, current.network, self.thresholds.distributor_min_reserve
                            ),
                            json!({
                                "network": current.network,
                                "contract": current.address,
                                "availableBalance": available.to_string(),
                                "floor": self.thresholds.distributor_min_reserve.to_string(),
                            }),
                        ));
                    }
                }
            }
        }

        alerts
    }
}

/// Hourly rate of an integer counter between two observations. `None` when
/// either counter is unknown, elapsed time is not strictly positive, or the
/// counter moved backwards (redeploy — treat as a fresh baseline).
fn counter_rate(current: Option<u64>, previous: Option<u64>, elapsed_hours: f64) -> Option<f64> {
    let current = current?;
    let previous = previous?;
    if elapsed_hours <= 0.0 || current < previous {
        return None;
    }
    Some((current - previous) as f64 / elapsed_hours)
}

fn decimal_rate(
    current: Option<Decimal>,
    previous: Option<Decimal>,
    elapsed_hours: f64,
) -> Option<f64> {
    let current = current?;
    let previous = previous?;
    if elapsed_hours <= 0.0 || current < previous {
        return None;
    }
    (current - previous).to_f64().map(|d| d / elapsed_hours)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContractFamily, WalletKind};
    use std::str::FromStr;

    fn engine() -> AnomalyEngine {
        AnomalyEngine::new(ThresholdConfig::default())
    }

    fn snapshot(amount: &str) -> BalanceSnapshot {
        BalanceSnapshot {
            network: "polygon".to_string(),
            wallet: "0x1111111111111111111111111111111111111111".to_string(),
            label: "treasury".to_string(),
            kind: WalletKind::Service,
            amount: Decimal::from_str(amount).unwrap(),
            currency: "POL".to_string(),
            observed_at: Utc::now(),
        }
    }

    fn escrow_stat(total: Option<u64>, cancelled: Option<u64>) -> ContractStat {
        ContractStat {
            network: "polygon".to_string(),
            address: "0x2222222222222222222222222222222222222222".to_string(),
            family: ContractFamily::JobEscrow,
            counters: FamilyCounters::JobEscrow {
                total_jobs: total,
                cancelled_jobs: cancelled,
                active: true,
            },
            observed_at: Utc::now(),
        }
    }

    fn distributor_stat(distributed: &str, available: &str) -> ContractStat {
        ContractStat {
            network: "polygon".to_string(),
            address: "0x3333333333333333333333333333333333333333".to_string(),
            family: ContractFamily::TokenDistributor,
            counters: FamilyCounters::TokenDistributor {
                total_distributed: Some(Decimal::from_str(distributed).unwrap()),
                available_balance: Some(Decimal::from_str(available).unwrap()),
                active: true,
            },
            observed_at: Utc::now(),
        }
    }

    fn claim_stat(claims: Option<u64>) -> ContractStat {
        ContractStat {
            network: "polygon".to_string(),
            address: "0x4444444444444444444444444444444444444444".to_string(),
            family: ContractFamily::RewardClaim,
            counters: FamilyCounters::RewardClaim {
                total_claims: claims,
                active: true,
            },
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_balance_drop_warning() {
        // 100 → 45: below half, above 30% — one warning, no email.
        let alerts = engine().evaluate_balance(&snapshot("45"), Some(&snapshot("100")));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::BalanceAlert);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert!(!alerts[0].should_escalate());
    }

    #[test]
    fn test_severe_drop_is_critical_and_escalates() {
        // Scenario: wallet had 100, now reports 25 — one critical, emailed.
        let alerts = engine().evaluate_balance(&snapshot("25"), Some(&snapshot("100")));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert!(alerts[0].should_escalate());
        assert_eq!(alerts[0].details["previous"], "100");
        assert_eq!(alerts[0].details["current"], "25");
    }

    #[test]
    fn test_no_drop_no_alert() {
        assert!(engine()
            .evaluate_balance(&snapshot("60"), Some(&snapshot("100")))
            .is_empty());
        // Exactly at the boundary: 50 is not < 100 * 0.5.
        assert!(engine()
            .evaluate_balance(&snapshot("50"), Some(&snapshot("100")))
            .is_empty());
    }

    #[test]
    fn test_first_observation_never_alerts() {
        assert!(engine().evaluate_balance(&snapshot("1"), None).is_empty());
        assert!(engine()
            .evaluate_contract(&claim_stat(Some(10_000)), None, 1.0)
            .is_empty());
    }

    #[test]
    fn test_zero_previous_balance_skipped() {
        assert!(engine()
            .evaluate_balance(&snapshot("0"), Some(&snapshot("0")))
            .is_empty());
    }

    #[test]
    fn test_low_balance_floor() {
        let alert = engine().check_low_balance(&snapshot("0.05")).unwrap();
        assert_eq!(alert.kind, AlertKind::WalletBalance);
        assert_eq!(alert.severity, Severity::Warning);

        assert!(engine().check_low_balance(&snapshot("0.1")).is_none());
    }

    #[test]
    fn test_claim_rate_alert() {
        let prev = claim_stat(Some(1_000));
        let cur = claim_stat(Some(1_250));
        // 250 claims in 2h = 125/h > 100/h.
        let alerts = engine().evaluate_contract(&cur, Some(&prev), 2.0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::ClaimRateAlert);
        assert_eq!(alerts[0].severity, Severity::Warning);
    }

    #[test]
    fn test_rate_skipped_on_zero_elapsed() {
        let prev = claim_stat(Some(0));
        let cur = claim_stat(Some(1_000_000));
        assert!(engine().evaluate_contract(&cur, Some(&prev), 0.0).is_empty());
        assert!(engine()
            .evaluate_contract(&cur, Some(&prev), -1.0)
            .is_empty());
    }

    #[test]
    fn test_rate_skipped_on_unknown_counter() {
        let prev = claim_stat(None);
        let cur = claim_stat(Some(1_000_000));
        assert!(engine().evaluate_contract(&cur, Some(&prev), 1.0).is_empty());
    }

    #[test]
    fn test_counter_regression_is_fresh_baseline() {
        // Redeployed contract: counter went down, no rate alert.
        let prev = claim_stat(Some(5_000));
        let cur = claim_stat(Some(10));
        assert!(engine().evaluate_contract(&cur, Some(&prev), 1.0).is_empty());
    }

    #[test]
    fn test_cancellation_spike() {
        // Scenario: 40 total, 15 cancelled — 37.5% > 30%.
        let cur = escrow_stat(Some(40), Some(15));
        let alerts = engine().evaluate_contract(&cur, None, 0.0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::InstantjobsHighCancellation);
        assert_eq!(alerts[0].severity, Severity::Error);
        assert!(alerts[0].should_escalate());
        assert_eq!(alerts[0].details["cancelledPercentage"], "37.50");
    }

    #[test]
    fn test_cancellation_needs_jobs() {
        assert!(engine()
            .evaluate_contract(&escrow_stat(Some(0), Some(0)), None, 0.0)
            .is_empty());
        assert!(engine()
            .evaluate_contract(&escrow_stat(None, Some(5)), None, 0.0)
            .is_empty());
    }

    #[test]
    fn test_job_creation_rate() {
        let prev = escrow_stat(Some(100), Some(0));
        let cur = escrow_stat(Some(160), Some(0));
        // 60 jobs in 1h > 50/h.
        let alerts = engine().evaluate_contract(&cur, Some(&prev), 1.0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::InstantjobsCreationRate);
    }

    #[test]
    fn test_distributor_low_reserve() {
        let cur = distributor_stat("50000", "999");
        let alerts = engine().evaluate_contract(&cur, None, 0.0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::DistributorLowReserve);
        assert_eq!(alerts[0].severity, Severity::Error);
        assert!(alerts[0].should_escalate());
    }

    #[test]
    fn test_distribution_rate_and_reserve_fire_together() {
        // Multiple rules may fire in the same cycle for the same entity.
        let prev = distributor_stat("0", "999");
        let cur = distributor_stat("20000", "999");
        let alerts = engine().evaluate_contract(&cur, Some(&prev), 1.0);
        assert_eq!(alerts.len(), 2);
        assert!(alerts
            .iter()
            .any(|a| a.kind == AlertKind::DistributionRateAlert));
        assert!(alerts
            .iter()
            .any(|a| a.kind == AlertKind::DistributorLowReserve));
    }

    #[test]
    fn test_lifecycle_alerts_escalate_regardless_of_severity() {
        let alert = Alert::lifecycle(Severity::Info, "monitor started", json!({}));
        assert!(alert.should_escalate());
    }
}
