//! Valkey (Redis-compatible) document store for monitoring state.
//!
//! Data model (all keys under a configurable prefix):
//!   monitoring:status                         → JSON StatusDoc (singleton)
//!   monitoring:balances:{kind}_{net}_{addr8}  → JSON BalanceSnapshot (latest)
//!   monitoring:balances:history               → LIST of JSON snapshots, capped
//!   monitoring:contracts:{family}_{net}_{addr8} → JSON ContractStat (latest)
//!   monitoring:contracts:history              → LIST of JSON stats, capped
//!   monitoring:alerts                         → LIST of alert ids, capped (ordering index)
//!   monitoring:alerts:{id}                    → JSON Alert (TTL: 30d)
//!   system_logs                               → LIST of JSON SystemLogEntry, capped
//!
//! Latest-doc keys are deterministic per monitored entity, so repeat writes
//! overwrite rather than accumulate. A latest-doc write is skipped entirely
//! when the stored document matches the new one in everything but the
//! timestamp; history and the alert log are append-only.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::anomaly::Alert;
use crate::chain::types::{BalanceSnapshot, ContractStat};

const MAX_HISTORY: isize = 10_000;
const MAX_ALERT_LOG: isize = 1_000;
const MAX_SYSTEM_LOG: isize = 1_000;
const ALERT_TTL_SECS: u64 = 30 * 86400; // 30 days

/// Singleton service status document, rewritten at the end of every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDoc {
    pub running: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub cycle_count: u64,
    pub networks: Vec<String>,
    /// Consecutive endpoint-resolution failures per network.
    #[serde(default)]
    pub failure_counts: BTreeMap<String, u32>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only operational log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemLogEntry {
    pub action: String,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
    pub source: String,
}

impl SystemLogEntry {
    pub fn new(action: impl Into<String>, details: serde_json::Value, source: &str) -> Self {
        Self {
            action: action.into(),
            details,
            at: Utc::now(),
            source: source.to_string(),
        }
    }
}

/// Valkey-backed monitoring store.
///
/// All keys are namespaced under a configurable prefix so multiple instances
/// (e.g. staging vs production fleets) can share one Valkey without
/// collisions.
#[derive(Clone)]
pub struct MonitorStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl MonitorStore {
    /// Connect to Valkey/Redis.
    pub async fn connect(url: &str, prefix: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Build a namespaced key: "{prefix}:{suffix}"
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// Test connectivity.
    pub async fn ping(&mut self) -> anyhow::Result<()> {
        let pong: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }

    // --- Status ---

    pub async fn set_status(&mut self, status: &StatusDoc) -> anyhow::Result<()> {
        let key = self.key("monitoring:status");
        let json = serde_json::to_string(status)?;
        self.conn.set::<_, _, ()>(&key, &json).await?;
        Ok(())
    }

    pub async fn get_status(&mut self) -> anyhow::Result<Option<StatusDoc>> {
        let key = self.key("monitoring:status");
        let json: Option<String> = self.conn.get(&key).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    // --- Balances ---

    /// Persist a balance snapshot. Returns `false` when the stored latest
    /// document already carries the same content (only the timestamp moved)
    /// and nothing was written.
    pub async fn put_balance(&mut self, snap: &BalanceSnapshot) -> anyhow::Result<bool> {
        let key = self.key(&format!("monitoring:balances:{}", snap.doc_key()));
        let existing: Option<String> = self.conn.get(&key).await?;
        if let Some(prev) = existing.as_deref() {
            if balance_unchanged(prev, snap) {
                debug!(doc_key = %snap.doc_key(), "balance unchanged, write skipped");
                return Ok(false);
            }
        }

        let json = serde_json::to_string(snap)?;
        self.conn.set::<_, _, ()>(&key, &json).await?;

        let history_key = self.key("monitoring:balances:history");
        self.conn.lpush::<_, _, ()>(&history_key, &json).await?;
        self.conn
            .ltrim::<_, ()>(&history_key, 0, MAX_HISTORY - 1)
            .await?;

        debug!(doc_key = %snap.doc_key(), amount = %snap.amount, "balance stored");
        Ok(true)
    }

    /// Latest persisted snapshot per wallet/network, for the read API.
    pub async fn latest_balances(&mut self) -> anyhow::Result<Vec<BalanceSnapshot>> {
        let pattern = self.key("monitoring:balances:*");
        let history_key = self.key("monitoring:balances:history");
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut self.conn)
            .await?;

        let mut snapshots = Vec::new();
        for key in keys {
            if key == history_key {
                continue;
            }
            let json: Option<String> = self.conn.get(&key).await?;
            if let Some(j) = json {
                match serde_json::from_str::<BalanceSnapshot>(&j) {
                    Ok(snap) => snapshots.push(snap),
                    Err(e) => warn!(key = %key, error = %e, "unreadable balance doc"),
                }
            }
        }
        snapshots.sort_by(|a, b| a.doc_key().cmp(&b.doc_key()));
        Ok(snapshots)
    }

    // --- Contracts ---

    /// Persist a contract stat. Same dedup rule as balances.
    pub async fn put_contract(&mut self, stat: &ContractStat) -> anyhow::Result<bool> {
        let key = self.key(&format!("monitoring:contracts:{}", stat.doc_key()));
        let existing: Option<String> = self.conn.get(&key).await?;
        if let Some(prev) = existing.as_deref() {
            if contract_unchanged(prev, stat) {
                debug!(doc_key = %stat.doc_key(), "contract stats unchanged, write skipped");
                return Ok(false);
            }
        }

        let json = serde_json::to_string(stat)?;
        self.conn.set::<_, _, ()>(&key, &json).await?;

        let history_key = self.key("monitoring:contracts:history");
        self.conn.lpush::<_, _, ()>(&history_key, &json).await?;
        self.conn
            .ltrim::<_, ()>(&history_key, 0, MAX_HISTORY - 1)
            .await?;

        debug!(doc_key = %stat.doc_key(), "contract stats stored");
        Ok(true)
    }

    // --- Alerts ---

    /// Persist an alert under its own key and record its id in the ordering
    /// index (newest first). Per-id keys keep later flag updates single-key,
    /// so concurrent writers on the index can never redirect them.
    pub async fn push_alert(&mut self, alert: &Alert) -> anyhow::Result<()> {
        let doc_key = self.key(&format!("monitoring:alerts:{}", alert.id));
        let json = serde_json::to_string(alert)?;
        self.conn
            .set_ex::<_, _, ()>(&doc_key, &json, ALERT_TTL_SECS)
            .await?;

        let index_key = self.key("monitoring:alerts");
        self.conn.lpush::<_, _, ()>(&index_key, &alert.id).await?;
        self.conn
            .ltrim::<_, ()>(&index_key, 0, MAX_ALERT_LOG - 1)
            .await?;
        Ok(())
    }

    /// Recent alerts, newest first. Ids whose document has expired are
    /// skipped.
    pub async fn recent_alerts(&mut self, count: isize) -> anyhow::Result<Vec<Alert>> {
        let index_key = self.key("monitoring:alerts");
        let ids: Vec<String> = self.conn.lrange(&index_key, 0, count - 1).await?;
        let mut alerts = Vec::new();
        for id in ids {
            let doc_key = self.key(&format!("monitoring:alerts:{id}"));
            let json: Option<String> = self.conn.get(&doc_key).await?;
            if let Some(j) = json {
                match serde_json::from_str::<Alert>(&j) {
                    Ok(a) => alerts.push(a),
                    Err(e) => warn!(alert_id = %id, error = %e, "unreadable alert doc"),
                }
            }
        }
        Ok(alerts)
    }

    /// Flip the `notified` flag on an already-persisted alert after a
    /// successful email send. A single-key rewrite: only the flag changes,
    /// message and severity stay as written.
    pub async fn mark_notified(&mut self, alert_id: &str) -> anyhow::Result<()> {
        let doc_key = self.key(&format!("monitoring:alerts:{alert_id}"));
        let json: Option<String> = self.conn.get(&doc_key).await?;
        let Some(stored) = json else {
            warn!(alert_id = alert_id, "alert not found for notified flag");
            return Ok(());
        };
        match set_notified(&stored) {
            Some(updated) => {
                self.conn
                    .set_ex::<_, _, ()>(&doc_key, &updated, ALERT_TTL_SECS)
                    .await?;
                Ok(())
            }
            None => {
                warn!(alert_id = alert_id, "unreadable alert doc, flag not set");
                Ok(())
            }
        }
    }

    // --- System log ---

    pub async fn log_system(&mut self, entry: &SystemLogEntry) -> anyhow::Result<()> {
        let key = self.key("system_logs");
        let json = serde_json::to_string(entry)?;
        self.conn.lpush::<_, _, ()>(&key, &json).await?;
        self.conn
            .ltrim::<_, ()>(&key, 0, MAX_SYSTEM_LOG - 1)
            .await?;
        debug!(action = %entry.action, source = %entry.source, "system log");
        Ok(())
    }
}

/// Stored latest-doc matches the new snapshot in everything but `observed_at`.
fn balance_unchanged(stored_json: &str, current: &BalanceSnapshot) -> bool {
    match serde_json::from_str::<BalanceSnapshot>(stored_json) {
        Ok(stored) => stored.content_eq(current),
        Err(_) => false,
    }
}

fn contract_unchanged(stored_json: &str, current: &ContractStat) -> bool {
    match serde_json::from_str::<ContractStat>(stored_json) {
        Ok(stored) => stored.content_eq(current),
        Err(_) => false,
    }
}

/// Rewrite a stored alert document with `notified` set. Everything else in
/// the document is preserved exactly as first written.
fn set_notified(stored_json: &str) -> Option<String> {
    let mut alert: Alert = serde_json::from_str(stored_json).ok()?;
    alert.notified = true;
    serde_json::to_string(&alert).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WalletKind;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn snapshot(amount: &str) -> BalanceSnapshot {
        BalanceSnapshot {
            network: "polygon".to_string(),
            wallet: "0x1234567890abcdef1234567890abcdefABCDef12".to_string(),
            label: "treasury".to_string(),
            kind: WalletKind::Service,
            amount: Decimal::from_str(amount).unwrap(),
            currency: "POL".to_string(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_same_observation_is_a_single_revision() {
        // Second cycle sees the identical balance at a later timestamp:
        // the stored doc counts as unchanged and no new write happens.
        let first = snapshot("42.5");
        let stored = serde_json::to_string(&first).unwrap();
        let mut second = snapshot("42.5");
        second.observed_at = first.observed_at + chrono::Duration::seconds(300);

        assert!(balance_unchanged(&stored, &second));

        let mut moved = snapshot("41.0");
        moved.observed_at = second.observed_at;
        assert!(!balance_unchanged(&stored, &moved));
    }

    #[test]
    fn test_unreadable_stored_doc_forces_rewrite() {
        assert!(!balance_unchanged("not json", &snapshot("1")));
    }

    #[test]
    fn test_balance_doc_round_trip() {
        let snap = snapshot("1.5");
        let json = serde_json::to_string(&snap).unwrap();
        let back: BalanceSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.network, "polygon");
        assert_eq!(back.amount, Decimal::from_str("1.5").unwrap());
        assert_eq!(back.doc_key(), snap.doc_key());
        assert!(back.content_eq(&snap));
    }

    #[test]
    fn test_status_doc_round_trip() {
        let mut failure_counts = BTreeMap::new();
        failure_counts.insert("bsc".to_string(), 3u32);
        let status = StatusDoc {
            running: true,
            last_cycle_at: Some(Utc::now()),
            cycle_count: 17,
            networks: vec!["bsc".to_string(), "polygon".to_string()],
            failure_counts,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: StatusDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cycle_count, 17);
        assert_eq!(back.failure_counts.get("bsc"), Some(&3));
    }

    #[test]
    fn test_notified_flag_changes_nothing_else() {
        // The flag update targets the alert's own document by id; whatever
        // else is being pushed to the index concurrently, no other alert's
        // content can be touched, and this one keeps its original message
        // and severity.
        let alert = crate::anomaly::Alert::new(
            crate::anomaly::AlertKind::DistributorLowReserve,
            crate::anomaly::Severity::Error,
            "distributor reserve 999 on polygon below floor 1000",
            serde_json::json!({ "availableBalance": "999" }),
        );
        let stored = serde_json::to_string(&alert).unwrap();

        let updated = set_notified(&stored).unwrap();
        let back: crate::anomaly::Alert = serde_json::from_str(&updated).unwrap();
        assert!(back.notified);
        assert_eq!(back.id, alert.id);
        assert_eq!(back.kind, alert.kind);
        assert_eq!(back.severity, alert.severity);
        assert_eq!(back.message, alert.message);
        assert_eq!(back.details, alert.details);
        assert_eq!(back.raised_at, alert.raised_at);

        assert!(set_notified("not json").is_none());
    }

    #[test]
    fn test_status_doc_tolerates_missing_failure_counts() {
        // Docs written before the field existed must still parse.
        let json = r#"{"running":false,"last_cycle_at":null,"cycle_count":0,
            "networks":[],"updated_at":"2026-01-01T00:00:00Z"}"#;
        let back: StatusDoc = serde_json::from_str(json).unwrap();
        assert!(back.failure_counts.is_empty());
    }
}
