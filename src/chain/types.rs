//! Observation records produced by the pollers.
//!
//! One snapshot/stat is created per (entity, network) pair per cycle. The
//! scheduler's state cache keeps the latest one per key for diffing; the
//! store persists every one as immutable history.

use alloy::primitives::utils::format_units;
use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::config::{ContractFamily, WalletKind};

/// One timestamped native-balance observation for a (wallet, network) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub network: String,
    pub wallet: String,
    pub label: String,
    pub kind: WalletKind,
    pub amount: Decimal,
    pub currency: String,
    pub observed_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    /// Deterministic composite document key so repeated writes merge.
    pub fn doc_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.kind,
            self.network,
            address_suffix(&self.wallet)
        )
    }

    /// Structural content equality, ignoring the observation timestamp.
    /// Used by the store to skip no-op writes.
    pub fn content_eq(&self, other: &BalanceSnapshot) -> bool {
        self.network == other.network
            && self.wallet == other.wallet
            && self.amount == other.amount
            && self.currency == other.currency
    }
}

/// Per-family activity counters. An accessor that reverted or is missing on
/// the deployed contract version leaves its counter `None`; `active`
/// defaults to `true` when unreadable so one legacy contract does not
/// suppress monitoring of the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FamilyCounters {
    RewardClaim {
        total_claims: Option<u64>,
        active: bool,
    },
    JobEscrow {
        total_jobs: Option<u64>,
        cancelled_jobs: Option<u64>,
        active: bool,
    },
    TokenDistributor {
        total_distributed: Option<Decimal>,
        available_balance: Option<Decimal>,
        active: bool,
    },
}

/// One timestamped contract-state observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractStat {
    pub network: String,
    pub address: String,
    pub family: ContractFamily,
    pub counters: FamilyCounters,
    pub observed_at: DateTime<Utc>,
}

impl ContractStat {
    pub fn doc_key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.family,
            self.network,
            address_suffix(&self.address)
        )
    }

    pub fn content_eq(&self, other: &ContractStat) -> bool {
        self.network == other.network
            && self.address == other.address
            && self.counters == other.counters
    }
}

/// Convert an 18-decimal base-unit amount (wei or token base units) to a
/// decimal in whole native units. `None` when the value has more significant
/// digits than a `Decimal` can hold.
pub fn from_base_units(value: U256) -> Option<Decimal> {
    let formatted = format_units(value, "ether").ok()?;
    Decimal::from_str(formatted.trim_end_matches('0').trim_end_matches('.')).ok()
}

/// Last 8 hex chars of an address, lowercased — enough to disambiguate
/// within one deployment while keeping keys short.
pub fn address_suffix(address: &str) -> String {
    let trimmed = address.trim_start_matches("0x");
    let start = trimmed.len().saturating_sub(8);
    trimmed[start..].to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn snapshot(amount: &str) -> BalanceSnapshot {
        BalanceSnapshot {
            network: "polygon".to_string(),
            wallet: "0xAbCdEf1234567890aBcDeF1234567890ABCDef12".to_string(),
            label: "treasury".to_string(),
            kind: WalletKind::Service,
            amount: Decimal::from_str(amount).unwrap(),
            currency: "POL".to_string(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_doc_key_is_deterministic() {
        // Same key regardless of the observed amount — repeat writes merge.
        let a = snapshot("1.5");
        let b = snapshot("99");
        assert_eq!(a.doc_key(), b.doc_key());
        assert_eq!(a.doc_key(), "service_polygon_abcdef12");
    }

    #[test]
    fn test_address_suffix() {
        assert_eq!(
            address_suffix("0xAbCdEf1234567890aBcDeF1234567890ABCDef12"),
            "abcdef12"
        );
        assert_eq!(address_suffix("0xABCD"), "abcd");
    }

    #[test]
    fn test_content_eq_ignores_timestamp() {
        let mut a = snapshot("1.5");
        let mut b = snapshot("1.5");
        b.observed_at = a.observed_at + chrono::Duration::seconds(300);
        assert!(a.content_eq(&b));

        b.amount = Decimal::from_str("1.4").unwrap();
        assert!(!a.content_eq(&b));

        b.amount = a.amount;
        a.currency = "ETH".to_string();
        assert!(!a.content_eq(&b));
    }

    #[test]
    fn test_contract_stat_content_eq() {
        let counters = FamilyCounters::JobEscrow {
            total_jobs: Some(40),
            cancelled_jobs: Some(15),
            active: true,
        };
        let a = ContractStat {
            network: "polygon".to_string(),
            address: "0x1234".to_string(),
            family: crate::config::ContractFamily::JobEscrow,
            counters: counters.clone(),
            observed_at: Utc::now(),
        };
        let mut b = a.clone();
        b.observed_at = a.observed_at + chrono::Duration::seconds(60);
        assert!(a.content_eq(&b));

        b.counters = FamilyCounters::JobEscrow {
            total_jobs: Some(41),
            cancelled_jobs: Some(15),
            active: true,
        };
        assert!(!a.content_eq(&b));
    }
}
