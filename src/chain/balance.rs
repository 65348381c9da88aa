//! Native-currency balance polling across all (wallet, network) pairs.

use alloy::primitives::Address;
use alloy::providers::Provider;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{from_base_units, BalanceSnapshot};
use super::Session;
use crate::config::WalletConfig;

/// Poll every configured wallet on every resolved session. Per-pair errors
/// are collected and returned alongside the successful snapshots — partial
/// success is the normal case, not a failure.
pub async fn poll_balances(
    sessions: &[Session],
    wallets: &[WalletConfig],
    call_timeout: Duration,
    max_concurrent: usize,
) -> (Vec<BalanceSnapshot>, Vec<String>) {
    let mut errors = Vec::new();

    // Address validation happens once per cycle, not once per network.
    let mut parsed: Vec<(&WalletConfig, Address)> = Vec::new();
    for wallet in wallets {
        match Address::from_str(&wallet.address) {
            Ok(addr) => parsed.push((wallet, addr)),
            Err(_) => {
                warn!(
                    wallet = %wallet.label,
                    address = %wallet.address,
                    "invalid wallet address, skipping"
                );
                errors.push(format!(
                    "invalid wallet address for {}: {}",
                    wallet.label, wallet.address
                ));
            }
        }
    }

    let tasks: Vec<_> = sessions
        .iter()
        .flat_map(|session| {
            parsed
                .iter()
                .map(move |(wallet, addr)| fetch_one(session, wallet, *addr, call_timeout))
        })
        .collect();

    let results: Vec<Result<BalanceSnapshot, String>> = stream::iter(tasks)
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;

    let mut snapshots = Vec::new();
    for result in results {
        match result {
            Ok(snap) => snapshots.push(snap),
            Err(e) => errors.push(e),
        }
    }
    (snapshots, errors)
}

async fn fetch_one(
    session: &Session,
    wallet: &WalletConfig,
    addr: Address,
    call_timeout: Duration,
) -> Result<BalanceSnapshot, String> {
    let wei = tokio::time::timeout(call_timeout, session.provider.get_balance(addr))
        .await
        .map_err(|_| {
            format!(
                "balance query timed out for {} on {}",
                wallet.label, session.network
            )
        })?
        .map_err(|e| {
            format!(
                "balance query failed for {} on {}: {}",
                wallet.label, session.network, e
            )
        })?;

    let amount = from_base_units(wei).ok_or_else(|| {
        format!(
            "unrepresentable balance for {} on {}: {}",
            wallet.label, session.network, wei
        )
    })?;

    debug!(
        network = %session.network,
        wallet = %wallet.label,
        amount = %amount,
        currency = %session.currency,
        "balance observed"
    );

    Ok(BalanceSnapshot {
        network: session.network.clone(),
        wallet: wallet.address.clone(),
        label: wallet.label.clone(),
        kind: wallet.kind,
        amount,
        currency: session.currency.clone(),
        observed_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use rust_decimal::Decimal;

    #[test]
    fn test_wei_to_native() {
        let wei = U256::from(1_500_000_000_000_000_000u128);
        assert_eq!(from_base_units(wei), Some(Decimal::from_str("1.5").unwrap()));

        assert_eq!(from_base_units(U256::ZERO), Some(Decimal::ZERO));

        // 1 wei
        assert_eq!(
            from_base_units(U256::from(1u8)),
            Some(Decimal::from_str("0.000000000000000001").unwrap())
        );
    }

    #[test]
    fn test_whole_unit_amount() {
        let wei = U256::from(25_000_000_000_000_000_000u128);
        assert_eq!(from_base_units(wei), Some(Decimal::from(25)));
    }
}
