//! Read-only contract state polling.
//!
//! Each watched contract gets the small fixed accessor set for its family.
//! An accessor that reverts or is missing on the deployed version yields an
//! unknown counter rather than an error, so one legacy deployment never
//! blocks monitoring of the rest of the fleet. A timed-out call, by
//! contrast, is a per-pair transient error and is reported as such.

use alloy::primitives::{Address, U256};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::future::IntoFuture;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::abi::{IJobEscrow, IRewardClaim, ITokenDistributor};
use super::types::{from_base_units, ContractStat, FamilyCounters};
use super::Session;
use crate::config::{ContractConfig, ContractFamily};

/// Poll every watched contract whose network has a resolved session.
/// Watches on networks that failed resolution this cycle are skipped
/// silently — the pool already recorded that failure once.
pub async fn poll_contracts(
    sessions: &[Session],
    watches: &[ContractConfig],
    call_timeout: Duration,
    max_concurrent: usize,
) -> (Vec<ContractStat>, Vec<String>) {
    let mut errors = Vec::new();

    let mut tasks = Vec::new();
    for watch in watches {
        let session = match sessions.iter().find(|s| s.network == watch.network) {
            Some(s) => s,
            None => {
                debug!(
                    network = %watch.network,
                    address = %watch.address,
                    "no session for network this cycle, skipping contract"
                );
                continue;
            }
        };
        match Address::from_str(&watch.address) {
            Ok(addr) => tasks.push(fetch_one(session, watch, addr, call_timeout)),
            Err(_) => {
                warn!(
                    network = %watch.network,
                    address = %watch.address,
                    "invalid contract address, skipping"
                );
                errors.push(format!(
                    "invalid contract address on {}: {}",
                    watch.network, watch.address
                ));
            }
        }
    }

    let results: Vec<Result<ContractStat, String>> = stream::iter(tasks)
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await;

    let mut stats = Vec::new();
    for result in results {
        match result {
            Ok(stat) => stats.push(stat),
            Err(e) => errors.push(e),
        }
    }
    (stats, errors)
}

async fn fetch_one(
    session: &Session,
    watch: &ContractConfig,
    addr: Address,
    call_timeout: Duration,
) -> Result<ContractStat, String> {
    let tag = format!("{} {} on {}", watch.family, watch.address, watch.network);

    let counters = match watch.family {
        ContractFamily::RewardClaim => {
            let contract = IRewardClaim::new(addr, &session.provider);
            let total_claims =
                read("totalClaims", &tag, call_timeout, contract.totalClaims().call())
                    .await?
                    .and_then(as_u64);
            let active = read("isActive", &tag, call_timeout, contract.isActive().call())
                .await?
                .unwrap_or(true);
            FamilyCounters::RewardClaim {
                total_claims,
                active,
            }
        }
        ContractFamily::JobEscrow => {
            let contract = IJobEscrow::new(addr, &session.provider);
            let total_jobs =
                read("totalJobs", &tag, call_timeout, contract.totalJobs().call())
                    .await?
                    .and_then(as_u64);
            let cancelled_jobs = read(
                "cancelledJobs",
                &tag,
                call_timeout,
                contract.cancelledJobs().call(),
            )
            .await?
            .and_then(as_u64);
            let active = read("isActive", &tag, call_timeout, contract.isActive().call())
                .await?
                .unwrap_or(true);
            FamilyCounters::JobEscrow {
                total_jobs,
                cancelled_jobs,
                active,
            }
        }
        ContractFamily::TokenDistributor => {
            let contract = ITokenDistributor::new(addr, &session.provider);
            let total_distributed = read(
                "totalDistributed",
                &tag,
                call_timeout,
                contract.totalDistributed().call(),
            )
            .await?
            .and_then(from_base_units);
            let available_balance = read(
                "availableBalance",
                &tag,
                call_timeout,
                contract.availableBalance().call(),
            )
            .await?
            .and_then(from_base_units);
            let active = read("isActive", &tag, call_timeout, contract.isActive().call())
                .await?
                .unwrap_or(true);
            FamilyCounters::TokenDistributor {
                total_distributed,
                available_balance,
                active,
            }
        }
    };

    debug!(contract = %tag, counters = ?counters, "contract state observed");

    Ok(ContractStat {
        network: watch.network.clone(),
        address: watch.address.clone(),
        family: watch.family,
        counters,
        observed_at: Utc::now(),
    })
}

/// Run one accessor call. Timeout → per-pair error; revert or unsupported
/// function → `Ok(None)` (counter unknown, documented default applies).
async fn read<T, F>(
    accessor: &str,
    tag: &str,
    call_timeout: Duration,
    fut: F,
) -> Result<Option<T>, String>
where
    F: IntoFuture<Output = Result<T, alloy::contract::Error>>,
{
    match tokio::time::timeout(call_timeout, fut.into_future()).await {
        Err(_) => Err(format!("{}() timed out for {}", accessor, tag)),
        Ok(Ok(value)) => Ok(Some(value)),
        Ok(Err(e)) => {
            debug!(
                accessor = accessor,
                contract = tag,
                error = %e,
                "accessor unavailable, counter unknown"
            );
            Ok(None)
        }
    }
}

fn as_u64(value: U256) -> Option<u64> {
    value.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_revert_is_unknown_not_error() {
        let result: Result<Option<U256>, String> = read(
            "totalClaims",
            "reward_claim 0xabc on polygon",
            Duration::from_secs(1),
            async { Err(alloy::contract::Error::ContractNotDeployed) },
        )
        .await;
        assert_eq!(result, Ok(None));
    }

    #[tokio::test]
    async fn test_read_timeout_is_an_error() {
        let result: Result<Option<U256>, String> = read(
            "totalJobs",
            "job_escrow 0xabc on polygon",
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(U256::ZERO)
            },
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.contains("timed out"), "got: {err}");
    }

    #[test]
    fn test_counter_narrowing() {
        assert_eq!(as_u64(U256::from(42u8)), Some(42));
        assert_eq!(as_u64(U256::MAX), None);
    }
}
