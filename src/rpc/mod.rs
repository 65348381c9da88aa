//! Per-network RPC endpoint pool with ordered failover.
//!
//! Each network has a priority-ordered URL list. `resolve` probes the URLs
//! starting from the last-known-good one and returns the first provider that
//! answers a block-number liveness call within the timeout. Failed URLs are
//! not retried until the next resolve — a provider that was down this cycle
//! gets a fresh chance next cycle.

use alloy::providers::{Provider, RootProvider};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::NetworkConfig;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("unknown network: {0}")]
    UnknownNetwork(String),
    #[error("all RPC endpoints exhausted for network {0}")]
    EndpointsExhausted(String),
}

/// A live connection for one network, valid for the current cycle.
pub struct ResolvedEndpoint {
    pub network: String,
    pub url: String,
    pub provider: RootProvider,
}

struct NetworkEndpoints {
    urls: Vec<String>,
    /// Index of the endpoint that last answered a probe. The only mutable
    /// piece of endpoint state; everything else is fixed at startup.
    last_good: AtomicUsize,
}

impl NetworkEndpoints {
    /// Probe order: last-known-good first, then the rest in configured order.
    fn candidate_order(&self) -> Vec<usize> {
        let n = self.urls.len();
        let start = self.last_good.load(Ordering::SeqCst).min(n.saturating_sub(1));
        (0..n).map(|i| (start + i) % n).collect()
    }
}

pub struct EndpointPool {
    networks: HashMap<String, NetworkEndpoints>,
    probe_timeout: Duration,
}

impl EndpointPool {
    pub fn new(
        configs: &std::collections::BTreeMap<String, NetworkConfig>,
        probe_timeout: Duration,
    ) -> Self {
        let networks = configs
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    NetworkEndpoints {
                        urls: cfg.rpc_urls.clone(),
                        last_good: AtomicUsize::new(0),
                    },
                )
            })
            .collect();
        Self {
            networks,
            probe_timeout,
        }
    }

    pub fn network_names(&self) -> Vec<String> {
        self.networks.keys().cloned().collect()
    }

    /// Resolve a live provider for `network`, failing over through the
    /// configured URL list. Each URL is probed at most once per call.
    pub async fn resolve(&self, network: &str) -> Result<ResolvedEndpoint, PoolError> {
        let ep = self
            .networks
            .get(network)
            .ok_or_else(|| PoolError::UnknownNetwork(network.to_string()))?;

        let timeout = self.probe_timeout;
        let (winner, failures) = first_live(&ep.urls, ep.candidate_order(), |url| async move {
            probe(&url, timeout).await
        })
        .await;

        match winner {
            Some((idx, provider)) => {
                ep.last_good.store(idx, Ordering::SeqCst);
                if failures > 0 {
                    warn!(
                        network = network,
                        url = %ep.urls[idx],
                        failed = failures,
                        "resolved RPC endpoint after failover"
                    );
                } else {
                    debug!(network = network, url = %ep.urls[idx], "resolved RPC endpoint");
                }
                Ok(ResolvedEndpoint {
                    network: network.to_string(),
                    url: ep.urls[idx].clone(),
                    provider,
                })
            }
            None => Err(PoolError::EndpointsExhausted(network.to_string())),
        }
    }
}

/// Try candidates in `order` until `probe` succeeds. Returns the winning
/// (index, value) and how many candidates failed before it.
async fn first_live<F, Fut, T>(
    urls: &[String],
    order: Vec<usize>,
    mut probe: F,
) -> (Option<(usize, T)>, usize)
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut failures = 0usize;
    for idx in order {
        match probe(urls[idx].clone()).await {
            Ok(value) => return (Some((idx, value)), failures),
            Err(e) => {
                warn!(url = %urls[idx], error = %e, "RPC endpoint probe failed");
                failures += 1;
            }
        }
    }
    (None, failures)
}

/// Liveness probe: connect and fetch the current block number within the timeout.
async fn probe(url: &str, timeout: Duration) -> anyhow::Result<RootProvider> {
    let provider = RootProvider::new_http(url.parse()?);
    let block = tokio::time::timeout(timeout, provider.get_block_number())
        .await
        .map_err(|_| anyhow::anyhow!("liveness probe timed out after {:?}", timeout))??;
    debug!(url = url, block = block, "RPC endpoint live");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_failover_skips_dead_endpoints() {
        // A fails, B fails, C answers — C wins and two failures are counted.
        let list = urls(&["http://a", "http://b", "http://c"]);
        let (winner, failures) = first_live(&list, vec![0, 1, 2], |url| async move {
            if url == "http://c" {
                Ok(url)
            } else {
                Err(anyhow::anyhow!("connection refused"))
            }
        })
        .await;

        let (idx, value) = winner.expect("expected a live endpoint");
        assert_eq!(idx, 2);
        assert_eq!(value, "http://c");
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn test_all_endpoints_exhausted() {
        let list = urls(&["http://a", "http://b"]);
        let (winner, failures) = first_live(&list, vec![0, 1], |_url| async move {
            Err::<(), _>(anyhow::anyhow!("down"))
        })
        .await;
        assert!(winner.is_none());
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_candidate_order_starts_at_last_good() {
        let ep = NetworkEndpoints {
            urls: urls(&["http://a", "http://b", "http://c"]),
            last_good: AtomicUsize::new(1),
        };
        assert_eq!(ep.candidate_order(), vec![1, 2, 0]);

        ep.last_good.store(0, Ordering::SeqCst);
        assert_eq!(ep.candidate_order(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_probe_order_stops_at_first_live() {
        // First candidate answers — no further probes issued.
        let list = urls(&["http://a", "http://b"]);
        let (winner, failures) = first_live(&list, vec![0, 1], |url| async move {
            assert_eq!(url, "http://a", "probe must stop after the first success");
            Ok(url)
        })
        .await;
        assert_eq!(winner.unwrap().0, 0);
        assert_eq!(failures, 0);
    }
}
