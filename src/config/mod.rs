use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no networks configured")]
    NoNetworks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Per-network RPC endpoint lists, keyed by network id ("polygon", "bsc", ...).
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(default)]
    pub wallets: Vec<WalletConfig>,
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// RPC URLs in priority order — first is primary, rest are fallbacks.
    pub rpc_urls: Vec<String>,
    /// Native currency symbol recorded on balance snapshots.
    #[serde(default = "default_currency")]
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub address: String,
    pub label: String,
    #[serde(default)]
    pub kind: WalletKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    #[default]
    Service,
    Admin,
    Monitor,
}

impl std::fmt::Display for WalletKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletKind::Service => write!(f, "service"),
            WalletKind::Admin => write!(f, "admin"),
            WalletKind::Monitor => write!(f, "monitor"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub network: String,
    pub address: String,
    pub family: ContractFamily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractFamily {
    RewardClaim,
    JobEscrow,
    TokenDistributor,
}

impl std::fmt::Display for ContractFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractFamily::RewardClaim => write!(f, "reward_claim"),
            ContractFamily::JobEscrow => write!(f, "job_escrow"),
            ContractFamily::TokenDistributor => write!(f, "token_distributor"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Poll cycle interval in seconds.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// No completed cycle for this long → service health warning.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    /// How often the health checker wakes up.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    /// Per-call RPC timeout.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    /// Bound on concurrent (entity, network) polls within one cycle.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_polls: usize,
    /// Grace period for an in-flight cycle on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

/// Anomaly rule thresholds. The per-hour rate limits are inherited
/// operational defaults with no stated derivation — tunables, not truth.
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    /// Absolute floor for any wallet balance, in native units.
    #[serde(default = "default_low_balance_floor")]
    pub low_balance_floor: rust_decimal::Decimal,
    /// current < previous * this → warning.
    #[serde(default = "default_drop_warning")]
    pub balance_drop_warning: rust_decimal::Decimal,
    /// current < previous * this → critical + email.
    #[serde(default = "default_drop_critical")]
    pub balance_drop_critical: rust_decimal::Decimal,
    #[serde(default = "default_claim_rate")]
    pub claim_rate_per_hour: f64,
    #[serde(default = "default_job_rate")]
    pub job_rate_per_hour: f64,
    #[serde(default = "default_cancellation_ratio")]
    pub cancellation_ratio: f64,
    #[serde(default = "default_distribution_rate")]
    pub distribution_rate_per_hour: f64,
    #[serde(default = "default_min_reserve")]
    pub distributor_min_reserve: rust_decimal::Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Key namespace so several instances can share one Valkey.
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Loaded from env SMTP_USERNAME.
    #[serde(default)]
    pub username: String,
    /// Loaded from env SMTP_PASSWORD.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_bind")]
    pub bind: String,
    /// Shared-secret bearer token - loaded from env SENTRY_API_TOKEN.
    #[serde(default)]
    pub bearer_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_currency() -> String {
    "ETH".to_string()
}
fn default_interval() -> u64 {
    300
}
fn default_stale_after() -> u64 {
    600
}
fn default_health_interval() -> u64 {
    60
}
fn default_rpc_timeout() -> u64 {
    5
}
fn default_max_concurrent() -> usize {
    8
}
fn default_shutdown_grace() -> u64 {
    10
}
fn default_low_balance_floor() -> rust_decimal::Decimal {
    rust_decimal::Decimal::new(1, 1) // 0.1
}
fn default_drop_warning() -> rust_decimal::Decimal {
    rust_decimal::Decimal::new(5, 1) // 0.5
}
fn default_drop_critical() -> rust_decimal::Decimal {
    rust_decimal::Decimal::new(3, 1) // 0.3
}
fn default_claim_rate() -> f64 {
    100.0
}
fn default_job_rate() -> f64 {
    50.0
}
fn default_cancellation_ratio() -> f64 {
    0.3
}
fn default_distribution_rate() -> f64 {
    10_000.0
}
fn default_min_reserve() -> rust_decimal::Decimal {
    rust_decimal::Decimal::from(1_000)
}
fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_store_prefix() -> String {
    "chainsentry".to_string()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_true() -> bool {
    true
}
fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            stale_after_secs: default_stale_after(),
            health_check_interval_secs: default_health_interval(),
            rpc_timeout_secs: default_rpc_timeout(),
            max_concurrent_polls: default_max_concurrent(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            low_balance_floor: default_low_balance_floor(),
            balance_drop_warning: default_drop_warning(),
            balance_drop_critical: default_drop_critical(),
            claim_rate_per_hour: default_claim_rate(),
            job_rate_per_hour: default_job_rate(),
            cancellation_ratio: default_cancellation_ratio(),
            distribution_rate_per_hour: default_distribution_rate(),
            distributor_min_reserve: default_min_reserve(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            prefix: default_store_prefix(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from: String::new(),
            to: Vec::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_api_bind(),
            bearer_token: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.overlay_env();
        config.validate()?;
        Ok(config)
    }

    /// Secrets never live in the config file.
    fn overlay_env(&mut self) {
        if let Ok(token) = std::env::var("SENTRY_API_TOKEN") {
            self.api.bearer_token = token;
        }
        if let Ok(user) = std::env::var("SMTP_USERNAME") {
            self.smtp.username = user;
        }
        if let Ok(pass) = std::env::var("SMTP_PASSWORD") {
            self.smtp.password = pass;
        }
        if let Ok(url) = std::env::var("STORE_URL") {
            self.store.url = url;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.networks.is_empty() {
            return Err(ConfigError::NoNetworks);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [networks.polygon]
            rpc_urls = ["https://polygon-rpc.com"]
            currency = "POL"

            [[wallets]]
            address = "0x1111111111111111111111111111111111111111"
            label = "service-treasury"
            kind = "service"

            [[contracts]]
            network = "polygon"
            address = "0x2222222222222222222222222222222222222222"
            family = "job_escrow"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.networks.len(), 1);
        assert_eq!(config.networks["polygon"].currency, "POL");
        assert_eq!(config.wallets[0].kind, WalletKind::Service);
        assert_eq!(config.contracts[0].family, ContractFamily::JobEscrow);
        // defaults
        assert_eq!(config.scheduler.interval_secs, 300);
        assert_eq!(config.scheduler.stale_after_secs, 600);
        assert_eq!(config.thresholds.claim_rate_per_hour, 100.0);
        assert_eq!(
            config.thresholds.low_balance_floor,
            rust_decimal::Decimal::new(1, 1)
        );
    }

    #[test]
    fn test_empty_networks_rejected() {
        let config: Config = toml::from_str("[networks]\n").unwrap();
        assert!(config.validate().is_err());
    }
}
