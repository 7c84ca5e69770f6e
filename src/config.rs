use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::repository::ChainId;

/// Per-chain watcher and client settings.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain: ChainId,
    pub rpc_urls: Vec<String>,
    pub bridge_address: Address,
    pub token_address: Option<Address>,
    /// Genesis block when no cursor has been persisted yet. `None` triggers deployment discovery.
    pub start_block: Option<u64>,
    pub confirmation_lag: u64,
    pub poll_interval: Duration,
    pub batch_size: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub reorg_tracking_depth: usize,
}

impl ChainConfig {
    pub fn contracts(&self) -> Vec<Address> {
        let mut contracts = vec![self.bridge_address];
        contracts.extend(self.token_address);
        contracts
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub l2_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long terminal operations stay in memory before only the repository holds them.
    pub terminal_retention: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            l2_timeout: Duration::from_secs(DEFAULT_L2_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            terminal_retention: Duration::from_secs(DEFAULT_TERMINAL_RETENTION_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub l1: ChainConfig,
    pub l2: ChainConfig,
    pub reconciliation: ReconciliationConfig,
    pub database_url: String,
    pub shutdown_grace: Duration,
}

pub const DEFAULT_CONFIRMATION_LAG: u64 = 6;
pub const DEFAULT_L2_TIMEOUT_SECS: u64 = 15 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;
const DEFAULT_TERMINAL_RETENTION_SECS: u64 = 60 * 60;
const DEFAULT_L1_POLL_INTERVAL_SECS: u64 = 12;
const DEFAULT_L2_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_BATCH_SIZE: u64 = 1000; // Most public RPCs allow up to 1k logs per request
const DEFAULT_MAX_RETRIES: usize = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
const DEFAULT_REORG_TRACKING_DEPTH: usize = 64;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .with_context(|| format!("{key} must be set in .env"))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {key} value {raw:?}: {e}")),
            None => Ok(default),
        }
    }

    fn optional<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid {key} value {raw:?}: {e}"))
            })
            .transpose()
    }

    fn urls(&self, key: &str) -> Result<Vec<String>> {
        let urls: Vec<String> = self
            .required(key)?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if urls.is_empty() {
            anyhow::bail!("{key} must contain at least one URL");
        }
        Ok(urls)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup };

        let confirmation_lag = env.parse_or("CONFIRMATION_LAG", DEFAULT_CONFIRMATION_LAG)?;
        let max_retries = env.parse_or("MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let retry_base_delay_ms = env.parse_or("RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?;
        let batch_size = env.parse_or("BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let reorg_tracking_depth =
            env.parse_or("REORG_TRACKING_DEPTH", DEFAULT_REORG_TRACKING_DEPTH)?;
        if batch_size == 0 {
            anyhow::bail!("BATCH_SIZE must be positive");
        }

        let l1 = ChainConfig {
            chain: ChainId::L1,
            rpc_urls: env.urls("L1_RPC_URLS")?,
            bridge_address: Address::from_str(&env.required("L1_BRIDGE_ADDRESS")?)
                .context("Invalid L1_BRIDGE_ADDRESS format")?,
            token_address: env.optional("L1_TOKEN_ADDRESS")?,
            start_block: env.optional("L1_START_BLOCK")?,
            confirmation_lag,
            poll_interval: Duration::from_secs(
                env.parse_or("POLL_INTERVAL_SECS", DEFAULT_L1_POLL_INTERVAL_SECS)?,
            ),
            batch_size,
            max_retries,
            retry_base_delay_ms,
            reorg_tracking_depth,
        };

        let l2 = ChainConfig {
            chain: ChainId::L2,
            rpc_urls: env.urls("L2_RPC_URLS")?,
            bridge_address: Address::from_str(&env.required("L2_BRIDGE_ADDRESS")?)
                .context("Invalid L2_BRIDGE_ADDRESS format")?,
            token_address: env.optional("L2_TOKEN_ADDRESS")?,
            start_block: env.optional("L2_START_BLOCK")?,
            confirmation_lag: env.parse_or("L2_CONFIRMATION_LAG", confirmation_lag)?,
            poll_interval: Duration::from_secs(
                env.parse_or("L2_POLL_INTERVAL_SECS", DEFAULT_L2_POLL_INTERVAL_SECS)?,
            ),
            batch_size,
            max_retries,
            retry_base_delay_ms,
            reorg_tracking_depth,
        };

        let reconciliation = ReconciliationConfig {
            l2_timeout: Duration::from_secs(
                env.parse_or("L2_TIMEOUT_SECS", DEFAULT_L2_TIMEOUT_SECS)?,
            ),
            sweep_interval: Duration::from_secs(
                env.parse_or("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?,
            ),
            terminal_retention: Duration::from_secs(
                env.parse_or("TERMINAL_RETENTION_SECS", DEFAULT_TERMINAL_RETENTION_SECS)?,
            ),
        };

        let database_url = env
            .get("DATABASE_URL")
            .unwrap_or_else(|| "sqlite:./bridge-monitor.db".to_string());

        Ok(Config {
            l1,
            l2,
            reconciliation,
            database_url,
            shutdown_grace: Duration::from_secs(
                env.parse_or("SHUTDOWN_GRACE_SECS", DEFAULT_SHUTDOWN_GRACE_SECS)?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("L1_RPC_URLS", "http://l1-a:8545, http://l1-b:8545"),
        ("L2_RPC_URLS", "http://l2:8545"),
        ("L1_BRIDGE_ADDRESS", "0x1111111111111111111111111111111111111111"),
        ("L2_BRIDGE_ADDRESS", "0x2222222222222222222222222222222222222222"),
    ];

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();

        assert_eq!(config.l1.rpc_urls.len(), 2);
        assert_eq!(config.l1.confirmation_lag, 6);
        assert_eq!(config.l2.confirmation_lag, 6);
        assert_eq!(config.l1.start_block, None);
        assert_eq!(config.reconciliation.l2_timeout, Duration::from_secs(900));
        assert_eq!(config.l1.poll_interval, Duration::from_secs(12));
        assert_eq!(config.database_url, "sqlite:./bridge-monitor.db");
        assert_eq!(config.l1.contracts().len(), 1);
    }

    #[test]
    fn test_overrides() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("CONFIRMATION_LAG", "12"),
            ("L2_CONFIRMATION_LAG", "1"),
            ("L2_TIMEOUT_SECS", "60"),
            ("L1_START_BLOCK", "19000000"),
            ("L1_TOKEN_ADDRESS", "0x3333333333333333333333333333333333333333"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.l1.confirmation_lag, 12);
        assert_eq!(config.l2.confirmation_lag, 1);
        assert_eq!(config.reconciliation.l2_timeout, Duration::from_secs(60));
        assert_eq!(config.l1.start_block, Some(19_000_000));
        assert_eq!(config.l1.contracts().len(), 2);
    }

    #[test]
    fn test_missing_and_invalid_values() {
        let err = Config::from_lookup(lookup(&REQUIRED[1..])).unwrap_err();
        assert!(err.to_string().contains("L1_RPC_URLS"));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("CONFIRMATION_LAG", "six"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(err.to_string().contains("CONFIRMATION_LAG"));
    }
}
