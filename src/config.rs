//! Runtime configuration from environment variables
//!
//! Unset variables fall back to defaults; set but unparseable ones are errors
//! so a typo never silently runs with a default. Zero RPC endpoints fails at
//! startup.

use crate::alerts::AlertThresholds;
use crate::approval::ScoreBands;
use crate::pipeline::ingestion::IngestConfig;
use crate::pipeline::types::TrackedToken;
use crate::pipeline::windows::WindowSize;
use crate::rpc::pool::{ProviderEndpoint, ProviderPoolConfig};
use std::env;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    MissingVariable(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("no RPC providers configured (set RPC_PRIMARY_URL or RPC_URLS)")]
    NoProviders,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub providers: Vec<ProviderEndpoint>,
    pub chain: String,
    pub confirmations: u64,
    pub block_time_ms: u64,
    pub max_block_span: u64,
    pub start_block: Option<u64>,
    pub ingest_poll_interval_ms: u64,
    pub approval_interval_ms: u64,
    pub alert_interval_ms: u64,
    pub db_path: String,
    pub schema_dir: String,
    pub rpc_timeout_ms: u64,
    pub rpc_retries: u32,
    pub rpc_backoff_step_ms: u64,
    pub provider_failure_threshold: u8,
    pub tracked_tokens: Vec<TrackedToken>,
    pub watch_addresses: Vec<String>,
    pub stale_claim_ms: i64,
    pub approved_min_score: u32,
    pub quarantine_min_score: u32,
    pub alert_lag_blocks: u64,
    pub alert_stall_ms: i64,
    pub alert_error_rate: f64,
    pub alert_min_calls: u64,
}

impl GateConfig {
    /// Load configuration from the process environment
    ///
    /// Environment variables:
    /// - `RPC_PRIMARY_URL`, `RPC_SECONDARY_URL`, `RPC_URLS` (comma separated)
    /// - `TRACKED_TOKENS` (required, `address:SYMBOL` pairs, comma separated)
    /// - `WATCH_ADDRESSES` (comma separated)
    /// - `CHAIN_NAME` (default: ethereum)
    /// - `CONFIRMATIONS` (default: 12)
    /// - `BLOCK_TIME_MS` (default: 12000)
    /// - `MAX_BLOCK_SPAN` (default: 2000)
    /// - `START_BLOCK` (default: one span below the safe head)
    /// - `INGEST_POLL_INTERVAL_MS` (default: 15000)
    /// - `APPROVAL_INTERVAL_MS` (default: 60000)
    /// - `ALERT_INTERVAL_MS` (default: 30000)
    /// - `GATE_DB_PATH` (default: flowgate.db)
    /// - `GATE_SCHEMA_DIR` (default: sql)
    /// - `RPC_TIMEOUT_MS`, `RPC_RETRIES`, `RPC_BACKOFF_STEP_MS`, `PROVIDER_FAILURE_THRESHOLD`
    /// - `STALE_CLAIM_SECS` (default: 900)
    /// - `APPROVED_MIN_SCORE` (default: 70), `QUARANTINE_MIN_SCORE` (default: 41)
    /// - `ALERT_LAG_BLOCKS`, `ALERT_STALL_SECS`, `ALERT_ERROR_RATE`, `ALERT_MIN_CALLS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let providers = parse_providers(
            var("RPC_PRIMARY_URL"),
            var("RPC_SECONDARY_URL"),
            var("RPC_URLS"),
        );
        if providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let tracked_tokens = parse_tokens(&var("TRACKED_TOKENS").ok_or(ConfigError::MissingVariable("TRACKED_TOKENS"))?)?;
        let watch_addresses = var("WATCH_ADDRESSES").map(|s| split_list(&s)).unwrap_or_default();

        let config = Self {
            providers,
            chain: var("CHAIN_NAME").unwrap_or_else(|| "ethereum".to_string()),
            confirmations: parse_or(&var, "CONFIRMATIONS", 12)?,
            block_time_ms: parse_or(&var, "BLOCK_TIME_MS", 12_000)?,
            max_block_span: parse_or(&var, "MAX_BLOCK_SPAN", 2_000)?,
            start_block: parse_opt(&var, "START_BLOCK")?,
            ingest_poll_interval_ms: parse_or(&var, "INGEST_POLL_INTERVAL_MS", 15_000)?,
            approval_interval_ms: parse_or(&var, "APPROVAL_INTERVAL_MS", 60_000)?,
            alert_interval_ms: parse_or(&var, "ALERT_INTERVAL_MS", 30_000)?,
            db_path: var("GATE_DB_PATH").unwrap_or_else(|| "flowgate.db".to_string()),
            schema_dir: var("GATE_SCHEMA_DIR").unwrap_or_else(|| "sql".to_string()),
            rpc_timeout_ms: parse_or(&var, "RPC_TIMEOUT_MS", 10_000)?,
            rpc_retries: parse_or(&var, "RPC_RETRIES", 3)?,
            rpc_backoff_step_ms: parse_or(&var, "RPC_BACKOFF_STEP_MS", 1_000)?,
            provider_failure_threshold: parse_or(&var, "PROVIDER_FAILURE_THRESHOLD", 30)?,
            tracked_tokens,
            watch_addresses,
            stale_claim_ms: secs_to_ms("STALE_CLAIM_SECS", parse_or(&var, "STALE_CLAIM_SECS", 900)?)?,
            approved_min_score: parse_or(&var, "APPROVED_MIN_SCORE", 70)?,
            quarantine_min_score: parse_or(&var, "QUARANTINE_MIN_SCORE", 41)?,
            alert_lag_blocks: parse_or(&var, "ALERT_LAG_BLOCKS", 50)?,
            alert_stall_ms: secs_to_ms("ALERT_STALL_SECS", parse_or(&var, "ALERT_STALL_SECS", 600)?)?,
            alert_error_rate: parse_or(&var, "ALERT_ERROR_RATE", 0.25)?,
            alert_min_calls: parse_or(&var, "ALERT_MIN_CALLS", 20)?,
        };

        if config.quarantine_min_score > config.approved_min_score {
            return Err(ConfigError::InvalidValue {
                name: "QUARANTINE_MIN_SCORE",
                value: config.quarantine_min_score.to_string(),
            });
        }
        if config.max_block_span == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MAX_BLOCK_SPAN",
                value: "0".to_string(),
            });
        }

        Ok(config)
    }

    pub fn pool_config(&self) -> ProviderPoolConfig {
        ProviderPoolConfig {
            timeout_ms: self.rpc_timeout_ms,
            retries: self.rpc_retries,
            backoff_step_ms: self.rpc_backoff_step_ms,
            failure_threshold: self.provider_failure_threshold,
            ..Default::default()
        }
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            chain: self.chain.clone(),
            confirmations: self.confirmations,
            block_time_ms: self.block_time_ms,
            max_block_span: self.max_block_span,
            start_block: self.start_block,
            stale_claim_ms: self.stale_claim_ms,
            window_sizes: WindowSize::all().to_vec(),
            ..Default::default()
        }
    }

    pub fn score_bands(&self) -> ScoreBands {
        ScoreBands {
            approved_min: self.approved_min_score,
            quarantine_min: self.quarantine_min_score,
        }
    }

    pub fn alert_thresholds(&self) -> AlertThresholds {
        AlertThresholds {
            lag_blocks: self.alert_lag_blocks,
            stall_ms: self.alert_stall_ms,
            error_rate: self.alert_error_rate,
            min_calls: self.alert_min_calls,
        }
    }
}

fn parse_or<T, V>(var: &V, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(var, name)?.unwrap_or(default))
}

fn parse_opt<T, V>(var: &V, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

/// Seconds as epoch-millisecond deltas; values that do not fit are rejected.
fn secs_to_ms(name: &'static str, secs: u64) -> Result<i64, ConfigError> {
    secs.checked_mul(1000)
        .and_then(|ms| i64::try_from(ms).ok())
        .ok_or(ConfigError::InvalidValue {
            name,
            value: secs.to_string(),
        })
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// `primary`, `secondary`, then `rpc-1`, `rpc-2`, ... Duplicate URLs are dropped.
fn parse_providers(primary: Option<String>, secondary: Option<String>, extra: Option<String>) -> Vec<ProviderEndpoint> {
    let mut endpoints: Vec<ProviderEndpoint> = Vec::new();
    let named = primary
        .map(|url| ("primary".to_string(), url))
        .into_iter()
        .chain(secondary.map(|url| ("secondary".to_string(), url)))
        .chain(
            extra
                .map(|s| split_list(&s))
                .unwrap_or_default()
                .into_iter()
                .enumerate()
                .map(|(i, url)| (format!("rpc-{}", i + 1), url)),
        );

    for (name, url) in named {
        if endpoints.iter().any(|e| e.url == url) {
            continue;
        }
        endpoints.push(ProviderEndpoint::new(&name, &url));
    }
    endpoints
}

fn parse_tokens(s: &str) -> Result<Vec<TrackedToken>, ConfigError> {
    split_list(s)
        .into_iter()
        .map(|entry| match entry.split_once(':') {
            Some((address, symbol)) if address.starts_with("0x") && !symbol.trim().is_empty() => {
                Ok(TrackedToken::new(address.trim(), symbol.trim()))
            }
            _ => Err(ConfigError::InvalidValue {
                name: "TRACKED_TOKENS",
                value: entry,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    const TOKENS: (&str, &str) = ("TRACKED_TOKENS", "0xA0b8:USDC, 0xdAC1:USDT");

    #[test]
    fn test_defaults() {
        // Test: Only the required variables set
        let config = GateConfig::from_lookup(lookup(&[("RPC_PRIMARY_URL", "http://a"), TOKENS])).unwrap();

        assert_eq!(config.providers, vec![ProviderEndpoint::new("primary", "http://a")]);
        assert_eq!(config.chain, "ethereum");
        assert_eq!(config.confirmations, 12);
        assert_eq!(config.block_time_ms, 12_000);
        assert_eq!(config.db_path, "flowgate.db");
        assert_eq!(config.start_block, None);
        assert_eq!(config.tracked_tokens[0], TrackedToken::new("0xa0b8", "USDC"));
        assert_eq!(config.tracked_tokens[1].symbol, "USDT");
        assert!(config.watch_addresses.is_empty());
        assert_eq!(config.score_bands(), ScoreBands::default());
        assert_eq!(config.alert_thresholds(), AlertThresholds::default());
        assert_eq!(config.ingest_config().stale_claim_ms, 900_000);
    }

    #[test]
    fn test_overrides() {
        // Test: Custom values flow into the sub-configs
        let config = GateConfig::from_lookup(lookup(&[
            ("RPC_PRIMARY_URL", "http://a"),
            ("RPC_SECONDARY_URL", "http://b"),
            ("RPC_URLS", "http://c, http://a ,"),
            ("CONFIRMATIONS", "64"),
            ("START_BLOCK", "19000000"),
            ("RPC_TIMEOUT_MS", "2500"),
            ("APPROVED_MIN_SCORE", "80"),
            ("ALERT_STALL_SECS", "60"),
            ("WATCH_ADDRESSES", "0xPool"),
            TOKENS,
        ]))
        .unwrap();

        let names: Vec<&str> = config.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["primary", "secondary", "rpc-1"]);
        assert_eq!(config.ingest_config().confirmations, 64);
        assert_eq!(config.ingest_config().start_block, Some(19_000_000));
        assert_eq!(config.pool_config().timeout_ms, 2_500);
        assert_eq!(config.pool_config().error_penalty, 20);
        assert_eq!(config.score_bands().approved_min, 80);
        assert_eq!(config.alert_thresholds().stall_ms, 60_000);
        assert_eq!(config.watch_addresses, vec!["0xPool".to_string()]);
    }

    #[test]
    fn test_no_providers_fails_fast() {
        assert_eq!(
            GateConfig::from_lookup(lookup(&[TOKENS, ("RPC_PRIMARY_URL", "  ")])),
            Err(ConfigError::NoProviders)
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = GateConfig::from_lookup(lookup(&[("RPC_URLS", "http://a"), TOKENS, ("CONFIRMATIONS", "twelve")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "CONFIRMATIONS",
                value: "twelve".to_string()
            }
        );

        let err = GateConfig::from_lookup(lookup(&[("RPC_URLS", "http://a"), ("TRACKED_TOKENS", "USDC")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "TRACKED_TOKENS", .. }));

        let err = GateConfig::from_lookup(lookup(&[("RPC_URLS", "http://a")])).unwrap_err();
        assert_eq!(err, ConfigError::MissingVariable("TRACKED_TOKENS"));

        let err = GateConfig::from_lookup(lookup(&[
            ("RPC_URLS", "http://a"),
            TOKENS,
            ("QUARANTINE_MIN_SCORE", "90"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "QUARANTINE_MIN_SCORE", .. }));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        // Test: Seconds that overflow milliseconds are a config error, not a panic
        let huge = u64::MAX.to_string();
        let err = GateConfig::from_lookup(lookup(&[("RPC_URLS", "http://a"), TOKENS, ("STALE_CLAIM_SECS", huge.as_str())]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "STALE_CLAIM_SECS",
                value: huge.clone()
            }
        );

        // Fits in u64 milliseconds but not in i64
        let just_over = (i64::MAX as u64 / 1000 + 1).to_string();
        let err = GateConfig::from_lookup(lookup(&[("RPC_URLS", "http://a"), TOKENS, ("ALERT_STALL_SECS", just_over.as_str())]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "ALERT_STALL_SECS", .. }));
    }
}
