use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

/// What the gateway does with a price request that carries no `x-api-key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonymousPolicy {
    /// Reject with 401.
    Deny,
    /// Stream without authentication, pre-check, or settlement.
    Unmetered,
}

impl FromStr for AnonymousPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" => Ok(AnonymousPolicy::Deny),
            "unmetered" => Ok(AnonymousPolicy::Unmetered),
            other => anyhow::bail!("unknown anonymous access policy '{}' (expected deny|unmetered)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub access_port: u16,
    /// Postgres URL for the token ledger. `None` keeps tokens in memory.
    pub database_url: Option<String>,
    pub access_url: String,
    pub prices_url: String,
    pub exchanges: Vec<String>,
    /// Deadline for every access RPC (validate, inspect, settle).
    pub rpc_timeout: Duration,
    /// Deadline for a whole upstream price stream.
    pub stream_timeout: Duration,
    pub price_retries: u32,
    pub quota_precheck: bool,
    pub anonymous: AnonymousPolicy,
    pub default_quota: i64,
    /// TTL for tokens issued through `POST /auth/token`.
    pub token_ttl_secs: i64,
    /// Capacity of the channel between the upstream reader and the client writer.
    pub relay_buffer: usize,
    /// Expired-row sweep period. 0 disables the sweep.
    pub sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            access_port: 50052,
            database_url: None,
            access_url: "http://127.0.0.1:50052".into(),
            prices_url: "http://127.0.0.1:50051".into(),
            exchanges: vec!["binance".into(), "bybit".into()],
            rpc_timeout: Duration::from_millis(5000),
            stream_timeout: Duration::from_secs(60),
            price_retries: 2,
            quota_precheck: true,
            anonymous: AnonymousPolicy::Deny,
            default_quota: crate::ledger::DEFAULT_ALLOTMENT,
            token_ttl_secs: 90 * 24 * 3600,
            relay_buffer: 16,
            sweep_interval_secs: 0,
        }
    }
}

/// Parse `key` if set; fall back to `default` when unset. A set but
/// malformed value is an error.
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        _ => Ok(default),
    }
}

fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => {
            let items: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if items.is_empty() {
                default
            } else {
                items
            }
        }
        Err(_) => default,
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = Config::default();

    let cfg = Config {
        port: env_or("PRICEGATE_PORT", defaults.port)?,
        access_port: env_or("PRICEGATE_ACCESS_PORT", defaults.access_port)?,
        database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.trim().is_empty()),
        access_url: std::env::var("PRICEGATE_ACCESS_URL").unwrap_or(defaults.access_url),
        prices_url: std::env::var("PRICEGATE_PRICES_URL").unwrap_or(defaults.prices_url),
        exchanges: env_list("PRICEGATE_EXCHANGES", defaults.exchanges),
        rpc_timeout: Duration::from_millis(env_or("PRICEGATE_RPC_TIMEOUT_MS", 5000u64)?),
        stream_timeout: Duration::from_secs(env_or("PRICEGATE_STREAM_TIMEOUT_SECS", 60u64)?),
        price_retries: env_or("PRICEGATE_PRICE_RETRIES", defaults.price_retries)?,
        quota_precheck: env_or("PRICEGATE_QUOTA_PRECHECK", defaults.quota_precheck)?,
        anonymous: env_or("PRICEGATE_ANONYMOUS_ACCESS", defaults.anonymous)?,
        default_quota: env_or("PRICEGATE_DEFAULT_QUOTA", defaults.default_quota)?,
        token_ttl_secs: env_or("PRICEGATE_TOKEN_TTL_SECS", defaults.token_ttl_secs)?,
        relay_buffer: env_or("PRICEGATE_RELAY_BUFFER", defaults.relay_buffer)?,
        sweep_interval_secs: env_or("PRICEGATE_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
    };

    if cfg.rpc_timeout.is_zero() {
        anyhow::bail!("PRICEGATE_RPC_TIMEOUT_MS must be positive");
    }
    if cfg.relay_buffer == 0 {
        anyhow::bail!("PRICEGATE_RELAY_BUFFER must be at least 1");
    }
    if cfg.default_quota <= 0 {
        anyhow::bail!("PRICEGATE_DEFAULT_QUOTA must be positive");
    }
    if cfg.token_ttl_secs <= 0 {
        anyhow::bail!("PRICEGATE_TOKEN_TTL_SECS must be positive");
    }

    Ok(cfg)
}
