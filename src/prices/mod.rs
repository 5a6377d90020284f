//! Price sources: upstream providers of OHLCV candles.
//!
//! The gateway only needs "stream N candles for a ticker on an exchange";
//! exchange integrations live behind the upstream price service.

pub mod registry;
pub mod remote;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Candles returned when the caller does not ask for a positive limit.
pub const DEFAULT_LIMIT: i64 = 100;

/// One candle. Passes through the gateway without being stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Exchanges the gateway knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
}

impl Exchange {
    pub const ALL: [Exchange; 2] = [Exchange::Binance, Exchange::Bybit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "bybit" => Ok(Exchange::Bybit),
            _ => Err(SourceError::UnsupportedExchange(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("unsupported exchange: {0}")]
    UnsupportedExchange(String),

    #[error("price source unreachable: {0}")]
    Unreachable(String),

    #[error("price source timed out")]
    Timeout,

    /// The upstream refused the request itself (unknown ticker, bad limit).
    #[error("price source rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("price source failed ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("malformed price record: {0}")]
    Decode(String),

    /// The stream broke after it had started.
    #[error("price stream interrupted: {0}")]
    Interrupted(String),
}

pub type PriceStream = BoxStream<'static, Result<PriceRecord, SourceError>>;

/// An upstream that can stream candles.
///
/// Errors returned by `open` happen before any record was produced; errors
/// yielded by the stream are mid-flight failures. Dropping the stream must
/// cancel the upstream call.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn open(&self, exchange: Exchange, ticker: &str, limit: i64) -> Result<PriceStream, SourceError>;

    async fn health(&self) -> Result<(), SourceError>;
}

/// Clamp a requested limit to the source contract.
pub fn effective_limit(limit: Option<i64>) -> i64 {
    match limit {
        Some(n) if n > 0 => n,
        _ => DEFAULT_LIMIT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_parse_is_case_insensitive() {
        assert_eq!("binance".parse::<Exchange>().unwrap(), Exchange::Binance);
        assert_eq!("ByBit".parse::<Exchange>().unwrap(), Exchange::Bybit);
        assert!(matches!(
            "kraken".parse::<Exchange>(),
            Err(SourceError::UnsupportedExchange(_))
        ));
    }

    #[test]
    fn test_effective_limit_defaults() {
        assert_eq!(effective_limit(None), 100);
        assert_eq!(effective_limit(Some(0)), 100);
        assert_eq!(effective_limit(Some(-5)), 100);
        assert_eq!(effective_limit(Some(7)), 7);
    }
}
