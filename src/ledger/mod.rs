//! Token ledger, the durable store of metered API tokens.
//!
//! A row exists only while its token is spendable: rows are deleted (never
//! flagged) when quota reaches zero or on revocation. Expiry is evaluated
//! lazily on read; expired rows stay until settled to zero, revoked, or swept.
//!
//! Two backends implement [`TokenLedger`]:
//! - [`memory::MemoryLedger`]: DashMap, mutation under the per-key entry lock
//! - [`postgres::PgLedger`]: sqlx, mutation under a `FOR UPDATE` row lock

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Quota granted to every new token.
pub const DEFAULT_ALLOTMENT: i64 = 5000;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("token not found")]
    NotFound,

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                LedgerError::Unavailable(e.to_string())
            }
            sqlx::Error::RowNotFound => LedgerError::NotFound,
            other => LedgerError::Storage(other.to_string()),
        }
    }
}

/// A stored token row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRow {
    /// Monotonic row serial, used to derive the caller identity.
    pub serial: i64,
    pub token: String,
    pub quota_left: i64,
    pub expires_at: DateTime<Utc>,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TokenRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn identity(&self) -> String {
        format!("user-{}", self.serial)
    }
}

/// Returned by [`TokenLedger::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of a validation. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub identity: String,
    pub permissions: Vec<String>,
}

impl ValidationResult {
    pub fn invalid() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token: String,
    pub quota_left: i64,
    pub expires_at: DateTime<Utc>,
    pub permissions: Vec<String>,
}

impl From<TokenRow> for TokenInfo {
    fn from(row: TokenRow) -> Self {
        Self {
            token: row.token,
            quota_left: row.quota_left,
            expires_at: row.expires_at,
            permissions: row.permissions,
        }
    }
}

/// Atomic operations over token rows.
///
/// Implementations must serialize `settle` per token: two concurrent settles
/// on the same token never lose an update, while unrelated tokens proceed
/// in parallel.
#[async_trait]
pub trait TokenLedger: Send + Sync {
    /// Persist a fresh token with the default allotment.
    async fn create(&self, permissions: Vec<String>, ttl_secs: i64) -> Result<IssuedToken, LedgerError>;

    /// Absent or expired tokens are `valid = false`, not errors. Never mutates.
    async fn validate(&self, token: &str) -> Result<ValidationResult, LedgerError>;

    /// Decrement quota by `delivered`, deleting the row once it reaches zero.
    ///
    /// A negative `delivered` deletes the row unconditionally and is echoed
    /// back; this force-revoke overload is kept for wire compatibility with
    /// `UpdateQuota`. New callers should use [`TokenLedger::revoke`].
    async fn settle(&self, token: &str, delivered: i64) -> Result<i64, LedgerError>;

    /// Idempotent delete. `false` when there was nothing to delete.
    async fn revoke(&self, token: &str) -> Result<bool, LedgerError>;

    async fn inspect(&self, token: &str) -> Result<TokenInfo, LedgerError>;

    /// Delete rows whose expiry has passed. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64, LedgerError>;

    /// Cheap reachability probe for health reporting.
    async fn ping(&self) -> Result<(), LedgerError>;
}

pub(crate) fn require_token(token: &str) -> Result<(), LedgerError> {
    if token.trim().is_empty() {
        return Err(LedgerError::InvalidArgument("token is required".into()));
    }
    Ok(())
}

pub(crate) fn require_ttl(ttl_secs: i64) -> Result<Duration, LedgerError> {
    if ttl_secs <= 0 {
        return Err(LedgerError::InvalidArgument("expires_in must be positive".into()));
    }
    Duration::try_seconds(ttl_secs)
        .ok_or_else(|| LedgerError::InvalidArgument("expires_in is out of range".into()))
}

/// Quota remaining after delivering `delivered` units, floored at zero.
pub(crate) fn remaining_after(quota_left: i64, delivered: i64) -> i64 {
    quota_left.saturating_sub(delivered).max(0)
}

/// Generate an opaque, collision-resistant token string.
pub fn generate_token() -> String {
    let mut random_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut random_bytes);
    format!("pk_{}", hex::encode(random_bytes))
}

/// Mask a token for logs: keeps the first and last four characters.
pub fn mask(token: &str) -> String {
    if token.len() > 12 && token.is_ascii() {
        format!("{}…{}", &token[..4], &token[token.len() - 4..])
    } else {
        "****".to_string()
    }
}
