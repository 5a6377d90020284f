//! In-process ledger backed by a DashMap.
//!
//! Each mutation runs under the shard lock held by a DashMap entry, so settles
//! on one token are serialized while other tokens proceed in parallel. Used for
//! local development when no `DATABASE_URL` is configured, and in tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    generate_token, remaining_after, require_token, require_ttl, IssuedToken, LedgerError,
    TokenInfo, TokenLedger, TokenRow, ValidationResult, DEFAULT_ALLOTMENT,
};

#[derive(Clone)]
pub struct MemoryLedger {
    rows: Arc<DashMap<String, TokenRow>>,
    next_serial: Arc<AtomicI64>,
    allotment: i64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_allotment(DEFAULT_ALLOTMENT)
    }

    pub fn with_allotment(allotment: i64) -> Self {
        Self {
            rows: Arc::new(DashMap::new()),
            next_serial: Arc::new(AtomicI64::new(1)),
            allotment,
        }
    }

    /// Number of stored rows, including expired ones.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.rows.contains_key(token)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenLedger for MemoryLedger {
    async fn create(&self, permissions: Vec<String>, ttl_secs: i64) -> Result<IssuedToken, LedgerError> {
        let ttl = require_ttl(ttl_secs)?;
        let now = Utc::now();
        let row = TokenRow {
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            token: generate_token(),
            quota_left: self.allotment,
            expires_at: now + ttl,
            permissions,
            created_at: now,
        };
        let issued = IssuedToken {
            token: row.token.clone(),
            expires_at: row.expires_at,
        };
        self.rows.insert(row.token.clone(), row);
        Ok(issued)
    }

    async fn validate(&self, token: &str) -> Result<ValidationResult, LedgerError> {
        require_token(token)?;
        let Some(row) = self.rows.get(token) else {
            return Ok(ValidationResult::invalid());
        };
        if row.is_expired(Utc::now()) {
            return Ok(ValidationResult::invalid());
        }
        Ok(ValidationResult {
            valid: true,
            identity: row.identity(),
            permissions: row.permissions.clone(),
        })
    }

    async fn settle(&self, token: &str, delivered: i64) -> Result<i64, LedgerError> {
        require_token(token)?;
        if delivered < 0 {
            self.rows.remove(token);
            return Ok(delivered);
        }

        match self.rows.entry(token.to_string()) {
            Entry::Vacant(_) => Err(LedgerError::NotFound),
            Entry::Occupied(mut entry) => {
                let next = remaining_after(entry.get().quota_left, delivered);
                if next <= 0 {
                    entry.remove();
                } else {
                    entry.get_mut().quota_left = next;
                }
                Ok(next)
            }
        }
    }

    async fn revoke(&self, token: &str) -> Result<bool, LedgerError> {
        require_token(token)?;
        Ok(self.rows.remove(token).is_some())
    }

    async fn inspect(&self, token: &str) -> Result<TokenInfo, LedgerError> {
        require_token(token)?;
        self.rows
            .get(token)
            .map(|row| TokenInfo::from(row.clone()))
            .ok_or(LedgerError::NotFound)
    }

    async fn purge_expired(&self) -> Result<u64, LedgerError> {
        let now = Utc::now();
        let before = self.rows.len();
        self.rows.retain(|_, row| !row.is_expired(now));
        Ok(before.saturating_sub(self.rows.len()) as u64)
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms() -> Vec<String> {
        vec!["read:prices".to_string()]
    }

    #[tokio::test]
    async fn test_create_then_validate_returns_permissions() {
        let ledger = MemoryLedger::new();
        let issued = ledger.create(perms(), 3600).await.unwrap();

        let v = ledger.validate(&issued.token).await.unwrap();
        assert!(v.valid);
        assert_eq!(v.permissions, perms());
        assert_eq!(v.identity, "user-1");
    }

    #[tokio::test]
    async fn test_create_rejects_non_positive_ttl_without_persisting() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.create(perms(), 0).await,
            Err(LedgerError::InvalidArgument(_))
        ));
        assert!(matches!(
            ledger.create(perms(), -1).await,
            Err(LedgerError::InvalidArgument(_))
        ));
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_validate_unknown_token_is_invalid_not_error() {
        let ledger = MemoryLedger::new();
        let v = ledger.validate("pk_missing").await.unwrap();
        assert_eq!(v, ValidationResult::invalid());
    }

    #[tokio::test]
    async fn test_validate_empty_token_is_invalid_argument() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.validate("").await,
            Err(LedgerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_is_invalid_but_kept() {
        let ledger = MemoryLedger::new();
        let issued = ledger.create(perms(), 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        for _ in 0..3 {
            let v = ledger.validate(&issued.token).await.unwrap();
            assert!(!v.valid);
        }
        assert!(ledger.contains(&issued.token), "expiry must not delete the row");
    }

    #[tokio::test]
    async fn test_settle_lifecycle_deletes_at_zero() {
        let ledger = MemoryLedger::new();
        let issued = ledger.create(perms(), 3600).await.unwrap();

        assert_eq!(ledger.settle(&issued.token, 100).await.unwrap(), 4900);
        assert!(ledger.contains(&issued.token));

        assert_eq!(ledger.settle(&issued.token, 4900).await.unwrap(), 0);
        assert!(!ledger.contains(&issued.token));
        assert!(!ledger.validate(&issued.token).await.unwrap().valid);

        assert!(matches!(
            ledger.settle(&issued.token, 1).await,
            Err(LedgerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_settle_overdraw_floors_at_zero_and_deletes() {
        let ledger = MemoryLedger::with_allotment(10);
        let issued = ledger.create(perms(), 3600).await.unwrap();
        assert_eq!(ledger.settle(&issued.token, 25).await.unwrap(), 0);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_negative_settle_force_revokes() {
        let ledger = MemoryLedger::new();
        let issued = ledger.create(perms(), 3600).await.unwrap();
        assert_eq!(ledger.settle(&issued.token, -7).await.unwrap(), -7);
        assert!(!ledger.contains(&issued.token));

        // Absent tokens take the same path without error.
        assert_eq!(ledger.settle(&issued.token, -1).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let ledger = MemoryLedger::new();
        let issued = ledger.create(perms(), 3600).await.unwrap();
        assert!(ledger.revoke(&issued.token).await.unwrap());
        assert!(!ledger.revoke(&issued.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_inspect_missing_is_not_found() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.inspect("pk_missing").await,
            Err(LedgerError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_purge_expired_only_removes_expired_rows() {
        let ledger = MemoryLedger::new();
        let short = ledger.create(perms(), 1).await.unwrap();
        let long = ledger.create(perms(), 3600).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        assert_eq!(ledger.purge_expired().await.unwrap(), 1);
        assert!(!ledger.contains(&short.token));
        assert!(ledger.contains(&long.token));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_settles_do_not_lose_updates() {
        let ledger = MemoryLedger::new();
        let issued = ledger.create(perms(), 3600).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..40 {
            let ledger = ledger.clone();
            let token = issued.token.clone();
            handles.push(tokio::spawn(async move { ledger.settle(&token, 25).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let info = ledger.inspect(&issued.token).await.unwrap();
        assert_eq!(info.quota_left, DEFAULT_ALLOTMENT - 40 * 25);
    }
}
