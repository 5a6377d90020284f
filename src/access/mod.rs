//! Access Manager: the RPC façade in front of the token ledger.
//!
//! [`AccessManager`] owns the ledger handle and translates ledger outcomes
//! into the [`Code`] taxonomy. It holds no other state. The gateway talks to
//! it through [`AccessApi`], either over HTTP ([`client::AccessClient`]) or
//! in-process when running embedded.

pub mod client;
pub mod rpc;
pub mod types;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use thiserror::Error;

use crate::ledger::{mask, LedgerError, TokenLedger};
use types::*;

/// Error taxonomy shared by every access operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    Unauthenticated,
    Forbidden,
    NotFound,
    Unavailable,
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "invalid_argument",
            Code::Unauthenticated => "unauthenticated",
            Code::Forbidden => "forbidden",
            Code::NotFound => "not_found",
            Code::Unavailable => "unavailable",
            Code::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invalid_argument" => Some(Code::InvalidArgument),
            "unauthenticated" => Some(Code::Unauthenticated),
            "forbidden" => Some(Code::Forbidden),
            "not_found" => Some(Code::NotFound),
            "unavailable" => Some(Code::Unavailable),
            "internal" => Some(Code::Internal),
            _ => None,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Code::InvalidArgument => StatusCode::BAD_REQUEST,
            Code::Unauthenticated => StatusCode::UNAUTHORIZED,
            Code::Forbidden => StatusCode::FORBIDDEN,
            Code::NotFound => StatusCode::NOT_FOUND,
            Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Best-effort inverse of [`Code::http_status`] for bodies without a code.
    pub fn from_http_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 | 422 => Code::InvalidArgument,
            401 => Code::Unauthenticated,
            403 => Code::Forbidden,
            404 => Code::NotFound,
            502..=504 => Code::Unavailable,
            _ => Code::Internal,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }
}

impl From<LedgerError> for Status {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InvalidArgument(msg) => Status::invalid_argument(msg),
            LedgerError::NotFound => Status::not_found("token not found"),
            LedgerError::Unavailable(detail) => {
                tracing::error!("token store unavailable: {}", detail);
                Status::unavailable("token store not available")
            }
            LedgerError::Storage(detail) => {
                tracing::error!("token store error: {}", detail);
                Status::internal("token store failure")
            }
        }
    }
}

/// The Access Manager RPC surface.
#[async_trait]
pub trait AccessApi: Send + Sync {
    async fn validate_token(&self, token: &str, service: &str) -> Result<ValidateResponse, Status>;

    async fn create_token(&self, permissions: Vec<String>, expires_in: i64) -> Result<CreateTokenResponse, Status>;

    async fn revoke_token(&self, token: &str) -> Result<RevokeTokenResponse, Status>;

    /// Settle consumption. Negative `decrease_by` force-revokes.
    async fn update_quota(&self, token: &str, decrease_by: i64) -> Result<UpdateQuotaResponse, Status>;

    async fn token_info(&self, token: &str) -> Result<TokenInfoResponse, Status>;

    async fn health(&self) -> Result<(), Status>;
}

#[derive(Clone)]
pub struct AccessManager {
    ledger: Option<Arc<dyn TokenLedger>>,
}

impl AccessManager {
    pub fn new(ledger: Arc<dyn TokenLedger>) -> Self {
        Self {
            ledger: Some(ledger),
        }
    }

    /// A manager with no store handle. Every call fails `Unavailable`.
    pub fn detached() -> Self {
        Self { ledger: None }
    }

    fn ledger(&self) -> Result<&Arc<dyn TokenLedger>, Status> {
        self.ledger.as_ref().ok_or_else(|| {
            tracing::error!("token store handle is not configured");
            Status::unavailable("token store not available")
        })
    }
}

#[async_trait]
impl AccessApi for AccessManager {
    async fn validate_token(&self, token: &str, service: &str) -> Result<ValidateResponse, Status> {
        if token.is_empty() {
            return Err(Status::invalid_argument("token is required"));
        }
        let result = self.ledger()?.validate(token).await?;
        if result.valid {
            tracing::debug!(token = %mask(token), service, identity = %result.identity, "token validated");
        } else {
            tracing::info!(token = %mask(token), service, "token invalid or expired");
        }
        Ok(ValidateResponse {
            is_valid: result.valid,
            user_id: result.identity,
            permissions: result.permissions,
        })
    }

    async fn create_token(&self, permissions: Vec<String>, expires_in: i64) -> Result<CreateTokenResponse, Status> {
        if expires_in <= 0 {
            return Err(Status::invalid_argument("expires_in must be positive"));
        }
        let issued = self.ledger()?.create(permissions, expires_in).await?;
        tracing::info!(token = %mask(&issued.token), expires_at = %issued.expires_at, "token created");
        Ok(CreateTokenResponse {
            token: issued.token,
            expires_at: issued.expires_at.timestamp(),
        })
    }

    async fn revoke_token(&self, token: &str) -> Result<RevokeTokenResponse, Status> {
        if token.is_empty() {
            return Err(Status::invalid_argument("token is required"));
        }
        let success = self.ledger()?.revoke(token).await?;
        if success {
            tracing::info!(token = %mask(token), "token revoked");
        } else {
            tracing::info!(token = %mask(token), "token not found for revocation");
        }
        Ok(RevokeTokenResponse { success })
    }

    async fn update_quota(&self, token: &str, decrease_by: i64) -> Result<UpdateQuotaResponse, Status> {
        if token.is_empty() {
            return Err(Status::invalid_argument("token is required"));
        }
        let quota_left = self.ledger()?.settle(token, decrease_by).await?;
        if decrease_by < 0 {
            tracing::info!(token = %mask(token), decrease_by, "token force-revoked via negative settle");
        } else {
            tracing::info!(token = %mask(token), decrease_by, quota_left, "token quota settled");
        }
        Ok(UpdateQuotaResponse { quota_left })
    }

    async fn token_info(&self, token: &str) -> Result<TokenInfoResponse, Status> {
        if token.is_empty() {
            return Err(Status::invalid_argument("token is required"));
        }
        let info = self.ledger()?.inspect(token).await?;
        Ok(TokenInfoResponse {
            token: info.token,
            quota_left: info.quota_left,
            expires_at: info.expires_at.timestamp(),
            permissions: info.permissions,
        })
    }

    async fn health(&self) -> Result<(), Status> {
        self.ledger()?.ping().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemoryLedger;

    fn manager() -> AccessManager {
        AccessManager::new(Arc::new(MemoryLedger::new()))
    }

    #[tokio::test]
    async fn test_detached_manager_is_unavailable_for_every_call() {
        let m = AccessManager::detached();
        assert_eq!(m.validate_token("pk_x", "gateway").await.unwrap_err().code, Code::Unavailable);
        assert_eq!(m.create_token(vec![], 60).await.unwrap_err().code, Code::Unavailable);
        assert_eq!(m.revoke_token("pk_x").await.unwrap_err().code, Code::Unavailable);
        assert_eq!(m.update_quota("pk_x", 1).await.unwrap_err().code, Code::Unavailable);
        assert_eq!(m.token_info("pk_x").await.unwrap_err().code, Code::Unavailable);
        assert_eq!(m.health().await.unwrap_err().code, Code::Unavailable);
    }

    #[tokio::test]
    async fn test_create_rejects_non_positive_expiry() {
        let m = manager();
        assert_eq!(m.create_token(vec![], 0).await.unwrap_err().code, Code::InvalidArgument);
        assert_eq!(m.create_token(vec![], -1).await.unwrap_err().code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_create_then_validate() {
        let m = manager();
        let created = m.create_token(vec!["read:prices".into()], 3600).await.unwrap();
        assert!(created.expires_at > chrono::Utc::now().timestamp());

        let v = m.validate_token(&created.token, "gateway").await.unwrap();
        assert!(v.is_valid);
        assert_eq!(v.permissions, vec!["read:prices".to_string()]);
        assert!(v.user_id.starts_with("user-"));
    }

    #[tokio::test]
    async fn test_empty_token_is_invalid_argument() {
        let m = manager();
        assert_eq!(m.validate_token("", "gateway").await.unwrap_err().code, Code::InvalidArgument);
        assert_eq!(m.revoke_token("").await.unwrap_err().code, Code::InvalidArgument);
        assert_eq!(m.token_info("").await.unwrap_err().code, Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_update_quota_unknown_token_is_not_found() {
        let m = manager();
        let err = m.update_quota("pk_missing", 10).await.unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[tokio::test]
    async fn test_negative_update_quota_echoes_and_deletes() {
        let m = manager();
        let created = m.create_token(vec![], 3600).await.unwrap();
        let resp = m.update_quota(&created.token, -5).await.unwrap();
        assert_eq!(resp.quota_left, -5);
        assert_eq!(m.token_info(&created.token).await.unwrap_err().code, Code::NotFound);
    }

    #[test]
    fn test_code_http_mapping_round_trips() {
        for code in [
            Code::InvalidArgument,
            Code::Unauthenticated,
            Code::Forbidden,
            Code::NotFound,
            Code::Unavailable,
            Code::Internal,
        ] {
            assert_eq!(Code::from_http_status(code.http_status()), code);
            assert_eq!(Code::parse(code.as_str()), Some(code));
        }
    }

    #[test]
    fn test_storage_errors_do_not_leak() {
        let status = Status::from(LedgerError::Storage("relation \"tokens\" does not exist".into()));
        assert_eq!(status.code, Code::Internal);
        assert!(!status.message.contains("relation"));
    }
}
