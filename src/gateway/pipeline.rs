//! Per-request price pipeline.
//!
//! `Received → Authenticating → Authenticated → Streaming → Settling → Completed`,
//! with `Failed` reachable from every non-terminal stage. Unmetered requests
//! go straight from `Received` to `Streaming` and never settle.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::access::{AccessApi, Status};
use crate::config::AnonymousPolicy;
use crate::errors::AppError;
use crate::ledger::mask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Authenticating,
    Authenticated,
    Streaming,
    Settling,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Received, Authenticating)
            | (Authenticating, Authenticated)
            | (Authenticated, Streaming)
            | (Streaming, Settling)
            | (Settling, Completed) => true,
            // unmetered
            (Received, Streaming) | (Streaming, Completed) => true,
            _ => false,
        }
    }
}

/// Tracks one request through the pipeline.
#[derive(Debug)]
pub struct RequestFlow {
    pub request_id: String,
    stage: Stage,
    started: Instant,
}

impl RequestFlow {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            stage: Stage::Received,
            started: Instant::now(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: Stage) -> bool {
        if !self.stage.can_advance_to(next) {
            tracing::warn!(
                request_id = %self.request_id,
                from = ?self.stage,
                to = ?next,
                "ignoring illegal pipeline transition"
            );
            return false;
        }
        tracing::debug!(request_id = %self.request_id, from = ?self.stage, to = ?next, "pipeline stage");
        self.stage = next;
        true
    }

    /// Enter `Failed` and hand the error back for propagation.
    pub fn fail(&mut self, err: AppError) -> AppError {
        self.advance(Stage::Failed);
        tracing::info!(
            request_id = %self.request_id,
            status = err.status_code().as_u16(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "request failed: {}",
            err
        );
        err
    }
}

/// Who is asking for data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Metered { token: String, identity: String },
    Unmetered,
}

impl Caller {
    pub fn token(&self) -> Option<&str> {
        match self {
            Caller::Metered { token, .. } => Some(token),
            Caller::Unmetered => None,
        }
    }
}

/// Run an access call under `timeout`. An expired deadline is `Unavailable`.
pub async fn with_deadline<T, F>(timeout: Duration, call: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(Status::unavailable("access manager deadline exceeded")),
    }
}

/// Resolve the caller from the optional `x-api-key`.
pub async fn authenticate(
    flow: &mut RequestFlow,
    access: &dyn AccessApi,
    api_key: Option<&str>,
    anonymous: AnonymousPolicy,
    timeout: Duration,
) -> Result<Caller, AppError> {
    let token = match api_key.map(str::trim).filter(|k| !k.is_empty()) {
        Some(token) => token,
        None => {
            return match anonymous {
                AnonymousPolicy::Deny => Err(flow.fail(AppError::Unauthenticated("missing api key".into()))),
                AnonymousPolicy::Unmetered => {
                    tracing::info!(request_id = %flow.request_id, "serving unmetered request without api key");
                    Ok(Caller::Unmetered)
                }
            };
        }
    };

    flow.advance(Stage::Authenticating);
    let resp = match with_deadline(timeout, access.validate_token(token, "gateway")).await {
        Ok(resp) => resp,
        Err(status) => {
            tracing::warn!(token = %mask(token), "token validation failed: {}", status);
            return Err(flow.fail(AppError::Unauthenticated("invalid token".into())));
        }
    };
    if !resp.is_valid {
        return Err(flow.fail(AppError::Unauthenticated("token is invalid or expired".into())));
    }

    flow.advance(Stage::Authenticated);
    tracing::debug!(identity = %resp.user_id, permissions = ?resp.permissions, "caller authenticated");
    Ok(Caller::Metered {
        token: token.to_string(),
        identity: resp.user_id,
    })
}

/// Advisory quota check before any stream is opened. Lookup failures let
/// the request through; settlement is authoritative.
pub async fn precheck_quota(
    flow: &mut RequestFlow,
    access: &dyn AccessApi,
    token: &str,
    limit: i64,
    timeout: Duration,
) -> Result<(), AppError> {
    match with_deadline(timeout, access.token_info(token)).await {
        Ok(info) => {
            tracing::debug!(token = %mask(token), quota_left = info.quota_left, limit, "quota pre-check");
            if info.quota_left <= 0 || info.quota_left < limit {
                return Err(flow.fail(AppError::Forbidden("insufficient quota for requested limit".into())));
            }
            Ok(())
        }
        Err(status) => {
            tracing::warn!(token = %mask(token), "quota pre-check skipped: {}", status);
            Ok(())
        }
    }
}

/// Charge `delivered` records to `token`. Never retried.
pub async fn settle(
    access: &dyn AccessApi,
    token: &str,
    delivered: i64,
    timeout: Duration,
) -> Result<i64, Status> {
    let resp = with_deadline(timeout, access.update_quota(token, delivered)).await?;
    tracing::info!(token = %mask(token), delivered, quota_left = resp.quota_left, "quota settled");
    Ok(resp.quota_left)
}
