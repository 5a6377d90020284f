//! HTTP client for a remote Access Manager.
//!
//! Calls are never retried: a replayed `UpdateQuota` would double-charge.
//! Each call runs under its own deadline.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};

use super::types::*;
use super::{AccessApi, Code, Status};

pub struct AccessClient {
    base_url: String,
    http: Client,
    timeout: Duration,
}

impl AccessClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .pool_max_idle_per_host(32)
            .connect_timeout(Duration::from_secs(2).min(timeout))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            timeout,
        })
    }

    async fn rpc<Req, Resp>(&self, method: &str, req: &Req) -> Result<Resp, Status>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/rpc/{}", self.base_url, method);
        let resp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(req)
            .send()
            .await
            .map_err(|e| transport_status(method, e))?;

        let status = resp.status();
        if status.is_success() {
            return resp.json::<Resp>().await.map_err(|e| {
                tracing::warn!(method, "access RPC returned an undecodable body: {}", e);
                Status::internal("malformed access manager response")
            });
        }

        let body = resp.json::<serde_json::Value>().await.unwrap_or_default();
        let code = body["code"]
            .as_str()
            .and_then(Code::parse)
            .unwrap_or_else(|| Code::from_http_status(status));
        let message = body["error"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| format!("access manager returned {}", status));
        Err(Status::new(code, message))
    }
}

fn transport_status(method: &str, e: reqwest::Error) -> Status {
    tracing::warn!(method, "access RPC transport failure: {}", e);
    if e.is_timeout() {
        Status::unavailable("access manager deadline exceeded")
    } else if e.is_connect() || e.is_request() {
        Status::unavailable("access manager unreachable")
    } else {
        Status::internal("access manager transport failure")
    }
}

#[async_trait]
impl AccessApi for AccessClient {
    async fn validate_token(&self, token: &str, service: &str) -> Result<ValidateResponse, Status> {
        let req = ValidateRequest {
            token: token.to_string(),
            service: service.to_string(),
        };
        self.rpc("ValidateToken", &req).await
    }

    async fn create_token(&self, permissions: Vec<String>, expires_in: i64) -> Result<CreateTokenResponse, Status> {
        let req = CreateTokenRequest {
            permissions,
            expires_in,
        };
        self.rpc("CreateToken", &req).await
    }

    async fn revoke_token(&self, token: &str) -> Result<RevokeTokenResponse, Status> {
        let req = TokenRequest {
            token: token.to_string(),
        };
        self.rpc("RevokeToken", &req).await
    }

    async fn update_quota(&self, token: &str, decrease_by: i64) -> Result<UpdateQuotaResponse, Status> {
        let req = UpdateQuotaRequest {
            token: token.to_string(),
            decrease_by,
        };
        self.rpc("UpdateQuota", &req).await
    }

    async fn token_info(&self, token: &str) -> Result<TokenInfoResponse, Status> {
        let req = TokenRequest {
            token: token.to_string(),
        };
        self.rpc("GetTokenInfo", &req).await
    }

    async fn health(&self) -> Result<(), Status> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_status("Health", e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Status::new(
                Code::from_http_status(resp.status()),
                format!("access manager health returned {}", resp.status()),
            ))
        }
    }
}
