//! Request/response shapes of the Access Manager RPC surface.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub token: String,
    #[serde(default)]
    pub service: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub is_valid: bool,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub permissions: Vec<String>,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    pub token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeTokenResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateQuotaRequest {
    pub token: String,
    /// Units to subtract. Negative values force-revoke the token.
    pub decrease_by: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateQuotaResponse {
    pub quota_left: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfoResponse {
    pub token: String,
    pub quota_left: i64,
    /// Unix seconds.
    pub expires_at: i64,
    pub permissions: Vec<String>,
}
