//! JSON-over-HTTP transport for the Access Manager.
//!
//! Every method is `POST /rpc/<Method>`; failures carry the taxonomy code in
//! the body so clients can reconstruct the [`Status`].

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use super::types::*;
use super::{AccessApi, AccessManager, Status};

impl IntoResponse for Status {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code.as_str(),
        }));
        (self.code.http_status(), body).into_response()
    }
}

pub fn router(manager: AccessManager) -> Router {
    Router::new()
        .route("/rpc/ValidateToken", post(validate_token))
        .route("/rpc/CreateToken", post(create_token))
        .route("/rpc/RevokeToken", post(revoke_token))
        .route("/rpc/UpdateQuota", post(update_quota))
        .route("/rpc/GetTokenInfo", post(token_info))
        .route("/health", get(health))
        .with_state(manager)
        .layer(TraceLayer::new_for_http())
}

async fn validate_token(
    State(manager): State<AccessManager>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, Status> {
    manager.validate_token(&req.token, &req.service).await.map(Json)
}

async fn create_token(
    State(manager): State<AccessManager>,
    Json(req): Json<CreateTokenRequest>,
) -> Result<Json<CreateTokenResponse>, Status> {
    manager.create_token(req.permissions, req.expires_in).await.map(Json)
}

async fn revoke_token(
    State(manager): State<AccessManager>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<RevokeTokenResponse>, Status> {
    manager.revoke_token(&req.token).await.map(Json)
}

async fn update_quota(
    State(manager): State<AccessManager>,
    Json(req): Json<UpdateQuotaRequest>,
) -> Result<Json<UpdateQuotaResponse>, Status> {
    manager.update_quota(&req.token, req.decrease_by).await.map(Json)
}

async fn token_info(
    State(manager): State<AccessManager>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<TokenInfoResponse>, Status> {
    manager.token_info(&req.token).await.map(Json)
}

async fn health(State(manager): State<AccessManager>) -> (StatusCode, Json<serde_json::Value>) {
    match manager.health().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "up", "message": "OK"}))),
        Err(status) => (
            status.code.http_status(),
            Json(json!({"status": "down", "message": status.message})),
        ),
    }
}
