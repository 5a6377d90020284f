use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;

use super::pipeline::{self, Caller, RequestFlow, Stage};
use super::relay::{self, Candle, Delivery, RelayOutcome};
use super::GatewayState;
use crate::access::types::TokenInfoResponse;
use crate::errors::AppError;
use crate::ledger::mask;
use crate::prices::{self, Exchange, PriceStream, SourceError};

/// Request id assigned by [`request_id_middleware`].
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Middleware: propagates or assigns `x-request-id` and echoes it back.
pub async fn request_id_middleware(
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let req_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(req_id.clone()));

    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

#[derive(Debug, Deserialize)]
pub struct PriceQuery {
    pub limit: Option<String>,
}

/// Absent or non-positive limits fall back to the default; anything that
/// is not an integer is rejected.
pub fn parse_limit(raw: Option<&str>) -> Result<i64, AppError> {
    let raw = match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw,
        None => return Ok(prices::DEFAULT_LIMIT),
    };
    let parsed = raw
        .parse::<i64>()
        .map_err(|_| AppError::InvalidArgument("invalid limit parameter".into()))?;
    Ok(prices::effective_limit(Some(parsed)))
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
}

/// `GET /prices/:exchange/:ticker`
pub async fn get_prices(
    State(state): State<Arc<GatewayState>>,
    Path((exchange, ticker)): Path<(String, String)>,
    Query(query): Query<PriceQuery>,
    request_id: Option<Extension<RequestId>>,
    headers: HeaderMap,
) -> Response {
    let request_id = request_id
        .map(|Extension(RequestId(id))| id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    match serve_prices(&state, request_id, &exchange, &ticker, query.limit.as_deref(), &headers).await {
        Ok(resp) => resp,
        Err(err) => {
            let label = exchange.parse::<Exchange>().map(|e| e.as_str()).unwrap_or("unknown");
            state.metrics.record_outcome(label, err.kind());
            err.into_response()
        }
    }
}

#[tracing::instrument(name = "prices", skip(state, request_id, limit, headers), fields(request_id = %request_id))]
async fn serve_prices(
    state: &Arc<GatewayState>,
    request_id: String,
    exchange: &str,
    ticker: &str,
    limit: Option<&str>,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let mut flow = RequestFlow::new(request_id);
    let settings = &state.settings;

    let (exchange, source) = state
        .sources
        .resolve(exchange)
        .map_err(|e| flow.fail(e.into()))?;
    let limit = parse_limit(limit).map_err(|e| flow.fail(e))?;

    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let caller = pipeline::authenticate(
        &mut flow,
        state.access.as_ref(),
        api_key,
        settings.anonymous,
        settings.rpc_timeout,
    )
    .await?;

    if let Caller::Metered { token, .. } = &caller {
        if settings.quota_precheck {
            pipeline::precheck_quota(&mut flow, state.access.as_ref(), token, limit, settings.rpc_timeout).await?;
        }
    }

    flow.advance(Stage::Streaming);
    let deadline = Instant::now() + settings.stream_timeout;
    let opened = match tokio::time::timeout_at(deadline, source.open(exchange, ticker, limit)).await {
        Ok(opened) => opened,
        Err(_) => Err(SourceError::Timeout),
    };

    let upstream = match opened {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(%exchange, ticker, "failed to open price stream: {}", e);
            let delivery = Delivery {
                delivered: 0,
                outcome: RelayOutcome::Failed(e.clone()),
            };
            settle_in_background(state, flow, caller, exchange, "open", delivery);
            // outcome already recorded by settlement
            return Ok(AppError::from(e).into_response());
        }
    };

    if wants_event_stream(headers) {
        Ok(relay_incremental(state, flow, caller, exchange, upstream, limit, deadline))
    } else {
        Ok(relay_buffered(state, flow, caller, exchange, upstream, limit, deadline).await)
    }
}

fn relay_incremental(
    state: &Arc<GatewayState>,
    flow: RequestFlow,
    caller: Caller,
    exchange: Exchange,
    upstream: PriceStream,
    limit: i64,
    deadline: Instant,
) -> Response {
    let rx = relay::spawn_reader(upstream, limit, state.settings.relay_buffer, deadline);
    let (events, report) = relay::sse_events(rx);

    let state = state.clone();
    tokio::spawn(async move {
        let delivery = report.await.unwrap_or(Delivery {
            delivered: 0,
            outcome: RelayOutcome::Disconnected,
        });
        finish(state, flow, caller, exchange, "sse", delivery).await;
    });

    Sse::new(events).into_response()
}

async fn relay_buffered(
    state: &Arc<GatewayState>,
    flow: RequestFlow,
    caller: Caller,
    exchange: Exchange,
    upstream: PriceStream,
    limit: i64,
    deadline: Instant,
) -> Response {
    let (delivery, response) = match relay::collect(upstream, limit, deadline).await {
        Ok(records) => {
            let delivered = records.len() as i64;
            let candles: Vec<Candle> = records.into_iter().map(Candle::from).collect();
            (
                Delivery {
                    delivered,
                    outcome: RelayOutcome::Finished,
                },
                Json(json!({ "prices": candles })).into_response(),
            )
        }
        Err((received, e)) => {
            tracing::warn!(%exchange, received, "price stream failed before the response was sent: {}", e);
            let response = (
                AppError::from(e.clone()).status_code(),
                Json(json!({ "error": relay::public_message(&e) })),
            )
                .into_response();
            // nothing reached the caller
            (
                Delivery {
                    delivered: 0,
                    outcome: RelayOutcome::Failed(e),
                },
                response,
            )
        }
    };

    settle_in_background(state, flow, caller, exchange, "buffered", delivery);
    response
}

/// Settle on a detached task. The response goes out without waiting for it,
/// and a caller hanging up cannot cancel it.
fn settle_in_background(
    state: &Arc<GatewayState>,
    flow: RequestFlow,
    caller: Caller,
    exchange: Exchange,
    variant: &'static str,
    delivery: Delivery,
) {
    tokio::spawn(finish(state.clone(), flow, caller, exchange, variant, delivery));
}

/// Streaming → Settling → Completed/Failed. Settlement errors are logged
/// and counted; they never change what the caller already got.
async fn finish(
    state: Arc<GatewayState>,
    mut flow: RequestFlow,
    caller: Caller,
    exchange: Exchange,
    variant: &'static str,
    delivery: Delivery,
) {
    let Delivery { delivered, outcome } = delivery;
    state
        .metrics
        .record_delivery(exchange.as_str(), variant, delivered, flow.elapsed().as_secs_f64());

    if let Some(token) = caller.token() {
        flow.advance(Stage::Settling);
        if let Err(status) =
            pipeline::settle(state.access.as_ref(), token, delivered, state.settings.rpc_timeout).await
        {
            tracing::error!(
                request_id = %flow.request_id,
                token = %mask(token),
                delivered,
                "quota settlement failed: {}",
                status
            );
            state.metrics.record_settle_failure();
        }
    } else {
        tracing::info!(request_id = %flow.request_id, delivered, "unmetered request finished");
    }

    let label = outcome.label();
    state.metrics.record_outcome(exchange.as_str(), label);
    match outcome {
        RelayOutcome::Failed(e) => {
            flow.fail(e.into());
        }
        RelayOutcome::Finished | RelayOutcome::Disconnected => {
            flow.advance(Stage::Completed);
            tracing::info!(
                request_id = %flow.request_id,
                %exchange,
                variant,
                delivered,
                outcome = label,
                elapsed_ms = flow.elapsed().as_millis() as u64,
                "price request completed"
            );
        }
    }
}

fn authorization_token(headers: &HeaderMap) -> Result<String, AppError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    if token.is_empty() {
        return Err(AppError::InvalidArgument("missing authorization header".into()));
    }
    Ok(token.to_string())
}

/// `POST /auth/token`
pub async fn create_token(State(state): State<Arc<GatewayState>>) -> Result<Json<serde_json::Value>, AppError> {
    let created = pipeline::with_deadline(
        state.settings.rpc_timeout,
        state
            .access
            .create_token(vec!["read:prices".to_string()], state.settings.token_ttl_secs),
    )
    .await?;
    Ok(Json(json!({
        "token": created.token,
        "expires_at": created.expires_at,
    })))
}

/// `GET /auth/validate`
pub async fn validate_token(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = authorization_token(&headers)?;
    let resp = pipeline::with_deadline(state.settings.rpc_timeout, state.access.validate_token(&token, "gateway"))
        .await
        .map_err(|status| {
            tracing::warn!(token = %mask(&token), "token validation failed: {}", status);
            AppError::Unauthenticated("invalid token".into())
        })?;
    if !resp.is_valid {
        return Err(AppError::Unauthenticated("token is invalid or expired".into()));
    }
    Ok(Json(json!({
        "userId": resp.user_id,
        "permissions": resp.permissions,
    })))
}

/// `DELETE /auth/token`
pub async fn revoke_token(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = authorization_token(&headers)?;
    let resp = pipeline::with_deadline(state.settings.rpc_timeout, state.access.revoke_token(&token)).await?;
    if !resp.success {
        return Err(AppError::NotFound("token not found".into()));
    }
    Ok(Json(json!({ "message": "token revoked successfully" })))
}

/// `GET /auth/token`
pub async fn token_info(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Json<TokenInfoResponse>, AppError> {
    let token = authorization_token(&headers)?;
    let info = pipeline::with_deadline(state.settings.rpc_timeout, state.access.token_info(&token)).await?;
    Ok(Json(info))
}

fn service_status(result: Result<(), String>) -> (bool, serde_json::Value) {
    match result {
        Ok(()) => (true, json!({ "status": "up", "message": "OK" })),
        Err(message) => (false, json!({ "status": "down", "message": message })),
    }
}

/// `GET /health`: `up` when both dependencies answer, `down` when neither
/// does, `degraded` otherwise.
pub async fn health(State(state): State<Arc<GatewayState>>) -> (StatusCode, Json<serde_json::Value>) {
    let timeout = state.settings.rpc_timeout;
    let (access, prices) = tokio::join!(
        pipeline::with_deadline(timeout, state.access.health()),
        async {
            match tokio::time::timeout(timeout, state.sources.health()).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout),
            }
        }
    );

    let (access_up, access_json) = service_status(access.map_err(|s| s.message));
    let (prices_up, prices_json) = service_status(prices.map_err(|e| e.to_string()));

    let (code, status) = match (access_up, prices_up) {
        (true, true) => (StatusCode::OK, "up"),
        (false, false) => (StatusCode::SERVICE_UNAVAILABLE, "down"),
        _ => (StatusCode::OK, "degraded"),
    };

    (
        code,
        Json(json!({
            "status": status,
            "services": {
                "access": access_json,
                "prices": prices_json,
            }
        })),
    )
}

/// `GET /metrics`
pub async fn metrics(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}
