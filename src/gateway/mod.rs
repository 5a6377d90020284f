//! Gateway orchestrator: the public HTTP surface in front of the Access
//! Manager and the price sources.

pub mod handlers;
pub mod pipeline;
pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::access::AccessApi;
use crate::config::{AnonymousPolicy, Config};
use crate::metrics::GatewayMetrics;
use crate::prices::registry::PriceSourceRegistry;

/// Per-request knobs, fixed at startup.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub rpc_timeout: Duration,
    pub stream_timeout: Duration,
    pub quota_precheck: bool,
    pub anonymous: AnonymousPolicy,
    pub token_ttl_secs: i64,
    pub relay_buffer: usize,
}

impl From<&Config> for GatewaySettings {
    fn from(cfg: &Config) -> Self {
        Self {
            rpc_timeout: cfg.rpc_timeout,
            stream_timeout: cfg.stream_timeout,
            quota_precheck: cfg.quota_precheck,
            anonymous: cfg.anonymous,
            token_ttl_secs: cfg.token_ttl_secs,
            relay_buffer: cfg.relay_buffer,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Shared gateway state. Immutable after construction; the ledger behind
/// `access` is the only mutable state a request touches.
pub struct GatewayState {
    pub access: Arc<dyn AccessApi>,
    pub sources: PriceSourceRegistry,
    pub settings: GatewaySettings,
    pub metrics: GatewayMetrics,
}

impl GatewayState {
    pub fn new(access: Arc<dyn AccessApi>, sources: PriceSourceRegistry, settings: GatewaySettings) -> Self {
        Self {
            access,
            sources,
            settings,
            metrics: GatewayMetrics::new(),
        }
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/prices/:exchange/:ticker", get(handlers::get_prices))
        .route(
            "/auth/token",
            get(handlers::token_info)
                .post(handlers::create_token)
                .delete(handlers::revoke_token),
        )
        .route("/auth/validate", get(handlers::validate_token))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(handlers::request_id_middleware))
}
