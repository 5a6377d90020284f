//! End-to-end tests for the gateway router: authenticate → stream → settle.
//!
//! The Access Manager runs in-process over the memory ledger and the price
//! source is a scripted fake, so no external services are needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tower::ServiceExt;

use pricegate::access::types::*;
use pricegate::access::{AccessApi, AccessManager, Status};
use pricegate::config::AnonymousPolicy;
use pricegate::gateway::{self, GatewaySettings, GatewayState};
use pricegate::ledger::memory::MemoryLedger;
use pricegate::prices::registry::PriceSourceRegistry;
use pricegate::prices::{Exchange, PriceRecord, PriceSource, PriceStream, SourceError};

/// Scripted upstream: `records` candles, optionally failing after `fail_after`.
#[derive(Default)]
struct FakeSource {
    records: usize,
    fail_after: Option<usize>,
    open_error: Option<SourceError>,
    unhealthy: bool,
    opens: AtomicUsize,
    requested_limit: AtomicUsize,
}

impl FakeSource {
    fn with_records(records: usize) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }
}

fn candle(i: usize) -> PriceRecord {
    PriceRecord {
        date: format!("2024-02-{:02}", i % 28 + 1),
        open: 100.0 + i as f64,
        high: 101.0 + i as f64,
        low: 99.0 + i as f64,
        close: 100.5 + i as f64,
        volume: 1_000.0,
    }
}

#[async_trait]
impl PriceSource for FakeSource {
    async fn open(&self, _exchange: Exchange, _ticker: &str, limit: i64) -> Result<PriceStream, SourceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.requested_limit.store(limit as usize, Ordering::SeqCst);
        if let Some(e) = &self.open_error {
            return Err(e.clone());
        }
        let fail_after = self.fail_after;
        let items = (0..self.records).map(move |i| match fail_after {
            Some(n) if i == n => Err(SourceError::Interrupted("exchange connection reset".into())),
            _ => Ok(candle(i)),
        });
        Ok(stream::iter(items.collect::<Vec<_>>()).boxed())
    }

    async fn health(&self) -> Result<(), SourceError> {
        if self.unhealthy {
            Err(SourceError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

struct Harness {
    app: Router,
    access: AccessManager,
    source: Arc<FakeSource>,
    state: Arc<GatewayState>,
}

fn harness_with(source: FakeSource, ledger: MemoryLedger, settings: GatewaySettings) -> Harness {
    let access = AccessManager::new(Arc::new(ledger));
    let source = Arc::new(source);
    let mut sources = PriceSourceRegistry::new();
    sources.register(Exchange::Binance, source.clone());
    let state = Arc::new(GatewayState::new(Arc::new(access.clone()), sources, settings));
    Harness {
        app: gateway::router(state.clone()),
        access,
        source,
        state,
    }
}

fn harness(source: FakeSource) -> Harness {
    harness_with(source, MemoryLedger::new(), GatewaySettings::default())
}

async fn issue(access: &AccessManager) -> String {
    access
        .create_token(vec!["read:prices".into()], 3600)
        .await
        .unwrap()
        .token
}

fn get(uri: &str, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::empty()).unwrap()
}

fn get_sse(uri: &str, api_key: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", api_key)
        .header("accept", "text/event-stream")
        .body(Body::empty())
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 22).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

async fn quota_left(access: &AccessManager, token: &str) -> i64 {
    access.token_info(token).await.unwrap().quota_left
}

/// Settlement runs after the response is sent; poll until it lands.
async fn wait_for_quota(access: &AccessManager, token: &str, expected: i64) -> i64 {
    let mut last = quota_left(access, token).await;
    for _ in 0..100 {
        if last == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        last = quota_left(access, token).await;
    }
    last
}

async fn wait_for_removal(access: &AccessManager, token: &str) -> bool {
    for _ in 0..100 {
        if access.token_info(token).await.is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..1000 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

mod routing_tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_exchange_is_client_error() {
        let h = harness(FakeSource::with_records(5));
        let token = issue(&h.access).await;

        let resp = h.app.oneshot(get("/prices/kraken/BTCUSDT", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "unsupported exchange: kraken");
        assert_eq!(h.source.opens.load(Ordering::SeqCst), 0);
        assert_eq!(quota_left(&h.access, &token).await, 5000);
    }

    #[tokio::test]
    async fn test_known_but_unconfigured_exchange_is_client_error() {
        let h = harness(FakeSource::with_records(5));
        let token = issue(&h.access).await;
        let resp = h.app.oneshot(get("/prices/bybit/BTCUSDT", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_limit_is_rejected() {
        let h = harness(FakeSource::with_records(5));
        let token = issue(&h.access).await;
        let resp = h
            .app
            .oneshot(get("/prices/binance/BTCUSDT?limit=lots", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "invalid limit parameter");
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let h = harness(FakeSource::with_records(1));
        let req = Request::builder()
            .uri("/metrics")
            .header("x-request-id", "req-42")
            .body(Body::empty())
            .unwrap();
        let resp = h.app.oneshot(req).await.unwrap();
        assert_eq!(resp.headers()["x-request-id"], "req-42");
    }
}

mod auth_stage_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_api_key_is_denied_by_default() {
        let h = harness(FakeSource::with_records(5));
        let resp = h.app.oneshot(get("/prices/binance/BTCUSDT", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(resp).await["error"], "missing api key");
        assert_eq!(h.source.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_api_key_streams_unmetered_when_allowed() {
        let settings = GatewaySettings {
            anonymous: AnonymousPolicy::Unmetered,
            ..GatewaySettings::default()
        };
        let h = harness_with(FakeSource::with_records(5), MemoryLedger::new(), settings);
        let resp = h.app.oneshot(get("/prices/binance/BTCUSDT", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["prices"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_invalid_token_is_unauthorized() {
        let h = harness(FakeSource::with_records(5));
        let resp = h
            .app
            .oneshot(get("/prices/binance/BTCUSDT", Some("pk_not_a_real_token")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(resp).await["error"], "token is invalid or expired");
        assert_eq!(h.source.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_precheck_blocks_limit_above_quota() {
        let h = harness_with(
            FakeSource::with_records(200),
            MemoryLedger::with_allotment(50),
            GatewaySettings::default(),
        );
        let token = issue(&h.access).await;

        // default limit is 100
        let resp = h.app.oneshot(get("/prices/binance/BTCUSDT", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(h.source.opens.load(Ordering::SeqCst), 0);
        assert_eq!(quota_left(&h.access, &token).await, 50);
    }

    #[tokio::test]
    async fn test_precheck_can_be_disabled() {
        let settings = GatewaySettings {
            quota_precheck: false,
            ..GatewaySettings::default()
        };
        let h = harness_with(FakeSource::with_records(80), MemoryLedger::with_allotment(50), settings);
        let token = issue(&h.access).await;

        let resp = h.app.oneshot(get("/prices/binance/BTCUSDT", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["prices"].as_array().unwrap().len(), 80);
        // overdraw floors at zero and the token is gone
        assert!(wait_for_removal(&h.access, &token).await);
    }
}

mod buffered_relay_tests {
    use super::*;

    #[tokio::test]
    async fn test_buffered_success_settles_delivered_count() {
        let h = harness(FakeSource::with_records(10));
        let token = issue(&h.access).await;

        let resp = h
            .app
            .oneshot(get("/prices/binance/BTCUSDT?limit=10", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let prices = body["prices"].as_array().unwrap();
        assert_eq!(prices.len(), 10);
        assert_eq!(prices[0]["open"], 100.0);
        assert!(prices[0].get("date").is_none());

        assert_eq!(wait_for_quota(&h.access, &token, 4990).await, 4990);
    }

    #[tokio::test]
    async fn test_default_limit_caps_buffered_body() {
        let h = harness(FakeSource::with_records(150));
        let token = issue(&h.access).await;

        let resp = h
            .app
            .oneshot(get("/prices/binance/BTCUSDT?limit=0", Some(&token)))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["prices"].as_array().unwrap().len(), 100);
        assert_eq!(h.source.requested_limit.load(Ordering::SeqCst), 100);
        assert_eq!(wait_for_quota(&h.access, &token, 4900).await, 4900);
    }

    #[tokio::test]
    async fn test_buffered_mid_stream_error_is_500_and_charges_nothing() {
        let h = harness(FakeSource {
            records: 10,
            fail_after: Some(4),
            ..Default::default()
        });
        let token = issue(&h.access).await;

        let resp = h
            .app
            .oneshot(get("/prices/binance/BTCUSDT?limit=10", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(resp).await["error"], "error receiving prices");
        assert_eq!(quota_left(&h.access, &token).await, 5000);
    }

    #[tokio::test]
    async fn test_unreachable_source_is_503() {
        let h = harness(FakeSource {
            open_error: Some(SourceError::Unreachable("connection refused".into())),
            ..Default::default()
        });
        let token = issue(&h.access).await;

        let resp = h.app.oneshot(get("/prices/binance/BTCUSDT", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(quota_left(&h.access, &token).await, 5000);
    }

    #[tokio::test]
    async fn test_rejected_ticker_is_400() {
        let h = harness(FakeSource {
            open_error: Some(SourceError::Rejected {
                status: 404,
                message: "unknown ticker NOPE".into(),
            }),
            ..Default::default()
        });
        let token = issue(&h.access).await;

        let resp = h.app.oneshot(get("/prices/binance/NOPE", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "unknown ticker NOPE");
    }

    #[tokio::test]
    async fn test_concurrent_requests_on_one_token_do_not_lose_settlements() {
        let h = harness(FakeSource::with_records(25));
        let token = issue(&h.access).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let app = h.app.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                app.oneshot(get("/prices/binance/BTCUSDT?limit=25", Some(&token)))
                    .await
                    .unwrap()
                    .status()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), StatusCode::OK);
        }
        assert_eq!(wait_for_quota(&h.access, &token, 5000 - 8 * 25).await, 5000 - 8 * 25);
    }
}

mod incremental_relay_tests {
    use super::*;

    async fn read_events(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 22).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_sse_full_stream_settles_all_records() {
        let h = harness(FakeSource::with_records(10));
        let token = issue(&h.access).await;

        let resp = h
            .app
            .oneshot(get_sse("/prices/binance/ETHUSDT?limit=10", &token))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");

        let text = read_events(resp).await;
        assert_eq!(text.matches("event: price").count(), 10);
        assert_eq!(wait_for_quota(&h.access, &token, 4990).await, 4990);
    }

    #[tokio::test]
    async fn test_disconnect_after_three_of_ten_settles_three() {
        let h = harness(FakeSource::with_records(10));
        let token = issue(&h.access).await;

        let resp = h
            .app
            .oneshot(get_sse("/prices/binance/ETHUSDT?limit=10", &token))
            .await
            .unwrap();
        let mut body = resp.into_body().into_data_stream();

        let mut seen = String::new();
        while seen.matches("event: price").count() < 3 {
            let chunk = body.next().await.expect("stream ended early").unwrap();
            seen.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        assert_eq!(seen.matches("event: price").count(), 3);
        // client hangs up
        drop(body);

        assert_eq!(wait_for_quota(&h.access, &token, 4997).await, 4997);
    }

    #[tokio::test]
    async fn test_sse_mid_stream_error_sends_error_event_and_settles_partial() {
        let h = harness(FakeSource {
            records: 10,
            fail_after: Some(4),
            ..Default::default()
        });
        let token = issue(&h.access).await;

        let resp = h
            .app
            .oneshot(get_sse("/prices/binance/ETHUSDT?limit=10", &token))
            .await
            .unwrap();
        let text = read_events(resp).await;
        assert_eq!(text.matches("event: price").count(), 4);
        assert!(text.contains("event: error"));
        assert!(text.contains("error receiving prices"));

        assert_eq!(wait_for_quota(&h.access, &token, 4996).await, 4996);
    }

    #[tokio::test]
    async fn test_sse_stops_at_limit_when_upstream_over_delivers() {
        let h = harness(FakeSource::with_records(150));
        let token = issue(&h.access).await;

        let resp = h
            .app
            .oneshot(get_sse("/prices/binance/ETHUSDT?limit=10", &token))
            .await
            .unwrap();
        let text = read_events(resp).await;
        assert_eq!(text.matches("event: price").count(), 10);
        assert_eq!(wait_for_quota(&h.access, &token, 4990).await, 4990);
    }

    #[tokio::test]
    async fn test_sse_and_buffered_charge_the_same() {
        let h = harness(FakeSource::with_records(150));
        let token = issue(&h.access).await;

        let resp = h
            .app
            .clone()
            .oneshot(get("/prices/binance/ETHUSDT?limit=20", Some(&token)))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["prices"].as_array().unwrap().len(), 20);
        assert_eq!(wait_for_quota(&h.access, &token, 4980).await, 4980);

        let resp = h
            .app
            .oneshot(get_sse("/prices/binance/ETHUSDT?limit=20", &token))
            .await
            .unwrap();
        assert_eq!(read_events(resp).await.matches("event: price").count(), 20);
        assert_eq!(wait_for_quota(&h.access, &token, 4960).await, 4960);
    }
}

mod settlement_tests {
    use super::*;

    /// Delegates to a real manager but refuses every settlement.
    struct SettleFails(AccessManager);

    /// Delegates to a real manager; settlements never return.
    struct SettleHangs(AccessManager);

    macro_rules! delegate_except_settle {
        ($ty:ident) => {
            #[async_trait]
            impl AccessApi for $ty {
                async fn validate_token(&self, token: &str, service: &str) -> Result<ValidateResponse, Status> {
                    self.0.validate_token(token, service).await
                }
                async fn create_token(
                    &self,
                    permissions: Vec<String>,
                    expires_in: i64,
                ) -> Result<CreateTokenResponse, Status> {
                    self.0.create_token(permissions, expires_in).await
                }
                async fn revoke_token(&self, token: &str) -> Result<RevokeTokenResponse, Status> {
                    self.0.revoke_token(token).await
                }
                async fn update_quota(&self, token: &str, amount: i64) -> Result<UpdateQuotaResponse, Status> {
                    self.settle(token, amount).await
                }
                async fn token_info(&self, token: &str) -> Result<TokenInfoResponse, Status> {
                    self.0.token_info(token).await
                }
                async fn health(&self) -> Result<(), Status> {
                    self.0.health().await
                }
            }
        };
    }

    impl SettleFails {
        async fn settle(&self, _: &str, _: i64) -> Result<UpdateQuotaResponse, Status> {
            Err(Status::unavailable("token store not available"))
        }
    }

    impl SettleHangs {
        async fn settle(&self, _: &str, _: i64) -> Result<UpdateQuotaResponse, Status> {
            futures::future::pending().await
        }
    }

    delegate_except_settle!(SettleFails);
    delegate_except_settle!(SettleHangs);

    fn app_with(access: Arc<dyn AccessApi>) -> (Router, Arc<GatewayState>) {
        let mut sources = PriceSourceRegistry::new();
        sources.register(Exchange::Binance, Arc::new(FakeSource::with_records(5)));
        let state = Arc::new(GatewayState::new(access, sources, GatewaySettings::default()));
        (gateway::router(state.clone()), state)
    }

    #[tokio::test]
    async fn test_settlement_failure_does_not_fail_response() {
        let manager = AccessManager::new(Arc::new(MemoryLedger::new()));
        let token = issue(&manager).await;
        let (app, state) = app_with(Arc::new(SettleFails(manager.clone())));

        let resp = app.oneshot(get("/prices/binance/BTCUSDT?limit=5", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["prices"].as_array().unwrap().len(), 5);
        assert!(eventually(|| state.metrics.settle_failures() == 1).await);
        assert_eq!(quota_left(&manager, &token).await, 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_settlement_is_bounded_by_deadline() {
        let manager = AccessManager::new(Arc::new(MemoryLedger::new()));
        let token = issue(&manager).await;
        let (app, state) = app_with(Arc::new(SettleHangs(manager.clone())));

        let resp = app.oneshot(get("/prices/binance/BTCUSDT?limit=5", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["prices"].as_array().unwrap().len(), 5);

        // the settle deadline (5s by default) elapses on the paused clock
        assert_eq!(state.metrics.settle_failures(), 0);
        assert!(eventually(|| state.metrics.settle_failures() == 1).await);
        assert_eq!(quota_left(&manager, &token).await, 5000);
    }

    #[tokio::test]
    async fn test_metrics_report_outcomes() {
        let h = harness(FakeSource::with_records(3));
        let token = issue(&h.access).await;
        let resp = h
            .app
            .clone()
            .oneshot(get("/prices/binance/BTCUSDT?limit=3", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let completed = r#"pricegate_requests_total{exchange="binance",outcome="completed"} 1"#;
        let delivered = r#"pricegate_records_delivered_total{exchange="binance",variant="buffered"} 3"#;
        assert!(eventually(|| h.state.metrics.encode().contains(completed)).await);
        assert!(h.state.metrics.encode().contains(delivered));
    }
}

mod auth_route_tests {
    use super::*;

    fn with_auth(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_create_validate_revoke_round() {
        let h = harness(FakeSource::default());

        let resp = h.app.clone().oneshot(with_auth("POST", "/auth/token", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let token = json_body(resp).await["token"].as_str().unwrap().to_string();

        let resp = h
            .app
            .clone()
            .oneshot(with_auth("GET", "/auth/validate", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert!(body["userId"].as_str().unwrap().starts_with("user-"));
        assert_eq!(body["permissions"], serde_json::json!(["read:prices"]));

        let resp = h
            .app
            .clone()
            .oneshot(with_auth("GET", "/auth/token", Some(&format!("Bearer {}", token))))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["quota_left"], 5000);

        let resp = h
            .app
            .clone()
            .oneshot(with_auth("DELETE", "/auth/token", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = h
            .app
            .clone()
            .oneshot(with_auth("DELETE", "/auth/token", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = h
            .app
            .oneshot(with_auth("GET", "/auth/validate", Some(&token)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_missing_authorization_header_is_400() {
        let h = harness(FakeSource::default());
        for (method, uri) in [("GET", "/auth/validate"), ("DELETE", "/auth/token"), ("GET", "/auth/token")] {
            let resp = h.app.clone().oneshot(with_auth(method, uri, None)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{} {}", method, uri);
            assert_eq!(json_body(resp).await["error"], "missing authorization header");
        }
    }
}

mod health_tests {
    use super::*;

    async fn health_of(access: Arc<dyn AccessApi>, source: FakeSource) -> (StatusCode, Value) {
        let mut sources = PriceSourceRegistry::new();
        sources.register(Exchange::Binance, Arc::new(source));
        let state = Arc::new(GatewayState::new(access, sources, GatewaySettings::default()));
        let resp = gateway::router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        (status, json_body(resp).await)
    }

    #[tokio::test]
    async fn test_all_up() {
        let access = Arc::new(AccessManager::new(Arc::new(MemoryLedger::new())));
        let (status, body) = health_of(access, FakeSource::default()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "up");
        assert_eq!(body["services"]["access"]["status"], "up");
        assert_eq!(body["services"]["prices"]["message"], "OK");
    }

    #[tokio::test]
    async fn test_detached_access_is_degraded() {
        let (status, body) = health_of(Arc::new(AccessManager::detached()), FakeSource::default()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["services"]["access"]["status"], "down");
        assert_eq!(body["services"]["prices"]["status"], "up");
    }

    #[tokio::test]
    async fn test_everything_down() {
        let source = FakeSource {
            unhealthy: true,
            ..Default::default()
        };
        let (status, body) = health_of(Arc::new(AccessManager::detached()), source).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "down");
    }
}
