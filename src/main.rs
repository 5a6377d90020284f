use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderName, Method};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pricegate::access::client::AccessClient;
use pricegate::access::{AccessApi, AccessManager};
use pricegate::cli;
use pricegate::config::{self, Config};
use pricegate::gateway::{self, GatewaySettings, GatewayState};
use pricegate::jobs;
use pricegate::ledger::memory::MemoryLedger;
use pricegate::ledger::postgres::PgLedger;
use pricegate::ledger::TokenLedger;
use pricegate::prices::registry::PriceSourceRegistry;
use pricegate::prices::remote::RemotePriceSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port, embedded_access }) => {
            let port = port.unwrap_or(cfg.port);
            run_gateway(cfg, port, embedded_access).await
        }
        Some(cli::Commands::Access { port }) => {
            let port = port.unwrap_or(cfg.access_port);
            run_access(cfg, port).await
        }
        Some(cli::Commands::Token { command }) => handle_token_command(command, &cfg).await,
        None => {
            let port = cfg.port;
            run_gateway(cfg, port, false).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when a collector is configured
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "pricegate"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pricegate=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();
    Ok(())
}

/// Postgres when `DATABASE_URL` is set, otherwise an in-process map.
async fn open_ledger(cfg: &Config) -> anyhow::Result<Arc<dyn TokenLedger>> {
    match &cfg.database_url {
        Some(url) => {
            tracing::info!("Connecting to token database...");
            let ledger = PgLedger::connect(url)
                .await
                .context("failed to connect to DATABASE_URL")?
                .with_allotment(cfg.default_quota);
            tracing::info!("Running migrations...");
            ledger.migrate().await?;
            Ok(Arc::new(ledger))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set; tokens are kept in memory and lost on restart");
            Ok(Arc::new(MemoryLedger::with_allotment(cfg.default_quota)))
        }
    }
}

fn start_sweep(cfg: &Config, ledger: &Arc<dyn TokenLedger>) {
    if cfg.sweep_interval_secs > 0 {
        jobs::sweep::spawn(ledger.clone(), Duration::from_secs(cfg.sweep_interval_secs));
        tracing::info!(every_secs = cfg.sweep_interval_secs, "Expired-token sweep started");
    }
}

async fn run_gateway(cfg: Config, port: u16, embedded_access: bool) -> anyhow::Result<()> {
    let access: Arc<dyn AccessApi> = if embedded_access {
        let ledger = open_ledger(&cfg).await?;
        start_sweep(&cfg, &ledger);
        tracing::info!("Access Manager running in-process");
        Arc::new(AccessManager::new(ledger))
    } else {
        tracing::info!(url = %cfg.access_url, "Using remote Access Manager");
        Arc::new(AccessClient::new(cfg.access_url.clone(), cfg.rpc_timeout)?)
    };

    let source = RemotePriceSource::new(cfg.prices_url.clone(), cfg.stream_timeout, cfg.price_retries)?;
    let sources = PriceSourceRegistry::from_names(&cfg.exchanges, Arc::new(source))
        .context("invalid PRICEGATE_EXCHANGES")?;
    tracing::info!(exchanges = ?sources.exchanges(), url = %cfg.prices_url, "Price sources registered");

    let state = Arc::new(GatewayState::new(access, sources, GatewaySettings::from(&cfg)));

    let app = gateway::router(state).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("authorization"),
                HeaderName::from_static("x-api-key"),
                HeaderName::from_static("x-request-id"),
            ]),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("pricegate gateway listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn run_access(cfg: Config, port: u16) -> anyhow::Result<()> {
    let ledger = open_ledger(&cfg).await?;
    start_sweep(&cfg, &ledger);

    let app = pricegate::access::rpc::router(AccessManager::new(ledger));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("pricegate access manager listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

/// Token commands go straight to the ledger when `DATABASE_URL` is set and
/// through the Access Manager RPC otherwise.
async fn handle_token_command(cmd: cli::TokenCommands, cfg: &Config) -> anyhow::Result<()> {
    let access: Arc<dyn AccessApi> = match &cfg.database_url {
        Some(_) => Arc::new(AccessManager::new(open_ledger(cfg).await?)),
        None => Arc::new(AccessClient::new(cfg.access_url.clone(), cfg.rpc_timeout)?),
    };

    match cmd {
        cli::TokenCommands::Create { permissions, ttl } => {
            let ttl = ttl.unwrap_or(cfg.token_ttl_secs);
            let created = access.create_token(permissions, ttl).await?;
            let expires = chrono::DateTime::from_timestamp(created.expires_at, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| created.expires_at.to_string());
            println!(
                "Token created:\n  Token:   {}\n  Expires: {}\n  Use:     x-api-key: {}",
                created.token, expires, created.token
            );
        }
        cli::TokenCommands::Info { token } => {
            let info = access.token_info(&token).await?;
            println!(
                "Token {}\n  Quota left:  {}\n  Expires at:  {}\n  Permissions: {}",
                pricegate::ledger::mask(&info.token),
                info.quota_left,
                info.expires_at,
                info.permissions.join(", ")
            );
        }
        cli::TokenCommands::Revoke { token } => {
            let resp = access.revoke_token(&token).await?;
            if resp.success {
                println!("Token revoked.");
            } else {
                println!("Token not found; nothing to revoke.");
            }
        }
    }
    Ok(())
}
