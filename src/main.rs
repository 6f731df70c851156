//! geotrigger-rs HTTP entrypoint.
//!
//! Launches the Axum server that exposes the contract registry, geofenced
//! execution rules, the location ingest pipeline, the pending / completed /
//! rejected projections, and the execution endpoints.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `DATABASE_URL` for Postgres (with PostGIS)
//! - `SOROBAN_RPC_URL_TESTNET` / `SOROBAN_RPC_URL_MAINNET` for chain access
//! - `OTEL_*` variables enable tracing export

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use geotrigger_rs::chain::ChainRegistry;
use geotrigger_rs::config::Config;
use geotrigger_rs::executor::Executor;
use geotrigger_rs::shutdown::Shutdown;
use geotrigger_rs::state::AppState;
use geotrigger_rs::telemetry::Telemetry;
use geotrigger_rs::{db, handlers};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _telemetry = Telemetry::init();
    let config = Config::load()?;

    let pool = db::connect(&config).await?;
    let chains = ChainRegistry::from_config(&config);
    let executor = Executor::new(
        pool.clone(),
        chains.clone(),
        config.tx_poll_attempts,
        Duration::from_secs(config.tx_poll_interval_secs),
    );
    let state = AppState::new(pool, chains, executor, config.clone());

    let http_endpoints = Router::new()
        .merge(handlers::routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let shutdown = Shutdown::install()?;
    let cancellation_token = shutdown.token();
    let graceful = async move { cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(graceful)
        .await?;

    Ok(())
}
