// =============================================================================
// Kline Relay — Main Entry Point
// =============================================================================
//
// Streams trades from one futures exchange at a time, rolls them into
// 1-minute candles and serves 1m/5m/15m/1h/4h/1d series over HTTP and a
// WebSocket push feed. The market to stream is restored from
// `runtime_config.json` and can be switched at runtime via the API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod api;
mod app_state;
mod exchanges;
mod market_data;
mod runtime_config;
mod session;
mod ticker;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::exchanges::LiveMarkets;
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Kline Relay — starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env();

    info!(
        exchange = %config.exchange,
        symbol = %config.symbol,
        tick_capacity = config.tick_capacity,
        candle_capacity = config.candle_capacity,
        "Configured market"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let markets = LiveMarkets::from_config(&config)?;
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, markets));

    // ── 3. Live roll-up (process lifetime) ───────────────────────────────
    let shutdown = CancellationToken::new();
    let rollup = state.session.spawn_rollup(shutdown.child_token());

    // ── 4. Initial market ────────────────────────────────────────────────
    // A failed backfill leaves the relay idle with empty buffers; a reset via
    // the API can recover it.
    match state.reset_from_config().await {
        Ok(market) => info!(exchange = %market.exchange, symbol = %market.symbol, "Initial session ready"),
        Err(e) => warn!(error = ?e, "Initial session reset failed — relay is idle"),
    }

    // ── 5. HTTP / WebSocket API ──────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server error");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    shutdown.cancel();
    state.session.shutdown().await;
    let _ = rollup.await;
    let _ = server.await;

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Kline Relay shut down complete.");
    Ok(())
}
