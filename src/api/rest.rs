// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The candle, tick, ticker and session
// views are public and read-only. Switching markets requires a valid Bearer
// token checked via the `AdminGuard` extractor.
//
// CORS is configured permissively; the relay is meant to sit behind a
// dashboard on another origin.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AdminGuard;
use crate::app_state::AppState;
use crate::exchanges::MarketSource;
use crate::market_data::Candle;
use crate::session::{ActiveMarket, SessionError};
use crate::types::Timeframe;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router<S: MarketSource>(state: Arc<AppState<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health::<S>))
        .route("/api/v1/candles/:timeframe", get(candles::<S>))
        .route("/api/v1/tick", get(last_tick::<S>))
        .route("/api/v1/ticker", get(ticker::<S>))
        .route("/api/v1/session", get(session::<S>))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/session/reset", post(session_reset::<S>))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler::<S>))
        // ── Middleware & State ───────────────────────────────────────
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

// =============================================================================
// Read-only views (public)
// =============================================================================

async fn health<S: MarketSource>(State(state): State<Arc<AppState<S>>>) -> impl IntoResponse {
    Json(state.build_health())
}

#[derive(Serialize)]
struct CandlesResponse {
    timeframe: Timeframe,
    interval_secs: i64,
    candles: Vec<Candle>,
}

async fn candles<S: MarketSource>(
    State(state): State<Arc<AppState<S>>>,
    Path(timeframe): Path<String>,
) -> Response {
    match timeframe.parse::<Timeframe>() {
        Ok(tf) => Json(CandlesResponse {
            timeframe: tf,
            interval_secs: tf.seconds(),
            candles: state.session.get_candles(tf),
        })
        .into_response(),
        Err(e) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn last_tick<S: MarketSource>(State(state): State<Arc<AppState<S>>>) -> impl IntoResponse {
    Json(state.session.get_last_tick())
}

/// `null` until the relay has seen a tick or a 1-minute bar.
async fn ticker<S: MarketSource>(State(state): State<Arc<AppState<S>>>) -> impl IntoResponse {
    Json(state.build_ticker())
}

async fn session<S: MarketSource>(State(state): State<Arc<AppState<S>>>) -> impl IntoResponse {
    Json(state.session_info())
}

// =============================================================================
// Session reset (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct ResetRequest {
    exchange: String,
    symbol: String,
}

#[derive(Serialize)]
struct ResetResponse {
    status: &'static str,
    active: ActiveMarket,
}

async fn session_reset<S: MarketSource>(
    _admin: AdminGuard,
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<ResetRequest>,
) -> Response {
    info!(exchange = %req.exchange, symbol = %req.symbol, "session reset via API");

    match state.reset(&req.exchange, &req.symbol).await {
        Ok(active) => Json(ResetResponse {
            status: "ok",
            active,
        })
        .into_response(),
        Err(e @ (SessionError::UnsupportedExchange(_) | SessionError::EmptySymbol)) => {
            warn!(error = %e, "session reset rejected");
            error_body(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e @ SessionError::History { .. }) => {
            warn!(error = ?e, "session reset failed");
            let message = match std::error::Error::source(&e) {
                Some(source) => format!("{e}: {source}"),
                None => e.to_string(),
            };
            error_body(StatusCode::BAD_GATEWAY, message)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::TEST_TOKEN;
    use crate::exchanges::stub::StubSource;
    use crate::runtime_config::RuntimeConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(bars: i64) -> (Arc<AppState<StubSource>>, Router) {
        std::env::set_var("KLINE_ADMIN_TOKEN", TEST_TOKEN);
        let state = Arc::new(AppState::new(
            RuntimeConfig::default(),
            StubSource::with_bars(bars),
        ));
        (state.clone(), router(state))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn reset_request(token: Option<&str>, exchange: &str) -> Request<Body> {
        let mut builder = Request::post("/api/v1/session/reset")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let body = serde_json::json!({ "exchange": exchange, "symbol": "BTCUSDT" });
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn health_reports_idle_session() {
        let (_, router) = app(0);
        let resp = router
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["session_state"], "idle");
    }

    #[tokio::test]
    async fn unknown_timeframe_is_bad_request() {
        let (_, router) = app(0);
        let resp = router
            .oneshot(Request::get("/api/v1/candles/7m").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn candles_after_reset() {
        let (state, router) = app(20);
        state.reset_from_config().await.unwrap();

        let resp = router
            .oneshot(Request::get("/api/v1/candles/5m").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["timeframe"], "5m");
        assert_eq!(json["interval_secs"], 300);
        assert_eq!(json["candles"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn tick_is_null_before_any_data() {
        let (_, router) = app(0);
        let resp = router
            .oneshot(Request::get("/api/v1/tick").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(body_json(resp).await.is_null());
    }

    #[tokio::test]
    async fn ticker_reports_change_against_daily_close() {
        let (state, router) = app(5);
        let resp = router
            .clone()
            .oneshot(Request::get("/api/v1/ticker").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(body_json(resp).await.is_null());

        state.reset_from_config().await.unwrap();
        let resp = router
            .oneshot(Request::get("/api/v1/ticker").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["price"], 104.5);
        assert_eq!(json["change_pct"], 0.0);
        assert!(json["reference_epoch"].is_null());
    }

    #[tokio::test]
    async fn reset_requires_token() {
        let (_, router) = app(5);
        let resp = router.oneshot(reset_request(None, "Bybit")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn reset_maps_errors_to_status_codes() {
        let (state, router) = app(5);

        let ok = router
            .clone()
            .oneshot(reset_request(Some(TEST_TOKEN), "Bybit"))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(body_json(ok).await["active"]["exchange"], "Bybit");

        let unsupported = router
            .clone()
            .oneshot(reset_request(Some(TEST_TOKEN), "Deribit"))
            .await
            .unwrap();
        assert_eq!(unsupported.status(), StatusCode::BAD_REQUEST);

        state.session.source().set_failing(true);
        let failed = router
            .oneshot(reset_request(Some(TEST_TOKEN), "Binance"))
            .await
            .unwrap();
        assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(failed).await;
        assert!(json["error"].as_str().unwrap().contains("HTTP 503"));
    }
}
