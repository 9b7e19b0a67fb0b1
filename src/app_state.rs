// =============================================================================
// Central Application State — kline relay
// =============================================================================
//
// Ties the session controller to the persisted runtime configuration and
// builds the serialisable views served by the REST API and WebSocket feed.
//
// Thread safety:
//   - The session owns its stores; every read returns an owned copy.
//   - parking_lot::RwLock around the runtime config.
//   - Atomic counter for the WebSocket message sequence.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::exchanges::{LiveMarkets, MarketSource};
use crate::market_data::{Candle, CandleStore, TickBuffer};
use crate::runtime_config::RuntimeConfig;
use crate::session::{ActiveMarket, Session, SessionError, SessionState};
use crate::ticker::{build_ticker, Ticker};
use crate::types::{Tick, Timeframe};

/// Number of 1-minute candles included in each push snapshot.
pub const WS_CANDLE_TAIL: usize = 60;

// =============================================================================
// AppState
// =============================================================================

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState<S: MarketSource = LiveMarkets> {
    pub session: Session<S>,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    /// Instant when the relay was started. Used for uptime reporting.
    pub start_time: std::time::Instant,
}

impl<S: MarketSource> AppState<S> {
    /// Build the stores sized from `config` and wrap them in a session that
    /// pulls market data from `source`.
    pub fn new(config: RuntimeConfig, source: S) -> Self {
        let ticks = Arc::new(TickBuffer::new(config.tick_capacity));
        let candles = Arc::new(CandleStore::new(config.candle_capacity));
        let session = Session::new(source, ticks, candles, config.stream_on_history_failure);

        Self {
            session,
            runtime_config: Arc::new(RwLock::new(config)),
            ws_sequence_number: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    /// Reset the session and remember whatever market ends up streaming, so
    /// the next start resumes it. That includes a failed backfill after which
    /// the adapter was launched anyway.
    pub async fn reset(&self, exchange: &str, symbol: &str) -> Result<ActiveMarket, SessionError> {
        let result = self.session.reset(exchange, symbol).await;
        let streaming = match &result {
            Ok(market) => Some(market.clone()),
            Err(_) => self.session.active(),
        };
        if let Some(market) = streaming {
            let mut config = self.runtime_config.write();
            config.exchange = market.exchange.name().to_string();
            config.symbol = market.symbol;
        }
        result
    }

    /// Reset to the exchange/symbol stored in the runtime config.
    pub async fn reset_from_config(&self) -> Result<ActiveMarket, SessionError> {
        let (exchange, symbol) = {
            let config = self.runtime_config.read();
            (config.exchange.clone(), config.symbol.clone())
        };
        self.reset(&exchange, &symbol).await
    }

    // ── Change tracking ─────────────────────────────────────────────────

    /// Changes whenever a candle series is touched or a new tick arrives.
    pub fn change_marker(&self) -> (u64, Option<Tick>) {
        (self.session.candles().version(), self.session.get_last_tick())
    }

    // ── Snapshot builders ───────────────────────────────────────────────

    pub fn session_info(&self) -> SessionInfo {
        SessionInfo {
            state: self.session.state(),
            active: self.session.active(),
        }
    }

    pub fn build_health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            session_state: self.session.state(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: Utc::now().timestamp_millis(),
        }
    }

    /// Payload pushed over the WebSocket feed.
    pub fn build_snapshot(&self) -> MarketSnapshot {
        let candles = self.session.candles();
        MarketSnapshot {
            version: candles.version(),
            server_time: Utc::now().timestamp_millis(),
            session: self.session_info(),
            last_tick: self.session.get_last_tick(),
            ticker: self.build_ticker(),
            candles_1m_tail: candles.tail(Timeframe::M1, WS_CANDLE_TAIL),
        }
    }

    /// Live price against the daily reference close.
    pub fn build_ticker(&self) -> Option<Ticker> {
        let offset = self.runtime_config.read().daily_close_offset();
        build_ticker(self.session.candles(), self.session.get_last_tick(), offset)
    }

    pub fn next_ws_sequence(&self) -> u64 {
        self.ws_sequence_number.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// =============================================================================
// Serialisable views
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub state: SessionState,
    pub active: Option<ActiveMarket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub session_state: SessionState,
    pub uptime_secs: u64,
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub version: u64,
    pub server_time: i64,
    pub session: SessionInfo,
    pub last_tick: Option<Tick>,
    pub ticker: Option<Ticker>,
    pub candles_1m_tail: Vec<Candle>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::stub::StubSource;
    use crate::types::Exchange;

    fn state(bars: i64) -> AppState<StubSource> {
        AppState::new(RuntimeConfig::default(), StubSource::with_bars(bars))
    }

    #[tokio::test]
    async fn successful_reset_updates_config() {
        let app = state(3);
        let market = app.reset("okx", "ETH-USDT-SWAP").await.unwrap();
        assert_eq!(market.exchange, Exchange::Okx);

        let config = app.runtime_config.read();
        assert_eq!(config.exchange, "OKX");
        assert_eq!(config.symbol, "ETH-USDT-SWAP");
    }

    #[tokio::test]
    async fn failed_reset_keeps_previous_config() {
        let app = state(3);
        app.session.source().set_failing(true);
        assert!(app.reset("Bybit", "ETHUSDT").await.is_err());
        assert_eq!(app.runtime_config.read().exchange, "Binance");
        assert_eq!(app.session_info().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn streaming_after_failed_backfill_updates_config() {
        let config = RuntimeConfig {
            stream_on_history_failure: true,
            ..RuntimeConfig::default()
        };
        let app = AppState::new(config, StubSource::with_bars(3));
        app.session.source().set_failing(true);

        assert!(app.reset("Bitget", "ETHUSDT").await.is_err());
        assert_eq!(app.session.active().unwrap().exchange, Exchange::Bitget);
        let config = app.runtime_config.read();
        assert_eq!(config.exchange, "Bitget");
        assert_eq!(config.symbol, "ETHUSDT");
    }

    #[tokio::test]
    async fn ticker_tracks_seed_tick() {
        let app = state(5);
        assert!(app.build_ticker().is_none());
        app.reset_from_config().await.unwrap();

        // Stub bars start at a UTC midnight, which is not a UTC+3 midnight.
        let ticker = app.build_ticker().unwrap();
        assert_eq!(ticker.price, 104.5);
        assert_eq!(ticker.reference_epoch, None);

        app.runtime_config.write().daily_close_utc_offset_hours = 0;
        let ticker = app.build_ticker().unwrap();
        assert_eq!(ticker.reference_epoch, Some(crate::exchanges::stub::T0));
        assert_eq!(ticker.reference_close, 100.5);
        assert!((ticker.change_pct - 4.0 / 100.5 * 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn snapshot_carries_tail_and_seed_tick() {
        let app = state(100);
        app.reset_from_config().await.unwrap();

        let snap = app.build_snapshot();
        assert_eq!(snap.candles_1m_tail.len(), WS_CANDLE_TAIL);
        assert_eq!(snap.session.state, SessionState::Streaming);
        let tick = snap.last_tick.unwrap();
        assert_eq!(tick.epoch_seconds, snap.candles_1m_tail.last().unwrap().open_epoch);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["session"]["active"]["exchange"], "Binance");
        assert_eq!(json["session"]["state"], "streaming");
    }

    #[tokio::test]
    async fn change_marker_moves_on_reset() {
        let app = state(5);
        let before = app.change_marker();
        app.reset_from_config().await.unwrap();
        assert_ne!(before, app.change_marker());
    }

    #[test]
    fn ws_sequence_increments() {
        let app = state(0);
        assert_eq!(app.next_ws_sequence(), 1);
        assert_eq!(app.next_ws_sequence(), 2);
    }
}
