// =============================================================================
// Session Controller — switching the relay between exchange/symbol pairs
// =============================================================================
//
// Exactly one market is streamed at a time. A reset tears down the running
// adapter, wipes both stores, backfills a day of 1-minute history, rebuilds
// the derived timeframes and launches the new adapter:
//
//   Idle ──reset──▶ Resetting ──ok──▶ Streaming ──reset──▶ Resetting ...
//                       │
//                       └──err──▶ Idle
//
// Resets are serialized by an async mutex; the stores are only touched through
// their own short synchronous critical sections.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::exchanges::{FetchError, MarketSource};
use crate::market_data::{Candle, CandleStore, TickBuffer};
use crate::types::{Exchange, Tick, Timeframe, UnknownExchange};

/// How long a reset waits for the previous adapter task to wind down.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Resetting,
    Streaming,
}

/// The exchange/symbol pair currently being streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveMarket {
    pub exchange: Exchange,
    pub symbol: String,
}

struct ActiveStream {
    market: ActiveMarket,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    UnsupportedExchange(#[from] UnknownExchange),

    #[error("symbol must not be empty")]
    EmptySymbol,

    #[error("history backfill failed for {exchange} {symbol}")]
    History {
        exchange: Exchange,
        symbol: String,
        #[source]
        source: FetchError,
    },
}

// =============================================================================
// Session
// =============================================================================

pub struct Session<S: MarketSource> {
    source: S,
    ticks: Arc<TickBuffer>,
    candles: Arc<CandleStore>,
    aggregator: Arc<Aggregator>,
    state: RwLock<SessionState>,
    active: Mutex<Option<ActiveStream>>,
    reset_lock: tokio::sync::Mutex<()>,
    stream_on_history_failure: bool,
}

impl<S: MarketSource> Session<S> {
    pub fn new(
        source: S,
        ticks: Arc<TickBuffer>,
        candles: Arc<CandleStore>,
        stream_on_history_failure: bool,
    ) -> Self {
        let aggregator = Arc::new(Aggregator::new(ticks.clone(), candles.clone()));
        Self {
            source,
            ticks,
            candles,
            aggregator,
            state: RwLock::new(SessionState::Idle),
            active: Mutex::new(None),
            reset_lock: tokio::sync::Mutex::new(()),
            stream_on_history_failure,
        }
    }

    /// Switch to `exchange`/`symbol`.
    ///
    /// The previous adapter is stopped and both stores are cleared before
    /// anything can fail, so a failed reset never leaves the old market's
    /// data behind.
    pub async fn reset(&self, exchange: &str, symbol: &str) -> Result<ActiveMarket, SessionError> {
        let _guard = self.reset_lock.lock().await;
        self.set_state(SessionState::Resetting);
        let _resetting = ResettingGuard(&self.state);
        info!(exchange = %exchange, symbol = %symbol, "session reset requested");

        self.stop_stream().await;
        if !self.ticks.is_empty() {
            debug!(pending = self.ticks.len(), "discarding undrained ticks");
        }
        self.ticks.clear();
        self.candles.clear_all();

        let exchange: Exchange = match exchange.parse() {
            Ok(exchange) => exchange,
            Err(e) => {
                self.set_state(SessionState::Idle);
                return Err(SessionError::UnsupportedExchange(e));
            }
        };
        let symbol = symbol.trim();
        if symbol.is_empty() {
            self.set_state(SessionState::Idle);
            return Err(SessionError::EmptySymbol);
        }

        let bars = match self.source.fetch_1m_history(exchange, symbol).await {
            Ok(bars) => bars,
            Err(source) => {
                warn!(exchange = %exchange, symbol = %symbol, error = %source, "history backfill failed");
                if self.stream_on_history_failure && source.is_transport() {
                    self.launch(exchange, symbol);
                } else {
                    self.set_state(SessionState::Idle);
                }
                return Err(SessionError::History {
                    exchange,
                    symbol: symbol.to_string(),
                    source,
                });
            }
        };

        let loaded = bars.len();
        let seed = bars.last().map(|last| Tick::seed(last.open_epoch, last.close));
        self.candles.extend_1m(bars);
        if let Some(seed) = seed {
            self.ticks.append(seed);
        }
        self.aggregator.rebuild_derived();
        info!(exchange = %exchange, symbol = %symbol, bars = loaded, "history loaded");

        Ok(self.launch(exchange, symbol))
    }

    fn launch(&self, exchange: Exchange, symbol: &str) -> ActiveMarket {
        let cancel = CancellationToken::new();
        let handle = self
            .source
            .spawn_stream(exchange, symbol, self.ticks.clone(), cancel.clone());
        let market = ActiveMarket {
            exchange,
            symbol: symbol.to_string(),
        };
        *self.active.lock() = Some(ActiveStream {
            market: market.clone(),
            cancel,
            handle,
        });
        self.set_state(SessionState::Streaming);
        info!(exchange = %exchange, symbol = %symbol, "streaming");
        market
    }

    /// Cancel the running adapter, if any, and wait briefly for it to exit.
    async fn stop_stream(&self) {
        let Some(stream) = self.active.lock().take() else {
            return;
        };
        stream.cancel.cancel();
        stream.handle.abort();
        if tokio::time::timeout(STOP_TIMEOUT, stream.handle).await.is_err() {
            warn!(exchange = %stream.market.exchange, "adapter did not stop in time");
        }
        debug!(exchange = %stream.market.exchange, symbol = %stream.market.symbol, "adapter stopped");
    }

    /// Stop streaming for process shutdown. Stored data is left in place.
    pub async fn shutdown(&self) {
        let _guard = self.reset_lock.lock().await;
        self.stop_stream().await;
        self.set_state(SessionState::Idle);
    }

    /// Launch the process-lifetime 1-minute roll-up.
    pub fn spawn_rollup(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.aggregator.clone().run_live_rollup(cancel))
    }

    // ── Read side ────────────────────────────────────────────────────────

    pub fn get_candles(&self, tf: Timeframe) -> Vec<Candle> {
        self.candles.snapshot(tf)
    }

    pub fn get_last_tick(&self) -> Option<Tick> {
        self.ticks.last()
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn active(&self) -> Option<ActiveMarket> {
        self.active.lock().as_ref().map(|s| s.market.clone())
    }

    pub fn candles(&self) -> &Arc<CandleStore> {
        &self.candles
    }

    #[cfg(test)]
    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }
}

/// Falls back to `Idle` if a reset future is dropped before it reaches a
/// terminal state, e.g. when the HTTP caller disconnects mid-backfill.
struct ResettingGuard<'a>(&'a RwLock<SessionState>);

impl Drop for ResettingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.write();
        if *state == SessionState::Resetting {
            *state = SessionState::Idle;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
