// =============================================================================
// Runtime Configuration — relay settings with atomic save
// =============================================================================
//
// Holds the startup exchange/symbol plus every tunable of the ingestion
// pipeline. The file is rewritten on shutdown so the last selected market is
// restored on the next start.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market_data::candle_store::DEFAULT_CANDLE_CAPACITY;
use crate::market_data::tick_buffer::DEFAULT_TICK_CAPACITY;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_exchange() -> String {
    "Binance".to_string()
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_tick_capacity() -> usize {
    DEFAULT_TICK_CAPACITY
}

fn default_candle_capacity() -> usize {
    DEFAULT_CANDLE_CAPACITY
}

fn default_reconnect_backoff_secs() -> u64 {
    5
}

fn default_kucoin_poll_interval_ms() -> u64 {
    1_000
}

fn default_history_timeout_secs() -> u64 {
    8
}

fn default_poll_timeout_secs() -> u64 {
    5
}

fn default_daily_close_utc_offset_hours() -> i32 {
    3
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the relay.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Market selection ---------------------------------------------------

    /// Exchange streamed on startup ("Binance", "Bybit", "OKX", "Bitget",
    /// "HTX", "KuCoin").
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Symbol in the exchange's native contract code.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    // --- API ----------------------------------------------------------------

    /// Address the HTTP/WebSocket API listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Buffers ------------------------------------------------------------

    /// Ticks retained before the oldest are dropped.
    #[serde(default = "default_tick_capacity")]
    pub tick_capacity: usize,

    /// Candles retained per timeframe.
    #[serde(default = "default_candle_capacity")]
    pub candle_capacity: usize,

    // --- Network ------------------------------------------------------------

    /// Wait between WebSocket reconnect attempts.
    #[serde(default = "default_reconnect_backoff_secs")]
    pub reconnect_backoff_secs: u64,

    /// KuCoin trade polling cadence (also the retry delay after a failure).
    #[serde(default = "default_kucoin_poll_interval_ms")]
    pub kucoin_poll_interval_ms: u64,

    /// Per-request timeout for the history backfill.
    #[serde(default = "default_history_timeout_secs")]
    pub history_timeout_secs: u64,

    /// Per-request timeout for KuCoin trade polls.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Launch the live stream even when the history backfill failed. The
    /// reset still reports the failure.
    #[serde(default)]
    pub stream_on_history_failure: bool,

    // --- Ticker -------------------------------------------------------------

    /// UTC offset, in hours, of the midnight whose 1-minute bar is the daily
    /// reference close.
    #[serde(default = "default_daily_close_utc_offset_hours")]
    pub daily_close_utc_offset_hours: i32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            symbol: default_symbol(),
            bind_addr: default_bind_addr(),
            tick_capacity: default_tick_capacity(),
            candle_capacity: default_candle_capacity(),
            reconnect_backoff_secs: default_reconnect_backoff_secs(),
            kucoin_poll_interval_ms: default_kucoin_poll_interval_ms(),
            history_timeout_secs: default_history_timeout_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
            stream_on_history_failure: false,
            daily_close_utc_offset_hours: default_daily_close_utc_offset_hours(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            exchange = %config.exchange,
            symbol = %config.symbol,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply `KLINE_EXCHANGE`, `KLINE_SYMBOL` and `KLINE_BIND_ADDR` overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(exchange) = non_empty("KLINE_EXCHANGE") {
            self.exchange = exchange;
        }
        if let Some(symbol) = non_empty("KLINE_SYMBOL") {
            self.symbol = symbol.to_uppercase();
        }
        if let Some(addr) = non_empty("KLINE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if self.tick_capacity == 0 || self.candle_capacity == 0 {
            warn!("zero buffer capacity configured; falling back to defaults");
            self.tick_capacity = default_tick_capacity();
            self.candle_capacity = default_candle_capacity();
        }
        if !(-23..=23).contains(&self.daily_close_utc_offset_hours) {
            warn!(
                hours = self.daily_close_utc_offset_hours,
                "daily close offset out of range; using UTC+3"
            );
            self.daily_close_utc_offset_hours = default_daily_close_utc_offset_hours();
        }
    }

    /// Timezone whose midnight marks the daily reference close.
    pub fn daily_close_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.daily_close_utc_offset_hours * 3_600)
            .unwrap_or_else(|| Utc.fix())
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        // Atomic write: write to a temporary sibling file, then rename.
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
