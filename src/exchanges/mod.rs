// =============================================================================
// Exchange Adapters — live trade streams and 1-minute history per venue
// =============================================================================
//
// Every venue provides two capabilities:
//
//   1. A long-running trade stream that normalizes prints into `Tick`s and
//      appends them to the shared `TickBuffer`, reconnecting forever until
//      cancelled.  Binance, Bybit, OKX, Bitget and HTX are WebSocket feeds
//      (`feed::TradeFeed`); KuCoin is polled over REST.
//   2. A one-shot REST call returning up to a day of closed 1-minute bars.
//
// The venue is picked in exactly one place: the `match` in
// `LiveMarkets::spawn_stream` / `LiveMarkets::fetch_1m_history`.

pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod feed;
pub mod history;
pub mod htx;
pub mod kucoin;
pub mod okx;

#[cfg(test)]
pub(crate) mod stub;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::market_data::{Candle, TickBuffer};
use crate::runtime_config::RuntimeConfig;
use crate::types::Exchange;

pub use history::FetchError;

// ---------------------------------------------------------------------------
// Capability seam used by the session controller
// ---------------------------------------------------------------------------

/// Everything the session controller needs from the outside world.
pub trait MarketSource: Send + Sync + 'static {
    /// Fetch recent closed 1-minute bars, oldest first.
    fn fetch_1m_history(
        &self,
        exchange: Exchange,
        symbol: &str,
    ) -> impl Future<Output = Result<Vec<Candle>, FetchError>> + Send;

    /// Start the trade stream for `symbol`. The task runs until `cancel`
    /// fires or the handle is aborted.
    fn spawn_stream(
        &self,
        exchange: Exchange,
        symbol: &str,
        ticks: Arc<TickBuffer>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>;
}

/// Timing knobs shared by all adapters.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub reconnect_backoff: Duration,
    pub poll_interval: Duration,
}

/// Production [`MarketSource`] talking to the real exchanges.
pub struct LiveMarkets {
    history_client: reqwest::Client,
    poll_client: reqwest::Client,
    settings: StreamSettings,
}

impl LiveMarkets {
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let history_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.history_timeout_secs))
            .build()
            .context("failed to build history HTTP client")?;
        let poll_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs))
            .build()
            .context("failed to build polling HTTP client")?;

        Ok(Self {
            history_client,
            poll_client,
            settings: StreamSettings {
                reconnect_backoff: Duration::from_secs(config.reconnect_backoff_secs),
                poll_interval: Duration::from_millis(config.kucoin_poll_interval_ms),
            },
        })
    }
}

impl MarketSource for LiveMarkets {
    async fn fetch_1m_history(
        &self,
        exchange: Exchange,
        symbol: &str,
    ) -> Result<Vec<Candle>, FetchError> {
        let client = &self.history_client;
        history::fetch_closed(async move {
            match exchange {
                Exchange::Binance => binance::fetch_history_1m(client, symbol).await,
                Exchange::Bybit => bybit::fetch_history_1m(client, symbol).await,
                Exchange::Okx => okx::fetch_history_1m(client, symbol).await,
                Exchange::Bitget => bitget::fetch_history_1m(client, symbol).await,
                Exchange::Htx => htx::fetch_history_1m(client, symbol).await,
                Exchange::Kucoin => kucoin::fetch_history_1m(client, symbol).await,
            }
        })
        .await
    }

    fn spawn_stream(
        &self,
        exchange: Exchange,
        symbol: &str,
        ticks: Arc<TickBuffer>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let symbol = symbol.to_string();
        let backoff = self.settings.reconnect_backoff;
        match exchange {
            Exchange::Binance => tokio::spawn(feed::run_with_reconnect(
                binance::BinanceFeed,
                symbol,
                ticks,
                cancel,
                backoff,
            )),
            Exchange::Bybit => tokio::spawn(feed::run_with_reconnect(
                bybit::BybitFeed,
                symbol,
                ticks,
                cancel,
                backoff,
            )),
            Exchange::Okx => tokio::spawn(feed::run_with_reconnect(
                okx::OkxFeed,
                symbol,
                ticks,
                cancel,
                backoff,
            )),
            Exchange::Bitget => tokio::spawn(feed::run_with_reconnect(
                bitget::BitgetFeed,
                symbol,
                ticks,
                cancel,
                backoff,
            )),
            Exchange::Htx => tokio::spawn(feed::run_with_reconnect(
                htx::HtxFeed,
                symbol,
                ticks,
                cancel,
                backoff,
            )),
            Exchange::Kucoin => tokio::spawn(kucoin::run_poller(
                self.poll_client.clone(),
                symbol,
                ticks,
                cancel,
                self.settings.poll_interval,
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared JSON helpers
// ---------------------------------------------------------------------------

/// Exchanges send numbers either as JSON strings or as JSON numbers.
pub(crate) fn value_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Integer timestamps, again either quoted or bare.
pub(crate) fn value_i64(val: &serde_json::Value, name: &str) -> Result<i64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .with_context(|| format!("failed to parse {name} as i64: {s}")),
        serde_json::Value::Number(n) => n
            .as_i64()
            .with_context(|| format!("field {name} is not a valid i64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse a `[open_time, open, high, low, close, volume, ...]` kline row.
/// `time_divisor` converts the exchange's time unit to seconds.
pub(crate) fn kline_row(row: &serde_json::Value, time_divisor: i64) -> Result<Candle> {
    let cols = row.as_array().context("kline row is not an array")?;
    if cols.len() < 6 {
        anyhow::bail!("kline row has {} columns, expected at least 6", cols.len());
    }
    Ok(Candle::new(
        value_i64(&cols[0], "open_time")? / time_divisor,
        value_f64(&cols[1], "open")?,
        value_f64(&cols[2], "high")?,
        value_f64(&cols[3], "low")?,
        value_f64(&cols[4], "close")?,
        value_f64(&cols[5], "volume")?,
    ))
}
