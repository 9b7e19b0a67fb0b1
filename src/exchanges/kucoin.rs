// =============================================================================
// KuCoin futures — REST trade polling and kline history
// =============================================================================
//
// No streaming channel is used for KuCoin: the public trade-history endpoint
// is polled once per second and deduplicated by the per-trade `sequence`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::{ensure_ok, get_json, now_epoch_secs, FetchError, HISTORY_BARS};
use super::{kline_row, value_f64, value_i64};
use crate::market_data::{Candle, TickBuffer};
use crate::types::{Side, Tick};

const TRADES_URL: &str = "https://api-futures.kucoin.com/api/v1/trade/history";
const KLINE_URL: &str = "https://api-futures.kucoin.com/api/v1/kline/query";

// ---------------------------------------------------------------------------
// Sequence filter
// ---------------------------------------------------------------------------

/// Accepts a trade only if its sequence is strictly greater than every
/// sequence accepted before it.
#[derive(Debug, Default, Clone)]
pub struct SequenceFilter {
    last_seen: Option<u64>,
}

impl SequenceFilter {
    pub fn accept(&mut self, sequence: u64) -> bool {
        match self.last_seen {
            Some(last) if sequence <= last => false,
            _ => {
                self.last_seen = Some(sequence);
                true
            }
        }
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }
}

/// One parsed trade with its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedTrade {
    pub sequence: u64,
    pub tick: Tick,
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Parse `/api/v1/trade/history`. The endpoint lists newest first; the result
/// is returned in ascending sequence order.
///
/// ```json
/// { "code": "200000", "data": [ { "sequence": 102, "tradeId": "5cbd7377a6ffab0c7ba98b26",
///   "price": "7245", "size": 1, "side": "buy", "ts": 1545904567062140823 } ] }
/// ```
fn parse_trades(body: &serde_json::Value) -> Result<Vec<SequencedTrade>> {
    let items = body["data"].as_array().context("missing field data")?;
    let mut trades = Vec::with_capacity(items.len());
    for item in items {
        let sequence = item["sequence"].as_u64().context("missing field sequence")?;
        // Nanoseconds.
        let ts = value_i64(&item["ts"], "ts")?;
        trades.push(SequencedTrade {
            sequence,
            tick: Tick::new(
                ts / 1_000_000_000,
                value_f64(&item["price"], "price")?,
                value_f64(&item["size"], "size")?,
                Side::from_label(item["side"].as_str().unwrap_or_default()),
            ),
        });
    }
    trades.sort_by_key(|t| t.sequence);
    Ok(trades)
}

/// Keep only trades the filter has not seen, in arrival order.
pub fn admit(filter: &mut SequenceFilter, trades: Vec<SequencedTrade>) -> Vec<Tick> {
    admit_since(filter, trades, i64::MIN)
}

/// Like [`admit`], but trades stamped before `cutoff` only advance the
/// filter and are not returned.
///
/// The first page of trade history reaches back into minutes the 1-minute
/// backfill already holds; priming with a cutoff at the current minute keeps
/// those prints out of the live bucket.
pub fn admit_since(
    filter: &mut SequenceFilter,
    trades: Vec<SequencedTrade>,
    cutoff: i64,
) -> Vec<Tick> {
    trades
        .into_iter()
        .filter(|t| filter.accept(t.sequence))
        .map(|t| t.tick)
        .filter(|tick| tick.epoch_seconds >= cutoff)
        .collect()
}

async fn poll_once(client: &reqwest::Client, symbol: &str) -> Result<Vec<SequencedTrade>> {
    let body = get_json(client, TRADES_URL, &[("symbol", symbol.to_string())]).await?;
    ensure_ok(body["code"].as_str() == Some("200000"), "KuCoin", &body)?;
    parse_trades(&body)
}

/// Poll KuCoin every `interval` until cancelled. A failed poll is logged and
/// retried on the next tick.
pub async fn run_poller(
    client: reqwest::Client,
    symbol: String,
    ticks: Arc<TickBuffer>,
    cancel: CancellationToken,
    interval: Duration,
) {
    info!(symbol = %symbol, "KuCoin trade polling started");
    let mut filter = SequenceFilter::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = poll_once(&client, &symbol) => match result {
                Ok(trades) => {
                    let fresh = if filter.last_seen().is_none() {
                        let minute_start = now_epoch_secs().div_euclid(60) * 60;
                        admit_since(&mut filter, trades, minute_start)
                    } else {
                        admit(&mut filter, trades)
                    };
                    if !fresh.is_empty() {
                        debug!(symbol = %symbol, count = fresh.len(), last_seq = ?filter.last_seen(), "KuCoin trades accepted");
                    }
                    ticks.extend(fresh.into_iter().filter(Tick::is_valid));
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "KuCoin trade poll failed — retrying");
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!(symbol = %symbol, "KuCoin trade polling stopped");
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// GET /api/v1/kline/query (granularity=1). KuCoin returns at most 500 bars
/// per call, the newest ones inside the requested window.
pub(super) async fn fetch_history_1m(
    client: &reqwest::Client,
    symbol: &str,
) -> Result<Vec<Candle>, FetchError> {
    let to_ms = now_epoch_secs() * 1_000;
    let from_ms = to_ms - HISTORY_BARS as i64 * 60_000;
    let query = [
        ("symbol", symbol.to_string()),
        ("granularity", "1".to_string()),
        ("from", from_ms.to_string()),
        ("to", to_ms.to_string()),
    ];
    let body = get_json(client, KLINE_URL, &query).await?;
    ensure_ok(body["code"].as_str() == Some("200000"), "KuCoin", &body)?;
    parse_klines(&body).map_err(FetchError::Parse)
}

/// Rows are `[time_ms, open, high, low, close, volume]` as JSON numbers.
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    body["data"]
        .as_array()
        .context("missing field data")?
        .iter()
        .map(|row| kline_row(row, 1_000))
        .collect()
}
