// =============================================================================
// OKX v5 — public trades channel and candle history
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use super::feed::{FeedEvent, TradeFeed};
use super::history::{ensure_ok, get_json, FetchError};
use super::{kline_row, value_f64, value_i64};
use crate::market_data::Candle;
use crate::types::{Exchange, Side, Tick};

const STREAM_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const CANDLES_URL: &str = "https://www.okx.com/api/v5/market/candles";

pub struct OkxFeed;

impl TradeFeed for OkxFeed {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn url(&self, _symbol: &str) -> String {
        STREAM_URL.to_string()
    }

    fn subscribe(&self, symbol: &str) -> Option<String> {
        Some(
            json!({
                "op": "subscribe",
                "args": [{ "channel": "trades", "instId": symbol }]
            })
            .to_string(),
        )
    }

    /// OKX closes the socket after 30 s without traffic.
    fn keepalive(&self) -> Option<(Duration, String)> {
        Some((Duration::from_secs(25), "ping".to_string()))
    }

    fn parse(&self, text: &str) -> Result<FeedEvent> {
        parse_trades(text)
    }
}

/// ```json
/// { "arg": { "channel": "trades", "instId": "BTC-USDT-SWAP" },
///   "data": [ { "instId": "BTC-USDT-SWAP", "tradeId": "130639474", "px": "42219.9",
///               "sz": "0.12", "side": "buy", "ts": "1630048897897" } ] }
/// ```
fn parse_trades(text: &str) -> Result<FeedEvent> {
    if text == "pong" {
        return Ok(FeedEvent::Ignore);
    }
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse OKX trades JSON")?;

    if let Some(event) = root["event"].as_str() {
        if event == "error" {
            anyhow::bail!(
                "OKX error event {}: {}",
                root["code"].as_str().unwrap_or("?"),
                root["msg"].as_str().unwrap_or("")
            );
        }
        return Ok(FeedEvent::Ignore);
    }

    let Some(items) = root["data"].as_array() else {
        return Ok(FeedEvent::Ignore);
    };
    let mut ticks = Vec::with_capacity(items.len());
    for item in items {
        ticks.push(Tick::new(
            value_i64(&item["ts"], "ts")? / 1_000,
            value_f64(&item["px"], "px")?,
            value_f64(&item["sz"], "sz")?,
            Side::from_label(item["side"].as_str().unwrap_or_default()),
        ));
    }
    Ok(FeedEvent::Trades(ticks))
}

/// GET /api/v5/market/candles (bar=1m). OKX caps this endpoint at 300 rows.
pub(super) async fn fetch_history_1m(
    client: &reqwest::Client,
    symbol: &str,
) -> Result<Vec<Candle>, FetchError> {
    let query = [
        ("instId", symbol.to_string()),
        ("bar", "1m".to_string()),
        ("limit", "300".to_string()),
    ];
    let body = get_json(client, CANDLES_URL, &query).await?;
    ensure_ok(body["code"].as_str() == Some("0"), "OKX", &body)?;
    parse_candles(&body).map_err(FetchError::Parse)
}

/// Rows are `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`; bars with
/// `confirm == "0"` are still forming and skipped.
fn parse_candles(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let rows = body["data"].as_array().context("missing field data")?;
    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        if row.get(8).and_then(|v| v.as_str()) == Some("0") {
            continue;
        }
        bars.push(kline_row(row, 1_000)?);
    }
    Ok(bars)
}
