// =============================================================================
// Bybit v5 linear — publicTrade stream and kline history
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use super::feed::{FeedEvent, TradeFeed};
use super::history::{ensure_ok, get_json, FetchError};
use super::{kline_row, value_f64, value_i64};
use crate::market_data::Candle;
use crate::types::{Exchange, Side, Tick};

const STREAM_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const KLINE_URL: &str = "https://api.bybit.com/v5/market/kline";

pub struct BybitFeed;

impl TradeFeed for BybitFeed {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn url(&self, _symbol: &str) -> String {
        STREAM_URL.to_string()
    }

    fn subscribe(&self, symbol: &str) -> Option<String> {
        Some(json!({ "op": "subscribe", "args": [format!("publicTrade.{symbol}")] }).to_string())
    }

    /// Bybit drops idle connections; it asks for a ping every 20 s.
    fn keepalive(&self) -> Option<(Duration, String)> {
        Some((Duration::from_secs(20), json!({ "op": "ping" }).to_string()))
    }

    fn parse(&self, text: &str) -> Result<FeedEvent> {
        parse_public_trade(text)
    }
}

/// Parse a publicTrade push.
///
/// ```json
/// { "topic": "publicTrade.BTCUSDT", "type": "snapshot", "ts": 1672304486868,
///   "data": [ { "T": 1672304486865, "s": "BTCUSDT", "S": "Buy", "v": "0.001", "p": "16578.50" } ] }
/// ```
fn parse_public_trade(text: &str) -> Result<FeedEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse publicTrade JSON")?;

    let is_trade = root["topic"]
        .as_str()
        .is_some_and(|topic| topic.starts_with("publicTrade"));
    if !is_trade {
        // Subscription acks and pongs.
        return Ok(FeedEvent::Ignore);
    }

    let items = root["data"].as_array().context("missing field data")?;
    let mut ticks = Vec::with_capacity(items.len());
    for item in items {
        let side = Side::from_label(item["S"].as_str().unwrap_or_default());
        ticks.push(Tick::new(
            value_i64(&item["T"], "T")? / 1_000,
            value_f64(&item["p"], "p")?,
            value_f64(&item["v"], "v")?,
            side,
        ));
    }
    Ok(FeedEvent::Trades(ticks))
}

/// GET /v5/market/kline (category=linear, interval=1). Rows arrive newest
/// first; ordering is fixed by the shared normalization.
pub(super) async fn fetch_history_1m(
    client: &reqwest::Client,
    symbol: &str,
) -> Result<Vec<Candle>, FetchError> {
    let query = [
        ("category", "linear".to_string()),
        ("symbol", symbol.to_string()),
        ("interval", "1".to_string()),
        ("limit", "1000".to_string()),
    ];
    let body = get_json(client, KLINE_URL, &query).await?;
    ensure_ok(body["retCode"].as_i64() == Some(0), "Bybit", &body)?;
    parse_klines(&body).map_err(FetchError::Parse)
}

fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    body["result"]["list"]
        .as_array()
        .context("missing field result.list")?
        .iter()
        .map(|row| kline_row(row, 1_000))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trade_batch() {
        let json = r#"{"topic":"publicTrade.BTCUSDT","type":"snapshot","ts":1672304486868,
            "data":[{"T":1672304486865,"s":"BTCUSDT","S":"Buy","v":"0.001","p":"16578.50","L":"PlusTick","i":"a","BT":false},
                    {"T":1672304487100,"s":"BTCUSDT","S":"Sell","v":"0.5","p":"16578.00","L":"MinusTick","i":"b","BT":false}]}"#;
        let FeedEvent::Trades(ticks) = parse_public_trade(json).unwrap() else {
            panic!("expected trades");
        };
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].epoch_seconds, 1_672_304_486);
        assert_eq!(ticks[0].side, Side::Buy);
        assert_eq!(ticks[1].side, Side::Sell);
        assert!((ticks[1].quantity - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn ignores_acks_and_pongs() {
        let ack = r#"{"success":true,"ret_msg":"","conn_id":"x","op":"subscribe"}"#;
        let pong = r#"{"success":true,"ret_msg":"pong","conn_id":"x","op":"ping"}"#;
        assert_eq!(parse_public_trade(ack).unwrap(), FeedEvent::Ignore);
        assert_eq!(parse_public_trade(pong).unwrap(), FeedEvent::Ignore);
    }

    #[test]
    fn subscribe_message_names_topic() {
        let sub = BybitFeed.subscribe("ETHUSDT").unwrap();
        let v: serde_json::Value = serde_json::from_str(&sub).unwrap();
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["args"][0], "publicTrade.ETHUSDT");
    }

    #[test]
    fn parses_klines_newest_first() {
        let body = serde_json::json!({
            "retCode": 0,
            "result": { "category": "linear", "symbol": "BTCUSDT", "list": [
                ["1700000100000", "105", "108", "100", "107", "30", "3000"],
                ["1700000040000", "100", "110", "95", "105", "50", "5000"]
            ]}
        });
        let bars = parse_klines(&body).unwrap();
        assert_eq!(bars[0].open_epoch, 1_700_000_100);
        assert_eq!(bars[1], Candle::new(1_700_000_040, 100.0, 110.0, 95.0, 105.0, 50.0));
    }
}
