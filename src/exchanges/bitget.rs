// =============================================================================
// Bitget v2 USDT-futures — trade channel and candle history
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use super::feed::{FeedEvent, TradeFeed};
use super::history::{ensure_ok, get_json, FetchError};
use super::{kline_row, value_f64, value_i64};
use crate::market_data::Candle;
use crate::types::{Exchange, Side, Tick};

const STREAM_URL: &str = "wss://ws.bitget.com/v2/ws/public";
const CANDLES_URL: &str = "https://api.bitget.com/api/v2/mix/market/candles";

pub struct BitgetFeed;

impl TradeFeed for BitgetFeed {
    fn exchange(&self) -> Exchange {
        Exchange::Bitget
    }

    fn url(&self, _symbol: &str) -> String {
        STREAM_URL.to_string()
    }

    fn subscribe(&self, symbol: &str) -> Option<String> {
        Some(
            json!({
                "op": "subscribe",
                "args": [{ "instType": "USDT-FUTURES", "channel": "trade", "instId": symbol }]
            })
            .to_string(),
        )
    }

    fn keepalive(&self) -> Option<(Duration, String)> {
        Some((Duration::from_secs(30), "ping".to_string()))
    }

    fn parse(&self, text: &str) -> Result<FeedEvent> {
        parse_trades(text)
    }
}

/// ```json
/// { "action": "update", "arg": { "instType": "USDT-FUTURES", "channel": "trade", "instId": "BTCUSDT" },
///   "data": [ { "ts": "1695716760565", "price": "27000.5", "size": "0.001", "side": "buy", "tradeId": "1" } ],
///   "ts": 1695716761589 }
/// ```
///
/// The `snapshot` pushed right after subscribing replays trades from before
/// the connection and is skipped.
fn parse_trades(text: &str) -> Result<FeedEvent> {
    if text == "pong" {
        return Ok(FeedEvent::Ignore);
    }
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse Bitget trade JSON")?;

    if let Some(event) = root["event"].as_str() {
        if event == "error" {
            anyhow::bail!(
                "Bitget error event {}: {}",
                root["code"],
                root["msg"].as_str().unwrap_or("")
            );
        }
        return Ok(FeedEvent::Ignore);
    }
    if root["action"].as_str() != Some("update") {
        return Ok(FeedEvent::Ignore);
    }

    let items = root["data"].as_array().context("missing field data")?;
    let mut ticks = Vec::with_capacity(items.len());
    for item in items {
        ticks.push(Tick::new(
            value_i64(&item["ts"], "ts")? / 1_000,
            value_f64(&item["price"], "price")?,
            value_f64(&item["size"], "size")?,
            Side::from_label(item["side"].as_str().unwrap_or_default()),
        ));
    }
    Ok(FeedEvent::Trades(ticks))
}

/// GET /api/v2/mix/market/candles (granularity=1m).
pub(super) async fn fetch_history_1m(
    client: &reqwest::Client,
    symbol: &str,
) -> Result<Vec<Candle>, FetchError> {
    let query = [
        ("symbol", symbol.to_string()),
        ("productType", "usdt-futures".to_string()),
        ("granularity", "1m".to_string()),
        ("limit", "1000".to_string()),
    ];
    let body = get_json(client, CANDLES_URL, &query).await?;
    ensure_ok(body["code"].as_str() == Some("00000"), "Bitget", &body)?;
    parse_candles(&body).map_err(FetchError::Parse)
}

/// Rows are `[ts, o, h, l, c, baseVolume, quoteVolume]`.
fn parse_candles(body: &serde_json::Value) -> Result<Vec<Candle>> {
    body["data"]
        .as_array()
        .context("missing field data")?
        .iter()
        .map(|row| kline_row(row, 1_000))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_frame() {
        let json = r#"{"action":"update","arg":{"instType":"USDT-FUTURES","channel":"trade","instId":"BTCUSDT"},
            "data":[{"ts":"1695716760565","price":"27000.5","size":"0.001","side":"buy","tradeId":"1"},
                    {"ts":"1695716761000","price":"27001.0","size":"0.002","side":"sell","tradeId":"2"}],"ts":1695716761589}"#;
        let FeedEvent::Trades(ticks) = parse_trades(json).unwrap() else {
            panic!("expected trades");
        };
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].epoch_seconds, 1_695_716_760);
        assert_eq!(ticks[0].side, Side::Buy);
        assert_eq!(ticks[1].side, Side::Sell);
    }

    #[test]
    fn skips_snapshot_and_acks() {
        let snapshot = r#"{"action":"snapshot","arg":{"channel":"trade"},"data":[{"ts":"1","price":"1","size":"1","side":"buy"}]}"#;
        let ack = r#"{"event":"subscribe","arg":{"instType":"USDT-FUTURES","channel":"trade","instId":"BTCUSDT"}}"#;
        assert_eq!(parse_trades(snapshot).unwrap(), FeedEvent::Ignore);
        assert_eq!(parse_trades(ack).unwrap(), FeedEvent::Ignore);
        assert_eq!(parse_trades("pong").unwrap(), FeedEvent::Ignore);
    }

    #[test]
    fn parses_candles() {
        let body = serde_json::json!({
            "code": "00000", "msg": "success",
            "data": [["1700000040000", "100", "110", "95", "105", "50", "5000"]]
        });
        assert_eq!(
            parse_candles(&body).unwrap(),
            vec![Candle::new(1_700_000_040, 100.0, 110.0, 95.0, 105.0, 50.0)]
        );
    }
}
