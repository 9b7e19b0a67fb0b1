// =============================================================================
// HTX (Huobi) USDT-margined swaps — gzip trade stream and kline history
// =============================================================================
//
// Every frame from the HTX market socket is gzip-compressed binary. The server
// pings with `{"ping": <ts>}` roughly every 5 s and drops the connection
// unless it receives `{"pong": <ts>}` with the same token.

use std::io::Read;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use super::feed::{FeedEvent, TradeFeed};
use super::history::{ensure_ok, get_json, FetchError};
use super::{value_f64, value_i64};
use crate::market_data::Candle;
use crate::types::{Exchange, Side, Tick};

const STREAM_URL: &str = "wss://api.hbdm.com/linear-swap-ws";
const KLINE_URL: &str = "https://api.hbdm.com/linear-swap-ex/market/history/kline";

pub struct HtxFeed;

impl TradeFeed for HtxFeed {
    fn exchange(&self) -> Exchange {
        Exchange::Htx
    }

    fn url(&self, _symbol: &str) -> String {
        STREAM_URL.to_string()
    }

    fn subscribe(&self, symbol: &str) -> Option<String> {
        Some(json!({ "sub": format!("market.{symbol}.trade.detail"), "id": "kline-relay" }).to_string())
    }

    fn decode(&self, msg: Message) -> Result<Option<String>> {
        match msg {
            Message::Binary(bytes) => gunzip(&bytes).map(Some),
            Message::Text(text) => Ok(Some(text)),
            _ => Ok(None),
        }
    }

    fn parse(&self, text: &str) -> Result<FeedEvent> {
        parse_message(text)
    }
}

fn gunzip(bytes: &[u8]) -> Result<String> {
    let mut out = String::new();
    GzDecoder::new(bytes)
        .read_to_string(&mut out)
        .context("failed to gunzip HTX frame")?;
    Ok(out)
}

/// Handles keep-alive pings as well as trade pushes:
///
/// ```json
/// { "ping": 1492420473027 }
/// { "ch": "market.BTC-USDT.trade.detail", "ts": 1603708208346,
///   "tick": { "id": 131602265, "ts": 1603708208335, "data": [
///     { "amount": 2, "quantity": 0.002, "ts": 1603708208335, "id": 1316022650000,
///       "price": 13073.3, "direction": "buy", "trade_turnover": 26.1466 } ] } }
/// ```
fn parse_message(text: &str) -> Result<FeedEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse HTX JSON")?;

    if let Some(token) = root.get("ping") {
        return Ok(FeedEvent::Reply(json!({ "pong": token }).to_string()));
    }
    if root["op"].as_str() == Some("ping") {
        return Ok(FeedEvent::Reply(json!({ "op": "pong", "ts": root["ts"] }).to_string()));
    }
    if root["status"].as_str() == Some("error") {
        anyhow::bail!(
            "HTX error {}: {}",
            root["err-code"],
            root["err-msg"].as_str().unwrap_or("")
        );
    }

    let is_trade = root["ch"]
        .as_str()
        .is_some_and(|ch| ch.ends_with(".trade.detail"));
    if !is_trade {
        return Ok(FeedEvent::Ignore);
    }

    let items = root["tick"]["data"]
        .as_array()
        .context("missing field tick.data")?;
    let mut ticks = Vec::with_capacity(items.len());
    for item in items {
        // `quantity` is in coin units; older payloads only carry `amount`
        // (contracts).
        let quantity = match item.get("quantity") {
            Some(q) => value_f64(q, "quantity")?,
            None => value_f64(&item["amount"], "amount")?,
        };
        ticks.push(Tick::new(
            value_i64(&item["ts"], "ts")? / 1_000,
            value_f64(&item["price"], "price")?,
            quantity,
            Side::from_label(item["direction"].as_str().unwrap_or_default()),
        ));
    }
    Ok(FeedEvent::Trades(ticks))
}

/// GET /linear-swap-ex/market/history/kline (period=1min).
pub(super) async fn fetch_history_1m(
    client: &reqwest::Client,
    symbol: &str,
) -> Result<Vec<Candle>, FetchError> {
    let query = [
        ("contract_code", symbol.to_string()),
        ("period", "1min".to_string()),
        ("size", "1440".to_string()),
    ];
    let body = get_json(client, KLINE_URL, &query).await?;
    ensure_ok(body["status"].as_str() == Some("ok"), "HTX", &body)?;
    parse_klines(&body).map_err(FetchError::Parse)
}

/// Rows are objects keyed by `id` (open time in seconds) with `amount` in
/// coin units.
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let rows = body["data"].as_array().context("missing field data")?;
    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        bars.push(Candle::new(
            value_i64(&row["id"], "id")?,
            value_f64(&row["open"], "open")?,
            value_f64(&row["high"], "high")?,
            value_f64(&row["low"], "low")?,
            value_f64(&row["close"], "close")?,
            value_f64(&row["amount"], "amount")?,
        ));
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(text: &str) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn ping_gets_matching_pong() {
        let FeedEvent::Reply(reply) = parse_message(r#"{"ping":1492420473027}"#).unwrap() else {
            panic!("expected reply");
        };
        let v: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(v["pong"], 1_492_420_473_027i64);
    }

    #[test]
    fn decodes_gzip_binary_frames() {
        let frame = Message::Binary(gzip(r#"{"ping":42}"#));
        let text = HtxFeed.decode(frame).unwrap().unwrap();
        assert_eq!(text, r#"{"ping":42}"#);
        assert!(HtxFeed.decode(Message::Binary(vec![1, 2, 3])).is_err());
    }

    #[test]
    fn parses_trade_detail() {
        let json = r#"{"ch":"market.BTC-USDT.trade.detail","ts":1603708208346,
            "tick":{"id":131602265,"ts":1603708208335,"data":[
              {"amount":2,"quantity":0.002,"ts":1603708208335,"id":1316022650000,"price":13073.3,"direction":"buy","trade_turnover":26.1466},
              {"amount":6,"ts":1603708209000,"id":1316022650001,"price":13073.1,"direction":"sell"}]}}"#;
        let FeedEvent::Trades(ticks) = parse_message(json).unwrap() else {
            panic!("expected trades");
        };
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].epoch_seconds, 1_603_708_208);
        assert!((ticks[0].quantity - 0.002).abs() < f64::EPSILON);
        assert_eq!(ticks[0].side, Side::Buy);
        assert!((ticks[1].quantity - 6.0).abs() < f64::EPSILON);
        assert_eq!(ticks[1].side, Side::Sell);
    }

    #[test]
    fn subscription_ack_is_ignored() {
        let ack = r#"{"id":"kline-relay","subbed":"market.BTC-USDT.trade.detail","ts":1,"status":"ok"}"#;
        assert_eq!(parse_message(ack).unwrap(), FeedEvent::Ignore);
        let err = r#"{"status":"error","err-code":"bad-request","err-msg":"invalid topic","ts":1}"#;
        assert!(parse_message(err).is_err());
    }

    #[test]
    fn parses_klines() {
        let body = serde_json::json!({
            "ch": "market.BTC-USDT.kline.1min", "status": "ok", "ts": 1,
            "data": [{"id": 1700000040, "open": 100.0, "close": 105.0, "low": 95.0,
                      "high": 110.0, "amount": 50.0, "vol": 50000, "trade_turnover": 1.0, "count": 9}]
        });
        assert_eq!(
            parse_klines(&body).unwrap(),
            vec![Candle::new(1_700_000_040, 100.0, 110.0, 95.0, 105.0, 50.0)]
        );
    }
}
