// =============================================================================
// Binance USDⓈ-M futures — aggTrade stream and kline history
// =============================================================================

use anyhow::{Context, Result};

use super::feed::{FeedEvent, TradeFeed};
use super::history::{get_json, FetchError};
use super::kline_row;
use crate::market_data::Candle;
use crate::types::{Exchange, Side, Tick};

const KLINES_URL: &str = "https://fapi.binance.com/fapi/v1/klines";

pub struct BinanceFeed;

impl TradeFeed for BinanceFeed {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn url(&self, symbol: &str) -> String {
        let lower = symbol.to_lowercase();
        format!("wss://fstream.binance.com/ws/{lower}@aggTrade")
    }

    fn parse(&self, text: &str) -> Result<FeedEvent> {
        parse_agg_trade(text)
    }
}

/// Parse a Binance aggTrade message.
///
/// Expected shape (single stream; a combined-stream `data` wrapper is also
/// accepted):
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "T": 1700000000123, "m": true }
/// ```
fn parse_agg_trade(text: &str) -> Result<FeedEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };
    if data.get("p").is_none() {
        return Ok(FeedEvent::Ignore);
    }

    let trade_time = data["T"].as_i64().context("missing field T")?;
    let price = super::value_f64(&data["p"], "p")?;
    let quantity = super::value_f64(&data["q"], "q")?;

    // Buyer is maker => taker is selling.
    let is_buyer_maker = data["m"].as_bool().context("missing field m")?;
    let side = if is_buyer_maker { Side::Sell } else { Side::Buy };

    Ok(FeedEvent::Trades(vec![Tick::new(
        trade_time / 1_000,
        price,
        quantity,
        side,
    )]))
}

/// GET /fapi/v1/klines for the last day of 1-minute bars.
pub(super) async fn fetch_history_1m(
    client: &reqwest::Client,
    symbol: &str,
) -> Result<Vec<Candle>, FetchError> {
    let query = [
        ("symbol", symbol.to_string()),
        ("interval", "1m".to_string()),
        ("limit", "1440".to_string()),
    ];
    let body = get_json(client, KLINES_URL, &query).await?;
    parse_klines(&body).map_err(FetchError::Parse)
}

/// `[[open_time_ms, "o", "h", "l", "c", "v", close_time_ms, ...], ...]`
fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    body.as_array()
        .context("klines response is not an array")?
        .iter()
        .map(|row| kline_row(row, 1_000))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agg_trade() {
        let json = r#"{"e":"aggTrade","E":1700000000200,"s":"BTCUSDT","a":5933014,
            "p":"37000.10","q":"0.250","f":100,"l":105,"T":1700000000123,"m":true}"#;
        let FeedEvent::Trades(ticks) = parse_agg_trade(json).unwrap() else {
            panic!("expected trades");
        };
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].epoch_seconds, 1_700_000_000);
        assert!((ticks[0].price - 37000.10).abs() < f64::EPSILON);
        assert!((ticks[0].quantity - 0.25).abs() < f64::EPSILON);
        assert_eq!(ticks[0].side, Side::Sell);
    }

    #[test]
    fn parses_combined_envelope_buyer_taker() {
        let json = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","p":"1.5","q":"2","T":61000,"m":false}}"#;
        let FeedEvent::Trades(ticks) = parse_agg_trade(json).unwrap() else {
            panic!("expected trades");
        };
        assert_eq!(ticks[0].side, Side::Buy);
        assert_eq!(ticks[0].epoch_seconds, 61);
    }

    #[test]
    fn ignores_non_trade_frames() {
        assert_eq!(parse_agg_trade(r#"{"result":null,"id":1}"#).unwrap(), FeedEvent::Ignore);
        assert!(parse_agg_trade("not json").is_err());
    }

    #[test]
    fn stream_url_is_lowercase() {
        assert_eq!(
            BinanceFeed.url("ETHUSDT"),
            "wss://fstream.binance.com/ws/ethusdt@aggTrade"
        );
        assert!(BinanceFeed.subscribe("ETHUSDT").is_none());
    }

    #[test]
    fn parses_klines() {
        let body = serde_json::json!([
            [1700000040000i64, "100.0", "110.0", "95.0", "105.0", "50.0", 1700000099999i64, "0", 10, "0", "0", "0"],
            [1700000100000i64, "105.0", "108.0", "100.0", "107.0", "30.0", 1700000159999i64, "0", 10, "0", "0", "0"]
        ]);
        let bars = parse_klines(&body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0], Candle::new(1_700_000_040, 100.0, 110.0, 95.0, 105.0, 50.0));
        assert_eq!(bars[1].open_epoch, 1_700_000_100);
    }

    #[test]
    fn rejects_non_array_klines() {
        let body = serde_json::json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(parse_klines(&body).is_err());
    }
}
