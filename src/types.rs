// =============================================================================
// Shared types used across the kline relay
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Taker side of a trade, as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
    Unknown,
}

impl Side {
    /// Map an exchange's `"buy"` / `"Sell"` style label onto a side.
    pub fn from_label(label: &str) -> Self {
        if label.eq_ignore_ascii_case("buy") {
            Self::Buy
        } else if label.eq_ignore_ascii_case("sell") {
            Self::Sell
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A single normalized trade print.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub epoch_seconds: i64,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
}

impl Tick {
    pub fn new(epoch_seconds: i64, price: f64, quantity: f64, side: Side) -> Self {
        Self {
            epoch_seconds,
            price,
            quantity,
            side,
        }
    }

    /// Zero-volume tick used to publish a price before the first real trade.
    pub fn seed(epoch_seconds: i64, price: f64) -> Self {
        Self::new(epoch_seconds, price, 0.0, Side::Unknown)
    }

    /// Exchanges occasionally emit zero or garbage prices; those never reach
    /// the buffer.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.quantity.is_finite() && self.quantity >= 0.0
    }
}

// =============================================================================
// Timeframe
// =============================================================================

/// Candle bucket width. Everything above one minute is derived from the
/// 1-minute series.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Every timeframe rolled up from the 1-minute series.
    pub const DERIVED: [Timeframe; 5] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Number of 1-minute bars per bucket.
    pub fn ratio(self) -> usize {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::H1 => 60,
            Self::H4 => 240,
            Self::D1 => 1440,
        }
    }

    pub fn seconds(self) -> i64 {
        self.ratio() as i64 * 60
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown timeframe: {s}"))
    }
}

// =============================================================================
// Exchange
// =============================================================================

/// The fixed set of venues the relay can stream from.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exchange {
    Binance,
    Bybit,
    #[serde(rename = "OKX")]
    Okx,
    Bitget,
    #[serde(rename = "HTX")]
    Htx,
    #[serde(rename = "KuCoin")]
    Kucoin,
}

impl Exchange {
    pub const ALL: [Exchange; 6] = [
        Exchange::Binance,
        Exchange::Bybit,
        Exchange::Okx,
        Exchange::Bitget,
        Exchange::Htx,
        Exchange::Kucoin,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Binance => "Binance",
            Self::Bybit => "Bybit",
            Self::Okx => "OKX",
            Self::Bitget => "Bitget",
            Self::Htx => "HTX",
            Self::Kucoin => "KuCoin",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when an exchange name has no adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported exchange: {0}")]
pub struct UnknownExchange(pub String);

impl FromStr for Exchange {
    type Err = UnknownExchange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        if name.eq_ignore_ascii_case("huobi") {
            return Ok(Self::Htx);
        }
        Self::ALL
            .into_iter()
            .find(|ex| ex.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownExchange(name.to_string()))
    }
}
