// =============================================================================
// Daily Ticker — live price against the day's reference close
// =============================================================================
//
// The reference is the close of the 1-minute bar that opens at local midnight
// in the configured offset (UTC+3 by default). The newest such bar in the
// store wins, so the reference rolls over once the live roll-up closes the
// next midnight bar.
//
// Until a midnight bar is stored the live price is its own reference and the
// change reads 0%.
// =============================================================================

use chrono::{DateTime, FixedOffset, Timelike};
use serde::Serialize;

use crate::market_data::CandleStore;
use crate::types::{Tick, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ticker {
    /// Last trade price, or the newest 1m close when no tick is known.
    pub price: f64,
    pub reference_close: f64,
    /// Open time of the midnight bar; `None` when the price stands in for it.
    pub reference_epoch: Option<i64>,
    pub change_pct: f64,
}

/// Whether a bar opening at `open_epoch` starts the day in `offset`.
pub fn opens_day(open_epoch: i64, offset: FixedOffset) -> bool {
    DateTime::from_timestamp(open_epoch, 0)
        .map(|utc| utc.with_timezone(&offset))
        .is_some_and(|local| local.hour() == 0 && local.minute() == 0)
}

/// Percent move from `reference` to `price`; 0 for a zero reference.
pub fn change_pct(price: f64, reference: f64) -> f64 {
    if reference == 0.0 {
        return 0.0;
    }
    (price - reference) / reference * 100.0
}

/// `None` only when neither a tick nor a 1-minute bar is available.
pub fn build_ticker(
    candles: &CandleStore,
    last_tick: Option<Tick>,
    offset: FixedOffset,
) -> Option<Ticker> {
    let price = match last_tick {
        Some(tick) => tick.price,
        None => candles.last(Timeframe::M1)?.close,
    };
    let reference = candles.find_last(Timeframe::M1, |c| opens_day(c.open_epoch, offset));
    let reference_close = reference.map_or(price, |c| c.close);

    Some(Ticker {
        price,
        reference_close,
        reference_epoch: reference.map(|c| c.open_epoch),
        change_pct: change_pct(price, reference_close),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;
    use crate::types::Side;

    // 2023-11-15 00:00:00 UTC.
    const MIDNIGHT_UTC: i64 = 1_700_006_400;
    const MIDNIGHT_UTC3: i64 = MIDNIGHT_UTC - 3 * 3_600;

    fn utc3() -> FixedOffset {
        FixedOffset::east_opt(3 * 3_600).unwrap()
    }

    fn bar(open_epoch: i64, close: f64) -> Candle {
        Candle::new(open_epoch, close, close, close, close, 1.0)
    }

    #[test]
    fn midnight_is_taken_in_the_configured_offset() {
        assert!(opens_day(MIDNIGHT_UTC3, utc3()));
        assert!(!opens_day(MIDNIGHT_UTC, utc3()));
        assert!(!opens_day(MIDNIGHT_UTC3 + 60, utc3()));
        assert!(opens_day(MIDNIGHT_UTC, FixedOffset::east_opt(0).unwrap()));
    }

    #[test]
    fn change_against_midnight_close() {
        let store = CandleStore::default();
        store.extend_1m([
            bar(MIDNIGHT_UTC3 - 60, 90.0),
            bar(MIDNIGHT_UTC3, 100.0),
            bar(MIDNIGHT_UTC3 + 60, 104.0),
        ]);
        let tick = Tick::new(MIDNIGHT_UTC3 + 130, 110.0, 1.0, Side::Buy);

        let ticker = build_ticker(&store, Some(tick), utc3()).unwrap();
        assert_eq!(ticker.reference_epoch, Some(MIDNIGHT_UTC3));
        assert_eq!(ticker.reference_close, 100.0);
        assert!((ticker.change_pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn newest_midnight_wins() {
        let store = CandleStore::default();
        let next_day = MIDNIGHT_UTC3 + 86_400;
        store.extend_1m([
            bar(MIDNIGHT_UTC3, 100.0),
            bar(next_day, 200.0),
            bar(next_day + 60, 150.0),
        ]);

        let ticker = build_ticker(&store, None, utc3()).unwrap();
        assert_eq!(ticker.price, 150.0);
        assert_eq!(ticker.reference_epoch, Some(next_day));
        assert!((ticker.change_pct + 25.0).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_live_price_without_midnight_bar() {
        let store = CandleStore::default();
        store.extend_1m([bar(MIDNIGHT_UTC3 + 60, 50.0)]);
        let ticker = build_ticker(&store, None, utc3()).unwrap();
        assert_eq!(ticker.reference_close, 50.0);
        assert_eq!(ticker.reference_epoch, None);
        assert_eq!(ticker.change_pct, 0.0);
    }

    #[test]
    fn zero_reference_reads_zero_change() {
        assert_eq!(change_pct(10.0, 0.0), 0.0);
        assert!((change_pct(99.0, 100.0) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn nothing_to_report_on_empty_store() {
        assert!(build_ticker(&CandleStore::default(), None, utc3()).is_none());
    }
}
