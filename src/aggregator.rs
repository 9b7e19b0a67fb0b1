// =============================================================================
// Aggregation Engine — 1-minute bars from ticks, higher timeframes from bars
// =============================================================================
//
// Two entry points:
//
//   * `rollup_from_scratch` rebuilds every derived series from the 1-minute
//     series after a history load.
//   * `run_live_rollup` closes one 1-minute candle per wall-clock minute from
//     the ticks that arrived during it, then extends the derived series.
//
// Derived candles are emitted when the 1-minute bar counter is a multiple of
// the timeframe ratio, so their boundaries are anchored to the first bar of
// the series rather than to UTC.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::market_data::{Candle, CandleSeries, CandleStore, TickBuffer};
use crate::types::{Tick, Timeframe};

/// How often the live roll-up drains the tick buffer while waiting for the
/// next minute boundary.
const DRAIN_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Combine a contiguous window of lower-timeframe candles into one.
pub fn rollup_window(window: &[Candle]) -> Option<Candle> {
    let first = window.first()?;
    let last = window.last()?;
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0.0;
    for c in window {
        high = high.max(c.high);
        low = low.min(c.low);
        volume += c.volume;
    }
    Some(Candle::new(first.open_epoch, first.open, high, low, last.close, volume))
}

/// Build the 1-minute candle for the bucket starting at `open_epoch`.
///
/// Zero-quantity ticks move the price extremes but add no volume. Returns
/// `None` for an empty bucket: quiet minutes leave a gap.
pub fn candle_from_ticks(open_epoch: i64, ticks: &[Tick]) -> Option<Candle> {
    let first = ticks.first()?;
    let last = ticks.last()?;
    let mut high = f64::MIN;
    let mut low = f64::MAX;
    let mut volume = 0.0;
    for t in ticks {
        high = high.max(t.price);
        low = low.min(t.price);
        volume += t.quantity;
    }
    Some(Candle::new(open_epoch, first.price, high, low, last.price, volume))
}

/// Start of the minute after `now` (epoch seconds).
pub fn next_minute_boundary(now: i64) -> i64 {
    (now.div_euclid(60) + 1) * 60
}

fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// Roll-ups over the candle series
// ---------------------------------------------------------------------------

/// Derive one `tf` candle from the newest `tf.ratio()` 1-minute bars.
/// No-op when fewer bars than the ratio are stored.
fn derive_latest(series: &mut CandleSeries, tf: Timeframe) -> bool {
    let window = series.tail(Timeframe::M1, tf.ratio());
    if window.len() < tf.ratio() {
        return false;
    }
    match rollup_window(&window) {
        Some(candle) => {
            series.append(tf, candle);
            true
        }
        None => false,
    }
}

/// Clear every derived series and rebuild it from the 1-minute series.
///
/// Walks the 1-minute bars in order and, after every `k`-th bar, rolls up the
/// `k` bars ending there. Running it twice yields the same derived series.
pub fn rollup_from_scratch(series: &mut CandleSeries) {
    for tf in Timeframe::DERIVED {
        series.clear(tf);
    }
    let bars = series.tail(Timeframe::M1, usize::MAX);
    for tf in Timeframe::DERIVED {
        let k = tf.ratio();
        for end in (k..=bars.len()).step_by(k) {
            if let Some(candle) = rollup_window(&bars[end - k..end]) {
                series.append(tf, candle);
            }
        }
    }
}

/// Append a freshly closed 1-minute candle and extend every derived series
/// whose ratio divides the new bar count.
///
/// Returns `false` when the bucket is not strictly newer than the last stored
/// bar; the candle is dropped in that case so the 1-minute series never holds
/// duplicates.
pub fn append_minute(series: &mut CandleSeries, candle: Candle) -> bool {
    if let Some(last) = series.last(Timeframe::M1) {
        if candle.open_epoch <= last.open_epoch {
            return false;
        }
    }
    series.append(Timeframe::M1, candle);
    let count = series.bar_count();
    for tf in Timeframe::DERIVED {
        if count % tf.ratio() as u64 == 0 && derive_latest(series, tf) {
            debug!(timeframe = %tf, bars = count, "derived candle appended");
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns handles to both stores and runs the per-minute roll-up.
pub struct Aggregator {
    ticks: Arc<TickBuffer>,
    candles: Arc<CandleStore>,
}

impl Aggregator {
    pub fn new(ticks: Arc<TickBuffer>, candles: Arc<CandleStore>) -> Self {
        Self { ticks, candles }
    }

    /// Rebuild all derived timeframes from the stored 1-minute series.
    pub fn rebuild_derived(&self) {
        self.candles.with_series(rollup_from_scratch);
    }

    /// Close the bucket ending at `boundary` from the ticks collected for it.
    /// Returns the appended candle, if any.
    pub fn close_bucket(&self, boundary: i64, collected: &[Tick]) -> Option<Candle> {
        let open_epoch = boundary - 60;
        let Some(candle) = candle_from_ticks(open_epoch, collected) else {
            debug!(open_epoch, "no ticks during minute; leaving a gap");
            return None;
        };
        let appended = self.candles.with_series(|series| append_minute(series, candle));
        if appended {
            debug!(
                open_epoch,
                close = candle.close,
                volume = candle.volume,
                ticks = collected.len(),
                "1m candle closed"
            );
            Some(candle)
        } else {
            warn!(open_epoch, "bucket is not newer than the last stored bar; dropped");
            None
        }
    }

    /// Drain ticks that belong before `boundary` until `now()` reaches it,
    /// then close the bucket.
    async fn collect_bucket(
        &self,
        boundary: i64,
        now: impl Fn() -> i64,
        cancel: &CancellationToken,
    ) -> Option<Candle> {
        let mut collected: Vec<Tick> = Vec::new();
        let mut generation = self.ticks.generation();
        loop {
            let (drained_from, batch) = self.ticks.drain_tagged(boundary);
            if drained_from != generation {
                // The buffer was reset mid-minute; what we hold belongs to the
                // previous symbol.
                collected.clear();
                generation = drained_from;
            }
            collected.extend(batch);
            if now() >= boundary {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(DRAIN_INTERVAL) => {}
            }
        }
        if self.ticks.generation() != generation {
            debug!(boundary, "tick buffer reset at the boundary; discarding bucket");
            return None;
        }
        self.close_bucket(boundary, &collected)
    }

    async fn run_one_minute(&self, cancel: &CancellationToken) -> Option<Candle> {
        let boundary = next_minute_boundary(now_epoch_secs());
        self.collect_bucket(boundary, now_epoch_secs, cancel).await
    }

    /// Process-lifetime roll-up loop. Only returns once `cancel` fires.
    pub async fn run_live_rollup(self: Arc<Self>, cancel: CancellationToken) {
        info!("live roll-up started");
        while !cancel.is_cancelled() {
            self.run_one_minute(&cancel).await;
        }
        info!("live roll-up stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
