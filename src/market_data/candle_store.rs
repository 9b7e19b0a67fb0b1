use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Default number of closed candles kept per timeframe.
pub const DEFAULT_CANDLE_CAPACITY: usize = 1_500;

/// A single closed OHLCV bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_epoch: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_epoch: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_epoch,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// `low <= open, close <= high`.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
    }
}

// ---------------------------------------------------------------------------
// CandleSeries -- the lock-protected contents of the store
// ---------------------------------------------------------------------------

/// One bounded ring per timeframe plus the 1-minute bar counter.
///
/// Only reachable through [`CandleStore::with_series`] or the store's own
/// methods, so every mutation happens under the write lock.
pub struct CandleSeries {
    rings: HashMap<Timeframe, VecDeque<Candle>>,
    capacity: usize,
    /// 1-minute bars appended since the last clear of the 1m ring. Unlike the
    /// ring length it keeps counting once the ring is full.
    bar_count: u64,
}

impl CandleSeries {
    fn new(capacity: usize) -> Self {
        let rings = Timeframe::ALL
            .into_iter()
            .map(|tf| (tf, VecDeque::with_capacity(capacity)))
            .collect();
        Self {
            rings,
            capacity,
            bar_count: 0,
        }
    }

    /// Append a closed candle, trimming the oldest to stay within capacity.
    pub fn append(&mut self, tf: Timeframe, candle: Candle) {
        let capacity = self.capacity;
        let ring = self.rings.entry(tf).or_default();
        ring.push_back(candle);
        while ring.len() > capacity {
            ring.pop_front();
        }
        if tf == Timeframe::M1 {
            self.bar_count += 1;
        }
    }

    pub fn clear(&mut self, tf: Timeframe) {
        if let Some(ring) = self.rings.get_mut(&tf) {
            ring.clear();
        }
        if tf == Timeframe::M1 {
            self.bar_count = 0;
        }
    }

    pub fn ring(&self, tf: Timeframe) -> Option<&VecDeque<Candle>> {
        self.rings.get(&tf)
    }

    #[cfg(test)]
    pub fn len(&self, tf: Timeframe) -> usize {
        self.rings.get(&tf).map_or(0, VecDeque::len)
    }

    pub fn last(&self, tf: Timeframe) -> Option<Candle> {
        self.rings.get(&tf).and_then(|ring| ring.back().copied())
    }

    pub fn bar_count(&self) -> u64 {
        self.bar_count
    }

    /// The newest `count` candles of `tf`, oldest first.
    pub fn tail(&self, tf: Timeframe, count: usize) -> Vec<Candle> {
        match self.rings.get(&tf) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.range(start..).copied().collect()
            }
            None => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// CandleStore -- thread-safe handle
// ---------------------------------------------------------------------------

/// Thread-safe store holding the most recent closed candles for every
/// timeframe of the active symbol.
///
/// The 1-minute ring is the source of truth; the others can be rebuilt from
/// it at any time. Readers always receive owned copies, never a view into a
/// ring that is being written.
pub struct CandleStore {
    series: RwLock<CandleSeries>,
    version: AtomicU64,
}

impl CandleStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            series: RwLock::new(CandleSeries::new(capacity.max(1))),
            version: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub fn append(&self, tf: Timeframe, candle: Candle) {
        self.series.write().append(tf, candle);
        self.bump();
    }

    /// Load a batch of 1-minute bars in one critical section.
    pub fn extend_1m(&self, candles: impl IntoIterator<Item = Candle>) {
        let mut series = self.series.write();
        for candle in candles {
            series.append(Timeframe::M1, candle);
        }
        drop(series);
        self.bump();
    }

    #[cfg(test)]
    pub fn clear(&self, tf: Timeframe) {
        self.series.write().clear(tf);
        self.bump();
    }

    pub fn clear_all(&self) {
        let mut series = self.series.write();
        for tf in Timeframe::ALL {
            series.clear(tf);
        }
        drop(series);
        self.bump();
    }

    /// Owned copy of one timeframe, oldest first. Empty when nothing is stored.
    pub fn snapshot(&self, tf: Timeframe) -> Vec<Candle> {
        self.series
            .read()
            .ring(tf)
            .map(|ring| ring.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn tail(&self, tf: Timeframe, count: usize) -> Vec<Candle> {
        self.series.read().tail(tf, count)
    }

    pub fn last(&self, tf: Timeframe) -> Option<Candle> {
        self.series.read().last(tf)
    }

    /// Newest candle of `tf` matching `pred`.
    pub fn find_last(&self, tf: Timeframe, pred: impl Fn(&Candle) -> bool) -> Option<Candle> {
        self.series
            .read()
            .ring(tf)
            .and_then(|ring| ring.iter().rev().find(|c| pred(c)).copied())
    }

    #[cfg(test)]
    pub fn len(&self, tf: Timeframe) -> usize {
        self.series.read().len(tf)
    }

    #[cfg(test)]
    pub fn bar_count(&self) -> u64 {
        self.series.read().bar_count()
    }

    /// Run `f` with exclusive access to every ring. Used by the aggregator so
    /// that derivation reads a consistent 1-minute series and its appends land
    /// atomically with respect to readers.
    pub fn with_series<R>(&self, f: impl FnOnce(&mut CandleSeries) -> R) -> R {
        let mut series = self.series.write();
        let out = f(&mut *series);
        drop(series);
        self.bump();
        out
    }

    /// Mutation counter; push consumers compare it to detect new data.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for CandleStore {
    fn default() -> Self {
        Self::new(DEFAULT_CANDLE_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
