// =============================================================================
// Tick Buffer — bounded FIFO of normalized trades
// =============================================================================
//
// Adapters append at the back, the live roll-up drains from the front. The
// buffer is shared across tokio worker threads, so every operation is a short
// critical section under a `parking_lot::Mutex` and never spans an await.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::types::Tick;

/// Default number of ticks retained before the oldest are evicted.
pub const DEFAULT_TICK_CAPACITY: usize = 6_000;

pub struct TickBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    ticks: VecDeque<Tick>,
    /// Survives draining; only `clear` forgets it.
    latest: Option<Tick>,
    /// Bumped by every `clear`, so a reader holding drained ticks can tell
    /// they belong to a previous session.
    generation: u64,
}

impl Inner {
    fn peek_front(&self) -> Option<&Tick> {
        self.ticks.front()
    }

    fn pop_front(&mut self) -> Option<Tick> {
        self.ticks.pop_front()
    }
}

impl TickBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                ticks: VecDeque::with_capacity(capacity),
                latest: None,
                generation: 0,
            }),
            capacity,
        }
    }

    /// Append a tick, silently dropping the oldest one when full.
    pub fn append(&self, tick: Tick) {
        let mut inner = self.inner.lock();
        inner.latest = Some(tick);
        let ticks = &mut inner.ticks;
        while ticks.len() >= self.capacity {
            ticks.pop_front();
        }
        ticks.push_back(tick);
    }

    /// Append a batch under one lock so a reader never sees half a frame.
    pub fn extend(&self, batch: impl IntoIterator<Item = Tick>) {
        let mut inner = self.inner.lock();
        let mut latest = inner.latest;
        let ticks = &mut inner.ticks;
        for tick in batch {
            while ticks.len() >= self.capacity {
                ticks.pop_front();
            }
            ticks.push_back(tick);
            latest = Some(tick);
        }
        inner.latest = latest;
    }

    #[cfg(test)]
    pub fn peek_front(&self) -> Option<Tick> {
        self.inner.lock().peek_front().copied()
    }

    #[cfg(test)]
    pub fn pop_front(&self) -> Option<Tick> {
        self.inner.lock().pop_front()
    }

    /// Remove and return every leading tick with `epoch_seconds < cutoff`,
    /// together with the generation they were drained from.
    ///
    /// Stops at the first tick at or past the cutoff; ticks are assumed to be
    /// in delivery order, so nothing behind it is inspected.
    pub fn drain_tagged(&self, cutoff: i64) -> (u64, Vec<Tick>) {
        let mut inner = self.inner.lock();
        let mut drained = Vec::new();
        while inner.peek_front().is_some_and(|front| front.epoch_seconds < cutoff) {
            if let Some(tick) = inner.pop_front() {
                drained.push(tick);
            }
        }
        (inner.generation, drained)
    }

    /// Most recently appended tick, even if it has since been drained.
    pub fn last(&self) -> Option<Tick> {
        self.inner.lock().latest
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ticks.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.ticks.clear();
        inner.latest = None;
        inner.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }
}

impl Default for TickBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_CAPACITY)
    }
}
