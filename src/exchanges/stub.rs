//! In-memory [`MarketSource`] for tests: serves a fixed history and records
//! every stream it is asked to launch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{FetchError, MarketSource};
use crate::market_data::{Candle, TickBuffer};
use crate::types::Exchange;

pub(crate) const T0: i64 = 1_700_006_400;

#[derive(Default)]
pub(crate) struct StubSource {
    pub bars: Vec<Candle>,
    pub fail: AtomicBool,
    pub hang: AtomicBool,
    pub launches: Mutex<Vec<(Exchange, String, CancellationToken)>>,
}

impl StubSource {
    /// `n` contiguous 1-minute bars starting at [`T0`].
    pub fn with_bars(n: i64) -> Self {
        let bars = (0..n)
            .map(|i| {
                let p = 100.0 + i as f64;
                Candle::new(T0 + i * 60, p, p + 1.0, p - 1.0, p + 0.5, 2.0)
            })
            .collect();
        Self {
            bars,
            ..Self::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make history requests never complete.
    pub fn set_hanging(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }
}

impl MarketSource for StubSource {
    async fn fetch_1m_history(
        &self,
        _exchange: Exchange,
        _symbol: &str,
    ) -> Result<Vec<Candle>, FetchError> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(FetchError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(self.bars.clone())
    }

    fn spawn_stream(
        &self,
        exchange: Exchange,
        symbol: &str,
        _ticks: Arc<TickBuffer>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.launches
            .lock()
            .push((exchange, symbol.to_string(), cancel.clone()));
        tokio::spawn(async move { cancel.cancelled().await })
    }
}
