// =============================================================================
// WebSocket trade feed runner — connect, subscribe, parse, reconnect
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::market_data::TickBuffer;
use crate::types::{Exchange, Tick};

/// What a single inbound frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Zero or more normalized trades.
    Trades(Vec<Tick>),
    /// A message that must be echoed back immediately (application pings).
    Reply(String),
    /// Acks, pongs and other frames with nothing to do.
    Ignore,
}

/// Per-venue WebSocket protocol.
pub trait TradeFeed: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;

    fn url(&self, symbol: &str) -> String;

    /// Message sent right after connecting, if the venue needs one.
    fn subscribe(&self, _symbol: &str) -> Option<String> {
        None
    }

    /// Application-level keep-alive: period and text payload.
    fn keepalive(&self) -> Option<(Duration, String)> {
        None
    }

    /// Turn a raw frame into text. The default accepts text frames only;
    /// control frames are handled by tungstenite.
    fn decode(&self, msg: Message) -> Result<Option<String>> {
        match msg {
            Message::Text(text) => Ok(Some(text)),
            _ => Ok(None),
        }
    }

    fn parse(&self, text: &str) -> Result<FeedEvent>;
}

/// Run one connection until it errors or the server closes it.
///
/// Malformed frames are logged and skipped; only transport failures end the
/// session. Trades inside one frame are appended under a single lock.
pub async fn run_session<F: TradeFeed>(feed: &F, symbol: &str, ticks: &TickBuffer) -> Result<()> {
    let exchange = feed.exchange();
    let url = feed.url(symbol);
    info!(%exchange, symbol, url = %url, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {exchange} trade WebSocket"))?;
    let (mut write, mut read) = ws_stream.split();

    if let Some(sub) = feed.subscribe(symbol) {
        write
            .send(Message::Text(sub))
            .await
            .with_context(|| format!("failed to subscribe to {exchange} trades"))?;
    }
    info!(%exchange, symbol, "trade WebSocket connected");

    let keepalive = feed.keepalive();
    let period = keepalive
        .as_ref()
        .map_or(Duration::from_secs(3_600), |(period, _)| *period);
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(msg)) => {
                    let text = match feed.decode(msg) {
                        Ok(Some(text)) => text,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(%exchange, error = %e, "failed to decode frame");
                            continue;
                        }
                    };
                    match feed.parse(&text) {
                        Ok(FeedEvent::Trades(mut batch)) => {
                            batch.retain(Tick::is_valid);
                            batch.sort_by_key(|t| t.epoch_seconds);
                            ticks.extend(batch);
                        }
                        Ok(FeedEvent::Reply(reply)) => {
                            debug!(%exchange, "answering keep-alive");
                            write
                                .send(Message::Text(reply))
                                .await
                                .context("failed to send keep-alive reply")?;
                        }
                        Ok(FeedEvent::Ignore) => {}
                        Err(e) => {
                            warn!(%exchange, error = %e, "failed to parse trade message");
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(%exchange, symbol, error = %e, "trade WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(%exchange, symbol, "trade WebSocket stream ended");
                    return Ok(());
                }
            },
            _ = ping.tick(), if keepalive.is_some() => {
                if let Some((_, payload)) = &keepalive {
                    write
                        .send(Message::Text(payload.clone()))
                        .await
                        .context("failed to send keep-alive")?;
                }
            }
        }
    }
}

/// Keep `feed` streaming forever, waiting `backoff` between sessions.
/// Returns only once `cancel` fires.
pub async fn run_with_reconnect<F: TradeFeed>(
    feed: F,
    symbol: String,
    ticks: Arc<TickBuffer>,
    cancel: CancellationToken,
    backoff: Duration,
) {
    let exchange = feed.exchange();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = run_session(&feed, &symbol, &ticks) => {
                if let Err(e) = result {
                    error!(%exchange, symbol = %symbol, error = %e, "trade stream error — reconnecting in {}s", backoff.as_secs());
                } else {
                    warn!(%exchange, symbol = %symbol, "trade stream closed — reconnecting in {}s", backoff.as_secs());
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
    info!(%exchange, symbol = %symbol, "trade stream stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unreachable;

    impl TradeFeed for Unreachable {
        fn exchange(&self) -> Exchange {
            Exchange::Binance
        }

        fn url(&self, _symbol: &str) -> String {
            "ws://127.0.0.1:9/never".to_string()
        }

        fn parse(&self, _text: &str) -> Result<FeedEvent> {
            Ok(FeedEvent::Ignore)
        }
    }

    #[test]
    fn default_decode_only_accepts_text() {
        let feed = Unreachable;
        assert_eq!(feed.decode(Message::Text("x".into())).unwrap(), Some("x".into()));
        assert_eq!(feed.decode(Message::Binary(vec![1, 2])).unwrap(), None);
        assert!(feed.subscribe("BTCUSDT").is_none());
        assert!(feed.keepalive().is_none());
    }

    #[tokio::test]
    async fn failed_connect_is_an_error() {
        let ticks = TickBuffer::new(10);
        assert!(run_session(&Unreachable, "BTCUSDT", &ticks).await.is_err());
    }

    #[tokio::test]
    async fn reconnect_loop_exits_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_with_reconnect(
            Unreachable,
            "BTCUSDT".into(),
            Arc::new(TickBuffer::new(10)),
            cancel.clone(),
            Duration::from_secs(60),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("adapter ignored cancellation")
            .unwrap();
    }
}
