// =============================================================================
// History Fetcher — shared REST plumbing for the 1-minute backfill
// =============================================================================

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::market_data::Candle;

/// Upper bound on backfilled 1-minute bars (one day).
pub const HISTORY_BARS: usize = 1_440;

/// Maximum characters of an error body kept in a [`FetchError::Status`].
const MAX_ERROR_BODY: usize = 256;

/// Why a history backfill failed.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Connection failure, timeout, or an unreadable response body.
    #[error("history request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The exchange answered with a non-2xx status.
    #[error("history request returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// 2xx response carrying an exchange-level error code.
    #[error("exchange rejected history request: {0}")]
    Api(String),

    /// The payload did not have the expected shape.
    #[error("malformed history response: {0:#}")]
    Parse(anyhow::Error),
}

impl FetchError {
    /// The exchange could not be reached or answered with an HTTP error,
    /// as opposed to a well-formed rejection or an unreadable payload.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Status { .. })
    }
}

/// GET `url` with `query` and decode the JSON body. Non-2xx is an error.
pub(crate) async fn get_json(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, String)],
) -> Result<serde_json::Value, FetchError> {
    let resp = client.get(url).query(query).send().await?;
    let status = resp.status();

    if !status.is_success() {
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        return Err(FetchError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let body = resp.json::<serde_json::Value>().await?;
    debug!(url, "history response received");
    Ok(body)
}

/// Turn a venue's "code" field check into a [`FetchError::Api`].
pub(crate) fn ensure_ok(ok: bool, exchange: &str, body: &serde_json::Value) -> Result<(), FetchError> {
    if ok {
        return Ok(());
    }
    let msg = body
        .get("msg")
        .or_else(|| body.get("retMsg"))
        .or_else(|| body.get("err-msg"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown error");
    Err(FetchError::Api(format!("{exchange}: {msg}")))
}

pub(crate) fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Run a venue's history `request` and normalize the result against the time
/// the request was issued. A minute that closes while the response is in
/// flight was still forming when the venue built it, so it must not count as
/// closed.
pub(crate) async fn fetch_closed<F>(request: F) -> Result<Vec<Candle>, FetchError>
where
    F: Future<Output = Result<Vec<Candle>, FetchError>>,
{
    let requested_at = now_epoch_secs();
    let bars = request.await?;
    Ok(normalize(bars, requested_at))
}

/// Shape raw venue bars into a clean 1-minute series:
/// oldest first, one bar per `open_epoch`, only minutes that have already
/// closed at `now`, no bar whose OHLC is self-contradictory, and at most
/// [`HISTORY_BARS`] of the newest.
///
/// The still-forming minute is dropped because the live roll-up will close
/// that bucket itself.
pub fn normalize(mut bars: Vec<Candle>, now: i64) -> Vec<Candle> {
    bars.retain(|c| c.open_epoch + 60 <= now);
    let before = bars.len();
    bars.retain(Candle::is_consistent);
    if bars.len() < before {
        warn!(dropped = before - bars.len(), "history contained inconsistent bars");
    }
    bars.sort_by_key(|c| c.open_epoch);
    bars.dedup_by_key(|c| c.open_epoch);
    if bars.len() > HISTORY_BARS {
        bars.drain(..bars.len() - HISTORY_BARS);
    }
    bars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_epoch: i64) -> Candle {
        Candle::new(open_epoch, 1.0, 1.0, 1.0, 1.0, 1.0)
    }

    #[test]
    fn normalize_sorts_dedups_and_drops_open_minute() {
        let now = 600 + 30;
        let raw = vec![bar(600), bar(540), bar(480), bar(540), bar(420)];
        let opens: Vec<i64> = normalize(raw, now).iter().map(|c| c.open_epoch).collect();
        assert_eq!(opens, vec![420, 480, 540]);
    }

    #[test]
    fn normalize_keeps_newest_day() {
        let raw: Vec<Candle> = (0..2_000).map(|i| bar(i * 60)).collect();
        let out = normalize(raw, 2_000 * 60);
        assert_eq!(out.len(), HISTORY_BARS);
        assert_eq!(out.last().unwrap().open_epoch, 1_999 * 60);
        assert_eq!(out[0].open_epoch, (2_000 - 1_440) * 60);
    }

    #[test]
    fn normalize_drops_inconsistent_bars() {
        let broken = Candle::new(480, 10.0, 9.0, 8.0, 9.5, 1.0);
        let opens: Vec<i64> = normalize(vec![bar(420), broken, bar(540)], 1_000)
            .iter()
            .map(|c| c.open_epoch)
            .collect();
        assert_eq!(opens, vec![420, 540]);
    }

    #[tokio::test]
    async fn minute_closing_in_flight_is_not_kept() {
        let request = async {
            let sent = now_epoch_secs();
            // Closes one second after the request went out.
            let forming = bar(sent - 59);
            let closed = bar(sent - 120);
            tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
            Ok(vec![closed, forming])
        };
        let bars = fetch_closed(request).await.unwrap();
        assert_eq!(bars.len(), 1);
        assert!(bars[0].open_epoch + 60 < now_epoch_secs());
    }

    #[tokio::test]
    async fn fetch_closed_propagates_errors() {
        let request = async { Err(FetchError::Api("OKX: busy".into())) };
        assert!(matches!(fetch_closed(request).await, Err(FetchError::Api(_))));
    }

    #[test]
    fn normalize_empty() {
        assert!(normalize(Vec::new(), 1_000).is_empty());
    }

    #[test]
    fn ensure_ok_reports_exchange_message() {
        let body = serde_json::json!({"retCode": 10001, "retMsg": "params error"});
        let err = ensure_ok(false, "Bybit", &body).unwrap_err();
        assert!(matches!(err, FetchError::Api(ref m) if m == "Bybit: params error"));
        assert!(ensure_ok(true, "Bybit", &body).is_ok());
    }

    #[test]
    fn transport_errors_are_distinguished() {
        let status = FetchError::Status { status: 502, body: String::new() };
        assert!(status.is_transport());
        assert!(!FetchError::Api("x".into()).is_transport());
        assert!(!FetchError::Parse(anyhow::anyhow!("bad")).is_transport());
    }
}
