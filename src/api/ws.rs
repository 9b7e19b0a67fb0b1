// =============================================================================
// WebSocket Handler — Push-based market updates
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate MarketSnapshot on connect.
//   2. A fresh snapshot every 500 ms whenever a candle series changed or a new
//      tick arrived since the last push.
//
// The handler also responds to Ping frames with Pong frames and stamps every
// outbound message with a global sequence number.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::{AppState, MarketSnapshot};
use crate::exchanges::MarketSource;

const PUSH_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

#[derive(Serialize)]
struct Envelope {
    seq: u64,
    #[serde(flatten)]
    snapshot: MarketSnapshot,
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

/// Validates the `?token=` query parameter before upgrading.
pub async fn ws_handler<S: MarketSource>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

/// Push loop and receive loop multiplexed with `tokio::select!` until either
/// side goes away.
async fn handle_ws_connection<S: MarketSource>(socket: WebSocket, state: Arc<AppState<S>>) {
    let (mut sender, mut receiver) = socket.split();

    let mut last_sent = state.change_marker();
    if let Err(e) = send_snapshot(&mut sender, &state).await {
        warn!(error = %e, "Failed to send initial WebSocket snapshot");
        return;
    }

    let mut push_interval = interval(PUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = push_interval.tick() => {
                let current = state.change_marker();
                if current != last_sent {
                    if let Err(e) = send_snapshot(&mut sender, &state).await {
                        debug!(error = %e, "WebSocket send failed — disconnecting");
                        break;
                    }
                    last_sent = current;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

// =============================================================================
// Helpers
// =============================================================================

async fn send_snapshot<W, S>(sender: &mut W, state: &AppState<S>) -> Result<(), axum::Error>
where
    W: Sink<Message, Error = axum::Error> + Unpin,
    S: MarketSource,
{
    let envelope = Envelope {
        seq: state.next_ws_sequence(),
        snapshot: state.build_snapshot(),
    };

    match serde_json::to_string(&envelope) {
        Ok(json) => {
            sender.send(Message::Text(json)).await?;
            debug!(
                version = envelope.snapshot.version,
                seq = envelope.seq,
                "WebSocket snapshot sent"
            );
            Ok(())
        }
        Err(e) => {
            // Not a network error; keep the connection.
            warn!(error = %e, "Failed to serialize snapshot");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::stub::StubSource;
    use crate::runtime_config::RuntimeConfig;

    #[test]
    fn envelope_flattens_snapshot() {
        let state = AppState::new(RuntimeConfig::default(), StubSource::with_bars(0));
        let envelope = Envelope {
            seq: state.next_ws_sequence(),
            snapshot: state.build_snapshot(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["seq"], 1);
        assert!(json["last_tick"].is_null());
        assert!(json["ticker"].is_null());
        assert_eq!(json["candles_1m_tail"], serde_json::json!([]));
        assert_eq!(json["session"]["state"], "idle");
    }
}
