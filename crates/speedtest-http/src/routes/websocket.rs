//! WebSocket jitter echo.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use speedtest_service::events::{TestKind, TestOutcome};

use crate::client::ClientId;
use crate::state::AppState;
use crate::types::WsEcho;

use super::speed::unix_nanos;

/// WebSocket upgrade handler.
///
/// The upgrade bypasses the admission gate but not the client limiter, which
/// runs once on the upgrade request.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    client: ClientId,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, client))
}

async fn handle_socket(socket: WebSocket, state: AppState, client: ClientId) {
    let session = state.begin_test(TestKind::WebSocket, client.as_str());
    let shutdown = state.request_token();
    let (mut sender, mut receiver) = socket.split();
    let mut bytes = 0u64;

    let outcome = loop {
        let msg = tokio::select! {
            () = shutdown.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break TestOutcome::Cancelled;
            }
            msg = receiver.next() => msg,
        };

        let reply = match msg {
            Some(Ok(Message::Text(text))) => {
                bytes += text.as_str().len() as u64;
                Message::Text(echo(text.as_str()).into())
            }
            Some(Ok(Message::Binary(data))) => {
                bytes += data.len() as u64;
                Message::Binary(echo(&String::from_utf8_lossy(&data)).into())
            }
            Some(Ok(Message::Ping(data))) => Message::Pong(data),
            Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break TestOutcome::Completed,
            Some(Err(e)) => {
                tracing::debug!(client = client.as_str(), "WebSocket receive error: {e}");
                break TestOutcome::Disconnected;
            }
        };

        if sender.send(reply).await.is_err() {
            break TestOutcome::Disconnected;
        }
    };

    session.finish(outcome, bytes);
    tracing::debug!(client = client.as_str(), "WebSocket connection closed");
}

/// Serializes the echo reply for `message`.
fn echo(message: &str) -> String {
    let reply = WsEcho {
        timestamp: unix_nanos(),
        echo: message.to_string(),
    };
    serde_json::to_string(&reply).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_wraps_message_with_timestamp() {
        let reply: WsEcho = serde_json::from_str(&echo("jitter-1")).unwrap();
        assert_eq!(reply.echo, "jitter-1");
        assert!(reply.timestamp > 0);
    }
}
