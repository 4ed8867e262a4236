use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use flowrun_engine::LogSubscription;

/// Forward a run's log events to one WebSocket client.
///
/// Each event goes out as a JSON text frame. The socket is closed after the
/// completion marker, or earlier if the client goes away.
pub async fn forward_logs(ws: WebSocket, mut subscription: LogSubscription) {
    let run_id = subscription.run_id().clone();
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "Failed to encode log event");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    debug!(run_id = %run_id, "Log client went away");
                    return;
                }
                if event.is_completion() {
                    break;
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(run_id = %run_id, "Log client closed");
                    return;
                }
                Some(Err(e)) => {
                    debug!(run_id = %run_id, error = %e, "WebSocket read error");
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    debug!(run_id = %run_id, "Log stream finished");
}
