//! Live hall map over WebSocket
//!
//! Server -> Client (JSON):
//! ```json
//! {"type": "snapshot", "computers": [...]}
//! {"type": "status", "computer_id": "PC-07", "status": "reserved", "reservation_id": "...", "version": 3, "timestamp": "..."}
//! ```
//!
//! The client only listens; anything it sends other than a close frame is ignored.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};

use crate::api::middleware::AppState;
use crate::services::Subscription;

/// WebSocket upgrade handler for `GET /computers/live`
pub async fn live_map(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| {
        let subscription = state.broadcaster.subscribe();
        stream_updates(socket, subscription)
    })
}

async fn stream_updates(socket: WebSocket, mut subscription: Subscription) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    tracing::debug!("Map viewer connected");

    loop {
        tokio::select! {
            update = subscription.next() => {
                let Some(update) = update else { break };
                let text = match serde_json::to_string(&update) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode map update: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    tracing::debug!("Map viewer disconnected");
}
