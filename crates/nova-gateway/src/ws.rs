use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use nova_agents::LifecycleEvent;

use crate::state::SharedState;

/// Clients only send control frames; anything larger is refused.
pub const MAX_WS_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Only forward events for this conversation.
    pub conversation_id: Option<String>,
}

/// GET /ws: live feed of turn lifecycle events.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_WS_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: SharedState, params: WsParams) {
    // Subscribe before the welcome frame so no event published after it is missed.
    let mut events = state.pipeline.events().subscribe();
    let (mut sender, mut receiver) = socket.split();

    let welcome = serde_json::json!({
        "type": "connected",
        "version": env!("CARGO_PKG_VERSION"),
        "conversation_id": params.conversation_id,
    });
    if sender
        .send(Message::Text(welcome.to_string().into()))
        .await
        .is_err()
    {
        return;
    }
    info!(filter = ?params.conversation_id, "ws client connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if !wanted(&event, params.conversation_id.as_deref()) {
                        continue;
                    }
                    let frame = match serde_json::to_string(&event) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("failed to encode lifecycle event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "ws subscriber lagged, events skipped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(payload))) => {
                    if sender.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("ws receive error: {}", e);
                    break;
                }
            },
        }
    }

    info!("ws client disconnected");
}

fn wanted(event: &LifecycleEvent, conversation_id: Option<&str>) -> bool {
    conversation_id.is_none_or(|id| event.conversation_id.as_str() == id)
}
