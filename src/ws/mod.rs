//! Subscriber transport: a thin axum WebSocket handler over the Event Bus
//! (C11). The out-of-scope "subscriber transport" contract (§1) only needs
//! a concrete instantiation for local testing; production subscribers are
//! the HTTP/UI layer's concern. Grounded in the teacher's `ws/ui.rs`
//! broadcast-forwarding idiom (subscribe, serialize, forward until the
//! socket closes), generalized with room-scoped filtering per §4.11.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::debug;

use crate::engine::Engine;
use crate::events::EventBus;

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    room: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
    Query(query): Query<SubscribeQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, engine.events.clone(), query.room))
}

async fn handle_socket(mut socket: WebSocket, events: Arc<EventBus>, room: Option<String>) {
    let room = room.unwrap_or_else(|| "all-jobs".to_string());
    match crate::events::EventBus::join_room(&room) {
        crate::events::RoomJoin::Joined => {
            let _ = socket
                .send(Message::Text(serde_json::json!({"topic": "room:joined", "room": room}).to_string().into()))
                .await;
        }
        crate::events::RoomJoin::Error => {
            let _ = socket
                .send(Message::Text(serde_json::json!({"topic": "room:error", "room": room}).to_string().into()))
                .await;
            return;
        }
    }

    let mut rx = events.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if !event.rooms().contains(&room) {
                            continue;
                        }
                        let Ok(payload) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "subscriber lagged, dropping buffered events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
