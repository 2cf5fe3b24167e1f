use axum::{debug_handler, extract::{ws::{Message, WebSocket}, State, WebSocketUpgrade}, response::IntoResponse};
use futures_util::{SinkExt, StreamExt};

use super::{key::RoomKey, protocol::{ClientEvent, ConnectionId, UserAnnouncement}, relay::ChatRelay};

#[debug_handler(state = crate::AppState)]
pub async fn chat_ws(
    State(relay): State<ChatRelay>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |stream| serve_connection(relay, stream))
}

async fn serve_connection(relay: ChatRelay, stream: WebSocket) {
    let (conn, mut rx) = relay.connect().await;
    let (mut sender, mut receiver) = stream.split();

    let mut outbound_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(%conn, "cannot encode event: {err}");
                    continue;
                }
            };

            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let inbound_relay = relay.clone();
    let mut inbound_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => handle_frame(&inbound_relay, conn, text.as_str()).await,
                Message::Close(_) => break,
                _ => continue,
            }
        }
    });

    tokio::select! {
        _ = &mut outbound_task => inbound_task.abort(),
        _ = &mut inbound_task => outbound_task.abort(),
    };

    relay.disconnect(conn).await;
}

/// Applies one inbound frame. Failures are logged and never end the connection.
pub async fn handle_frame(relay: &ChatRelay, conn: ConnectionId, text: &str) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(%conn, "dropping malformed frame: {err}");
            return;
        }
    };

    match event {
        ClientEvent::Join(room) => match room.parse::<RoomKey>() {
            Ok(room) => relay.join(conn, room).await,
            Err(err) => tracing::warn!(%conn, "join refused: {err}"),
        },
        ClientEvent::Announce(UserAnnouncement { id }) => relay.announce(conn, id).await,
        ClientEvent::CreateMessage(dto) => {
            let temp_id = dto.temp_id;
            if let Err(err) = relay.create_message(conn, dto).await {
                if err.is_validation() {
                    tracing::warn!(%conn, ?temp_id, "message refused: {err}");
                } else {
                    tracing::error!(%conn, ?temp_id, "message lost: {err}");
                }
            }
        }
    }
}
