mod conversation;
mod key;
mod msg;
mod protocol;
mod relay;
mod ws;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub use conversation::{MarkedRead, UnreadCount};
pub use key::RoomKey;
pub use msg::{MessageStore, NewMessage, StoredMessage};
pub use protocol::{ClientEvent, ConnectionId, CreateMessageDto, Hello, OutboundMessage, ServerEvent, UserAnnouncement};
pub use relay::ChatRelay;
pub use ws::handle_frame;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/conversation/{user_id}/{other_user_id}", get(conversation::conversation))
        .route("/unread-count/{user_id}", get(conversation::unread_count))
        .route("/mark-as-read/{user_id}/{other_user_id}", post(conversation::mark_as_read))
        .route("/online-users", get(conversation::online_users))
        .route("/ws", get(ws::chat_ws))
}
