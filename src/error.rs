use thiserror::Error;

use crate::UserId;

/// Failures of the chat path, shared by the relay, the store and the client view.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid room {0:?}")]
    InvalidRoom(String),

    #[error("user {author} is not a participant of room {room}")]
    RecipientResolution { author: UserId, room: String },

    #[error("message text is empty")]
    EmptyText,

    #[error("no room selected")]
    NoRoomSelected,

    #[error("not connected to the relay")]
    NotConnected,

    #[error("persistence failure: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl ChatError {
    /// Errors caused by the caller's input rather than by the server.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ChatError::InvalidRoom(_)
                | ChatError::RecipientResolution { .. }
                | ChatError::EmptyText
                | ChatError::NoRoomSelected
        )
    }
}
