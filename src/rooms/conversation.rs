use axum::{debug_handler, extract::{Path, State}, Json};
use serde::{Deserialize, Serialize};

use crate::{AppResult, UserId};

use super::{msg::{MessageStore, StoredMessage}, relay::ChatRelay};

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCount {
    pub count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkedRead {
    pub updated: u64,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn conversation(
    Path((user_id, other_user_id)): Path<(UserId, UserId)>,
    State(store): State<MessageStore>,
) -> AppResult<Json<Vec<StoredMessage>>> {
    Ok(Json(store.find_conversation(user_id, other_user_id).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn unread_count(
    Path(user_id): Path<UserId>,
    State(store): State<MessageStore>,
) -> AppResult<Json<UnreadCount>> {
    let count = store.count_unread(user_id).await?;
    Ok(Json(UnreadCount { count }))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn mark_as_read(
    Path((user_id, other_user_id)): Path<(UserId, UserId)>,
    State(store): State<MessageStore>,
) -> AppResult<Json<MarkedRead>> {
    let updated = store.mark_read(user_id, other_user_id).await?;
    tracing::debug!(user_id, other_user_id, updated, "marked as read");
    Ok(Json(MarkedRead { updated }))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn online_users(State(relay): State<ChatRelay>) -> Json<Vec<UserId>> {
    Json(relay.online_users().await)
}
