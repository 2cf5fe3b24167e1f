//! Wire format of the realtime channel.
//!
//! Every WebSocket text frame carries one event as `{"event": <name>, "data": <payload>}`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{EntityId, TempId, UserId};

use super::msg::StoredMessage;

/// Identifies one live transport connection. Assigned by the relay on upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ConnectionId)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageDto {
    pub room: String,
    pub text: String,
    pub author_user_id: UserId,
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
}

/// A persisted message as delivered to room members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: i64,
    pub text: String,
    pub room: String,
    /// Connection the message was sent from.
    pub author_id: ConnectionId,
    pub author_user_id: UserId,
    pub entity_id: EntityId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub is_read: bool,
}

impl OutboundMessage {
    pub fn new(stored: StoredMessage, room: String, author_id: ConnectionId, temp_id: Option<TempId>) -> Self {
        OutboundMessage {
            id: stored.id,
            text: stored.text,
            room,
            author_id,
            author_user_id: stored.from_user_id,
            entity_id: stored.entity_id,
            created_at: stored.created_at,
            temp_id,
            from_user_id: stored.from_user_id,
            to_user_id: stored.to_user_id,
            is_read: stored.is_read,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAnnouncement {
    pub id: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Subscribe this connection to a room.
    Join(String),
    /// Register the user behind this connection.
    Announce(UserAnnouncement),
    CreateMessage(CreateMessageDto),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// First event on every connection.
    Connected(Hello),
    NewMessage(OutboundMessage),
    UpdateOnlineUsers(Vec<UserId>),
}
