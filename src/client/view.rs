//! Display state of the open conversation.
//!
//! Sends are shown immediately as `Pending` entries and swapped in place for
//! the relay's echo once it arrives. The echo is matched on its `temp_id`
//! together with the connection that sent it, so an echo never lands on a
//! message composed by another connection of the same user.

use std::collections::HashMap;

use time::{Duration, OffsetDateTime};

use crate::{
    rooms::{ConnectionId, CreateMessageDto, OutboundMessage, RoomKey, StoredMessage},
    ChatError, EntityId, TempId, UserId,
};

/// Who wrote an entry, as far as this client can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Author {
    /// Sent over a live connection during this session.
    Live(ConnectionId),
    /// Loaded from the message log, where only the user is known.
    Historical(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Shown optimistically, waiting for the relay's echo.
    Pending { sent_at: OffsetDateTime },
    Confirmed,
    /// Gave up waiting. Only reached through [`ChatView::expire_pending`].
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub id: Option<i64>,
    pub temp_id: Option<TempId>,
    pub author: Author,
    pub author_user_id: UserId,
    pub entity_id: EntityId,
    pub text: String,
    pub created_at: OffsetDateTime,
    pub delivery: Delivery,
}

impl ChatEntry {
    fn confirmed(msg: OutboundMessage) -> Self {
        ChatEntry {
            id: Some(msg.id),
            temp_id: msg.temp_id,
            author: Author::Live(msg.author_id),
            author_user_id: msg.author_user_id,
            entity_id: msg.entity_id,
            text: msg.text,
            created_at: msg.created_at,
            delivery: Delivery::Confirmed,
        }
    }

    fn historical(msg: StoredMessage) -> Self {
        ChatEntry {
            id: Some(msg.id),
            temp_id: None,
            author: Author::Historical(msg.from_user_id),
            author_user_id: msg.from_user_id,
            entity_id: msg.entity_id,
            text: msg.text,
            created_at: msg.created_at,
            delivery: Delivery::Confirmed,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.delivery, Delivery::Pending { .. })
    }
}

/// What [`ChatView::on_incoming`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    /// Addressed to a room that is not open. The list is untouched.
    Discarded,
    /// Already on display under the same server id.
    Duplicate,
    /// Our pending entry at this index was dropped because its confirmed copy
    /// was already on display, e.g. loaded with the history.
    Settled(usize),
    /// Replaced our own pending entry at this index.
    Reconciled(usize),
    Appended(usize),
}

pub struct ChatView {
    user_id: UserId,
    entity_id: EntityId,
    connection: Option<ConnectionId>,
    room: Option<RoomKey>,
    entries: Vec<ChatEntry>,
    last_temp_id: TempId,
    unseen: HashMap<RoomKey, usize>,
}

impl ChatView {
    pub fn new(user_id: UserId, entity_id: EntityId) -> Self {
        ChatView {
            user_id,
            entity_id,
            connection: None,
            room: None,
            entries: Vec::new(),
            last_temp_id: 0,
            unseen: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Called with the id the relay hands out on every (re)connect.
    pub fn set_connection(&mut self, connection: ConnectionId) {
        self.connection = Some(connection);
    }

    pub fn room(&self) -> Option<RoomKey> {
        self.room
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    /// Opens the conversation with `peer` and empties the list.
    ///
    /// The caller joins the returned room on the relay and feeds the stored
    /// conversation to [`ChatView::load_history`].
    pub fn select_room(&mut self, peer: UserId) -> Result<RoomKey, ChatError> {
        let room = RoomKey::between(self.user_id, peer)?;
        self.room = Some(room);
        self.entries.clear();
        self.unseen.remove(&room);
        Ok(room)
    }

    /// Puts stored messages ahead of anything already shown. Ignored when
    /// another room has been opened since the fetch started. Returns how many
    /// entries were added.
    pub fn load_history(&mut self, room: RoomKey, messages: Vec<StoredMessage>) -> usize {
        if self.room != Some(room) {
            tracing::debug!(%room, "history for a room that is no longer open");
            return 0;
        }

        let history: Vec<_> = messages
            .into_iter()
            .filter(|msg| !self.entries.iter().any(|entry| entry.id == Some(msg.id)))
            .map(ChatEntry::historical)
            .collect();

        let added = history.len();
        self.entries.splice(0..0, history);
        added
    }

    pub fn on_incoming(&mut self, msg: OutboundMessage) -> Incoming {
        let room = match msg.room.parse::<RoomKey>() {
            Ok(room) => room,
            Err(err) => {
                tracing::warn!("ignoring message {}: {err}", msg.id);
                return Incoming::Discarded;
            }
        };

        if self.room != Some(room) {
            tracing::debug!(%room, id = msg.id, "message for another room");
            *self.unseen.entry(room).or_default() += 1;
            return Incoming::Discarded;
        }

        let shown = self.entries.iter().any(|entry| entry.id == Some(msg.id));

        let own_confirmation = msg.temp_id.is_some() && self.connection == Some(msg.author_id);
        if own_confirmation {
            let author = Author::Live(msg.author_id);
            let position = self.entries.iter().position(|entry| {
                entry.temp_id == msg.temp_id && entry.author == author && entry.delivery != Delivery::Confirmed
            });

            if let Some(index) = position {
                if shown {
                    self.entries.remove(index);
                    return Incoming::Settled(index);
                }
                self.entries[index] = ChatEntry::confirmed(msg);
                return Incoming::Reconciled(index);
            }
        }

        if shown {
            return Incoming::Duplicate;
        }

        self.entries.push(ChatEntry::confirmed(msg));
        Incoming::Appended(self.entries.len() - 1)
    }

    pub fn is_mine(&self, entry: &ChatEntry) -> bool {
        match entry.author {
            Author::Live(conn) => self.connection == Some(conn),
            Author::Historical(user) => user == self.user_id,
        }
    }

    pub fn send_message(&mut self, text: &str) -> Result<CreateMessageDto, ChatError> {
        self.send_message_at(text, OffsetDateTime::now_utc())
    }

    /// Inserts an optimistic entry and returns the event to emit for it.
    pub fn send_message_at(&mut self, text: &str, now: OffsetDateTime) -> Result<CreateMessageDto, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyText);
        }
        let room = self.room.ok_or(ChatError::NoRoomSelected)?;
        let connection = self.connection.ok_or(ChatError::NotConnected)?;

        let temp_id = self.next_temp_id(now);
        self.entries.push(ChatEntry {
            id: None,
            temp_id: Some(temp_id),
            author: Author::Live(connection),
            author_user_id: self.user_id,
            entity_id: self.entity_id,
            text: text.to_owned(),
            created_at: now,
            delivery: Delivery::Pending { sent_at: now },
        });

        Ok(CreateMessageDto {
            room: room.to_string(),
            text: text.to_owned(),
            author_user_id: self.user_id,
            entity_id: self.entity_id,
            temp_id: Some(temp_id),
        })
    }

    /// Milliseconds since the epoch, bumped so that ids never repeat.
    fn next_temp_id(&mut self, now: OffsetDateTime) -> TempId {
        let millis = (now.unix_timestamp_nanos() / 1_000_000) as TempId;
        self.last_temp_id = millis.max(self.last_temp_id + 1);
        self.last_temp_id
    }

    /// Marks entries pending for longer than `timeout` as failed. Returns how many changed.
    pub fn expire_pending(&mut self, now: OffsetDateTime, timeout: Duration) -> usize {
        let mut expired = 0;
        for entry in &mut self.entries {
            if let Delivery::Pending { sent_at } = entry.delivery {
                if now - sent_at >= timeout {
                    entry.delivery = Delivery::Failed;
                    expired += 1;
                }
            }
        }
        expired
    }

    pub fn retry(&mut self, temp_id: TempId) -> Result<Option<CreateMessageDto>, ChatError> {
        self.retry_at(temp_id, OffsetDateTime::now_utc())
    }

    /// Puts a failed entry back to pending and returns the event to emit again.
    /// The entry is re-attributed to the current connection so the new echo
    /// can find it. `None` when no failed entry carries `temp_id`.
    pub fn retry_at(&mut self, temp_id: TempId, now: OffsetDateTime) -> Result<Option<CreateMessageDto>, ChatError> {
        let room = self.room.ok_or(ChatError::NoRoomSelected)?;
        let connection = self.connection.ok_or(ChatError::NotConnected)?;

        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.temp_id == Some(temp_id) && entry.delivery == Delivery::Failed)
        else {
            return Ok(None);
        };

        entry.author = Author::Live(connection);
        entry.delivery = Delivery::Pending { sent_at: now };

        Ok(Some(CreateMessageDto {
            room: room.to_string(),
            text: entry.text.clone(),
            author_user_id: entry.author_user_id,
            entity_id: entry.entity_id,
            temp_id: Some(temp_id),
        }))
    }

    /// Messages received for `room` while another room was open.
    pub fn unseen(&self, room: &RoomKey) -> usize {
        self.unseen.get(room).copied().unwrap_or(0)
    }

    /// Returns the unseen count for `room` and resets it.
    pub fn take_unseen(&mut self, room: &RoomKey) -> usize {
        self.unseen.remove(room).unwrap_or(0)
    }
}
