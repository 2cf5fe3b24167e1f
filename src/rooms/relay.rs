use std::{collections::{HashMap, HashSet}, sync::Arc};

use tokio::sync::{mpsc, Mutex};

use crate::{ChatError, UserId};

use super::{
    key::RoomKey,
    msg::{MessageStore, NewMessage},
    protocol::{ConnectionId, CreateMessageDto, Hello, OutboundMessage, ServerEvent},
};

/// Events a connection may have waiting before further ones are dropped.
pub const CONNECTION_QUEUE: usize = 64;

/// Routes messages between connections.
///
/// Owns the only copy of the room membership table and the user → connection
/// registry. Both live for the process lifetime and start empty.
#[derive(Clone)]
pub struct ChatRelay {
    state: Arc<Mutex<RelayState>>,
    store: MessageStore,
}

#[derive(Default)]
struct RelayState {
    connections: HashMap<ConnectionId, mpsc::Sender<ServerEvent>>,
    rooms: HashMap<RoomKey, HashSet<ConnectionId>>,
    registry: HashMap<UserId, ConnectionId>,
}

impl RelayState {
    fn send_to(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let Some(tx) = self.connections.get(&conn) else {
            return false;
        };

        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%conn, "connection is not keeping up, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn publish(&self, room: &RoomKey, msg: &OutboundMessage) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };

        members
            .iter()
            .filter(|conn| self.send_to(**conn, ServerEvent::NewMessage(msg.clone())))
            .count()
    }

    fn notify(&self, user: UserId, msg: &OutboundMessage) -> bool {
        match self.registry.get(&user) {
            Some(conn) => self.send_to(*conn, ServerEvent::NewMessage(msg.clone())),
            None => false,
        }
    }

    fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.registry.keys().copied().collect();
        users.sort_unstable();
        users
    }

    fn broadcast_online(&self) {
        let users = self.online_users();
        for conn in self.connections.keys() {
            self.send_to(*conn, ServerEvent::UpdateOnlineUsers(users.clone()));
        }
    }
}

impl ChatRelay {
    pub fn new(store: MessageStore) -> Self {
        ChatRelay {
            state: Arc::default(),
            store,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Registers a new connection. The receiver yields every event addressed
    /// to it, starting with [`ServerEvent::Connected`].
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);
        let _ = tx.try_send(ServerEvent::Connected(Hello { connection_id: conn }));

        self.state.lock().await.connections.insert(conn, tx);
        tracing::debug!(%conn, "connection opened");
        (conn, rx)
    }

    pub async fn join(&self, conn: ConnectionId, room: RoomKey) {
        let mut state = self.state.lock().await;
        if !state.connections.contains_key(&conn) {
            tracing::warn!(%conn, %room, "join from unknown connection");
            return;
        }

        if state.rooms.entry(room).or_default().insert(conn) {
            tracing::debug!(%conn, %room, "joined room");
        }
    }

    /// Records that `user` is reachable on `conn`. A later announcement for the
    /// same user replaces the earlier connection.
    pub async fn announce(&self, conn: ConnectionId, user: UserId) {
        let mut state = self.state.lock().await;
        if !state.connections.contains_key(&conn) {
            tracing::warn!(%conn, user, "announcement from unknown connection");
            return;
        }

        state.registry.insert(user, conn);
        tracing::info!(%conn, user, "user online");
        state.broadcast_online();
    }

    /// Validates, persists and delivers a message.
    ///
    /// Every member of the room gets it, the sender included, since the echoed
    /// `temp_id` is how the sender learns its message was stored. If the
    /// recipient is online but has not joined the room it is notified directly.
    /// Nothing is delivered when any step fails.
    pub async fn create_message(&self, conn: ConnectionId, dto: CreateMessageDto) -> Result<OutboundMessage, ChatError> {
        let CreateMessageDto { room, text, author_user_id, entity_id, temp_id } = dto;

        if text.trim().is_empty() {
            return Err(ChatError::EmptyText);
        }
        let room: RoomKey = room.parse()?;
        let to_user_id = room.peer_of(author_user_id)?;

        // the lock is not held while the store works
        let stored = self.store
            .append(NewMessage {
                from_user_id: author_user_id,
                to_user_id,
                entity_id,
                text,
            })
            .await?;

        let msg = OutboundMessage::new(stored, room.to_string(), conn, temp_id);

        let state = self.state.lock().await;
        let delivered = state.publish(&room, &msg);

        let recipient_in_room = state
            .registry
            .get(&to_user_id)
            .is_some_and(|peer| state.rooms.get(&room).is_some_and(|members| members.contains(peer)));
        let notified = !recipient_in_room && state.notify(to_user_id, &msg);

        tracing::debug!(id = msg.id, %room, delivered, notified, "message relayed");
        Ok(msg)
    }

    /// Sends `msg` to every connection joined to `room`. Returns how many were reached.
    pub async fn publish(&self, room: &RoomKey, msg: &OutboundMessage) -> usize {
        self.state.lock().await.publish(room, msg)
    }

    /// Sends `msg` to the connection registered for `user`. `false` means the
    /// user is offline and the notification was dropped.
    pub async fn notify(&self, user: UserId, msg: &OutboundMessage) -> bool {
        self.state.lock().await.notify(user, msg)
    }

    pub async fn disconnect(&self, conn: ConnectionId) {
        let mut state = self.state.lock().await;
        state.connections.remove(&conn);

        state.rooms.retain(|_, members| {
            members.remove(&conn);
            !members.is_empty()
        });

        let registered = state.registry.len();
        state.registry.retain(|_, registered_conn| *registered_conn != conn);
        if state.registry.len() != registered {
            state.broadcast_online();
        }

        tracing::debug!(%conn, "connection closed");
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.state.lock().await.online_users()
    }

    pub async fn room_size(&self, room: &RoomKey) -> usize {
        self.state.lock().await.rooms.get(room).map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn relay() -> ChatRelay {
        ChatRelay::new(MessageStore::new(db::memory_pool().await.unwrap()))
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn messages(events: &[ServerEvent]) -> Vec<&OutboundMessage> {
        events
            .iter()
            .filter_map(|event| match event {
                ServerEvent::NewMessage(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn dto(room: &str, author: UserId, text: &str, temp_id: Option<i64>) -> CreateMessageDto {
        CreateMessageDto {
            room: room.to_owned(),
            text: text.to_owned(),
            author_user_id: author,
            entity_id: 2,
            temp_id,
        }
    }

    #[tokio::test]
    async fn connect_says_hello_first() {
        let relay = relay().await;
        let (conn, mut rx) = relay.connect().await;
        assert_eq!(
            drain(&mut rx),
            [ServerEvent::Connected(Hello { connection_id: conn })]
        );
    }

    #[tokio::test]
    async fn first_message_in_a_new_room() {
        let relay = relay().await;
        let room = RoomKey::between(3, 7).unwrap();

        let (alice, mut alice_rx) = relay.connect().await;
        let (bob, mut bob_rx) = relay.connect().await;
        relay.join(alice, room).await;
        relay.join(bob, room).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        assert!(relay.store().find_conversation(3, 7).await.unwrap().is_empty());

        let msg = relay.create_message(alice, dto("3_7", 3, "hola", Some(41))).await.unwrap();
        assert_eq!(msg.author_id, alice);
        assert_eq!(msg.temp_id, Some(41));
        assert_eq!(msg.room, "3_7");

        let stored = relay.store().find_conversation(3, 7).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!((stored[0].from_user_id, stored[0].to_user_id), (3, 7));
        assert_eq!(stored[0].text, "hola");

        let alice_events = drain(&mut alice_rx);
        let bob_events = drain(&mut bob_rx);
        assert_eq!(messages(&alice_events), [&msg]);
        assert_eq!(messages(&bob_events), [&msg]);
    }

    #[tokio::test]
    async fn non_members_do_not_receive_room_traffic() {
        let relay = relay().await;
        let (alice, mut alice_rx) = relay.connect().await;
        let (carol, mut carol_rx) = relay.connect().await;
        relay.join(alice, RoomKey::between(3, 7).unwrap()).await;
        relay.join(carol, RoomKey::between(9, 7).unwrap()).await;
        drain(&mut alice_rx);
        drain(&mut carol_rx);

        relay.create_message(alice, dto("7_3", 3, "hola", None)).await.unwrap();

        assert_eq!(messages(&drain(&mut alice_rx)).len(), 1);
        assert!(drain(&mut carol_rx).is_empty());
    }

    #[tokio::test]
    async fn rejects_bad_input_without_side_effects() {
        let relay = relay().await;
        let (alice, mut alice_rx) = relay.connect().await;
        relay.join(alice, RoomKey::between(3, 7).unwrap()).await;
        drain(&mut alice_rx);

        let err = relay.create_message(alice, dto("3-7", 3, "hola", None)).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidRoom(_)));

        let err = relay.create_message(alice, dto("3_7", 4, "hola", None)).await.unwrap_err();
        assert!(matches!(err, ChatError::RecipientResolution { author: 4, .. }));

        let err = relay.create_message(alice, dto("3_7", 3, "   ", None)).await.unwrap_err();
        assert!(matches!(err, ChatError::EmptyText));

        assert!(drain(&mut alice_rx).is_empty());
        assert!(relay.store().find_conversation(3, 7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_broadcasts_nothing() {
        let db_pool = db::memory_pool().await.unwrap();
        let relay = ChatRelay::new(MessageStore::new(db_pool.clone()));
        let (alice, mut alice_rx) = relay.connect().await;
        relay.join(alice, RoomKey::between(3, 7).unwrap()).await;
        drain(&mut alice_rx);

        db_pool.close().await;

        let err = relay.create_message(alice, dto("3_7", 3, "hola", Some(1))).await.unwrap_err();
        assert!(matches!(err, ChatError::Persistence(_)));
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn recipient_outside_the_room_is_notified_directly() {
        let relay = relay().await;
        let (alice, mut alice_rx) = relay.connect().await;
        let (bob, mut bob_rx) = relay.connect().await;
        relay.announce(bob, 7).await;
        relay.join(alice, RoomKey::between(3, 7).unwrap()).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let msg = relay.create_message(alice, dto("3_7", 3, "hola", None)).await.unwrap();
        assert_eq!(messages(&drain(&mut bob_rx)), [&msg]);
        assert_eq!(messages(&drain(&mut alice_rx)), [&msg]);
    }

    #[tokio::test]
    async fn recipient_in_the_room_gets_one_copy() {
        let relay = relay().await;
        let (alice, mut alice_rx) = relay.connect().await;
        let (bob, mut bob_rx) = relay.connect().await;
        let room = RoomKey::between(3, 7).unwrap();
        relay.announce(bob, 7).await;
        relay.join(alice, room).await;
        relay.join(bob, room).await;
        relay.join(bob, room).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);
        assert_eq!(relay.room_size(&room).await, 2);

        relay.create_message(alice, dto("3_7", 3, "hola", None)).await.unwrap();
        assert_eq!(messages(&drain(&mut bob_rx)).len(), 1);
    }

    #[tokio::test]
    async fn notify_offline_user_is_dropped() {
        let relay = relay().await;
        let (alice, _alice_rx) = relay.connect().await;
        relay.join(alice, RoomKey::between(3, 7).unwrap()).await;

        let msg = relay.create_message(alice, dto("3_7", 3, "hola", None)).await.unwrap();
        assert!(!relay.notify(7, &msg).await);

        // still durable for the next conversation fetch
        assert_eq!(relay.store().count_unread(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn presence_tracks_announce_and_disconnect() {
        let relay = relay().await;
        let (alice, mut alice_rx) = relay.connect().await;
        let (bob, mut bob_rx) = relay.connect().await;
        let room = RoomKey::between(3, 7).unwrap();
        relay.join(bob, room).await;

        relay.announce(alice, 3).await;
        relay.announce(bob, 7).await;
        assert_eq!(relay.online_users().await, [3, 7]);

        let alice_events = drain(&mut alice_rx);
        assert_eq!(alice_events.last(), Some(&ServerEvent::UpdateOnlineUsers(vec![3, 7])));
        drain(&mut bob_rx);

        relay.disconnect(bob).await;
        assert_eq!(relay.online_users().await, [3]);
        assert_eq!(relay.room_size(&room).await, 0);
        assert_eq!(drain(&mut alice_rx), [ServerEvent::UpdateOnlineUsers(vec![3])]);

        let (carol, _) = relay.connect().await;
        let msg = relay.create_message(carol, dto("3_7", 3, "hola", None)).await.unwrap();
        assert!(!relay.notify(7, &msg).await);
        assert_eq!(relay.publish(&room, &msg).await, 0);
    }

    #[tokio::test]
    async fn reannounce_moves_user_to_new_connection() {
        let relay = relay().await;
        let (old, _old_rx) = relay.connect().await;
        let (new, _new_rx) = relay.connect().await;
        relay.announce(old, 3).await;
        relay.announce(new, 3).await;

        relay.disconnect(old).await;
        assert_eq!(relay.online_users().await, [3]);
    }

    #[tokio::test]
    async fn stalled_connection_does_not_grow_without_bound() {
        let relay = relay().await;
        let room = RoomKey::between(3, 7).unwrap();
        let (alice, mut alice_rx) = relay.connect().await;
        let (bob, mut bob_rx) = relay.connect().await;
        relay.join(alice, room).await;
        relay.join(bob, room).await;
        drain(&mut alice_rx);

        let msg = relay.create_message(alice, dto("3_7", 3, "hola", None)).await.unwrap();
        // bob never reads: his queue already holds the greeting and one message
        for _ in 2..CONNECTION_QUEUE {
            assert_eq!(relay.publish(&room, &msg).await, 2);
            drain(&mut alice_rx);
        }
        assert_eq!(relay.publish(&room, &msg).await, 1);
        assert_eq!(drain(&mut bob_rx).len(), CONNECTION_QUEUE);

        // drained, bob is reachable again
        assert_eq!(relay.publish(&room, &msg).await, 2);
    }

    #[tokio::test]
    async fn unknown_connection_cannot_join() {
        let relay = relay().await;
        let room = RoomKey::between(3, 7).unwrap();
        relay.join(ConnectionId::new(), room).await;
        assert_eq!(relay.room_size(&room).await, 0);
    }
}
