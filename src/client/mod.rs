//! Terminal chat client.
//!
//! [`ChatView`] holds the display state; this module wires it to the relay
//! socket and the conversation API.

mod view;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{header::AUTHORIZATION, HeaderValue},
    Message,
};

use crate::{
    rooms::{ClientEvent, MarkedRead, RoomKey, ServerEvent, StoredMessage, UnreadCount, UserAnnouncement},
    EntityId, UserId,
};

pub use view::{Author, ChatEntry, ChatView, Delivery, Incoming};

/// HTTP side of the chat: history, unread counters, read receipts.
#[derive(Clone)]
pub struct ConversationApi {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ConversationApi {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        ConversationApi {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            token,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn conversation(&self, user_id: UserId, other_user_id: UserId) -> Result<Vec<StoredMessage>> {
        let url = format!("{}/conversation/{user_id}/{other_user_id}", self.base_url);
        let messages = self.authorize(self.http.get(url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    pub async fn unread_count(&self, user_id: UserId) -> Result<i64> {
        let url = format!("{}/unread-count/{user_id}", self.base_url);
        let UnreadCount { count } = self.authorize(self.http.get(url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(count)
    }

    pub async fn mark_as_read(&self, user_id: UserId, other_user_id: UserId) -> Result<u64> {
        let url = format!("{}/mark-as-read/{user_id}/{other_user_id}", self.base_url);
        let MarkedRead { updated } = self.authorize(self.http.post(url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(updated)
    }
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Base HTTP url of the server, e.g. `http://127.0.0.1:8080`
    pub server: String,
    pub token: Option<String>,
    pub user_id: UserId,
    pub peer_id: UserId,
    pub entity_id: EntityId,
    /// Mark sends as failed after this long without an echo. `None` waits forever.
    pub pending_timeout: Option<time::Duration>,
}

/// `http(s)://host` → `ws(s)://host/ws`
pub fn socket_url(server: &str) -> String {
    let server = server.trim_end_matches('/');
    let server = if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        server.to_owned()
    };
    format!("{server}/ws")
}

fn encode(event: &ClientEvent) -> Result<Message> {
    Ok(Message::Text(serde_json::to_string(event)?.into()))
}

fn render(view: &ChatView, entry: &ChatEntry) {
    let who = if view.is_mine(entry) { "me".to_owned() } else { format!("#{}", entry.author_user_id) };
    let mark = match entry.delivery {
        Delivery::Pending { .. } => " …",
        Delivery::Confirmed => "",
        Delivery::Failed => match entry.temp_id {
            Some(_) => " (failed, /retry to resend)",
            None => " (failed)",
        },
    };
    println!("[{who}] {}{mark}", entry.text);
}

/// Runs an interactive conversation with `options.peer_id` until stdin closes
/// or the relay goes away.
pub async fn run_chat(options: ChatOptions) -> Result<()> {
    let api = ConversationApi::new(&options.server, options.token.clone());
    let mut view = ChatView::new(options.user_id, options.entity_id);

    let mut request = socket_url(&options.server).into_client_request()?;
    if let Some(token) = &options.token {
        request.headers_mut().insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
    }

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .context("cannot reach the chat relay")?;
    let (mut sink, mut stream) = socket.split();

    // the relay introduces itself before anything else
    loop {
        let Some(frame) = stream.next().await else {
            bail!("relay closed before greeting");
        };
        if let Message::Text(text) = frame? {
            if let Ok(ServerEvent::Connected(hello)) = serde_json::from_str::<ServerEvent>(text.as_str()) {
                tracing::info!(connection = %hello.connection_id, "connected");
                view.set_connection(hello.connection_id);
                break;
            }
        }
    }

    sink.send(encode(&ClientEvent::Announce(UserAnnouncement { id: options.user_id }))?).await?;

    let room: RoomKey = view.select_room(options.peer_id)?;
    sink.send(encode(&ClientEvent::Join(room.to_string()))?).await?;

    let history = api.conversation(options.user_id, options.peer_id).await?;
    view.load_history(room, history);
    let updated = api.mark_as_read(options.user_id, options.peer_id).await?;
    tracing::debug!(updated, "marked conversation as read");
    let unread = api.unread_count(options.user_id).await?;

    tracing::debug!(user = view.user_id(), connection = ?view.connection(), room = ?view.room(), "conversation open");
    println!("room {room}, {unread} unread elsewhere");
    for entry in view.entries() {
        render(&view, entry);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut expiry = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };

                if line.trim() == "/retry" {
                    let failed: Vec<_> = view.entries()
                        .iter()
                        .filter(|entry| entry.delivery == Delivery::Failed)
                        .filter_map(|entry| entry.temp_id)
                        .collect();
                    for temp_id in failed {
                        if let Some(dto) = view.retry(temp_id)? {
                            sink.send(encode(&ClientEvent::CreateMessage(dto))?).await?;
                        }
                    }
                    continue;
                }

                let dto = match view.send_message(&line) {
                    Ok(dto) => dto,
                    Err(err) => {
                        eprintln!("{err}");
                        continue;
                    }
                };

                sink.send(encode(&ClientEvent::CreateMessage(dto))?).await?;
            }

            frame = stream.next() => {
                let Some(frame) = frame else {
                    bail!("relay closed the connection");
                };
                let Message::Text(text) = frame? else {
                    continue;
                };

                match serde_json::from_str::<ServerEvent>(text.as_str()) {
                    Ok(ServerEvent::NewMessage(msg)) => {
                        let from = msg.from_user_id;
                        let target = msg.room.parse::<RoomKey>().ok();
                        match view.on_incoming(msg) {
                            Incoming::Appended(index) | Incoming::Reconciled(index) => {
                                render(&view, &view.entries()[index]);
                                if from == options.peer_id {
                                    api.mark_as_read(options.user_id, options.peer_id).await?;
                                }
                            }
                            Incoming::Discarded => {
                                if let Some(other) = target {
                                    println!("(new message from #{from}, {} unseen)", view.unseen(&other));
                                }
                            }
                            Incoming::Settled(_) | Incoming::Duplicate => {}
                        }
                    }
                    Ok(ServerEvent::UpdateOnlineUsers(users)) => {
                        let online = users.contains(&options.peer_id);
                        tracing::debug!(?users, "presence update");
                        println!("(#{} is {})", options.peer_id, if online { "online" } else { "offline" });
                    }
                    Ok(ServerEvent::Connected(hello)) => view.set_connection(hello.connection_id),
                    Err(err) => tracing::warn!("unreadable event: {err}"),
                }
            }

            _ = expiry.tick(), if options.pending_timeout.is_some() => {
                if let Some(timeout) = options.pending_timeout {
                    if view.expire_pending(time::OffsetDateTime::now_utc(), timeout) > 0 {
                        for entry in view.entries().iter().filter(|entry| entry.delivery == Delivery::Failed) {
                            render(&view, entry);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_from_http_base() {
        assert_eq!(socket_url("http://127.0.0.1:8080"), "ws://127.0.0.1:8080/ws");
        assert_eq!(socket_url("https://chat.example/"), "wss://chat.example/ws");
        assert_eq!(socket_url("ws://host"), "ws://host/ws");
    }
}
