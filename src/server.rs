use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use warp::ws::{Message as WsMessage, WebSocket};
use warp::Filter;

use crate::config::Settings;
use crate::error::ChatError;
use crate::fanout::{MessageFanout, Submission};
use crate::identity::{bearer_token, IdentityService};
use crate::membership::{Committed, RoomMembershipManager};
use crate::messages::{ClientEvent, ErrorEvent, Outbound, ServerEvent};
use crate::models::UserId;
use crate::presence::{PresenceChange, PresenceTracker};
use crate::session::{ConnectionHandle, SessionRegistry, Transition};
use crate::store::{RetryPolicy, Store};
use crate::typing::TypingCoordinator;

/// Close code sent when the handshake credential is rejected.
pub const AUTH_FAILED_CLOSE: u16 = 4001;

/// Owns every component; constructed once at startup and cloned into each
/// connection task.
#[derive(Clone)]
pub struct Server {
    sessions: Arc<SessionRegistry>,
    presence: Arc<PresenceTracker>,
    rooms: Arc<RoomMembershipManager>,
    typing: TypingCoordinator,
    fanout: Arc<MessageFanout>,
}

impl Server {
    pub fn new(settings: &Settings, store: Arc<dyn Store>, identity: Arc<dyn IdentityService>) -> Self {
        let sessions = Arc::new(SessionRegistry::new(identity));
        let rooms = Arc::new(RoomMembershipManager::new(
            store.clone(),
            RetryPolicy::from_settings(settings),
        ));
        let typing = TypingCoordinator::new(settings.typing_timeout, sessions.clone(), rooms.clone());
        let fanout = Arc::new(MessageFanout::new(store, rooms.clone(), sessions.clone(), settings));
        Server {
            sessions,
            presence: Arc::new(PresenceTracker::new()),
            rooms,
            typing,
            fanout,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn rooms(&self) -> &RoomMembershipManager {
        &self.rooms
    }

    pub async fn handle_connection(&self, ws: WebSocket, token: Option<String>) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        let handle = match self.connect(token.as_deref(), tx).await {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("Rejected connection: {err}");
                let frame = Outbound::from(ErrorEvent::new("auth", &err));
                if let Ok(text) = serde_json::to_string(&frame) {
                    let _ = ws_tx.send(WsMessage::text(text)).await;
                }
                let _ = ws_tx
                    .send(WsMessage::close_with(AUTH_FAILED_CLOSE, "authentication failed"))
                    .await;
                return;
            }
        };

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Failed to encode frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::text(text)).await {
                    log::debug!("Failed to send WebSocket message: {e}");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(result) = ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    log::debug!("WebSocket error on {}: {e}", handle.id);
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            let Ok(text) = msg.to_str() else { continue };
            match serde_json::from_str::<ClientEvent>(text) {
                Ok(event) => self.dispatch(&handle, event).await,
                Err(e) => {
                    log::debug!("Unparseable frame from {}: {e}", handle.id);
                    handle.send(ErrorEvent::new("invalid-event", &ChatError::invalid(e.to_string())));
                }
            }
        }

        self.disconnect(&handle).await;
        writer.abort();
    }

    /// Authenticates and registers a connection, announcing the user online
    /// if this is their first live connection.
    pub async fn connect(
        &self,
        token: Option<&str>,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<ConnectionHandle, ChatError> {
        let (handle, transition) = self.sessions.register(token, tx).await?;
        self.apply_presence(handle.user_id(), transition).await;
        Ok(handle)
    }

    /// Releases the connection's live reachability. Persisted membership is
    /// untouched.
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        let Some(departed) = self.sessions.unregister(handle.id).await else {
            return;
        };
        let user_id = departed.handle.user_id();
        if let Transition::LastDisconnect { .. } = departed.transition {
            self.typing.stop_all(user_id).await;
        } else {
            for room_id in &departed.rooms {
                if !self.sessions.is_attached(user_id, room_id).await {
                    self.typing.stop_typing(room_id, user_id).await;
                }
            }
        }
        self.apply_presence(user_id, departed.transition).await;
    }

    async fn apply_presence(&self, user_id: &str, transition: Transition) {
        let Some(change) = self.presence.apply(user_id, transition).await else {
            return;
        };
        self.announce_presence(user_id, change).await;
    }

    async fn announce_presence(&self, user_id: &str, change: PresenceChange) {
        let event = match change {
            PresenceChange::Online => ServerEvent::UserOnline {
                user_id: user_id.to_string(),
            },
            PresenceChange::Offline { last_seen } => ServerEvent::UserOffline {
                user_id: user_id.to_string(),
                last_seen,
            },
            PresenceChange::Status(status) => ServerEvent::UserStatus {
                user_id: user_id.to_string(),
                status,
            },
        };
        let audience = self.rooms.co_members(user_id).await;
        self.sessions.broadcast(&audience, &Outbound::from(event), None).await;
    }

    /// Routes one inbound event to its owning component; failures go back to
    /// the caller only.
    pub async fn dispatch(&self, conn: &ConnectionHandle, event: ClientEvent) {
        let operation = event.operation();
        log::debug!("{} -> {operation}", conn.user_id());
        if let Err(err) = self.handle_event(conn, event).await {
            match err {
                ChatError::StoreUnavailable(_) => log::error!("{operation} for {} failed: {err}", conn.user_id()),
                _ => log::debug!("{operation} for {} rejected: {err}", conn.user_id()),
            }
            conn.send(ErrorEvent::new(operation, &err));
        }
    }

    async fn handle_event(&self, conn: &ConnectionHandle, event: ClientEvent) -> Result<(), ChatError> {
        let user_id = conn.user_id();
        match event {
            ClientEvent::JoinRoom { room_id, user_data } => self.join_room(conn, &room_id, user_data).await,
            ClientEvent::LeaveRoom { room_id } => self.leave_room(conn, &room_id).await,
            ClientEvent::UpdateRoom { room_id, updated_room } => {
                let committed = self.rooms.update(&room_id, user_id, &updated_room).await?;
                let event = ServerEvent::RoomUpdated {
                    room_id,
                    updated_room: committed.room.clone(),
                    updated_by: user_id.to_string(),
                    timestamp: Utc::now(),
                };
                self.sessions
                    .broadcast(committed.room.participants(), &Outbound::from(event), None)
                    .await;
                Ok(())
            }
            ClientEvent::DeleteRoom { room_id } => {
                let Committed { outcome: former, .. } = self.rooms.close(&room_id, user_id).await?;
                for member in &former {
                    self.release_user(&room_id, member).await;
                }
                let event = ServerEvent::RoomDeleted {
                    room_id,
                    deleted_by: user_id.to_string(),
                    timestamp: Utc::now(),
                };
                self.sessions.broadcast(&former, &Outbound::from(event), None).await;
                Ok(())
            }
            ClientEvent::SendMessage {
                room_id,
                content,
                message_type,
                reply_to,
                client_temp_id,
            } => {
                let submission = Submission {
                    room_id: room_id.clone(),
                    sender_id: user_id.to_string(),
                    content,
                    kind: message_type,
                    reply_to,
                    client_temp_id,
                };
                self.fanout.submit(Some(conn), submission).await?;
                self.typing.stop_typing(&room_id, user_id).await;
                Ok(())
            }
            ClientEvent::EditMessage { message_id, content } => {
                self.fanout.edit(user_id, &message_id, &content).await.map(drop)
            }
            ClientEvent::DeleteMessage { message_id, room_id } => {
                self.fanout.delete(user_id, &message_id, room_id.as_deref()).await.map(drop)
            }
            ClientEvent::MarkDelivered { message_id } => {
                self.fanout.mark_delivered(&message_id, user_id).await.map(drop)
            }
            ClientEvent::MarkRead { message_id } => self.fanout.mark_read(&message_id, user_id).await.map(drop),
            ClientEvent::StartTyping { room_id } => self.typing.start_typing(&room_id, user_id).await.map(drop),
            ClientEvent::StopTyping { room_id } => {
                self.typing.stop_typing(&room_id, user_id).await;
                Ok(())
            }
            ClientEvent::AddUser { room_id, user_id: target } => {
                let committed = self.rooms.add_member(&room_id, user_id, &target).await?;
                let event = ServerEvent::UserAdded {
                    room_id: room_id.clone(),
                    user_id: target.clone(),
                    added_by: user_id.to_string(),
                };
                self.sessions
                    .broadcast(committed.room.participants(), &Outbound::from(event), None)
                    .await;
                let name = self.name_of(&target).await;
                self.record_system(&room_id, user_id, format!("{name} was added to the room")).await;
                Ok(())
            }
            ClientEvent::UserRemoved { room_id, user_id: target } => {
                let committed = self.rooms.kick(&room_id, user_id, &target).await?;
                self.release_user(&room_id, &target).await;
                let event = ServerEvent::UserRemoved {
                    room_id: room_id.clone(),
                    user_id: target.clone(),
                    removed_by: user_id.to_string(),
                };
                let audience = committed.room.participants().iter().chain(std::iter::once(&target));
                self.sessions.broadcast(audience, &Outbound::from(event), None).await;
                let name = self.name_of(&target).await;
                self.record_system(&room_id, user_id, format!("{name} was removed from the room")).await;
                Ok(())
            }
            ClientEvent::AddAdmin { room_id, user_id: target } => {
                let committed = self.rooms.promote(&room_id, user_id, &target).await?;
                let event = ServerEvent::AdminAdded {
                    room_id,
                    user_id: target,
                    added_by: user_id.to_string(),
                };
                self.sessions
                    .broadcast(committed.room.participants(), &Outbound::from(event), None)
                    .await;
                Ok(())
            }
            ClientEvent::RemoveAdmin { room_id, user_id: target } => {
                let committed = self.rooms.demote(&room_id, user_id, &target).await?;
                let event = ServerEvent::AdminRemoved {
                    room_id,
                    user_id: target,
                    removed_by: user_id.to_string(),
                };
                self.sessions
                    .broadcast(committed.room.participants(), &Outbound::from(event), None)
                    .await;
                Ok(())
            }
            ClientEvent::SetStatus { status } => {
                if let Some(change) = self.presence.set_status(user_id, status).await? {
                    self.announce_presence(user_id, change).await;
                }
                Ok(())
            }
        }
    }

    async fn join_room(
        &self,
        conn: &ConnectionHandle,
        room_id: &str,
        user_data: Option<serde_json::Value>,
    ) -> Result<(), ChatError> {
        let user_id = conn.user_id();
        let Committed { outcome: joined, room } = self.rooms.enter(room_id, user_id).await?;
        if joined {
            let event = ServerEvent::UserJoined {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                username: conn.identity.username.clone(),
                user_data,
                timestamp: Utc::now(),
            };
            let others = room.participants().iter().filter(|p| *p != user_id);
            self.sessions.broadcast(others, &Outbound::from(event), None).await;
        }

        self.sessions.attach_room(conn.id, room_id).await;
        let online = self.presence.online_among(room.participants()).await;
        conn.send(ServerEvent::JoinRoomSuccess {
            room_id: room_id.to_string(),
            room,
            online,
        });

        if joined {
            let text = format!("{} joined the room", conn.identity.username);
            self.record_system(room_id, user_id, text).await;
        }
        Ok(())
    }

    async fn leave_room(&self, conn: &ConnectionHandle, room_id: &str) -> Result<(), ChatError> {
        let user_id = conn.user_id();
        let committed = self.rooms.leave(room_id, user_id).await?;
        self.release_user(room_id, user_id).await;

        let event = ServerEvent::UserLeft {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            username: conn.identity.username.clone(),
            new_creator: committed.outcome.new_creator.clone(),
            timestamp: Utc::now(),
        };
        let leaver = user_id.to_string();
        let audience = committed.room.participants().iter().chain(std::iter::once(&leaver));
        self.sessions.broadcast(audience, &Outbound::from(event), None).await;

        if !committed.outcome.deactivated {
            let text = format!("{} left the room", conn.identity.username);
            self.record_system(room_id, user_id, text).await;
        }
        Ok(())
    }

    /// Forces a typing stop and drops the room from the user's connections.
    async fn release_user(&self, room_id: &str, user_id: &str) {
        self.typing.stop_typing(room_id, user_id).await;
        self.sessions.detach_user_room(user_id, room_id).await;
    }

    async fn record_system(&self, room_id: &str, actor: &str, text: String) {
        if let Err(err) = self.fanout.post_system(room_id, actor, text).await {
            log::warn!("System message for {room_id} not recorded: {err}");
        }
    }

    async fn name_of(&self, user_id: &UserId) -> String {
        self.sessions.display_name(user_id).await.unwrap_or_else(|| user_id.clone())
    }
}

/// `/ws` upgrades (credential from `Authorization: Bearer` or `?token=`) and a
/// health document at `/`.
pub fn routes(server: Server) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_server = warp::any().map(move || server.clone());

    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::query::<HashMap<String, String>>())
        .and(with_server.clone())
        .map(
            |ws: warp::ws::Ws, header: Option<String>, query: HashMap<String, String>, server: Server| {
                let token = header
                    .as_deref()
                    .and_then(bearer_token)
                    .map(ToString::to_string)
                    .or_else(|| query.get("token").cloned());
                ws.on_upgrade(move |socket| async move {
                    server.handle_connection(socket, token).await;
                })
            },
        );

    let health = warp::path::end()
        .and(warp::get())
        .and(with_server)
        .then(|server: Server| async move {
            let connections = server.sessions().connection_count().await;
            warp::reply::json(&json!({ "status": "ok", "connections": connections }))
        });

    ws_route.or(health).with(warp::cors().allow_any_origin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::identity::SignedTokenIdentity;
    use crate::models::{MessageKind, PresenceStatus};
    use crate::room::{Room, RoomKind};
    use crate::session::tests::{token, SECRET};
    use crate::store::InMemoryStore;

    type Rx = mpsc::UnboundedReceiver<Outbound>;

    async fn server_with(rooms: Vec<Room>) -> (Server, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        for room in rooms {
            store.insert_room(room).await;
        }
        let settings = Settings {
            store_backoff: Duration::from_millis(1),
            ..Settings::default()
        };
        let server = Server::new(&settings, store.clone(), Arc::new(SignedTokenIdentity::new(SECRET)));
        (server, store)
    }

    async fn connect(server: &Server, user: &str) -> (ConnectionHandle, Rx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = server.connect(Some(token(user).as_str()), tx).await.unwrap();
        (handle, rx)
    }

    fn drain(rx: &mut Rx) -> Vec<Outbound> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn events(rx: &mut Rx) -> Vec<ServerEvent> {
        drain(rx)
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Event(event) => Some(event),
                Outbound::Error(_) => None,
            })
            .collect()
    }

    fn errors(rx: &mut Rx) -> Vec<ErrorEvent> {
        drain(rx)
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Error(error) => Some(error),
                Outbound::Event(_) => None,
            })
            .collect()
    }

    fn general() -> Room {
        let mut room = Room::new("r1", "general", RoomKind::Public, "alice");
        room.join("bob").unwrap();
        room
    }

    #[tokio::test]
    async fn join_announces_and_snapshots() {
        let (server, store) = server_with(vec![general()]).await;
        let (_alice, mut alice_rx) = connect(&server, "alice").await;
        let (carol, mut carol_rx) = connect(&server, "carol").await;

        server
            .dispatch(&carol, ClientEvent::JoinRoom { room_id: "r1".into(), user_data: None })
            .await;

        let carol_events = events(&mut carol_rx);
        assert_eq!(carol_events.len(), 2);
        assert!(matches!(&carol_events[1], ServerEvent::NewMessage { .. }));
        match &carol_events[0] {
            ServerEvent::JoinRoomSuccess { room, online, .. } => {
                assert_eq!(room.participants(), ["alice", "bob", "carol"]);
                let mut online: Vec<_> = online.iter().map(|p| p.user_id.as_str()).collect();
                online.sort_unstable();
                assert_eq!(online, ["alice", "carol"]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let alice_events = events(&mut alice_rx);
        assert!(matches!(&alice_events[0], ServerEvent::UserJoined { user_id, .. } if user_id == "carol"));
        assert!(matches!(
            &alice_events[1],
            ServerEvent::NewMessage { message } if message.kind == MessageKind::System
        ));
        assert_eq!(store.room_history("r1").await[0].content, "carol-name joined the room");

        server
            .dispatch(&carol, ClientEvent::JoinRoom { room_id: "r1".into(), user_data: None })
            .await;
        assert!(matches!(&events(&mut carol_rx)[..], [ServerEvent::JoinRoomSuccess { .. }]));
        assert!(events(&mut alice_rx).is_empty(), "rejoin is a silent re-attach");
    }

    #[tokio::test]
    async fn join_failures_reach_only_the_caller() {
        let private = Room::new("p1", "secret", RoomKind::Private, "alice").with_settings(crate::room::RoomSettings {
            require_approval: true,
            ..Default::default()
        });
        let (server, _) = server_with(vec![private]).await;
        let (_alice, mut alice_rx) = connect(&server, "alice").await;
        let (carol, mut carol_rx) = connect(&server, "carol").await;
        drain(&mut alice_rx);

        server
            .dispatch(&carol, ClientEvent::JoinRoom { room_id: "p1".into(), user_data: None })
            .await;
        server
            .dispatch(&carol, ClientEvent::JoinRoom { room_id: "nope".into(), user_data: None })
            .await;

        let errs: Vec<_> = errors(&mut carol_rx).into_iter().map(|e| e.data.kind).collect();
        assert_eq!(errs, ["approval-required", "room-not-found"]);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn presence_follows_connection_count() {
        let (server, _) = server_with(vec![general()]).await;
        server.rooms().snapshot("r1").await.unwrap();
        let (_alice, mut alice_rx) = connect(&server, "alice").await;

        let (bob_laptop, _rx1) = connect(&server, "bob").await;
        let (bob_phone, _rx2) = connect(&server, "bob").await;
        let online: Vec<_> = events(&mut alice_rx);
        assert_eq!(online, [ServerEvent::UserOnline { user_id: "bob".into() }]);

        server.disconnect(&bob_laptop).await;
        assert!(events(&mut alice_rx).is_empty());
        assert_eq!(server.presence().status_of("bob").await.status, PresenceStatus::Online);

        server.disconnect(&bob_phone).await;
        assert!(matches!(
            &events(&mut alice_rx)[..],
            [ServerEvent::UserOffline { user_id, .. }] if user_id == "bob"
        ));
        assert_eq!(server.presence().status_of("bob").await.status, PresenceStatus::Offline);
        assert_eq!(server.rooms().snapshot("r1").await.unwrap().participants(), ["alice", "bob"]);
    }

    #[tokio::test]
    async fn send_message_acks_with_temp_id() {
        let (server, _) = server_with(vec![general()]).await;
        let (alice, mut alice_rx) = connect(&server, "alice").await;
        let (_bob, mut bob_rx) = connect(&server, "bob").await;
        drain(&mut alice_rx);

        server
            .dispatch(
                &alice,
                ClientEvent::SendMessage {
                    room_id: "r1".into(),
                    content: "hello".into(),
                    message_type: MessageKind::Text,
                    reply_to: None,
                    client_temp_id: Some("tmp-1".into()),
                },
            )
            .await;

        let durable = match &events(&mut bob_rx)[..] {
            [ServerEvent::NewMessage { message }] => message.clone(),
            other => panic!("unexpected {other:?}"),
        };
        match &events(&mut alice_rx)[..] {
            [ServerEvent::MessageSent { message, client_temp_id }] => {
                assert_eq!(client_temp_id.as_deref(), Some("tmp-1"));
                assert_eq!(message.id, durable.id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_permissions_over_the_wire() {
        let mut room = general();
        room.join("carol").unwrap();
        let (server, _) = server_with(vec![room]).await;
        let (alice, mut alice_rx) = connect(&server, "alice").await;
        let (bob, mut bob_rx) = connect(&server, "bob").await;
        let (carol, mut carol_rx) = connect(&server, "carol").await;

        let message = server
            .fanout
            .submit(
                Some(&bob),
                Submission {
                    room_id: "r1".into(),
                    sender_id: "bob".into(),
                    content: "oops".into(),
                    kind: MessageKind::Text,
                    reply_to: None,
                    client_temp_id: None,
                },
            )
            .await
            .unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let delete = || ClientEvent::DeleteMessage { message_id: message.id.clone(), room_id: Some("r1".into()) };
        server.dispatch(&carol, delete()).await;
        let errs = errors(&mut carol_rx);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].event, "delete-message-error");
        assert_eq!(errs[0].data.kind, "permission-denied");
        assert!(drain(&mut bob_rx).is_empty());

        server.dispatch(&alice, delete()).await;
        assert!(matches!(&events(&mut bob_rx)[..], [ServerEvent::MessageDeleted { .. }]));

        server.dispatch(&alice, delete()).await;
        assert_eq!(errors(&mut alice_rx)[0].data.kind, "already-deleted");
    }

    #[tokio::test]
    async fn creator_leave_hands_over_and_notifies() {
        let mut room = general();
        room.join("carol").unwrap();
        room.promote("alice", "bob").unwrap();
        let (server, _) = server_with(vec![room]).await;
        let (alice, mut alice_rx) = connect(&server, "alice").await;
        let (_carol, mut carol_rx) = connect(&server, "carol").await;
        server
            .dispatch(&alice, ClientEvent::JoinRoom { room_id: "r1".into(), user_data: None })
            .await;
        drain(&mut alice_rx);
        drain(&mut carol_rx);

        server.dispatch(&alice, ClientEvent::LeaveRoom { room_id: "r1".into() }).await;

        let room = server.rooms().snapshot("r1").await.unwrap();
        assert_eq!(room.creator(), "bob");
        assert_eq!(room.participants(), ["bob", "carol"]);
        assert!(!server.sessions().is_attached("alice", "r1").await);

        for rx in [&mut alice_rx, &mut carol_rx] {
            assert!(matches!(
                &events(rx)[0],
                ServerEvent::UserLeft { new_creator: Some(creator), .. } if creator == "bob"
            ));
        }
    }

    #[tokio::test]
    async fn kick_and_admin_events() {
        let mut room = general();
        room.join("carol").unwrap();
        let (server, _) = server_with(vec![room]).await;
        let (alice, mut alice_rx) = connect(&server, "alice").await;
        let (bob, mut bob_rx) = connect(&server, "bob").await;
        let (_carol, mut carol_rx) = connect(&server, "carol").await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        server
            .dispatch(&bob, ClientEvent::UserRemoved { room_id: "r1".into(), user_id: "carol".into() })
            .await;
        assert_eq!(errors(&mut bob_rx)[0].event, "remove-user-error");

        server
            .dispatch(&alice, ClientEvent::AddAdmin { room_id: "r1".into(), user_id: "bob".into() })
            .await;
        assert!(matches!(&events(&mut carol_rx)[..], [ServerEvent::AdminAdded { .. }]));

        server
            .dispatch(&bob, ClientEvent::UserRemoved { room_id: "r1".into(), user_id: "carol".into() })
            .await;
        assert!(matches!(&events(&mut carol_rx)[0], ServerEvent::UserRemoved { user_id, .. } if user_id == "carol"));

        server
            .dispatch(&bob, ClientEvent::UserRemoved { room_id: "r1".into(), user_id: "alice".into() })
            .await;
        let errs = errors(&mut bob_rx);
        assert_eq!(errs.last().map(|e| e.data.kind.as_str()), Some("cannot-remove-creator"));

        let room = server.rooms().snapshot("r1").await.unwrap();
        assert_eq!(room.participants(), ["alice", "bob"]);
        room.check_invariants().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_forces_typing_stop() {
        let (server, _) = server_with(vec![general()]).await;
        let (alice, _alice_rx) = connect(&server, "alice").await;
        let (_bob, mut bob_rx) = connect(&server, "bob").await;
        server
            .dispatch(&alice, ClientEvent::JoinRoom { room_id: "r1".into(), user_data: None })
            .await;
        server.dispatch(&alice, ClientEvent::StartTyping { room_id: "r1".into() }).await;
        assert!(events(&mut bob_rx).contains(&ServerEvent::UserTyping {
            user_id: "alice".into(),
            room_id: "r1".into()
        }));

        server.disconnect(&alice).await;
        let after = events(&mut bob_rx);
        assert_eq!(
            after[0],
            ServerEvent::UserStoppedTyping { user_id: "alice".into(), room_id: "r1".into() }
        );
        assert!(matches!(after[1], ServerEvent::UserOffline { .. }));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(events(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn manual_status_reaches_co_members() {
        let (server, _) = server_with(vec![general()]).await;
        server.rooms().snapshot("r1").await.unwrap();
        let (alice, _alice_rx) = connect(&server, "alice").await;
        let (_bob, mut bob_rx) = connect(&server, "bob").await;

        server.dispatch(&alice, ClientEvent::SetStatus { status: PresenceStatus::Busy }).await;
        assert_eq!(
            events(&mut bob_rx),
            [ServerEvent::UserStatus { user_id: "alice".into(), status: PresenceStatus::Busy }]
        );
    }

    fn three_member_room() -> Room {
        let mut room = general();
        room.join("carol").unwrap();
        room
    }

    #[tokio::test]
    async fn leave_and_self_removal_are_recorded_as_system_messages() {
        let mut room = three_member_room();
        room.join("dave").unwrap();
        let (server, store) = server_with(vec![room]).await;
        let (alice, _alice_rx) = connect(&server, "alice").await;
        let (bob, _bob_rx) = connect(&server, "bob").await;
        let (carol, mut carol_rx) = connect(&server, "carol").await;
        let (_dave, mut dave_rx) = connect(&server, "dave").await;
        drain(&mut dave_rx);

        server.dispatch(&bob, ClientEvent::LeaveRoom { room_id: "r1".into() }).await;
        server
            .dispatch(&carol, ClientEvent::UserRemoved { room_id: "r1".into(), user_id: "carol".into() })
            .await;
        assert!(errors(&mut carol_rx).is_empty());

        let notices: Vec<_> = store
            .room_history("r1")
            .await
            .into_iter()
            .map(|m| (m.kind, m.sender_id, m.content))
            .collect();
        assert_eq!(
            notices,
            [
                (MessageKind::System, "bob".to_string(), "bob-name left the room".to_string()),
                (MessageKind::System, "carol".to_string(), "carol-name was removed from the room".to_string()),
            ]
        );
        let fanned_out = events(&mut dave_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::NewMessage { .. }))
            .count();
        assert_eq!(fanned_out, 2);

        server.dispatch(&alice, ClientEvent::LeaveRoom { room_id: "r1".into() }).await;
        assert_eq!(store.room_history("r1").await.len(), 3, "room with a member left keeps recording");
    }

    #[tokio::test(start_paused = true)]
    async fn last_disconnect_stops_typing_without_a_join() {
        let (server, _) = server_with(vec![general()]).await;
        let (alice, _alice_rx) = connect(&server, "alice").await;
        let (_bob, mut bob_rx) = connect(&server, "bob").await;

        server.dispatch(&alice, ClientEvent::StartTyping { room_id: "r1".into() }).await;
        drain(&mut bob_rx);

        server.disconnect(&alice).await;
        let after = events(&mut bob_rx);
        assert_eq!(
            after[0],
            ServerEvent::UserStoppedTyping { user_id: "alice".into(), room_id: "r1".into() }
        );
        assert!(matches!(after[1], ServerEvent::UserOffline { .. }));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(events(&mut bob_rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn leave_and_kick_force_typing_stop() {
        let (server, _) = server_with(vec![three_member_room()]).await;
        let (alice, _alice_rx) = connect(&server, "alice").await;
        let (bob, _bob_rx) = connect(&server, "bob").await;
        let (carol, mut carol_rx) = connect(&server, "carol").await;

        server.dispatch(&bob, ClientEvent::StartTyping { room_id: "r1".into() }).await;
        server.dispatch(&carol, ClientEvent::StartTyping { room_id: "r1".into() }).await;
        server.dispatch(&alice, ClientEvent::StartTyping { room_id: "r1".into() }).await;
        drain(&mut carol_rx);

        server.dispatch(&bob, ClientEvent::LeaveRoom { room_id: "r1".into() }).await;
        assert_eq!(
            events(&mut carol_rx)[0],
            ServerEvent::UserStoppedTyping { user_id: "bob".into(), room_id: "r1".into() }
        );

        server
            .dispatch(&alice, ClientEvent::UserRemoved { room_id: "r1".into(), user_id: "carol".into() })
            .await;
        assert!(server.typing.is_typing("r1", "alice"));
        assert!(!server.typing.is_typing("r1", "carol"));
        assert!(!server.typing.is_typing("r1", "bob"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let late: Vec<_> = events(&mut carol_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::UserStoppedTyping { user_id, .. } if user_id != "alice"))
            .collect();
        assert!(late.is_empty(), "no expiry fires for entries already stopped: {late:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_from_two_devices_both_attach() {
        let (server, store) = server_with(vec![general()]).await;
        let (_alice, mut alice_rx) = connect(&server, "alice").await;
        let (laptop, mut laptop_rx) = connect(&server, "carol").await;
        let (phone, mut phone_rx) = connect(&server, "carol").await;
        drain(&mut alice_rx);

        let joins = [laptop.clone(), phone.clone()].map(|conn| {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .dispatch(&conn, ClientEvent::JoinRoom { room_id: "r1".into(), user_data: None })
                    .await;
            })
        });
        for join in joins {
            join.await.unwrap();
        }

        for rx in [&mut laptop_rx, &mut phone_rx] {
            let frames = drain(rx);
            assert!(
                frames.iter().all(|f| matches!(f, Outbound::Event(_))),
                "no join error: {frames:?}"
            );
            assert!(frames
                .iter()
                .any(|f| matches!(f, Outbound::Event(ServerEvent::JoinRoomSuccess { .. }))));
        }
        let announced = events(&mut alice_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::UserJoined { .. }))
            .count();
        assert_eq!(announced, 1);
        assert_eq!(store.room_history("r1").await.len(), 1);
        assert!(server.sessions().is_attached("carol", "r1").await);
    }

    #[tokio::test]
    async fn room_update_and_delete_reach_members() {
        let mut room = three_member_room();
        room.promote("alice", "bob").unwrap();
        let (server, _) = server_with(vec![room]).await;
        let (alice, mut alice_rx) = connect(&server, "alice").await;
        let (bob, mut bob_rx) = connect(&server, "bob").await;
        let (carol, mut carol_rx) = connect(&server, "carol").await;
        server
            .dispatch(&carol, ClientEvent::JoinRoom { room_id: "r1".into(), user_data: None })
            .await;
        drain(&mut alice_rx);
        drain(&mut carol_rx);

        let rename = |name: &str| ClientEvent::UpdateRoom {
            room_id: "r1".into(),
            updated_room: crate::room::RoomUpdate {
                name: Some(name.into()),
                ..Default::default()
            },
        };
        server.dispatch(&carol, rename("mine now")).await;
        assert_eq!(errors(&mut carol_rx)[0].event, "update-room-error");

        server.dispatch(&bob, rename("ops")).await;
        match &events(&mut carol_rx)[..] {
            [ServerEvent::RoomUpdated { updated_room, updated_by, .. }] => {
                assert_eq!(updated_room.name, "ops");
                assert_eq!(updated_by, "bob");
            }
            other => panic!("unexpected {other:?}"),
        }

        server.dispatch(&bob, ClientEvent::DeleteRoom { room_id: "r1".into() }).await;
        assert_eq!(errors(&mut bob_rx)[0].data.kind, "permission-denied");

        server.dispatch(&alice, ClientEvent::DeleteRoom { room_id: "r1".into() }).await;
        assert!(matches!(
            &events(&mut carol_rx)[..],
            [ServerEvent::RoomDeleted { deleted_by, .. }] if deleted_by == "alice"
        ));
        assert!(!server.sessions().is_attached("carol", "r1").await);

        server
            .dispatch(
                &carol,
                ClientEvent::SendMessage {
                    room_id: "r1".into(),
                    content: "anyone?".into(),
                    message_type: MessageKind::Text,
                    reply_to: None,
                    client_temp_id: None,
                },
            )
            .await;
        assert_eq!(errors(&mut carol_rx)[0].data.kind, "room-inactive");
    }
}
