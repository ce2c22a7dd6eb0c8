use std::{collections::HashSet, sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    game::{ArcGameService, GameId},
    protocol::{
        Frame, FrameType, GameMovePayload, JoinGamePayload, RoomJoinPayload, RoomLeavePayload,
        RoomReadyPayload,
    },
    room::ArcRoomService,
    users::UserId,
};

pub type ClientId = Uuid;

pub const MAX_FRAME_BYTES: usize = 512 * 1024;
const OUTBOUND_BUFFER: usize = 256;
const PING_PERIOD: Duration = Duration::from_secs(54);
const PONG_WAIT: Duration = Duration::from_secs(60);

#[async_trait::async_trait]
pub trait ClientService: Send + Sync {
    fn add_to_game(&self, id: &ClientId, game_id: &GameId);
    fn remove_from_game(&self, id: &ClientId, game_id: &GameId);
    fn broadcast_to_game(&self, game_id: &GameId, frame: &Frame, exclude: Option<&ClientId>);
    fn send_to_client(&self, id: &ClientId, frame: &Frame);
    fn send_to_user(&self, user_id: &UserId, frame: &Frame);
    fn client_count(&self) -> usize;
    async fn handle_socket(&self, socket: WebSocket, user: AuthUser);
}

pub type ArcClientService = Arc<Box<dyn ClientService + Send + Sync>>;

struct ClientHandle {
    user_id: UserId,
    username: String,
    sender: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// Routes frames between live connections and game memberships. Knows
/// nothing about game semantics; it only fans out and enforces buffer
/// limits.
pub struct HubService {
    clients: DashMap<ClientId, Arc<ClientHandle>>,
    game_clients: DashMap<GameId, HashSet<ClientId>>,
    user_clients: DashMap<UserId, ClientId>,
    game_service: ArcGameService,
    room_service: ArcRoomService,
}

impl HubService {
    pub fn new(game_service: ArcGameService, room_service: ArcRoomService) -> Self {
        Self {
            clients: DashMap::new(),
            game_clients: DashMap::new(),
            user_clients: DashMap::new(),
            game_service,
            room_service,
        }
    }

    fn register(
        &self,
        id: ClientId,
        user_id: UserId,
        username: &str,
        sender: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) {
        let handle = Arc::new(ClientHandle {
            user_id,
            username: username.to_string(),
            sender,
            cancel,
        });
        self.clients.insert(id, handle);
        self.user_clients.insert(user_id, id);
        log::info!("Client {} registered (user {})", id, username);
    }

    fn unregister(&self, id: &ClientId) {
        let Some((_, handle)) = self.clients.remove(id) else {
            return; // idempotent
        };
        handle.cancel.cancel();
        // purge from every membership set
        self.game_clients.retain(|_, members| {
            members.remove(id);
            !members.is_empty()
        });
        if let Some(entry) = self.user_clients.get(&handle.user_id) {
            if *entry.value() == *id {
                drop(entry);
                self.user_clients.remove(&handle.user_id);
            }
        }
        log::info!("Client {} unregistered (user {})", id, handle.username);
    }

    /// Push a frame into a client's outbound buffer. A full buffer drops the
    /// whole connection: the write loop is cancelled and the client reclaimed.
    fn try_deliver(&self, id: &ClientId, handle: &ClientHandle, json: &str) -> bool {
        match handle.sender.try_send(json.to_string()) {
            Ok(()) => true,
            Err(_) => {
                log::warn!(
                    "Client {} outbound buffer full, dropping connection",
                    id
                );
                handle.cancel.cancel();
                false
            }
        }
    }

    fn dispatch(&self, client_id: &ClientId, user: &AuthUser, text: &str) {
        if text.len() > MAX_FRAME_BYTES {
            self.send_to_client(client_id, &Frame::error(400, "Frame too large"));
            return;
        }
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => {
                self.send_to_client(client_id, &Frame::error(400, "Invalid message format"));
                return;
            }
        };

        match frame.frame_type {
            FrameType::Ping => {
                self.send_to_client(client_id, &Frame::empty(FrameType::Pong));
            }
            FrameType::JoinGame => self.handle_join_game(client_id, frame.payload),
            FrameType::GameMove => self.handle_game_move(client_id, user, frame.payload),
            FrameType::RoomJoined => self.handle_room_join(client_id, user, frame.payload),
            FrameType::RoomLeft => self.handle_room_leave(client_id, user, frame.payload),
            FrameType::RoomParticipantReady => {
                self.handle_room_ready(client_id, user, frame.payload)
            }
            other => {
                log::debug!("Client {} sent unhandled frame type {:?}", client_id, other);
            }
        }
    }

    fn parse_payload<T: serde::de::DeserializeOwned>(
        &self,
        client_id: &ClientId,
        payload: Option<serde_json::Value>,
    ) -> Option<T> {
        let result = payload.and_then(|p| serde_json::from_value(p).ok());
        if result.is_none() {
            self.send_to_client(client_id, &Frame::error(400, "Invalid payload"));
        }
        result
    }

    fn handle_join_game(&self, client_id: &ClientId, payload: Option<serde_json::Value>) {
        let Some(payload) = self.parse_payload::<JoinGamePayload>(client_id, payload) else {
            return;
        };
        let Ok(game_id) = Uuid::parse_str(&payload.game_id) else {
            self.send_to_client(client_id, &Frame::error(400, "Invalid game_id"));
            return;
        };
        self.add_to_game(client_id, &game_id);
        self.send_to_client(
            client_id,
            &Frame::new(
                FrameType::GameJoined,
                serde_json::json!({ "game_id": game_id }),
            ),
        );
        // a full snapshot doubles as reconnection state
        match self.game_service.get(&game_id) {
            Ok(session) => self.send_to_client(
                client_id,
                &Frame::new(
                    FrameType::GameState,
                    serde_json::to_value(session.view())
                        .expect("session serialization is infallible"),
                ),
            ),
            Err(e) => self.send_to_client(client_id, &Frame::error(404, &e.to_string())),
        }
    }

    fn handle_game_move(
        &self,
        client_id: &ClientId,
        user: &AuthUser,
        payload: Option<serde_json::Value>,
    ) {
        let Some(payload) = self.parse_payload::<GameMovePayload>(client_id, payload) else {
            return;
        };
        let Ok(game_id) = Uuid::parse_str(&payload.game_id) else {
            self.send_to_client(client_id, &Frame::error(400, "Invalid game_id"));
            return;
        };
        // the authenticated identity is authoritative, not the payload
        if let Err(e) = self
            .game_service
            .make_move(&game_id, &user.id, &payload.game_move)
        {
            self.send_to_client(client_id, &Frame::error(400, &e.to_string()));
        }
        // the resulting state reaches every member through the event relay
    }

    fn handle_room_join(
        &self,
        client_id: &ClientId,
        user: &AuthUser,
        payload: Option<serde_json::Value>,
    ) {
        let Some(payload) = self.parse_payload::<RoomJoinPayload>(client_id, payload) else {
            return;
        };
        let user_ref = crate::users::UserRef {
            id: user.id,
            username: user.username.clone(),
        };
        let result = if let Some(room_id) = payload.room_id.as_deref() {
            Uuid::parse_str(room_id)
                .map_err(|_| crate::ServiceError::Validation("Invalid room_id".to_string()))
                .and_then(|id| self.room_service.join(&id, &user_ref))
        } else if let Some(join_code) = payload.join_code.as_deref() {
            self.room_service.join_by_code(join_code, &user_ref)
        } else {
            self.send_to_client(client_id, &Frame::error(400, "Missing room_id or join_code"));
            return;
        };
        match result {
            Ok(room) => self.send_to_client(
                client_id,
                &Frame::new(FrameType::RoomJoined, serde_json::to_value(room)
                    .expect("room serialization is infallible")),
            ),
            Err(e) => self.send_to_client(client_id, &Frame::error(400, &e.to_string())),
        }
    }

    fn handle_room_leave(
        &self,
        client_id: &ClientId,
        user: &AuthUser,
        payload: Option<serde_json::Value>,
    ) {
        let Some(payload) = self.parse_payload::<RoomLeavePayload>(client_id, payload) else {
            return;
        };
        let Ok(room_id) = Uuid::parse_str(&payload.room_id) else {
            self.send_to_client(client_id, &Frame::error(400, "Invalid room_id"));
            return;
        };
        match self.room_service.leave(&room_id, &user.id) {
            Ok(()) => self.send_to_client(
                client_id,
                &Frame::new(FrameType::RoomLeft, serde_json::json!({"room_id": room_id})),
            ),
            Err(e) => self.send_to_client(client_id, &Frame::error(400, &e.to_string())),
        }
    }

    fn handle_room_ready(
        &self,
        client_id: &ClientId,
        user: &AuthUser,
        payload: Option<serde_json::Value>,
    ) {
        let Some(payload) = self.parse_payload::<RoomReadyPayload>(client_id, payload) else {
            return;
        };
        let Ok(room_id) = Uuid::parse_str(&payload.room_id) else {
            self.send_to_client(client_id, &Frame::error(400, "Invalid room_id"));
            return;
        };
        match self
            .room_service
            .set_ready(&room_id, &user.id, payload.is_ready)
        {
            Ok(room) => self.send_to_client(
                client_id,
                &Frame::new(FrameType::RoomUpdated, serde_json::to_value(room)
                    .expect("room serialization is infallible")),
            ),
            Err(e) => self.send_to_client(client_id, &Frame::error(400, &e.to_string())),
        }
    }

    async fn write_loop(
        mut ws_sender: SplitSink<WebSocket, Message>,
        mut rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) {
        let mut ping_interval = tokio::time::interval(PING_PERIOD);
        // the first tick fires immediately; skip it
        ping_interval.tick().await;
        loop {
            select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => {
                    match msg {
                        Some(json) => {
                            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
        cancel.cancel();
    }
}

#[async_trait::async_trait]
impl ClientService for HubService {
    fn add_to_game(&self, id: &ClientId, game_id: &GameId) {
        // one active game membership per connection
        self.game_clients.retain(|_, members| {
            members.remove(id);
            !members.is_empty()
        });
        self.game_clients
            .entry(*game_id)
            .or_default()
            .insert(*id);
        log::debug!("Client {} joined game channel {}", id, game_id);
    }

    fn remove_from_game(&self, id: &ClientId, game_id: &GameId) {
        if let Some(mut members) = self.game_clients.get_mut(game_id) {
            members.remove(id);
        }
    }

    fn broadcast_to_game(&self, game_id: &GameId, frame: &Frame, exclude: Option<&ClientId>) {
        // snapshot the member set so no map guard is held during fan-out
        let members: Vec<ClientId> = {
            let Some(members) = self.game_clients.get(game_id) else {
                return;
            };
            members.iter().copied().collect()
        };

        let json = frame.to_json();
        let mut dropped = Vec::new();
        for member in members {
            if exclude == Some(&member) {
                continue;
            }
            let Some(handle) = self.clients.get(&member) else {
                continue;
            };
            if !self.try_deliver(&member, &handle, &json) {
                dropped.push(member);
            }
        }
        for member in dropped {
            self.unregister(&member);
        }
    }

    fn send_to_client(&self, id: &ClientId, frame: &Frame) {
        let Some(handle) = self.clients.get(id) else {
            return;
        };
        let json = frame.to_json();
        if !self.try_deliver(id, &handle, &json) {
            drop(handle);
            self.unregister(id);
        }
    }

    fn send_to_user(&self, user_id: &UserId, frame: &Frame) {
        let Some(client_id) = self.user_clients.get(user_id).map(|e| *e.value()) else {
            return;
        };
        self.send_to_client(&client_id, frame);
    }

    fn client_count(&self) -> usize {
        self.clients.len()
    }

    async fn handle_socket(&self, socket: WebSocket, user: AuthUser) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let cancel = CancellationToken::new();

        let (ws_sender, mut ws_receiver) = socket.split();
        self.register(client_id, user.id, &user.username, tx, cancel.clone());

        self.send_to_client(
            &client_id,
            &Frame::new(
                FrameType::Connected,
                serde_json::json!({
                    "client_id": client_id,
                    "user_id": user.id,
                    "username": user.username,
                }),
            ),
        );

        let write_cancel = cancel.clone();
        let write_task = tokio::spawn(Self::write_loop(ws_sender, rx, write_cancel));

        loop {
            let next = select! {
                _ = cancel.cancelled() => break,
                next = tokio::time::timeout(PONG_WAIT, ws_receiver.next()) => next,
            };
            let msg = match next {
                // no pong (or any frame) within the window: the peer is gone
                Err(_) => {
                    log::info!("Client {} timed out waiting for pong", client_id);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(_))) => break,
                Ok(Some(Ok(msg))) => msg,
            };
            match msg {
                Message::Text(text) => self.dispatch(&client_id, &user, text.as_str()),
                Message::Close(_) => break,
                // Ping/Pong frames only refresh the liveness window
                _ => {}
            }
        }

        cancel.cancel();
        self.unregister(&client_id);
        let _ = write_task.await;
    }
}

#[derive(Clone, Default)]
pub struct MockClientService {
    pub broadcasts: Arc<std::sync::Mutex<Vec<(GameId, Frame)>>>,
    pub direct: Arc<std::sync::Mutex<Vec<(UserId, Frame)>>>,
}

#[async_trait::async_trait]
impl ClientService for MockClientService {
    fn add_to_game(&self, _id: &ClientId, _game_id: &GameId) {}
    fn remove_from_game(&self, _id: &ClientId, _game_id: &GameId) {}

    fn broadcast_to_game(&self, game_id: &GameId, frame: &Frame, _exclude: Option<&ClientId>) {
        self.broadcasts.lock().unwrap().push((*game_id, frame.clone()));
    }

    fn send_to_client(&self, _id: &ClientId, _frame: &Frame) {}

    fn send_to_user(&self, user_id: &UserId, frame: &Frame) {
        self.direct.lock().unwrap().push((*user_id, frame.clone()));
    }

    fn client_count(&self) -> usize {
        0
    }

    async fn handle_socket(&self, _socket: WebSocket, _user: AuthUser) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::MockGameService;
    use crate::room::MockRoomService;

    fn hub() -> HubService {
        HubService::new(
            Arc::new(Box::new(MockGameService::default())
                as Box<dyn crate::game::GameService + Send + Sync>),
            Arc::new(Box::new(MockRoomService::default())
                as Box<dyn crate::room::RoomService + Send + Sync>),
        )
    }

    fn connect(hub: &HubService, buffer: usize) -> (ClientId, UserId, mpsc::Receiver<String>) {
        let client_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(buffer);
        hub.register(client_id, user_id, "tester", tx, CancellationToken::new());
        (client_id, user_id, rx)
    }

    #[test]
    fn test_broadcast_reaches_members_and_respects_exclude() {
        let hub = hub();
        let game_id = Uuid::new_v4();
        let (c1, _, mut rx1) = connect(&hub, 8);
        let (c2, _, mut rx2) = connect(&hub, 8);
        let (_c3, _, mut rx3) = connect(&hub, 8);
        hub.add_to_game(&c1, &game_id);
        hub.add_to_game(&c2, &game_id);
        // c3 is connected but not a member

        hub.broadcast_to_game(&game_id, &Frame::empty(FrameType::GameMove), Some(&c1));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn test_full_buffer_drops_member() {
        let hub = hub();
        let game_id = Uuid::new_v4();
        let (c1, _, _rx1) = connect(&hub, 1);
        let (c2, _, mut rx2) = connect(&hub, 8);
        hub.add_to_game(&c1, &game_id);
        hub.add_to_game(&c2, &game_id);
        assert_eq!(hub.client_count(), 2);

        // first frame fills c1's buffer (it is never drained), second drops it
        hub.broadcast_to_game(&game_id, &Frame::empty(FrameType::GameMove), None);
        hub.broadcast_to_game(&game_id, &Frame::empty(FrameType::GameMove), None);

        assert_eq!(hub.client_count(), 1);
        assert!(rx2.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_unregister_purges_memberships_and_user_index() {
        let hub = hub();
        let game_id = Uuid::new_v4();
        let (c1, u1, _rx) = connect(&hub, 8);
        hub.add_to_game(&c1, &game_id);

        hub.unregister(&c1);
        hub.unregister(&c1); // idempotent

        assert_eq!(hub.client_count(), 0);
        hub.send_to_user(&u1, &Frame::empty(FrameType::Pong)); // no panic, no-op
        hub.broadcast_to_game(&game_id, &Frame::empty(FrameType::GameMove), None);
    }

    #[test]
    fn test_single_game_membership_per_connection() {
        let hub = hub();
        let game_a = Uuid::new_v4();
        let game_b = Uuid::new_v4();
        let (c1, _, mut rx) = connect(&hub, 8);
        hub.add_to_game(&c1, &game_a);
        hub.add_to_game(&c1, &game_b);

        hub.broadcast_to_game(&game_a, &Frame::empty(FrameType::GameMove), None);
        assert!(rx.try_recv().is_err());
        hub.broadcast_to_game(&game_b, &Frame::empty(FrameType::GameMove), None);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_send_to_user_routes_to_connection() {
        let hub = hub();
        let (_c1, u1, mut rx) = connect(&hub, 8);
        hub.send_to_user(&u1, &Frame::empty(FrameType::MatchmakingMatched));
        let json = rx.try_recv().unwrap();
        assert!(json.contains("matchmaking_matched"));
    }
}
