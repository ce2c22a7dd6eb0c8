use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    ServiceError, ServiceResult,
    engine::{GameKind, GameSettings},
    game::{ArcGameService, GameId},
    persistence::rooms::{ArcRoomRepository, TournamentRoomEntity},
    store::ArcEphemeralStore,
    users::{UserId, UserRef},
    util::{EntityLocks, generate_join_code},
};

pub type RoomId = Uuid;

const ROOM_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Quickplay,
    Private,
    Ranked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Ready,
    Active,
    Complete,
    Closed,
}

impl RoomStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Waiting => "waiting",
            RoomStatus::Ready => "ready",
            RoomStatus::Active => "active",
            RoomStatus::Complete => "complete",
            RoomStatus::Closed => "closed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Player,
    Spectator,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub username: String,
    pub role: ParticipantRole,
    pub is_ready: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub status: RoomStatus,
    pub game_type: GameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_settings: Option<GameSettings>,
    pub join_code: String,
    pub host_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<GameId>,
    pub max_players: u32,
    pub participants: Vec<Participant>,
    /// Tournament-linked rooms are also written durably.
    #[serde(default)]
    pub is_tournament: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl Room {
    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == *user_id)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub game_type: GameKind,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub max_players: u32,
    #[serde(default)]
    pub game_settings: Option<GameSettings>,
}

pub trait RoomService: Send + Sync {
    fn create(&self, host: &UserRef, req: &CreateRoomRequest) -> ServiceResult<Room>;
    /// Tournament variant: the room is additionally written durably.
    fn create_for_tournament(&self, host: &UserRef, req: &CreateRoomRequest) -> ServiceResult<Room>;
    fn get(&self, id: &RoomId) -> ServiceResult<Room>;
    fn get_by_code(&self, join_code: &str) -> ServiceResult<Room>;
    fn join(&self, id: &RoomId, user: &UserRef) -> ServiceResult<Room>;
    fn join_by_code(&self, join_code: &str, user: &UserRef) -> ServiceResult<Room>;
    fn leave(&self, id: &RoomId, user_id: &UserId) -> ServiceResult<()>;
    fn set_ready(&self, id: &RoomId, user_id: &UserId, is_ready: bool) -> ServiceResult<Room>;
    fn start_game(&self, id: &RoomId, caller: &UserId) -> ServiceResult<Room>;
}

pub type ArcRoomService = Arc<Box<dyn RoomService + Send + Sync>>;

fn room_key(id: &RoomId) -> String {
    format!("room:{}", id)
}

fn room_code_key(code: &str) -> String {
    format!("room:code:{}", code)
}

pub struct RoomServiceImpl {
    store: ArcEphemeralStore,
    game_service: ArcGameService,
    room_repo: ArcRoomRepository,
    locks: EntityLocks<RoomId>,
}

impl RoomServiceImpl {
    pub fn new(
        store: ArcEphemeralStore,
        game_service: ArcGameService,
        room_repo: ArcRoomRepository,
    ) -> Self {
        Self {
            store,
            game_service,
            room_repo,
            locks: EntityLocks::new(),
        }
    }

    fn load(&self, id: &RoomId) -> ServiceResult<Room> {
        let Some(json) = self.store.get(&room_key(id)) else {
            return ServiceError::not_found("Room not found");
        };
        serde_json::from_str(&json)
            .map_err(|e| ServiceError::Internal(format!("Corrupt room record for {}: {}", id, e)))
    }

    fn save(&self, room: &Room) {
        let json = serde_json::to_string(room).expect("room serialization is infallible");
        self.store.set_ex(&room_key(&room.id), &json, ROOM_TTL);
        self.store
            .set_ex(&room_code_key(&room.join_code), &room.id.to_string(), ROOM_TTL);
    }

    fn publish_event(&self, event: &str, room: &Room) {
        let payload = serde_json::json!({
            "type": event,
            "room": room,
        });
        self.store
            .publish(&room_key(&room.id), &payload.to_string());
    }

    fn create_internal(
        &self,
        host: &UserRef,
        req: &CreateRoomRequest,
        tournament: bool,
    ) -> ServiceResult<Room> {
        if !(2..=4).contains(&req.max_players) && !tournament {
            return ServiceError::validation("max_players must be between 2 and 4");
        }
        let now = Utc::now();
        let room = Room {
            id: Uuid::new_v4(),
            room_type: req.room_type,
            status: RoomStatus::Waiting,
            game_type: req.game_type,
            game_settings: req.game_settings.clone(),
            join_code: generate_join_code(),
            host_id: host.id,
            game_id: None,
            max_players: req.max_players,
            participants: vec![Participant {
                user_id: host.id,
                username: host.username.clone(),
                role: ParticipantRole::Host,
                is_ready: false,
                joined_at: now,
            }],
            is_tournament: tournament,
            created_at: now,
            updated_at: now,
            started_at: None,
            expires_at: now
                + chrono::Duration::from_std(ROOM_TTL)
                    .expect("room TTL fits in a chrono duration"),
        };
        self.save(&room);

        if tournament {
            self.room_repo.create(&TournamentRoomEntity {
                id: room.id,
                code: room.join_code.clone(),
                host_id: room.host_id,
                game_type: room.game_type.as_str().to_string(),
                max_players: room.max_players,
                status: room.status.as_str().to_string(),
            })?;
        }

        self.publish_event("room_created", &room);
        log::info!(
            "Room {} created by {} ({}, code {})",
            room.id,
            host.username,
            room.game_type,
            room.join_code
        );
        Ok(room)
    }
}

impl RoomService for RoomServiceImpl {
    fn create(&self, host: &UserRef, req: &CreateRoomRequest) -> ServiceResult<Room> {
        self.create_internal(host, req, false)
    }

    fn create_for_tournament(
        &self,
        host: &UserRef,
        req: &CreateRoomRequest,
    ) -> ServiceResult<Room> {
        self.create_internal(host, req, true)
    }

    fn get(&self, id: &RoomId) -> ServiceResult<Room> {
        self.load(id)
    }

    fn get_by_code(&self, join_code: &str) -> ServiceResult<Room> {
        let Some(id) = self.store.get(&room_code_key(join_code)) else {
            return ServiceError::not_found("Room not found for join code");
        };
        let id = Uuid::parse_str(&id)
            .map_err(|_| ServiceError::Internal("Corrupt join code index".to_string()))?;
        self.load(&id)
    }

    fn join(&self, id: &RoomId, user: &UserRef) -> ServiceResult<Room> {
        let lock = self.locks.entry_lock(id);
        let _guard = lock.lock().unwrap();

        let mut room = self.load(id)?;
        if room.status == RoomStatus::Closed || room.status == RoomStatus::Complete {
            return ServiceError::conflict("Room is closed");
        }
        if room.participant(&user.id).is_some() {
            return Ok(room); // already joined, idempotent
        }
        if room.participants.len() as u32 >= room.max_players {
            return ServiceError::conflict("Room is full");
        }

        room.participants.push(Participant {
            user_id: user.id,
            username: user.username.clone(),
            role: ParticipantRole::Player,
            is_ready: false,
            joined_at: Utc::now(),
        });
        room.updated_at = Utc::now();
        if room.participants.len() as u32 == room.max_players {
            room.status = RoomStatus::Ready;
        }
        self.save(&room);
        self.publish_event("room_joined", &room);
        Ok(room)
    }

    fn join_by_code(&self, join_code: &str, user: &UserRef) -> ServiceResult<Room> {
        let room = self.get_by_code(join_code)?;
        self.join(&room.id, user)
    }

    fn leave(&self, id: &RoomId, user_id: &UserId) -> ServiceResult<()> {
        let lock = self.locks.entry_lock(id);
        let _guard = lock.lock().unwrap();

        let mut room = self.load(id)?;
        let before = room.participants.len();
        room.participants.retain(|p| p.user_id != *user_id);
        if room.participants.len() == before {
            return ServiceError::not_found("User not in room");
        }
        room.updated_at = Utc::now();

        if room.participants.is_empty() {
            room.status = RoomStatus::Closed;
            self.save(&room);
            if room.is_tournament {
                self.room_repo.update_status(id, room.status.as_str())?;
            }
            self.publish_event("room_closed", &room);
            log::info!("Room {} closed (last participant left)", id);
            return Ok(());
        }

        // host departure promotes the next participant
        if room.host_id == *user_id {
            room.host_id = room.participants[0].user_id;
            room.participants[0].role = ParticipantRole::Host;
            log::info!(
                "Room {}: host left, {} promoted",
                id,
                room.participants[0].username
            );
        }

        if room.status == RoomStatus::Ready && (room.participants.len() as u32) < room.max_players {
            room.status = RoomStatus::Waiting;
        }

        self.save(&room);
        self.publish_event("room_left", &room);
        Ok(())
    }

    fn set_ready(&self, id: &RoomId, user_id: &UserId, is_ready: bool) -> ServiceResult<Room> {
        let lock = self.locks.entry_lock(id);
        let _guard = lock.lock().unwrap();

        let mut room = self.load(id)?;
        let Some(participant) = room.participants.iter_mut().find(|p| p.user_id == *user_id)
        else {
            return ServiceError::not_found("User not in room");
        };
        participant.is_ready = is_ready;
        room.updated_at = Utc::now();
        self.save(&room);
        self.publish_event("participant_ready", &room);
        Ok(room)
    }

    fn start_game(&self, id: &RoomId, caller: &UserId) -> ServiceResult<Room> {
        let lock = self.locks.entry_lock(id);
        let _guard = lock.lock().unwrap();

        let mut room = self.load(id)?;
        if room.host_id != *caller {
            return ServiceError::forbidden("Only the host can start the game");
        }
        if room.participants.len() < 2 {
            return ServiceError::conflict("Not enough players");
        }
        if !room.participants.iter().all(|p| p.is_ready) {
            return ServiceError::conflict("Not all participants are ready");
        }
        if room.status == RoomStatus::Active && room.game_id.is_some() {
            return ServiceError::conflict("Room already has an active game");
        }

        let player1 = UserRef {
            id: room.participants[0].user_id,
            username: room.participants[0].username.clone(),
        };
        let player2 = UserRef {
            id: room.participants[1].user_id,
            username: room.participants[1].username.clone(),
        };

        let session =
            self.game_service
                .create(room.game_type, &player1, room.game_settings.as_ref())?;
        self.game_service.join(&session.id, &player2)?;

        let now = Utc::now();
        room.status = RoomStatus::Active;
        room.game_id = Some(session.id);
        room.started_at = Some(now);
        room.updated_at = now;
        self.save(&room);
        if room.is_tournament {
            self.room_repo.update_status(id, room.status.as_str())?;
        }
        self.publish_event("game_started", &room);
        log::info!("Room {} started game {}", id, session.id);
        Ok(room)
    }
}

#[derive(Clone, Default)]
pub struct MockRoomService {
    pub rooms: Arc<dashmap::DashMap<RoomId, Room>>,
    pub joins: Arc<std::sync::Mutex<Vec<(RoomId, UserId)>>>,
}

impl RoomService for MockRoomService {
    fn create(&self, host: &UserRef, req: &CreateRoomRequest) -> ServiceResult<Room> {
        let now = Utc::now();
        let room = Room {
            id: Uuid::new_v4(),
            room_type: req.room_type,
            status: RoomStatus::Waiting,
            game_type: req.game_type,
            game_settings: req.game_settings.clone(),
            join_code: generate_join_code(),
            host_id: host.id,
            game_id: None,
            max_players: req.max_players,
            participants: vec![Participant {
                user_id: host.id,
                username: host.username.clone(),
                role: ParticipantRole::Host,
                is_ready: false,
                joined_at: now,
            }],
            is_tournament: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            expires_at: now + chrono::Duration::hours(2),
        };
        self.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    fn create_for_tournament(
        &self,
        host: &UserRef,
        req: &CreateRoomRequest,
    ) -> ServiceResult<Room> {
        self.create(host, req)
    }

    fn get(&self, id: &RoomId) -> ServiceResult<Room> {
        match self.rooms.get(id) {
            Some(room) => Ok(room.clone()),
            None => ServiceError::not_found("Room not found"),
        }
    }

    fn get_by_code(&self, join_code: &str) -> ServiceResult<Room> {
        self.rooms
            .iter()
            .find(|r| r.join_code == join_code)
            .map(|r| r.clone())
            .ok_or_else(|| ServiceError::NotFound("Room not found for join code".to_string()))
    }

    fn join(&self, id: &RoomId, user: &UserRef) -> ServiceResult<Room> {
        self.joins.lock().unwrap().push((*id, user.id));
        let mut room = match self.rooms.get_mut(id) {
            Some(room) => room,
            None => return ServiceError::not_found("Room not found"),
        };
        if room.participant(&user.id).is_none() {
            if room.participants.len() as u32 >= room.max_players {
                return ServiceError::conflict("Room is full");
            }
            room.participants.push(Participant {
                user_id: user.id,
                username: user.username.clone(),
                role: ParticipantRole::Player,
                is_ready: false,
                joined_at: Utc::now(),
            });
        }
        Ok(room.clone())
    }

    fn join_by_code(&self, join_code: &str, user: &UserRef) -> ServiceResult<Room> {
        let room = self.get_by_code(join_code)?;
        self.join(&room.id, user)
    }

    fn leave(&self, _id: &RoomId, _user_id: &UserId) -> ServiceResult<()> {
        Ok(())
    }

    fn set_ready(&self, id: &RoomId, _user_id: &UserId, _is_ready: bool) -> ServiceResult<Room> {
        self.get(id)
    }

    fn start_game(&self, id: &RoomId, _caller: &UserId) -> ServiceResult<Room> {
        self.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameService, MockGameService};
    use crate::persistence::{DatabaseResult, rooms::RoomRepository};
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct MockRoomRepository {
        created: std::sync::Mutex<Vec<TournamentRoomEntity>>,
    }

    impl RoomRepository for MockRoomRepository {
        fn create(&self, room: &TournamentRoomEntity) -> DatabaseResult<()> {
            self.created.lock().unwrap().push(room.clone());
            Ok(())
        }
        fn update_status(&self, _id: &RoomId, _status: &str) -> DatabaseResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        service: RoomServiceImpl,
        games: MockGameService,
    }

    fn fixture() -> Fixture {
        let store: ArcEphemeralStore = Arc::new(Box::new(MemoryStore::new()));
        let games = MockGameService::default();
        let service = RoomServiceImpl::new(
            store,
            Arc::new(Box::new(games.clone()) as Box<dyn crate::game::GameService + Send + Sync>),
            Arc::new(Box::new(MockRoomRepository::default()) as Box<dyn RoomRepository>),
        );
        Fixture { service, games }
    }

    fn user(name: &str) -> UserRef {
        UserRef {
            id: Uuid::new_v4(),
            username: name.to_string(),
        }
    }

    fn request(max_players: u32) -> CreateRoomRequest {
        CreateRoomRequest {
            game_type: GameKind::TicTacToe,
            room_type: RoomType::Private,
            max_players,
            game_settings: None,
        }
    }

    #[test]
    fn test_create_inserts_host_as_sole_participant() {
        let f = fixture();
        let host = user("alice");
        let room = f.service.create(&host, &request(2)).unwrap();
        assert_eq!(room.status, RoomStatus::Waiting);
        assert_eq!(room.participants.len(), 1);
        assert_eq!(room.participants[0].role, ParticipantRole::Host);
        assert!(!room.participants[0].is_ready);
        assert_eq!(room.join_code.len(), 6);

        let by_code = f.service.get_by_code(&room.join_code).unwrap();
        assert_eq!(by_code.id, room.id);
    }

    #[test]
    fn test_join_is_idempotent_and_caps_at_max_players() {
        let f = fixture();
        let host = user("alice");
        let bob = user("bob");
        let carol = user("carol");
        let room = f.service.create(&host, &request(2)).unwrap();

        let room = f.service.join(&room.id, &bob).unwrap();
        assert_eq!(room.status, RoomStatus::Ready); // full → ready
        let again = f.service.join(&room.id, &bob).unwrap();
        assert_eq!(again.participants.len(), 2);

        let err = f.service.join(&room.id, &carol).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn test_leave_promotes_next_host_and_reopens_room() {
        let f = fixture();
        let host = user("alice");
        let bob = user("bob");
        let carol = user("carol");
        let room = f.service.create(&host, &request(3)).unwrap();
        f.service.join(&room.id, &bob).unwrap();
        let full = f.service.join(&room.id, &carol).unwrap();
        assert_eq!(full.status, RoomStatus::Ready);

        f.service.leave(&room.id, &host.id).unwrap();
        let room = f.service.get(&room.id).unwrap();
        assert_eq!(room.status, RoomStatus::Waiting);
        assert_eq!(room.host_id, bob.id);
        assert_eq!(room.participant(&bob.id).unwrap().role, ParticipantRole::Host);
        assert_eq!(room.participants.len(), 2);
    }

    #[test]
    fn test_room_closes_when_empty() {
        let f = fixture();
        let host = user("alice");
        let room = f.service.create(&host, &request(2)).unwrap();
        f.service.leave(&room.id, &host.id).unwrap();
        let room = f.service.get(&room.id).unwrap();
        assert_eq!(room.status, RoomStatus::Closed);

        let err = f.service.join(&room.id, &user("bob")).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn test_start_game_requires_host_and_readiness() {
        let f = fixture();
        let host = user("alice");
        let bob = user("bob");
        let room = f.service.create(&host, &request(2)).unwrap();
        f.service.join(&room.id, &bob).unwrap();

        let err = f.service.start_game(&room.id, &bob.id).unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let err = f.service.start_game(&room.id, &host.id).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_))); // not ready

        f.service.set_ready(&room.id, &host.id, true).unwrap();
        f.service.set_ready(&room.id, &bob.id, true).unwrap();
        let room = f.service.start_game(&room.id, &host.id).unwrap();
        assert_eq!(room.status, RoomStatus::Active);
        let game_id = room.game_id.expect("game linked");
        let session = f.games.get(&game_id).unwrap();
        assert_eq!(session.player1.id, host.id);
        assert_eq!(session.player2.as_ref().unwrap().id, bob.id);
    }

    #[test]
    fn test_start_game_rejected_with_one_player() {
        let f = fixture();
        let host = user("alice");
        let room = f.service.create(&host, &request(2)).unwrap();
        f.service.set_ready(&room.id, &host.id, true).unwrap();
        let err = f.service.start_game(&room.id, &host.id).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }
}
