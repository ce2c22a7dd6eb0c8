use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    ServiceError, ServiceResult,
    engine::{GameConfig, GameEngine, GameKind, GameMove, GameSettings, MoveError},
    persistence::games::{ArcCompletedGameRepository, CompletedGameEntity},
    stats::ArcStatsService,
    store::ArcEphemeralStore,
    tournament::TournamentId,
    users::{UserId, UserRef},
    util::{EntityLocks, LazyInit},
};

pub type GameId = Uuid;

const GAME_TTL: Duration = Duration::from_secs(4 * 60 * 60);
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    Waiting,
    Active,
    Completed,
    Abandoned,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spectator {
    pub user_id: UserId,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// Linkage of a session to the tournament match it backs.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TournamentLink {
    pub tournament_id: TournamentId,
    pub round: u32,
    pub total_rounds: u32,
}

#[derive(Clone, Debug)]
pub struct GameSession {
    pub id: GameId,
    pub kind: GameKind,
    pub status: GameStatus,
    pub player1: UserRef,
    pub player2: Option<UserRef>,
    pub current_turn: Option<UserId>,
    pub winner_id: Option<UserId>,
    pub engine: GameEngine,
    pub spectators: Vec<Spectator>,
    pub tournament: Option<TournamentLink>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Wire/store form of a session; the engine state rides as an opaque payload
/// routed by `type` on the way back in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameSessionView {
    pub id: GameId,
    #[serde(rename = "type")]
    pub kind: GameKind,
    pub status: GameStatus,
    pub player1_id: UserId,
    pub player1_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player2_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player2_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_turn: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<UserId>,
    pub state: Value,
    pub spectators: Vec<Spectator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tournament: Option<TournamentLink>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl GameSession {
    pub fn view(&self) -> GameSessionView {
        GameSessionView {
            id: self.id,
            kind: self.kind,
            status: self.status,
            player1_id: self.player1.id,
            player1_name: self.player1.username.clone(),
            player2_id: self.player2.as_ref().map(|p| p.id),
            player2_name: self.player2.as_ref().map(|p| p.username.clone()),
            current_turn: self.current_turn,
            winner_id: self.winner_id,
            state: self.engine.snapshot(),
            spectators: self.spectators.clone(),
            tournament: self.tournament,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    fn from_view(view: GameSessionView) -> ServiceResult<Self> {
        let engine = GameEngine::from_snapshot(view.kind, view.state).map_err(|e| {
            ServiceError::Internal(format!("Failed to deserialize game state: {}", e))
        })?;
        Ok(Self {
            id: view.id,
            kind: view.kind,
            status: view.status,
            player1: UserRef {
                id: view.player1_id,
                username: view.player1_name,
            },
            player2: match (view.player2_id, view.player2_name) {
                (Some(id), Some(username)) => Some(UserRef { id, username }),
                _ => None,
            },
            current_turn: view.current_turn,
            winner_id: view.winner_id,
            engine,
            spectators: view.spectators,
            tournament: view.tournament,
            created_at: view.created_at,
            updated_at: view.updated_at,
            started_at: view.started_at,
            ended_at: view.ended_at,
        })
    }
}

/// Envelope published on `game:{id}` for every session transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameEventEnvelope {
    pub event: String,
    pub game_id: GameId,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// The slice of the tournament service the game service consumes; wired
/// post-construction to break the cyclic dependency.
pub trait TournamentAdvancer: Send + Sync {
    fn advance_winner(
        &self,
        tournament_id: &TournamentId,
        match_game_id: &GameId,
        winner: &UserId,
    ) -> ServiceResult<()>;
}

pub type ArcTournamentAdvancer = Arc<Box<dyn TournamentAdvancer + Send + Sync>>;

pub trait GameService: Send + Sync {
    fn create(
        &self,
        kind: GameKind,
        host: &UserRef,
        settings: Option<&GameSettings>,
    ) -> ServiceResult<GameSession>;
    fn join(&self, id: &GameId, user: &UserRef) -> ServiceResult<GameSession>;
    fn make_move(&self, id: &GameId, player: &UserId, mv: &Value) -> ServiceResult<GameSession>;
    fn get(&self, id: &GameId) -> ServiceResult<GameSession>;
    fn create_for_tournament(
        &self,
        id: &GameId,
        kind: GameKind,
        player1: &UserRef,
        player2: &UserRef,
        link: TournamentLink,
    ) -> ServiceResult<GameSession>;
    fn add_spectator(&self, id: &GameId, user: &UserRef) -> ServiceResult<GameSession>;
    fn remove_spectator(&self, id: &GameId, user_id: &UserId) -> ServiceResult<GameSession>;
    fn get_spectators(&self, id: &GameId) -> ServiceResult<Vec<Spectator>>;
    fn is_spectator(&self, id: &GameId, user_id: &UserId) -> ServiceResult<bool>;
    fn init_advancer(&self, advancer: ArcTournamentAdvancer);
}

pub type ArcGameService = Arc<Box<dyn GameService + Send + Sync>>;

fn game_key(id: &GameId) -> String {
    format!("game:{}", id)
}

fn session_payload(session: &GameSession) -> Value {
    serde_json::to_value(session.view()).expect("session serialization is infallible")
}

pub struct GameServiceImpl {
    store: ArcEphemeralStore,
    stats_service: ArcStatsService,
    game_repo: ArcCompletedGameRepository,
    advancer: LazyInit<ArcTournamentAdvancer>,
    locks: EntityLocks<GameId>,
}

impl GameServiceImpl {
    pub fn new(
        store: ArcEphemeralStore,
        stats_service: ArcStatsService,
        game_repo: ArcCompletedGameRepository,
    ) -> Self {
        Self {
            store,
            stats_service,
            game_repo,
            advancer: LazyInit::new(),
            locks: EntityLocks::new(),
        }
    }

    fn load(&self, id: &GameId) -> ServiceResult<GameSession> {
        if let Some(json) = self.store.get(&game_key(id)) {
            let view: GameSessionView = serde_json::from_str(&json).map_err(|e| {
                ServiceError::Internal(format!("Corrupt session record for {}: {}", id, e))
            })?;
            return GameSession::from_view(view);
        }
        // evicted sessions of finished games can still be served read-only
        match self.game_repo.get_by_id(id)? {
            Some(record) => Self::hydrate_completed(record),
            None => ServiceError::not_found("Game not found"),
        }
    }

    fn hydrate_completed(record: CompletedGameEntity) -> ServiceResult<GameSession> {
        let Some(kind) = GameKind::from_str(&record.game_type) else {
            return ServiceError::internal(format!("Unknown game type {}", record.game_type));
        };
        let state: Value = serde_json::from_str(&record.game_state).map_err(|e| {
            ServiceError::Internal(format!("Corrupt stored game state: {}", e))
        })?;
        let engine = GameEngine::from_snapshot(kind, state).map_err(|e| {
            ServiceError::Internal(format!("Failed to deserialize game state: {}", e))
        })?;
        Ok(GameSession {
            id: record.id,
            kind,
            status: GameStatus::Completed,
            player1: UserRef {
                id: record.player1_id,
                username: record.player1_name,
            },
            player2: match (record.player2_id, record.player2_name) {
                (Some(id), Some(username)) => Some(UserRef { id, username }),
                _ => None,
            },
            current_turn: None,
            winner_id: record.winner_id,
            engine,
            spectators: Vec::new(),
            tournament: None,
            created_at: record.created_at,
            updated_at: record.ended_at.unwrap_or(record.created_at),
            started_at: None,
            ended_at: record.ended_at,
        })
    }

    fn save(&self, session: &GameSession) {
        let json = serde_json::to_string(&session.view())
            .expect("session serialization is infallible");
        self.store.set_ex(&game_key(&session.id), &json, GAME_TTL);
    }

    fn publish_event(&self, id: &GameId, event: &str, payload: Value) {
        let envelope = GameEventEnvelope {
            event: event.to_string(),
            game_id: *id,
            payload,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&envelope).expect("envelope serialization is infallible");
        self.store.publish(&game_key(id), &json);
    }

    fn completed_entity(session: &GameSession) -> CompletedGameEntity {
        CompletedGameEntity {
            id: session.id,
            game_type: session.kind.as_str().to_string(),
            player1_id: session.player1.id,
            player1_name: session.player1.username.clone(),
            player2_id: session.player2.as_ref().map(|p| p.id),
            player2_name: session.player2.as_ref().map(|p| p.username.clone()),
            winner_id: session.winner_id,
            game_state: session.engine.snapshot().to_string(),
            created_at: session.created_at,
            ended_at: session.ended_at,
        }
    }

    /// Best effort with bounded retries: ephemeral state stays authoritative,
    /// so the move is acknowledged even if every attempt fails.
    fn persist_completed(&self, session: &GameSession) {
        let entity = Self::completed_entity(session);
        let mut last_error = None;
        for attempt in 1..=PERSIST_ATTEMPTS {
            match self.game_repo.save(&entity) {
                Ok(()) => return,
                Err(e) => {
                    log::error!(
                        "Failed to persist completed game {} (attempt {}/{}): {}",
                        session.id,
                        attempt,
                        PERSIST_ATTEMPTS,
                        e
                    );
                    last_error = Some(e);
                    if attempt < PERSIST_ATTEMPTS {
                        std::thread::sleep(PERSIST_BACKOFF * attempt);
                    }
                }
            }
        }
        if let Some(e) = last_error {
            log::error!(
                "Giving up persisting completed game {} after {} attempts: {}",
                session.id,
                PERSIST_ATTEMPTS,
                e
            );
        }
    }

    fn update_stats(&self, session: &GameSession) {
        let Some(player2) = session.player2.as_ref() else {
            return;
        };
        let result = match session.tournament {
            Some(link) => self.stats_service.update_tournament_game_stats(
                session.kind,
                &session.player1.id,
                &player2.id,
                session.winner_id.as_ref(),
                link.round,
                link.total_rounds,
            ),
            None => self.stats_service.update_game_stats(
                session.kind,
                &session.player1.id,
                &player2.id,
                session.winner_id.as_ref(),
            ),
        };
        // a stats failure never fails the move
        if let Err(e) = result {
            log::error!("Failed to update stats for game {}: {}", session.id, e);
        }
    }

    fn map_move_error(e: MoveError) -> ServiceError {
        match e {
            MoveError::NotYourTurn | MoveError::NotAPlayer => ServiceError::Forbidden(e.to_string()),
            MoveError::GameOver => ServiceError::Conflict(e.to_string()),
            MoveError::Invalid(msg) => ServiceError::Validation(msg),
        }
    }
}

impl GameService for GameServiceImpl {
    fn create(
        &self,
        kind: GameKind,
        host: &UserRef,
        settings: Option<&GameSettings>,
    ) -> ServiceResult<GameSession> {
        let config = GameConfig::resolve(kind, settings);
        let engine = GameEngine::new(&config, host.id, None);
        let now = Utc::now();
        let session = GameSession {
            id: Uuid::new_v4(),
            kind,
            status: GameStatus::Waiting,
            current_turn: engine.current_player(),
            player1: host.clone(),
            player2: None,
            winner_id: None,
            engine,
            spectators: Vec::new(),
            tournament: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        };
        self.save(&session);
        log::info!("Game {} created ({}) by {}", session.id, kind, host.username);
        Ok(session)
    }

    fn join(&self, id: &GameId, user: &UserRef) -> ServiceResult<GameSession> {
        let lock = self.locks.entry_lock(id);
        let _guard = lock.lock().unwrap();

        let mut session = self.load(id)?;
        if session.status != GameStatus::Waiting {
            return ServiceError::conflict("Game is not waiting for players");
        }
        if session.player1.id == user.id {
            return ServiceError::conflict("You are already in this game");
        }
        session.player2 = Some(user.clone());
        session.engine.set_player2(user.id);
        session.status = GameStatus::Active;
        session.current_turn = session.engine.current_player();
        let now = Utc::now();
        session.started_at = Some(now);
        session.updated_at = now;
        self.save(&session);

        self.publish_event(id, "game_started", session_payload(&session));
        log::info!("Game {} started: {} vs {}", id, session.player1.username, user.username);
        Ok(session)
    }

    fn make_move(&self, id: &GameId, player: &UserId, mv: &Value) -> ServiceResult<GameSession> {
        let lock = self.locks.entry_lock(id);
        let guard = lock.lock().unwrap();

        let mut session = self.load(id)?;
        if session.status == GameStatus::Completed {
            return ServiceError::conflict("The game has already ended");
        }
        if session.status != GameStatus::Active {
            return ServiceError::conflict("Game is not active");
        }
        let is_player = *player == session.player1.id
            || session.player2.as_ref().is_some_and(|p| p.id == *player);
        if !is_player {
            return ServiceError::forbidden(
                "You are not a participant in this game - spectators cannot make moves",
            );
        }

        let game_move = GameMove::from_value(session.kind, mv).map_err(Self::map_move_error)?;
        session
            .engine
            .apply(*player, &game_move)
            .map_err(Self::map_move_error)?;

        let (winner, game_over) = session.engine.check_terminal();
        if game_over {
            session.status = GameStatus::Completed;
            session.winner_id = winner;
            session.ended_at = Some(Utc::now());
            self.update_stats(&session);
            self.persist_completed(&session);
        }

        session.current_turn = if game_over {
            None
        } else {
            session.engine.current_player()
        };
        session.updated_at = Utc::now();
        self.save(&session);

        self.publish_event(id, "game_move", session_payload(&session));

        drop(guard);

        // advancement runs outside the session critical section; it takes the
        // tournament's own lock and may create the next round's games
        if game_over {
            if let (Some(link), Some(winner_id)) = (session.tournament, session.winner_id) {
                if let Some(advancer) = self.advancer.try_get() {
                    if let Err(e) =
                        advancer.advance_winner(&link.tournament_id, id, &winner_id)
                    {
                        log::error!(
                            "Failed to advance tournament {} after game {}: {}",
                            link.tournament_id,
                            id,
                            e
                        );
                    }
                }
            }
        }

        Ok(session)
    }

    fn get(&self, id: &GameId) -> ServiceResult<GameSession> {
        self.load(id)
    }

    fn create_for_tournament(
        &self,
        id: &GameId,
        kind: GameKind,
        player1: &UserRef,
        player2: &UserRef,
        link: TournamentLink,
    ) -> ServiceResult<GameSession> {
        let lock = self.locks.entry_lock(id);
        let _guard = lock.lock().unwrap();

        let config = GameConfig::default_for(kind);
        let engine = GameEngine::new(&config, player1.id, Some(player2.id));
        let now = Utc::now();
        let session = GameSession {
            id: *id,
            kind,
            status: GameStatus::Active,
            current_turn: engine.current_player(),
            player1: player1.clone(),
            player2: Some(player2.clone()),
            winner_id: None,
            engine,
            spectators: Vec::new(),
            tournament: Some(link),
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            ended_at: None,
        };
        self.save(&session);

        // written durably right away so the match survives store eviction
        if let Err(e) = self.game_repo.save(&Self::completed_entity(&session)) {
            log::error!("Failed to persist initial tournament game {}: {}", id, e);
        }

        log::info!(
            "Tournament game {} created: {} vs {} (round {})",
            id,
            player1.username,
            player2.username,
            link.round
        );
        Ok(session)
    }

    fn add_spectator(&self, id: &GameId, user: &UserRef) -> ServiceResult<GameSession> {
        let lock = self.locks.entry_lock(id);
        let _guard = lock.lock().unwrap();

        let mut session = self.load(id)?;
        if session.player1.id == user.id
            || session.player2.as_ref().is_some_and(|p| p.id == user.id)
        {
            return ServiceError::conflict("Players cannot spectate their own game");
        }
        if session.spectators.iter().any(|s| s.user_id == user.id) {
            return Ok(session); // already spectating
        }
        let spectator = Spectator {
            user_id: user.id,
            username: user.username.clone(),
            joined_at: Utc::now(),
        };
        session.spectators.push(spectator.clone());
        session.updated_at = Utc::now();
        self.save(&session);

        self.publish_event(
            id,
            "spectator_joined",
            serde_json::json!({
                "spectator": spectator,
                "count": session.spectators.len(),
            }),
        );
        Ok(session)
    }

    fn remove_spectator(&self, id: &GameId, user_id: &UserId) -> ServiceResult<GameSession> {
        let lock = self.locks.entry_lock(id);
        let _guard = lock.lock().unwrap();

        let mut session = self.load(id)?;
        let before = session.spectators.len();
        session.spectators.retain(|s| s.user_id != *user_id);
        if session.spectators.len() == before {
            return Ok(session); // not spectating
        }
        session.updated_at = Utc::now();
        self.save(&session);

        self.publish_event(
            id,
            "spectator_left",
            serde_json::json!({
                "user_id": user_id,
                "count": session.spectators.len(),
            }),
        );
        Ok(session)
    }

    fn get_spectators(&self, id: &GameId) -> ServiceResult<Vec<Spectator>> {
        Ok(self.load(id)?.spectators)
    }

    fn is_spectator(&self, id: &GameId, user_id: &UserId) -> ServiceResult<bool> {
        Ok(self
            .load(id)?
            .spectators
            .iter()
            .any(|s| s.user_id == *user_id))
    }

    fn init_advancer(&self, advancer: ArcTournamentAdvancer) {
        let _ = self.advancer.init(advancer);
    }
}

#[derive(Clone, Default)]
pub struct MockGameService {
    pub sessions: Arc<dashmap::DashMap<GameId, GameSession>>,
}

impl GameService for MockGameService {
    fn create(
        &self,
        kind: GameKind,
        host: &UserRef,
        settings: Option<&GameSettings>,
    ) -> ServiceResult<GameSession> {
        let config = GameConfig::resolve(kind, settings);
        let engine = GameEngine::new(&config, host.id, None);
        let now = Utc::now();
        let session = GameSession {
            id: Uuid::new_v4(),
            kind,
            status: GameStatus::Waiting,
            current_turn: engine.current_player(),
            player1: host.clone(),
            player2: None,
            winner_id: None,
            engine,
            spectators: Vec::new(),
            tournament: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        };
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    fn join(&self, id: &GameId, user: &UserRef) -> ServiceResult<GameSession> {
        let mut session = match self.sessions.get_mut(id) {
            Some(session) => session,
            None => return ServiceError::not_found("Game not found"),
        };
        session.player2 = Some(user.clone());
        session.engine.set_player2(user.id);
        session.status = GameStatus::Active;
        Ok(session.clone())
    }

    fn make_move(&self, id: &GameId, _player: &UserId, _mv: &Value) -> ServiceResult<GameSession> {
        match self.sessions.get(id) {
            Some(session) => Ok(session.clone()),
            None => ServiceError::not_found("Game not found"),
        }
    }

    fn get(&self, id: &GameId) -> ServiceResult<GameSession> {
        match self.sessions.get(id) {
            Some(session) => Ok(session.clone()),
            None => ServiceError::not_found("Game not found"),
        }
    }

    fn create_for_tournament(
        &self,
        id: &GameId,
        kind: GameKind,
        player1: &UserRef,
        player2: &UserRef,
        link: TournamentLink,
    ) -> ServiceResult<GameSession> {
        let config = GameConfig::default_for(kind);
        let engine = GameEngine::new(&config, player1.id, Some(player2.id));
        let now = Utc::now();
        let session = GameSession {
            id: *id,
            kind,
            status: GameStatus::Active,
            current_turn: engine.current_player(),
            player1: player1.clone(),
            player2: Some(player2.clone()),
            winner_id: None,
            engine,
            spectators: Vec::new(),
            tournament: Some(link),
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            ended_at: None,
        };
        self.sessions.insert(*id, session.clone());
        Ok(session)
    }

    fn add_spectator(&self, id: &GameId, _user: &UserRef) -> ServiceResult<GameSession> {
        self.get(id)
    }

    fn remove_spectator(&self, id: &GameId, _user_id: &UserId) -> ServiceResult<GameSession> {
        self.get(id)
    }

    fn get_spectators(&self, _id: &GameId) -> ServiceResult<Vec<Spectator>> {
        Ok(Vec::new())
    }

    fn is_spectator(&self, _id: &GameId, _user_id: &UserId) -> ServiceResult<bool> {
        Ok(false)
    }

    fn init_advancer(&self, _advancer: ArcTournamentAdvancer) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{DatabaseResult, games::CompletedGameRepository};
    use crate::stats::MockStatsService;
    use crate::store::{EphemeralStore, MemoryStore};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockCompletedGameRepository {
        saved: Mutex<Vec<CompletedGameEntity>>,
        failures_remaining: Mutex<u32>,
    }

    impl CompletedGameRepository for MockCompletedGameRepository {
        fn save(&self, game: &CompletedGameEntity) -> DatabaseResult<()> {
            let mut failures = self.failures_remaining.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(crate::persistence::DatabaseError::QueryError(
                    rusqlite::Error::InvalidQuery,
                ));
            }
            self.saved.lock().unwrap().push(game.clone());
            Ok(())
        }

        fn get_by_id(&self, id: &Uuid) -> DatabaseResult<Option<CompletedGameEntity>> {
            Ok(self
                .saved
                .lock()
                .unwrap()
                .iter()
                .find(|g| g.id == *id)
                .cloned())
        }

        fn list_for_user(
            &self,
            _user_id: &UserId,
            _game_type: Option<&str>,
            _limit: u32,
        ) -> DatabaseResult<Vec<CompletedGameEntity>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        service: GameServiceImpl,
        stats: MockStatsService,
        repo: Arc<MockCompletedGameRepository>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let stats = MockStatsService::default();
        let repo = Arc::new(MockCompletedGameRepository::default());
        let repo_box: ArcCompletedGameRepository =
            Arc::new(Box::new(SharedRepo(repo.clone())) as Box<dyn CompletedGameRepository>);
        let service = GameServiceImpl::new(
            Arc::new(Box::new(store.clone()) as Box<dyn crate::store::EphemeralStore>),
            Arc::new(Box::new(stats.clone()) as Box<dyn crate::stats::StatsService + Send + Sync>),
            repo_box,
        );
        Fixture {
            service,
            stats,
            repo,
            store,
        }
    }

    // thin forwarding wrapper so the fixture can keep a handle to the mock
    struct SharedRepo(Arc<MockCompletedGameRepository>);
    impl CompletedGameRepository for SharedRepo {
        fn save(&self, game: &CompletedGameEntity) -> DatabaseResult<()> {
            self.0.save(game)
        }
        fn get_by_id(&self, id: &Uuid) -> DatabaseResult<Option<CompletedGameEntity>> {
            self.0.get_by_id(id)
        }
        fn list_for_user(
            &self,
            user_id: &UserId,
            game_type: Option<&str>,
            limit: u32,
        ) -> DatabaseResult<Vec<CompletedGameEntity>> {
            self.0.list_for_user(user_id, game_type, limit)
        }
    }

    fn user(name: &str) -> UserRef {
        UserRef {
            id: Uuid::new_v4(),
            username: name.to_string(),
        }
    }

    fn ttt_move(row: i32, col: i32) -> Value {
        serde_json::json!({"row": row, "col": col})
    }

    #[test]
    fn test_create_starts_waiting_with_empty_spectators() {
        let f = fixture();
        let host = user("alice");
        let session = f
            .service
            .create(GameKind::TicTacToe, &host, None)
            .unwrap();
        assert_eq!(session.status, GameStatus::Waiting);
        assert!(session.player2.is_none());
        assert!(session.spectators.is_empty());
        // spectators are always present in the wire form, never absent
        let json = serde_json::to_string(&session.view()).unwrap();
        assert!(json.contains("\"spectators\":[]"));
    }

    #[test]
    fn test_join_activates_and_publishes() {
        let f = fixture();
        let mut rx = f.store.subscribe();
        let host = user("alice");
        let guest = user("bob");
        let session = f.service.create(GameKind::TicTacToe, &host, None).unwrap();
        let session = f.service.join(&session.id, &guest).unwrap();
        assert_eq!(session.status, GameStatus::Active);
        assert_eq!(session.current_turn, Some(host.id));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.topic, format!("game:{}", session.id));
        let envelope: GameEventEnvelope = serde_json::from_str(&event.payload).unwrap();
        assert_eq!(envelope.event, "game_started");
    }

    #[test]
    fn test_wrong_turn_is_forbidden_and_does_not_mutate() {
        let f = fixture();
        let host = user("alice");
        let guest = user("bob");
        let session = f.service.create(GameKind::TicTacToe, &host, None).unwrap();
        f.service.join(&session.id, &guest).unwrap();

        let err = f
            .service
            .make_move(&session.id, &guest.id, &ttt_move(0, 0))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        let reloaded = f.service.get(&session.id).unwrap();
        assert_eq!(reloaded.current_turn, Some(host.id));
        assert_eq!(reloaded.engine.snapshot()["move_count"], 0);
    }

    #[test]
    fn test_spectator_cannot_move() {
        let f = fixture();
        let host = user("alice");
        let guest = user("bob");
        let watcher = user("carol");
        let session = f.service.create(GameKind::TicTacToe, &host, None).unwrap();
        f.service.join(&session.id, &guest).unwrap();
        f.service.add_spectator(&session.id, &watcher).unwrap();

        let err = f
            .service
            .make_move(&session.id, &watcher.id, &ttt_move(0, 0))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[test]
    fn test_full_game_completes_updates_stats_and_persists() {
        let f = fixture();
        let host = user("alice");
        let guest = user("bob");
        let session = f.service.create(GameKind::TicTacToe, &host, None).unwrap();
        f.service.join(&session.id, &guest).unwrap();

        let moves = [
            (host.id, 0, 0),
            (guest.id, 1, 0),
            (host.id, 0, 1),
            (guest.id, 1, 1),
            (host.id, 0, 2),
        ];
        let mut last = None;
        for (player, row, col) in moves {
            last = Some(
                f.service
                    .make_move(&session.id, &player, &ttt_move(row, col))
                    .unwrap(),
            );
        }
        let finished = last.unwrap();
        assert_eq!(finished.status, GameStatus::Completed);
        assert_eq!(finished.winner_id, Some(host.id));
        assert!(finished.ended_at.is_some());
        assert_eq!(finished.current_turn, None);

        let updates = f.stats.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].3, Some(host.id));

        let saved = f.repo.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].winner_id, Some(host.id));
        assert!(!saved[0].game_state.is_empty());

        // further moves are rejected as already ended
        drop(saved);
        drop(updates);
        let err = f
            .service
            .make_move(&session.id, &guest.id, &ttt_move(2, 2))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn test_persist_retries_transient_failures() {
        let f = fixture();
        *f.repo.failures_remaining.lock().unwrap() = 2;
        let host = user("alice");
        let guest = user("bob");
        let session = f.service.create(GameKind::TicTacToe, &host, None).unwrap();
        f.service.join(&session.id, &guest).unwrap();

        let moves = [
            (host.id, 0, 0),
            (guest.id, 1, 0),
            (host.id, 0, 1),
            (guest.id, 1, 1),
            (host.id, 0, 2),
        ];
        for (player, row, col) in moves {
            f.service
                .make_move(&session.id, &player, &ttt_move(row, col))
                .unwrap();
        }
        // two failures, third attempt lands
        assert_eq!(f.repo.saved.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_get_hydrates_completed_game_from_durable_store() {
        let f = fixture();
        let host = user("alice");
        let guest = user("bob");
        let session = f.service.create(GameKind::TicTacToe, &host, None).unwrap();
        f.service.join(&session.id, &guest).unwrap();
        let moves = [
            (host.id, 0, 0),
            (guest.id, 1, 0),
            (host.id, 0, 1),
            (guest.id, 1, 1),
            (host.id, 0, 2),
        ];
        for (player, row, col) in moves {
            f.service
                .make_move(&session.id, &player, &ttt_move(row, col))
                .unwrap();
        }

        // simulate eviction
        f.store.del(&game_key(&session.id));
        let hydrated = f.service.get(&session.id).unwrap();
        assert_eq!(hydrated.status, GameStatus::Completed);
        assert_eq!(hydrated.winner_id, Some(host.id));
        assert_eq!(hydrated.engine.snapshot()["move_count"], 5);
    }

    #[test]
    fn test_spectators_are_deduplicated() {
        let f = fixture();
        let host = user("alice");
        let guest = user("bob");
        let watcher = user("carol");
        let session = f.service.create(GameKind::TicTacToe, &host, None).unwrap();
        f.service.join(&session.id, &guest).unwrap();

        f.service.add_spectator(&session.id, &watcher).unwrap();
        let session2 = f.service.add_spectator(&session.id, &watcher).unwrap();
        assert_eq!(session2.spectators.len(), 1);
        assert!(f.service.is_spectator(&session.id, &watcher.id).unwrap());

        let err = f.service.add_spectator(&session.id, &host).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));

        f.service.remove_spectator(&session.id, &watcher.id).unwrap();
        assert!(f.service.get_spectators(&session.id).unwrap().is_empty());
    }

    #[test]
    fn test_rps_surfaces_no_current_turn() {
        let f = fixture();
        let host = user("alice");
        let guest = user("bob");
        let session = f.service.create(GameKind::Rps, &host, None).unwrap();
        let session = f.service.join(&session.id, &guest).unwrap();
        assert_eq!(session.current_turn, None);

        // both players may submit concurrently
        let mv = serde_json::json!({"choice": "rock"});
        f.service.make_move(&session.id, &guest.id, &mv).unwrap();
        let mv = serde_json::json!({"choice": "scissors"});
        let session = f.service.make_move(&session.id, &host.id, &mv).unwrap();
        assert_eq!(session.engine.snapshot()["rounds"][0]["winner_id"], serde_json::json!(guest.id));
    }

    #[test]
    fn test_tournament_completion_invokes_advancer() {
        #[derive(Default)]
        struct RecordingAdvancer {
            calls: Mutex<Vec<(TournamentId, GameId, UserId)>>,
        }
        impl TournamentAdvancer for RecordingAdvancer {
            fn advance_winner(
                &self,
                tournament_id: &TournamentId,
                match_game_id: &GameId,
                winner: &UserId,
            ) -> ServiceResult<()> {
                self.calls
                    .lock()
                    .unwrap()
                    .push((*tournament_id, *match_game_id, *winner));
                Ok(())
            }
        }

        let f = fixture();
        let advancer = Arc::new(RecordingAdvancer::default());
        struct SharedAdvancer(Arc<RecordingAdvancer>);
        impl TournamentAdvancer for SharedAdvancer {
            fn advance_winner(
                &self,
                tournament_id: &TournamentId,
                match_game_id: &GameId,
                winner: &UserId,
            ) -> ServiceResult<()> {
                self.0.advance_winner(tournament_id, match_game_id, winner)
            }
        }
        f.service.init_advancer(Arc::new(Box::new(SharedAdvancer(advancer.clone()))
            as Box<dyn TournamentAdvancer + Send + Sync>));

        let p1 = user("alice");
        let p2 = user("bob");
        let tournament_id = Uuid::new_v4();
        let game_id = Uuid::new_v4();
        let link = TournamentLink {
            tournament_id,
            round: 1,
            total_rounds: 2,
        };
        f.service
            .create_for_tournament(&game_id, GameKind::TicTacToe, &p1, &p2, link)
            .unwrap();

        let moves = [
            (p1.id, 0, 0),
            (p2.id, 1, 0),
            (p1.id, 0, 1),
            (p2.id, 1, 1),
            (p1.id, 0, 2),
        ];
        for (player, row, col) in moves {
            f.service
                .make_move(&game_id, &player, &ttt_move(row, col))
                .unwrap();
        }

        let calls = advancer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (tournament_id, game_id, p1.id));

        // tournament stats path carries the round context
        let tournament_updates = f.stats.tournament_updates.lock().unwrap();
        assert_eq!(tournament_updates.len(), 1);
        assert_eq!(tournament_updates[0].2, 1);
        assert_eq!(tournament_updates[0].3, 2);
    }
}
