use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    ServiceError, ServiceResult,
    engine::{GameKind, GameSettings},
    game::{ArcGameService, GameId, GameSession, TournamentAdvancer, TournamentLink},
    persistence::tournaments::{ArcTournamentRepository, TournamentMatchEntity},
    room::{ArcRoomService, CreateRoomRequest, RoomId, RoomType},
    store::ArcEphemeralStore,
    users::{ArcUserService, UserId, UserRef},
    util::EntityLocks,
};

pub type TournamentId = Uuid;

const TOURNAMENT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const MIN_PARTICIPANTS: u32 = 4;
const MAX_PARTICIPANTS: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TournamentStatus {
    Pending,
    Ready,
    InProgress,
    Complete,
    Cancelled,
}

impl TournamentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TournamentStatus::Pending => "pending",
            TournamentStatus::Ready => "ready",
            TournamentStatus::InProgress => "in_progress",
            TournamentStatus::Complete => "complete",
            TournamentStatus::Cancelled => "cancelled",
        }
    }
}

/// Single elimination is the only format in scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TournamentFormat {
    SingleElimination,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    Ready,
    InProgress,
    Complete,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Ready => "ready",
            MatchStatus::InProgress => "in_progress",
            MatchStatus::Complete => "complete",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TournamentParticipant {
    pub user_id: UserId,
    pub username: String,
    pub seed: u32,
    pub elo_rating: i64,
    pub is_eliminated: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BracketMatch {
    pub match_number: u32,
    /// Allocated at bracket creation; doubles as the id of the backing game
    /// session, which is only reified on demand.
    pub match_id: GameId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player1_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player1_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player2_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player2_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<UserId>,
    pub status: MatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advances_to_match: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BracketRound {
    pub round_number: u32,
    pub round_name: String,
    pub matches: Vec<BracketMatch>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bracket {
    pub rounds: Vec<BracketRound>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tournament {
    pub id: TournamentId,
    pub room_id: RoomId,
    pub name: String,
    pub game_type: GameKind,
    pub format: TournamentFormat,
    pub status: TournamentStatus,
    pub max_participants: u32,
    pub is_private: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bracket: Option<Bracket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<UserId>,
    pub created_by: UserId,
    pub participants: Vec<TournamentParticipant>,
    pub current_round: u32,
    pub total_rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_settings: Option<GameSettings>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Tournament {
    pub fn participant(&self, user_id: &UserId) -> Option<&TournamentParticipant> {
        self.participants.iter().find(|p| p.user_id == *user_id)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateTournamentRequest {
    pub name: String,
    pub game_type: GameKind,
    #[serde(default = "default_format")]
    pub format: TournamentFormat,
    pub max_participants: u32,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub game_settings: Option<GameSettings>,
}

fn default_format() -> TournamentFormat {
    TournamentFormat::SingleElimination
}

fn is_power_of_two(n: u32) -> bool {
    n > 0 && n & (n - 1) == 0
}

/// Deterministic round names counted back from the final.
pub fn round_name(round: u32, total_rounds: u32) -> String {
    if round == total_rounds {
        "Finals".to_string()
    } else if round + 1 == total_rounds {
        "Semifinals".to_string()
    } else if round + 2 == total_rounds {
        "Quarterfinals".to_string()
    } else {
        format!("Round {}", round)
    }
}

fn tournament_key(id: &TournamentId) -> String {
    format!("tournament:{}", id)
}

fn match_index_key(match_id: &GameId) -> String {
    format!("tournament:match:{}", match_id)
}

pub trait TournamentService: Send + Sync {
    fn create(&self, host: &UserRef, req: &CreateTournamentRequest) -> ServiceResult<Tournament>;
    fn join(
        &self,
        id: &TournamentId,
        user: &UserRef,
        join_code: Option<&str>,
    ) -> ServiceResult<Tournament>;
    fn start(&self, id: &TournamentId, caller: &UserId) -> ServiceResult<Tournament>;
    fn get(&self, id: &TournamentId) -> ServiceResult<Tournament>;
    fn list(&self, status: Option<TournamentStatus>, limit: u32) -> ServiceResult<Vec<Tournament>>;
    /// Reify the backing game of a bracket match on demand. Returns `None`
    /// when the id is not a known tournament match.
    fn ensure_match_game(&self, game_id: &GameId) -> ServiceResult<Option<GameSession>>;
}

pub type ArcTournamentService = Arc<Box<dyn TournamentService + Send + Sync>>;

/// Clonable so one instance can serve both as the tournament service and as
/// the advancement seam handed to the game service.
#[derive(Clone)]
pub struct TournamentServiceImpl {
    store: ArcEphemeralStore,
    tournament_repo: ArcTournamentRepository,
    room_service: ArcRoomService,
    game_service: ArcGameService,
    user_service: ArcUserService,
    locks: Arc<EntityLocks<TournamentId>>,
}

impl TournamentServiceImpl {
    pub fn new(
        store: ArcEphemeralStore,
        tournament_repo: ArcTournamentRepository,
        room_service: ArcRoomService,
        game_service: ArcGameService,
        user_service: ArcUserService,
    ) -> Self {
        Self {
            store,
            tournament_repo,
            room_service,
            game_service,
            user_service,
            locks: Arc::new(EntityLocks::new()),
        }
    }

    fn load(&self, id: &TournamentId) -> ServiceResult<Tournament> {
        if let Some(json) = self.store.get(&tournament_key(id)) {
            if let Ok(tournament) = serde_json::from_str(&json) {
                return Ok(tournament);
            }
        }
        match self.tournament_repo.get_by_id(id)? {
            Some(tournament) => {
                self.cache(&tournament);
                Ok(tournament)
            }
            None => ServiceError::not_found("Tournament not found"),
        }
    }

    fn cache(&self, tournament: &Tournament) {
        let json =
            serde_json::to_string(tournament).expect("tournament serialization is infallible");
        self.store
            .set_ex(&tournament_key(&tournament.id), &json, TOURNAMENT_TTL);
    }

    fn persist(&self, tournament: &Tournament) -> ServiceResult<()> {
        self.tournament_repo.update(tournament)?;
        self.cache(tournament);
        Ok(())
    }

    fn publish_event(&self, event: &str, tournament: &Tournament) {
        let payload = serde_json::json!({
            "type": event,
            "tournament": tournament,
        });
        self.store
            .publish(&tournament_key(&tournament.id), &payload.to_string());
    }

    fn match_entity(tournament: &Tournament, round: u32, m: &BracketMatch) -> TournamentMatchEntity {
        TournamentMatchEntity {
            id: m.match_id,
            tournament_id: tournament.id,
            round,
            match_number: m.match_number,
            player1_id: m.player1_id,
            player2_id: m.player2_id,
            winner_id: m.winner_id,
            status: m.status.as_str().to_string(),
        }
    }

    fn generate_bracket(&self, tournament: &Tournament) -> Bracket {
        let mut participants = tournament.participants.clone();
        participants.sort_by_key(|p| p.seed);

        let total_rounds = tournament.total_rounds;
        let mut rounds = Vec::with_capacity(total_rounds as usize);
        for round in 1..=total_rounds {
            let matches_in_round = 1u32 << (total_rounds - round);
            let mut matches = Vec::with_capacity(matches_in_round as usize);
            for match_number in 1..=matches_in_round {
                let mut bracket_match = BracketMatch {
                    match_number,
                    match_id: Uuid::new_v4(),
                    player1_id: None,
                    player1_name: None,
                    player2_id: None,
                    player2_name: None,
                    winner_id: None,
                    status: MatchStatus::Pending,
                    advances_to_match: (round < total_rounds).then(|| match_number.div_ceil(2)),
                };
                if round == 1 {
                    let p1 = &participants[(match_number as usize - 1) * 2];
                    let p2 = &participants[(match_number as usize - 1) * 2 + 1];
                    bracket_match.player1_id = Some(p1.user_id);
                    bracket_match.player1_name = Some(p1.username.clone());
                    bracket_match.player2_id = Some(p2.user_id);
                    bracket_match.player2_name = Some(p2.username.clone());
                    bracket_match.status = MatchStatus::Ready;
                }
                matches.push(bracket_match);
            }
            rounds.push(BracketRound {
                round_number: round,
                round_name: round_name(round, total_rounds),
                matches,
            });
        }
        Bracket { rounds }
    }
}

impl TournamentService for TournamentServiceImpl {
    fn create(&self, host: &UserRef, req: &CreateTournamentRequest) -> ServiceResult<Tournament> {
        if req.name.len() < 3 || req.name.len() > 100 {
            return ServiceError::validation("Tournament name must be 3-100 characters");
        }
        if !(MIN_PARTICIPANTS..=MAX_PARTICIPANTS).contains(&req.max_participants)
            || !is_power_of_two(req.max_participants)
        {
            return ServiceError::validation(
                "Max participants must be a power of two between 4 and 32",
            );
        }

        let room = self.room_service.create_for_tournament(
            host,
            &CreateRoomRequest {
                game_type: req.game_type,
                room_type: RoomType::Private,
                max_players: req.max_participants,
                game_settings: req.game_settings.clone(),
            },
        )?;

        let host_rating = self.user_service.rating_of(&host.id)?;
        let now = Utc::now();
        let tournament = Tournament {
            id: Uuid::new_v4(),
            room_id: room.id,
            name: req.name.clone(),
            game_type: req.game_type,
            format: req.format,
            status: TournamentStatus::Pending,
            max_participants: req.max_participants,
            is_private: req.is_private,
            // private tournaments reuse the room's join code
            join_code: req.is_private.then(|| room.join_code.clone()),
            bracket: None,
            winner_id: None,
            created_by: host.id,
            participants: vec![TournamentParticipant {
                user_id: host.id,
                username: host.username.clone(),
                seed: 1,
                elo_rating: host_rating,
                is_eliminated: false,
                joined_at: now,
            }],
            current_round: 0,
            total_rounds: req.max_participants.ilog2(),
            game_settings: req.game_settings.clone(),
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        };

        self.tournament_repo.create(&tournament)?;
        self.cache(&tournament);
        self.publish_event("tournament_created", &tournament);
        log::info!(
            "Tournament {} ({}) created by {} for {} players",
            tournament.id,
            tournament.name,
            host.username,
            tournament.max_participants
        );
        Ok(tournament)
    }

    fn join(
        &self,
        id: &TournamentId,
        user: &UserRef,
        join_code: Option<&str>,
    ) -> ServiceResult<Tournament> {
        let lock = self.locks.entry_lock(id);
        let _guard = lock.lock().unwrap();

        let mut tournament = self.load(id)?;
        if tournament.status != TournamentStatus::Pending {
            return ServiceError::conflict("Tournament has already started");
        }
        if tournament.is_private {
            let expected = tournament.join_code.as_deref();
            if expected.is_none() || join_code != expected {
                return ServiceError::forbidden("Invalid join code");
            }
        }
        if tournament.participant(&user.id).is_some() {
            return Ok(tournament); // already joined
        }
        if tournament.participants.len() as u32 >= tournament.max_participants {
            return ServiceError::conflict("Tournament is full");
        }

        // the room tracks capacity; join it first so both stay consistent
        self.room_service.join(&tournament.room_id, user)?;

        let rating = self.user_service.rating_of(&user.id)?;
        tournament.participants.push(TournamentParticipant {
            user_id: user.id,
            username: user.username.clone(),
            seed: tournament.participants.len() as u32 + 1,
            elo_rating: rating,
            is_eliminated: false,
            joined_at: Utc::now(),
        });
        tournament.updated_at = Utc::now();
        self.persist(&tournament)?;
        self.publish_event("tournament_joined", &tournament);
        Ok(tournament)
    }

    fn start(&self, id: &TournamentId, caller: &UserId) -> ServiceResult<Tournament> {
        let lock = self.locks.entry_lock(id);
        let _guard = lock.lock().unwrap();

        let mut tournament = self.load(id)?;
        if tournament.created_by != *caller {
            return ServiceError::forbidden("Only the tournament host can start it");
        }
        if tournament.status != TournamentStatus::Pending {
            return ServiceError::conflict("Tournament has already started");
        }
        if (tournament.participants.len() as u32) < tournament.max_participants {
            return Err(ServiceError::Conflict(format!(
                "Tournament is not full yet ({}/{} participants)",
                tournament.participants.len(),
                tournament.max_participants
            )));
        }

        let bracket = self.generate_bracket(&tournament);

        // index every match id so a game reference can be resolved back to
        // this tournament without scanning
        for round in &bracket.rounds {
            for m in &round.matches {
                self.store.set_ex(
                    &match_index_key(&m.match_id),
                    &tournament.id.to_string(),
                    TOURNAMENT_TTL,
                );
                self.tournament_repo
                    .upsert_match(&Self::match_entity(&tournament, round.round_number, m))?;
            }
        }

        tournament.bracket = Some(bracket);
        tournament.status = TournamentStatus::InProgress;
        tournament.current_round = 1;
        let now = Utc::now();
        tournament.started_at = Some(now);
        tournament.updated_at = now;
        self.persist(&tournament)?;
        self.publish_event("tournament_started", &tournament);
        log::info!(
            "Tournament {} started with {} participants over {} rounds",
            id,
            tournament.participants.len(),
            tournament.total_rounds
        );
        Ok(tournament)
    }

    fn get(&self, id: &TournamentId) -> ServiceResult<Tournament> {
        self.load(id)
    }

    fn list(&self, status: Option<TournamentStatus>, limit: u32) -> ServiceResult<Vec<Tournament>> {
        let limit = if limit == 0 || limit > 100 { 100 } else { limit };
        let mut tournaments = self.tournament_repo.list(status.as_ref(), limit)?;
        // the cached copy is fresher than the durable row
        for tournament in tournaments.iter_mut() {
            if let Some(json) = self.store.get(&tournament_key(&tournament.id)) {
                if let Ok(cached) = serde_json::from_str::<Tournament>(&json) {
                    *tournament = cached;
                }
            }
        }
        Ok(tournaments)
    }

    fn ensure_match_game(&self, game_id: &GameId) -> ServiceResult<Option<GameSession>> {
        let Some(tournament_id) = self.store.get(&match_index_key(game_id)) else {
            return Ok(None);
        };
        let Ok(tournament_id) = Uuid::parse_str(&tournament_id) else {
            return Ok(None);
        };

        let lock = self.locks.entry_lock(&tournament_id);
        let _guard = lock.lock().unwrap();

        let mut tournament = self.load(&tournament_id)?;
        let total_rounds = tournament.total_rounds;
        let Some(bracket) = tournament.bracket.as_mut() else {
            return ServiceError::internal("Tournament has no bracket");
        };

        let mut found = None;
        for round in bracket.rounds.iter_mut() {
            if let Some(m) = round.matches.iter_mut().find(|m| m.match_id == *game_id) {
                found = Some((round.round_number, m));
                break;
            }
        }
        let Some((round_number, bracket_match)) = found else {
            return ServiceError::internal("Match index points at a missing match");
        };

        let (Some(p1_id), Some(p1_name), Some(p2_id), Some(p2_name)) = (
            bracket_match.player1_id,
            bracket_match.player1_name.clone(),
            bracket_match.player2_id,
            bracket_match.player2_name.clone(),
        ) else {
            return ServiceError::conflict("Match players are not decided yet");
        };

        if let Ok(existing) = self.game_service.get(game_id) {
            return Ok(Some(existing));
        }

        let session = self.game_service.create_for_tournament(
            game_id,
            tournament.game_type,
            &UserRef {
                id: p1_id,
                username: p1_name,
            },
            &UserRef {
                id: p2_id,
                username: p2_name,
            },
            TournamentLink {
                tournament_id,
                round: round_number,
                total_rounds,
            },
        )?;

        bracket_match.status = MatchStatus::InProgress;
        let entity = Self::match_entity(&tournament, round_number, {
            // reborrow immutably for the entity snapshot
            let bracket = tournament.bracket.as_ref().unwrap();
            bracket
                .rounds
                .iter()
                .flat_map(|r| r.matches.iter())
                .find(|m| m.match_id == *game_id)
                .unwrap()
        });
        self.tournament_repo.upsert_match(&entity)?;
        self.persist(&tournament)?;
        Ok(Some(session))
    }
}

impl TournamentAdvancer for TournamentServiceImpl {
    fn advance_winner(
        &self,
        tournament_id: &TournamentId,
        match_game_id: &GameId,
        winner: &UserId,
    ) -> ServiceResult<()> {
        let lock = self.locks.entry_lock(tournament_id);
        let _guard = lock.lock().unwrap();

        let mut tournament = self.load(tournament_id)?;
        let winner_name = tournament
            .participant(winner)
            .map(|p| p.username.clone())
            .unwrap_or_default();
        let Some(bracket) = tournament.bracket.as_mut() else {
            return ServiceError::internal("Tournament has no bracket");
        };

        let mut source = None;
        for (round_idx, round) in bracket.rounds.iter_mut().enumerate() {
            if let Some(m) = round.matches.iter_mut().find(|m| m.match_id == *match_game_id) {
                m.status = MatchStatus::Complete;
                m.winner_id = Some(*winner);
                source = Some((round_idx, m.match_number, m.advances_to_match));
                break;
            }
        }
        let Some((round_idx, match_number, advances_to)) = source else {
            return ServiceError::not_found("Match not found in bracket");
        };

        let mut next_ready_match: Option<GameId> = None;
        match advances_to {
            Some(next_match_number) => {
                let next_round = &mut bracket.rounds[round_idx + 1];
                let next_match = next_round
                    .matches
                    .get_mut(next_match_number as usize - 1)
                    .ok_or_else(|| {
                        ServiceError::Internal("Bracket advancement points past the round".into())
                    })?;

                // odd source match fills slot 1, even fills slot 2
                if match_number % 2 == 1 {
                    next_match.player1_id = Some(*winner);
                    next_match.player1_name = Some(winner_name.clone());
                } else {
                    next_match.player2_id = Some(*winner);
                    next_match.player2_name = Some(winner_name.clone());
                }
                if next_match.player1_id.is_some() && next_match.player2_id.is_some() {
                    next_match.status = MatchStatus::Ready;
                    next_ready_match = Some(next_match.match_id);
                }
                tournament.current_round =
                    tournament.current_round.max(round_idx as u32 + 2).min(tournament.total_rounds);
            }
            None => {
                // the final: the tournament is decided
                tournament.winner_id = Some(*winner);
                tournament.status = TournamentStatus::Complete;
                tournament.ended_at = Some(Utc::now());
            }
        }

        // refresh the durable rows for the completed match and, if one just
        // became ready, its downstream match
        if let Some(bracket) = tournament.bracket.as_ref() {
            let touched: Vec<TournamentMatchEntity> = bracket
                .rounds
                .iter()
                .flat_map(|round| {
                    round
                        .matches
                        .iter()
                        .filter(|m| {
                            m.match_id == *match_game_id || Some(m.match_id) == next_ready_match
                        })
                        .map(|m| Self::match_entity(&tournament, round.round_number, m))
                })
                .collect();
            for entity in &touched {
                self.tournament_repo.upsert_match(entity)?;
            }
        }

        tournament.updated_at = Utc::now();
        self.persist(&tournament)?;

        self.publish_event("tournament_match_complete", &tournament);
        if next_ready_match.is_some() {
            self.publish_event("tournament_match_ready", &tournament);
        }
        if tournament.status == TournamentStatus::Complete {
            self.publish_event("tournament_complete", &tournament);
            log::info!(
                "Tournament {} complete, winner {}",
                tournament_id,
                winner_name
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{GameService, MockGameService};
    use crate::persistence::{DatabaseResult, tournaments::TournamentRepository};
    use crate::room::MockRoomService;
    use crate::store::MemoryStore;
    use crate::users::MockUserService;

    #[derive(Default)]
    struct MockTournamentRepository {
        tournaments: dashmap::DashMap<TournamentId, Tournament>,
        match_rows: std::sync::Mutex<Vec<TournamentMatchEntity>>,
    }

    impl TournamentRepository for MockTournamentRepository {
        fn create(&self, tournament: &Tournament) -> DatabaseResult<()> {
            self.tournaments.insert(tournament.id, tournament.clone());
            Ok(())
        }
        fn update(&self, tournament: &Tournament) -> DatabaseResult<()> {
            self.tournaments.insert(tournament.id, tournament.clone());
            Ok(())
        }
        fn get_by_id(&self, id: &TournamentId) -> DatabaseResult<Option<Tournament>> {
            Ok(self.tournaments.get(id).map(|t| t.clone()))
        }
        fn list(
            &self,
            status: Option<&TournamentStatus>,
            _limit: u32,
        ) -> DatabaseResult<Vec<Tournament>> {
            Ok(self
                .tournaments
                .iter()
                .filter(|t| status.is_none_or(|s| t.status == *s))
                .map(|t| t.clone())
                .collect())
        }
        fn upsert_match(&self, entity: &TournamentMatchEntity) -> DatabaseResult<()> {
            let mut rows = self.match_rows.lock().unwrap();
            rows.retain(|r| r.id != entity.id);
            rows.push(entity.clone());
            Ok(())
        }
    }

    struct Fixture {
        service: TournamentServiceImpl,
        games: MockGameService,
        users: MockUserService,
    }

    fn fixture() -> Fixture {
        let store: ArcEphemeralStore = Arc::new(Box::new(MemoryStore::new()));
        let games = MockGameService::default();
        let rooms = MockRoomService::default();
        let users = MockUserService::default();
        let service = TournamentServiceImpl::new(
            store,
            Arc::new(Box::new(MockTournamentRepository::default()) as Box<dyn TournamentRepository>),
            Arc::new(Box::new(rooms.clone()) as Box<dyn crate::room::RoomService + Send + Sync>),
            Arc::new(Box::new(games.clone()) as Box<dyn crate::game::GameService + Send + Sync>),
            Arc::new(Box::new(users.clone()) as Box<dyn crate::users::UserService + Send + Sync>),
        );
        Fixture {
            service,
            games,
            users,
        }
    }

    fn user(f: &Fixture, name: &str, rating: i64) -> UserRef {
        let id = Uuid::new_v4();
        f.users.insert(id, name, rating);
        UserRef {
            id,
            username: name.to_string(),
        }
    }

    fn request(max_participants: u32) -> CreateTournamentRequest {
        CreateTournamentRequest {
            name: "Friday Cup".to_string(),
            game_type: GameKind::TicTacToe,
            format: TournamentFormat::SingleElimination,
            max_participants,
            is_private: false,
            game_settings: None,
        }
    }

    fn filled_tournament(f: &Fixture, size: u32) -> (Tournament, Vec<UserRef>) {
        let host = user(f, "seed1", 1200);
        let tournament = f.service.create(&host, &request(size)).unwrap();
        let mut players = vec![host];
        for i in 2..=size {
            let p = user(f, &format!("seed{}", i), 1200);
            f.service.join(&tournament.id, &p, None).unwrap();
            players.push(p);
        }
        (f.service.get(&tournament.id).unwrap(), players)
    }

    /// Complete every ready match by declaring the given seat the winner,
    /// reifying each backing game first. Returns the completion count.
    fn walk_bracket(f: &Fixture, id: &TournamentId, pick_player1: bool) -> u32 {
        let mut completions = 0;
        loop {
            let tournament = f.service.get(id).unwrap();
            if tournament.status == TournamentStatus::Complete {
                return completions;
            }
            let bracket = tournament.bracket.as_ref().unwrap();
            let ready: Vec<(GameId, Option<UserId>, Option<UserId>)> = bracket
                .rounds
                .iter()
                .flat_map(|r| r.matches.iter())
                .filter(|m| m.status == MatchStatus::Ready)
                .map(|m| (m.match_id, m.player1_id, m.player2_id))
                .collect();
            assert!(!ready.is_empty(), "bracket stalled before completion");
            for (match_id, p1, p2) in ready {
                f.service.ensure_match_game(&match_id).unwrap().unwrap();
                let winner = if pick_player1 { p1 } else { p2 }.unwrap();
                f.service
                    .advance_winner(id, &match_id, &winner)
                    .unwrap();
                completions += 1;
            }
        }
    }

    #[test]
    fn test_create_requires_power_of_two() {
        let f = fixture();
        let host = user(&f, "alice", 1200);
        for bad in [0, 2, 5, 6, 33, 64] {
            assert!(
                f.service.create(&host, &request(bad)).is_err(),
                "{} should be rejected",
                bad
            );
        }
        for good in [4, 8, 16, 32] {
            assert!(f.service.create(&host, &request(good)).is_ok());
        }
    }

    #[test]
    fn test_create_seeds_host_first() {
        let f = fixture();
        let host = user(&f, "alice", 1337);
        let tournament = f.service.create(&host, &request(4)).unwrap();
        assert_eq!(tournament.status, TournamentStatus::Pending);
        assert_eq!(tournament.total_rounds, 2);
        assert_eq!(tournament.participants.len(), 1);
        assert_eq!(tournament.participants[0].seed, 1);
        assert_eq!(tournament.participants[0].elo_rating, 1337);
    }

    #[test]
    fn test_private_tournament_join_code() {
        let f = fixture();
        let host = user(&f, "alice", 1200);
        let mut req = request(4);
        req.is_private = true;
        let tournament = f.service.create(&host, &req).unwrap();
        let code = tournament.join_code.clone().unwrap();

        let bob = user(&f, "bob", 1200);
        let err = f.service.join(&tournament.id, &bob, None).unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        let err = f
            .service
            .join(&tournament.id, &bob, Some("WRONG1"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let joined = f
            .service
            .join(&tournament.id, &bob, Some(&code))
            .unwrap();
        assert_eq!(joined.participants.len(), 2);
        assert_eq!(joined.participants[1].seed, 2);

        // idempotent
        let again = f.service.join(&tournament.id, &bob, Some(&code)).unwrap();
        assert_eq!(again.participants.len(), 2);
    }

    #[test]
    fn test_join_rejected_when_full() {
        let f = fixture();
        let (tournament, _) = filled_tournament(&f, 4);
        let late = user(&f, "late", 1200);
        let err = f.service.join(&tournament.id, &late, None).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn test_start_requires_host_and_full_roster() {
        let f = fixture();
        let host = user(&f, "alice", 1200);
        let tournament = f.service.create(&host, &request(4)).unwrap();

        let err = f.service.start(&tournament.id, &host.id).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_))); // not full

        let bob = user(&f, "bob", 1200);
        f.service.join(&tournament.id, &bob, None).unwrap();
        let err = f.service.start(&tournament.id, &bob.id).unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_))); // not host
    }

    #[test]
    fn test_bracket_shape_for_four_players() {
        let f = fixture();
        let (tournament, players) = filled_tournament(&f, 4);
        let tournament = f.service.start(&tournament.id, &players[0].id).unwrap();
        assert_eq!(tournament.status, TournamentStatus::InProgress);
        assert_eq!(tournament.current_round, 1);
        assert!(tournament.started_at.is_some());

        let bracket = tournament.bracket.as_ref().unwrap();
        assert_eq!(bracket.rounds.len(), 2);
        assert_eq!(bracket.rounds[0].round_name, "Semifinals");
        assert_eq!(bracket.rounds[1].round_name, "Finals");

        let semis = &bracket.rounds[0].matches;
        assert_eq!(semis.len(), 2);
        assert_eq!(semis[0].player1_id, Some(players[0].id));
        assert_eq!(semis[0].player2_id, Some(players[1].id));
        assert_eq!(semis[1].player1_id, Some(players[2].id));
        assert_eq!(semis[1].player2_id, Some(players[3].id));
        assert!(semis.iter().all(|m| m.status == MatchStatus::Ready));
        assert!(semis.iter().all(|m| m.advances_to_match == Some(1)));

        let finals = &bracket.rounds[1].matches;
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].status, MatchStatus::Pending);
        assert_eq!(finals[0].advances_to_match, None);
    }

    #[test]
    fn test_round_names_for_sixteen() {
        assert_eq!(round_name(1, 4), "Round 1");
        assert_eq!(round_name(2, 4), "Quarterfinals");
        assert_eq!(round_name(3, 4), "Semifinals");
        assert_eq!(round_name(4, 4), "Finals");
    }

    #[test]
    fn test_advancement_slot_parity() {
        let f = fixture();
        let (tournament, players) = filled_tournament(&f, 4);
        f.service.start(&tournament.id, &players[0].id).unwrap();
        let tournament = f.service.get(&tournament.id).unwrap();
        let semis: Vec<GameId> = tournament.bracket.as_ref().unwrap().rounds[0]
            .matches
            .iter()
            .map(|m| m.match_id)
            .collect();

        // seed1 wins match 1 (odd → slot 1), seed3 wins match 2 (even → slot 2)
        f.service
            .advance_winner(&tournament.id, &semis[0], &players[0].id)
            .unwrap();
        let t = f.service.get(&tournament.id).unwrap();
        let finals = &t.bracket.as_ref().unwrap().rounds[1].matches[0];
        assert_eq!(finals.player1_id, Some(players[0].id));
        assert_eq!(finals.status, MatchStatus::Pending); // one slot empty

        f.service
            .advance_winner(&tournament.id, &semis[1], &players[2].id)
            .unwrap();
        let t = f.service.get(&tournament.id).unwrap();
        let finals = &t.bracket.as_ref().unwrap().rounds[1].matches[0];
        assert_eq!(finals.player2_id, Some(players[2].id));
        assert_eq!(finals.status, MatchStatus::Ready);
    }

    #[test]
    fn test_lazy_game_reification() {
        let f = fixture();
        let (tournament, players) = filled_tournament(&f, 4);
        f.service.start(&tournament.id, &players[0].id).unwrap();
        let tournament = f.service.get(&tournament.id).unwrap();
        let first_match = tournament.bracket.as_ref().unwrap().rounds[0].matches[0].clone();

        // the backing game does not exist until demanded
        assert!(f.games.get(&first_match.match_id).is_err());
        let session = f
            .service
            .ensure_match_game(&first_match.match_id)
            .unwrap()
            .unwrap();
        assert_eq!(session.id, first_match.match_id);
        assert_eq!(session.player1.id, players[0].id);
        assert_eq!(session.player2.as_ref().unwrap().id, players[1].id);
        let link = session.tournament.unwrap();
        assert_eq!(link.tournament_id, tournament.id);
        assert_eq!(link.round, 1);
        assert_eq!(link.total_rounds, 2);

        // a second request reuses the existing session
        let again = f
            .service
            .ensure_match_game(&first_match.match_id)
            .unwrap()
            .unwrap();
        assert_eq!(again.id, session.id);

        // an unknown id is simply not a tournament match
        assert!(
            f.service
                .ensure_match_game(&Uuid::new_v4())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_bracket_walk_completes_after_n_minus_one_matches() {
        for size in [4u32, 8, 16] {
            let f = fixture();
            let (tournament, players) = filled_tournament(&f, size);
            f.service.start(&tournament.id, &players[0].id).unwrap();

            let completions = walk_bracket(&f, &tournament.id, true);
            assert_eq!(completions, size - 1);

            let done = f.service.get(&tournament.id).unwrap();
            assert_eq!(done.status, TournamentStatus::Complete);
            assert_eq!(done.winner_id, Some(players[0].id));
            assert!(done.ended_at.is_some());
        }
    }
}
