use chrono::Utc;
use uuid::Uuid;

use crate::persistence::{DatabaseError, DatabaseResult, DbPool, get_connection};
use crate::tournament::{Tournament, TournamentId, TournamentStatus};
use crate::users::UserId;

/// Flat per-match row; the bracket itself is kept in the tournament's JSON
/// blob, these rows exist for reporting and recovery.
#[derive(Clone, Debug)]
pub struct TournamentMatchEntity {
    pub id: Uuid,
    pub tournament_id: TournamentId,
    pub round: u32,
    pub match_number: u32,
    pub player1_id: Option<UserId>,
    pub player2_id: Option<UserId>,
    pub winner_id: Option<UserId>,
    pub status: String,
}

pub trait TournamentRepository: Send + Sync {
    fn create(&self, tournament: &Tournament) -> DatabaseResult<()>;
    fn update(&self, tournament: &Tournament) -> DatabaseResult<()>;
    fn get_by_id(&self, id: &TournamentId) -> DatabaseResult<Option<Tournament>>;
    fn list(
        &self,
        status: Option<&TournamentStatus>,
        limit: u32,
    ) -> DatabaseResult<Vec<Tournament>>;
    fn upsert_match(&self, entity: &TournamentMatchEntity) -> DatabaseResult<()>;
}

pub type ArcTournamentRepository = std::sync::Arc<Box<dyn TournamentRepository>>;

pub struct SqliteTournamentRepository {
    pool: DbPool,
}

impl SqliteTournamentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn write(&self, tournament: &Tournament, insert: bool) -> DatabaseResult<()> {
        let data = serde_json::to_string(tournament)
            .map_err(|e| DatabaseError::QueryError(rusqlite::Error::ToSqlConversionFailure(Box::new(e))))?;
        let conn = get_connection(&self.pool)?;
        let query = if insert {
            "INSERT INTO tournaments
                (id, room_id, name, game_type, status, max_participants, is_private, join_code,
                 created_by, winner_id, current_round, total_rounds, data, created_at, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        } else {
            "UPDATE tournaments SET
                room_id = ?2, name = ?3, game_type = ?4, status = ?5, max_participants = ?6,
                is_private = ?7, join_code = ?8, created_by = ?9, winner_id = ?10,
                current_round = ?11, total_rounds = ?12, data = ?13, created_at = ?14,
                started_at = ?15, ended_at = ?16
             WHERE id = ?1"
        };
        conn.execute(
            query,
            rusqlite::params![
                tournament.id.to_string(),
                tournament.room_id.to_string(),
                tournament.name,
                tournament.game_type.as_str(),
                tournament.status.as_str(),
                tournament.max_participants,
                tournament.is_private,
                tournament.join_code,
                tournament.created_by.to_string(),
                tournament.winner_id.map(|id| id.to_string()),
                tournament.current_round,
                tournament.total_rounds,
                data,
                tournament.created_at.timestamp(),
                tournament.started_at.map(|t| t.timestamp()),
                tournament.ended_at.map(|t| t.timestamp()),
            ],
        )
        .map_err(DatabaseError::QueryError)?;
        Ok(())
    }
}

impl TournamentRepository for SqliteTournamentRepository {
    fn create(&self, tournament: &Tournament) -> DatabaseResult<()> {
        self.write(tournament, true)
    }

    fn update(&self, tournament: &Tournament) -> DatabaseResult<()> {
        self.write(tournament, false)
    }

    fn get_by_id(&self, id: &TournamentId) -> DatabaseResult<Option<Tournament>> {
        let conn = get_connection(&self.pool)?;
        let mut stmt = conn
            .prepare("SELECT data FROM tournaments WHERE id = ?1")
            .map_err(DatabaseError::QueryError)?;
        let mut rows = stmt
            .query_map([id.to_string()], |row| row.get::<_, String>(0))
            .map_err(DatabaseError::QueryError)?;
        match rows.next() {
            Some(Ok(data)) => Ok(serde_json::from_str(&data).ok()),
            Some(Err(e)) => Err(DatabaseError::QueryError(e)),
            None => Ok(None),
        }
    }

    fn list(
        &self,
        status: Option<&TournamentStatus>,
        limit: u32,
    ) -> DatabaseResult<Vec<Tournament>> {
        let conn = get_connection(&self.pool)?;
        let mut tournaments = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT data FROM tournaments WHERE status = ?1
                         ORDER BY created_at DESC LIMIT ?2",
                    )
                    .map_err(DatabaseError::QueryError)?;
                let rows = stmt
                    .query_map(rusqlite::params![status.as_str(), limit], |row| {
                        row.get::<_, String>(0)
                    })
                    .map_err(DatabaseError::QueryError)?;
                for row in rows {
                    let data = row.map_err(DatabaseError::QueryError)?;
                    if let Ok(tournament) = serde_json::from_str(&data) {
                        tournaments.push(tournament);
                    }
                }
            }
            None => {
                let mut stmt = conn
                    .prepare("SELECT data FROM tournaments ORDER BY created_at DESC LIMIT ?1")
                    .map_err(DatabaseError::QueryError)?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], |row| row.get::<_, String>(0))
                    .map_err(DatabaseError::QueryError)?;
                for row in rows {
                    let data = row.map_err(DatabaseError::QueryError)?;
                    if let Ok(tournament) = serde_json::from_str(&data) {
                        tournaments.push(tournament);
                    }
                }
            }
        }
        Ok(tournaments)
    }

    fn upsert_match(&self, entity: &TournamentMatchEntity) -> DatabaseResult<()> {
        let conn = get_connection(&self.pool)?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO tournament_matches
                (id, tournament_id, round, match_number, player1_id, player2_id, winner_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT (id) DO UPDATE SET
                player1_id = excluded.player1_id,
                player2_id = excluded.player2_id,
                winner_id = excluded.winner_id,
                status = excluded.status,
                updated_at = excluded.updated_at",
            rusqlite::params![
                entity.id.to_string(),
                entity.tournament_id.to_string(),
                entity.round,
                entity.match_number,
                entity.player1_id.map(|id| id.to_string()),
                entity.player2_id.map(|id| id.to_string()),
                entity.winner_id.map(|id| id.to_string()),
                entity.status,
                now,
            ],
        )
        .map_err(DatabaseError::QueryError)?;
        Ok(())
    }
}
