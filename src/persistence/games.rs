use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Row;
use uuid::Uuid;

use crate::persistence::{DatabaseError, DatabaseResult, DbPool, get_connection};
use crate::users::UserId;

/// Durable record of a completed game, including the serialized final engine
/// state so history endpoints can replay the final position.
#[derive(Clone, Debug)]
pub struct CompletedGameEntity {
    pub id: Uuid,
    pub game_type: String,
    pub player1_id: UserId,
    pub player1_name: String,
    pub player2_id: Option<UserId>,
    pub player2_name: Option<String>,
    pub winner_id: Option<UserId>,
    pub game_state: String,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

pub trait CompletedGameRepository: Send + Sync {
    /// Insert or overwrite the record for a game; tournament games are
    /// written once at creation and again at completion.
    fn save(&self, game: &CompletedGameEntity) -> DatabaseResult<()>;
    fn get_by_id(&self, id: &Uuid) -> DatabaseResult<Option<CompletedGameEntity>>;
    fn list_for_user(
        &self,
        user_id: &UserId,
        game_type: Option<&str>,
        limit: u32,
    ) -> DatabaseResult<Vec<CompletedGameEntity>>;
}

pub type ArcCompletedGameRepository = std::sync::Arc<Box<dyn CompletedGameRepository>>;

pub struct SqliteCompletedGameRepository {
    pool: DbPool,
}

impl SqliteCompletedGameRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &Row) -> Result<CompletedGameEntity, rusqlite::Error> {
        let id: String = row.get("id")?;
        let player1_id: String = row.get("player1_id")?;
        let player2_id: Option<String> = row.get("player2_id")?;
        let winner_id: Option<String> = row.get("winner_id")?;
        let created_at: i64 = row.get("created_at")?;
        let ended_at: Option<i64> = row.get("ended_at")?;
        Ok(CompletedGameEntity {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            game_type: row.get("game_type")?,
            player1_id: Uuid::parse_str(&player1_id).unwrap_or_default(),
            player1_name: row.get("player1_name")?,
            player2_id: player2_id.and_then(|s| Uuid::parse_str(&s).ok()),
            player2_name: row.get("player2_name")?,
            winner_id: winner_id.and_then(|s| Uuid::parse_str(&s).ok()),
            game_state: row.get("game_state")?,
            created_at: Utc.timestamp_opt(created_at, 0).single().unwrap_or_default(),
            ended_at: ended_at.and_then(|t| Utc.timestamp_opt(t, 0).single()),
        })
    }
}

impl CompletedGameRepository for SqliteCompletedGameRepository {
    fn save(&self, game: &CompletedGameEntity) -> DatabaseResult<()> {
        let conn = get_connection(&self.pool)?;
        conn.execute(
            "INSERT INTO completed_games
                (id, game_type, player1_id, player1_name, player2_id, player2_name, winner_id, game_state, created_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (id) DO UPDATE SET
                winner_id = excluded.winner_id,
                game_state = excluded.game_state,
                ended_at = excluded.ended_at",
            rusqlite::params![
                game.id.to_string(),
                game.game_type,
                game.player1_id.to_string(),
                game.player1_name,
                game.player2_id.map(|id| id.to_string()),
                game.player2_name,
                game.winner_id.map(|id| id.to_string()),
                game.game_state,
                game.created_at.timestamp(),
                game.ended_at.map(|t| t.timestamp()),
            ],
        )
        .map_err(DatabaseError::QueryError)?;
        Ok(())
    }

    fn get_by_id(&self, id: &Uuid) -> DatabaseResult<Option<CompletedGameEntity>> {
        let conn = get_connection(&self.pool)?;
        let mut stmt = conn
            .prepare("SELECT * FROM completed_games WHERE id = ?1")
            .map_err(DatabaseError::QueryError)?;
        let mut rows = stmt
            .query_map([id.to_string()], Self::from_row)
            .map_err(DatabaseError::QueryError)?;
        match rows.next() {
            Some(Ok(game)) => Ok(Some(game)),
            Some(Err(e)) => Err(DatabaseError::QueryError(e)),
            None => Ok(None),
        }
    }

    fn list_for_user(
        &self,
        user_id: &UserId,
        game_type: Option<&str>,
        limit: u32,
    ) -> DatabaseResult<Vec<CompletedGameEntity>> {
        let conn = get_connection(&self.pool)?;
        let user = user_id.to_string();
        let mut games = Vec::new();
        match game_type {
            Some(game_type) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM completed_games
                         WHERE (player1_id = ?1 OR player2_id = ?1) AND game_type = ?2 AND ended_at IS NOT NULL
                         ORDER BY ended_at DESC LIMIT ?3",
                    )
                    .map_err(DatabaseError::QueryError)?;
                let rows = stmt
                    .query_map(rusqlite::params![user, game_type, limit], Self::from_row)
                    .map_err(DatabaseError::QueryError)?;
                for row in rows {
                    games.push(row.map_err(DatabaseError::QueryError)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM completed_games
                         WHERE (player1_id = ?1 OR player2_id = ?1) AND ended_at IS NOT NULL
                         ORDER BY ended_at DESC LIMIT ?2",
                    )
                    .map_err(DatabaseError::QueryError)?;
                let rows = stmt
                    .query_map(rusqlite::params![user, limit], Self::from_row)
                    .map_err(DatabaseError::QueryError)?;
                for row in rows {
                    games.push(row.map_err(DatabaseError::QueryError)?);
                }
            }
        }
        Ok(games)
    }
}
