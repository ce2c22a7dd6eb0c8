use rusqlite::Row;
use uuid::Uuid;

use crate::persistence::{DatabaseError, DatabaseResult, DbPool, get_connection};
use crate::users::UserId;

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct PlayerStatsEntity {
    pub user_id: UserId,
    pub game_type: String,
    pub wins: i64,
    pub losses: i64,
    pub draws: i64,
    pub current_streak: i64,
    pub best_streak: i64,
    pub total_games: i64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub username: String,
    pub elo_rating: i64,
    pub wins: i64,
    pub losses: i64,
    pub draws: i64,
    pub total_games: i64,
}

pub trait StatsRepository: Send + Sync {
    fn get_or_create(&self, user_id: &UserId, game_type: &str) -> DatabaseResult<PlayerStatsEntity>;
    /// Single-statement counter and streak update so concurrent completions
    /// cannot interleave a read-modify-write.
    fn record_result(
        &self,
        user_id: &UserId,
        game_type: &str,
        won: bool,
        draw: bool,
    ) -> DatabaseResult<()>;
    fn leaderboard(&self, game_type: Option<&str>, limit: u32) -> DatabaseResult<Vec<LeaderboardEntry>>;
}

pub type ArcStatsRepository = std::sync::Arc<Box<dyn StatsRepository>>;

pub struct SqliteStatsRepository {
    pool: DbPool,
}

impl SqliteStatsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &Row) -> Result<PlayerStatsEntity, rusqlite::Error> {
        let user_id: String = row.get("user_id")?;
        Ok(PlayerStatsEntity {
            user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
            game_type: row.get("game_type")?,
            wins: row.get("wins")?,
            losses: row.get("losses")?,
            draws: row.get("draws")?,
            current_streak: row.get("current_streak")?,
            best_streak: row.get("best_streak")?,
            total_games: row.get("total_games")?,
        })
    }
}

impl StatsRepository for SqliteStatsRepository {
    fn get_or_create(&self, user_id: &UserId, game_type: &str) -> DatabaseResult<PlayerStatsEntity> {
        let conn = get_connection(&self.pool)?;
        conn.execute(
            "INSERT INTO player_stats (id, user_id, game_type, updated_at)
             VALUES (?1, ?2, ?3, strftime('%s','now'))
             ON CONFLICT (user_id, game_type) DO NOTHING",
            rusqlite::params![Uuid::new_v4().to_string(), user_id.to_string(), game_type],
        )
        .map_err(DatabaseError::QueryError)?;

        conn.query_row(
            "SELECT * FROM player_stats WHERE user_id = ?1 AND game_type = ?2",
            rusqlite::params![user_id.to_string(), game_type],
            Self::from_row,
        )
        .map_err(DatabaseError::QueryError)
    }

    fn record_result(
        &self,
        user_id: &UserId,
        game_type: &str,
        won: bool,
        draw: bool,
    ) -> DatabaseResult<()> {
        self.get_or_create(user_id, game_type)?;

        let (win_inc, loss_inc, draw_inc) = if draw {
            (0, 0, 1)
        } else if won {
            (1, 0, 0)
        } else {
            (0, 1, 0)
        };

        let conn = get_connection(&self.pool)?;
        conn.execute(
            "UPDATE player_stats SET
                wins = wins + ?3,
                losses = losses + ?4,
                draws = draws + ?5,
                current_streak = CASE
                    WHEN ?3 = 1 THEN current_streak + 1
                    WHEN ?4 = 1 THEN 0
                    ELSE current_streak
                END,
                best_streak = CASE
                    WHEN ?3 = 1 AND current_streak + 1 > best_streak THEN current_streak + 1
                    ELSE best_streak
                END,
                total_games = total_games + 1,
                updated_at = strftime('%s','now')
             WHERE user_id = ?1 AND game_type = ?2",
            rusqlite::params![
                user_id.to_string(),
                game_type,
                win_inc,
                loss_inc,
                draw_inc
            ],
        )
        .map_err(DatabaseError::QueryError)?;
        Ok(())
    }

    fn leaderboard(
        &self,
        game_type: Option<&str>,
        limit: u32,
    ) -> DatabaseResult<Vec<LeaderboardEntry>> {
        let conn = get_connection(&self.pool)?;
        let mut entries = Vec::new();

        let map_row = |row: &Row| -> Result<LeaderboardEntry, rusqlite::Error> {
            let user_id: String = row.get("id")?;
            Ok(LeaderboardEntry {
                user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
                username: row.get("username")?,
                elo_rating: row.get("elo_rating")?,
                wins: row.get("wins")?,
                losses: row.get("losses")?,
                draws: row.get("draws")?,
                total_games: row.get("total_games")?,
            })
        };

        match game_type {
            Some(game_type) => {
                let mut stmt = conn
                    .prepare(
                        "SELECT u.id, u.username, u.elo_rating,
                                COALESCE(s.wins, 0) AS wins,
                                COALESCE(s.losses, 0) AS losses,
                                COALESCE(s.draws, 0) AS draws,
                                COALESCE(s.total_games, 0) AS total_games
                         FROM users u
                         JOIN player_stats s ON s.user_id = u.id AND s.game_type = ?1
                         ORDER BY u.elo_rating DESC LIMIT ?2",
                    )
                    .map_err(DatabaseError::QueryError)?;
                let rows = stmt
                    .query_map(rusqlite::params![game_type, limit], map_row)
                    .map_err(DatabaseError::QueryError)?;
                for row in rows {
                    entries.push(row.map_err(DatabaseError::QueryError)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(
                        "SELECT u.id, u.username, u.elo_rating,
                                COALESCE(SUM(s.wins), 0) AS wins,
                                COALESCE(SUM(s.losses), 0) AS losses,
                                COALESCE(SUM(s.draws), 0) AS draws,
                                COALESCE(SUM(s.total_games), 0) AS total_games
                         FROM users u
                         LEFT JOIN player_stats s ON s.user_id = u.id
                         GROUP BY u.id
                         ORDER BY u.elo_rating DESC LIMIT ?1",
                    )
                    .map_err(DatabaseError::QueryError)?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], map_row)
                    .map_err(DatabaseError::QueryError)?;
                for row in rows {
                    entries.push(row.map_err(DatabaseError::QueryError)?);
                }
            }
        }
        Ok(entries)
    }
}
