use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::ToSql;
use thiserror::Error;

pub mod games;
pub mod notifications;
pub mod rooms;
pub mod stats;
pub mod tournaments;
pub mod users;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection error: {0}")]
    ConnectionError(r2d2::Error),
    #[error("query error: {0}")]
    QueryError(rusqlite::Error),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

pub type DbPool = Pool<SqliteConnectionManager>;

const POOL_MIN_IDLE: u32 = 5;
const POOL_MAX_SIZE: u32 = 10;
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the durable store. Boot fails (non-zero exit) when this errors.
pub fn connect(database_url: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_url);
    Pool::builder()
        .min_idle(Some(POOL_MIN_IDLE))
        .max_size(POOL_MAX_SIZE)
        .connection_timeout(POOL_CONNECTION_TIMEOUT)
        .build(manager)
}

pub fn get_connection(pool: &DbPool) -> DatabaseResult<PooledConnection<SqliteConnectionManager>> {
    pool.get().map_err(DatabaseError::ConnectionError)
}

pub fn init_schema(pool: &DbPool) -> DatabaseResult<()> {
    let conn = get_connection(pool)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            elo_rating INTEGER NOT NULL DEFAULT 1200,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS completed_games (
            id TEXT PRIMARY KEY,
            game_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'completed',
            player1_id TEXT NOT NULL,
            player1_name TEXT NOT NULL,
            player2_id TEXT,
            player2_name TEXT,
            winner_id TEXT,
            game_state TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            ended_at INTEGER
        );
        CREATE TABLE IF NOT EXISTS player_stats (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            game_type TEXT NOT NULL,
            wins INTEGER NOT NULL DEFAULT 0,
            losses INTEGER NOT NULL DEFAULT 0,
            draws INTEGER NOT NULL DEFAULT 0,
            current_streak INTEGER NOT NULL DEFAULT 0,
            best_streak INTEGER NOT NULL DEFAULT 0,
            total_games INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            UNIQUE (user_id, game_type)
        );
        CREATE TABLE IF NOT EXISTS tournaments (
            id TEXT PRIMARY KEY,
            room_id TEXT NOT NULL,
            name TEXT NOT NULL,
            game_type TEXT NOT NULL,
            status TEXT NOT NULL,
            max_participants INTEGER NOT NULL,
            is_private INTEGER NOT NULL DEFAULT 0,
            join_code TEXT,
            created_by TEXT NOT NULL,
            winner_id TEXT,
            current_round INTEGER NOT NULL DEFAULT 0,
            total_rounds INTEGER NOT NULL DEFAULT 0,
            data TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            ended_at INTEGER
        );
        CREATE TABLE IF NOT EXISTS tournament_matches (
            id TEXT PRIMARY KEY,
            tournament_id TEXT NOT NULL,
            round INTEGER NOT NULL,
            match_number INTEGER NOT NULL,
            player1_id TEXT,
            player2_id TEXT,
            winner_id TEXT,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS tournament_rooms (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            host_id TEXT NOT NULL,
            game_type TEXT NOT NULL,
            max_players INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            read INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_completed_games_player1 ON completed_games (player1_id);
        CREATE INDEX IF NOT EXISTS idx_completed_games_player2 ON completed_games (player2_id);
        CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications (user_id);
        CREATE INDEX IF NOT EXISTS idx_tournament_matches_tournament ON tournament_matches (tournament_id);",
    )
    .map_err(DatabaseError::QueryError)?;
    Ok(())
}

pub fn to_sql_option<T>(value: &Option<T>) -> Option<&dyn ToSql>
where
    T: ToSql,
{
    value.as_ref().map(|v| v as &dyn ToSql)
}

pub(crate) fn update_entry(
    pool: &DbPool,
    table: &str,
    id: (&str, &dyn ToSql),
    value_pairs: Vec<(&str, Option<&dyn ToSql>)>,
) -> DatabaseResult<()> {
    let mut query = format!("UPDATE {} SET ", table);
    let mut assignments = Vec::new();
    let mut params: Vec<&dyn ToSql> = Vec::new();

    for (field, value) in value_pairs {
        if let Some(v) = value {
            assignments.push(format!("{} = ?", field));
            params.push(v);
        }
    }
    if params.is_empty() {
        return Ok(());
    }
    query.push_str(&assignments.join(", "));
    query.push_str(&format!(" WHERE {} = ?", id.0));
    params.push(id.1);
    let conn = get_connection(pool)?;
    conn.execute(&query, rusqlite::params_from_iter(params.iter()))
        .map_err(DatabaseError::QueryError)?;
    Ok(())
}
