use chrono::Utc;
use rusqlite::ToSql;

use crate::persistence::{DatabaseError, DatabaseResult, DbPool, get_connection, update_entry};
use crate::room::RoomId;
use crate::users::UserId;

/// Only tournament-linked rooms are written durably; quickplay and plain
/// private rooms live in the ephemeral store alone.
#[derive(Clone, Debug)]
pub struct TournamentRoomEntity {
    pub id: RoomId,
    pub code: String,
    pub host_id: UserId,
    pub game_type: String,
    pub max_players: u32,
    pub status: String,
}

pub trait RoomRepository: Send + Sync {
    fn create(&self, room: &TournamentRoomEntity) -> DatabaseResult<()>;
    fn update_status(&self, id: &RoomId, status: &str) -> DatabaseResult<()>;
}

pub type ArcRoomRepository = std::sync::Arc<Box<dyn RoomRepository>>;

pub struct SqliteRoomRepository {
    pool: DbPool,
}

impl SqliteRoomRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl RoomRepository for SqliteRoomRepository {
    fn create(&self, room: &TournamentRoomEntity) -> DatabaseResult<()> {
        let conn = get_connection(&self.pool)?;
        conn.execute(
            "INSERT INTO tournament_rooms (id, code, host_id, game_type, max_players, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                room.id.to_string(),
                room.code,
                room.host_id.to_string(),
                room.game_type,
                room.max_players,
                room.status,
                Utc::now().timestamp(),
            ],
        )
        .map_err(DatabaseError::QueryError)?;
        Ok(())
    }

    fn update_status(&self, id: &RoomId, status: &str) -> DatabaseResult<()> {
        let id = id.to_string();
        let status = status.to_string();
        let value_pairs: Vec<(&str, Option<&dyn ToSql>)> = vec![("status", Some(&status))];
        update_entry(&self.pool, "tournament_rooms", ("id", &id), value_pairs)
    }
}
