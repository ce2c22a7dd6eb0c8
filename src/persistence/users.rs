use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Row, ToSql};
use uuid::Uuid;

use crate::persistence::{
    DatabaseError, DatabaseResult, DbPool, get_connection, to_sql_option, update_entry,
};
use crate::users::UserId;

#[derive(Clone, Debug)]
pub struct UserEntity {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub elo_rating: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update; fields left at `None` are untouched.
#[derive(Debug, Default)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub password_hash: Option<String>,
    pub elo_rating: Option<i64>,
}

pub trait UserRepository: Send + Sync {
    fn create(&self, user: &UserEntity) -> DatabaseResult<()>;
    fn get_by_id(&self, id: &UserId) -> DatabaseResult<Option<UserEntity>>;
    fn get_by_username(&self, username: &str) -> DatabaseResult<Option<UserEntity>>;
    fn get_by_email(&self, email: &str) -> DatabaseResult<Option<UserEntity>>;
    fn update(&self, id: &UserId, update: &UserUpdate) -> DatabaseResult<()>;
}

pub type ArcUserRepository = std::sync::Arc<Box<dyn UserRepository>>;

pub struct SqliteUserRepository {
    pool: DbPool,
}

impl SqliteUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &Row) -> Result<UserEntity, rusqlite::Error> {
        let id: String = row.get("id")?;
        let created_at: i64 = row.get("created_at")?;
        let updated_at: i64 = row.get("updated_at")?;
        Ok(UserEntity {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            username: row.get("username")?,
            email: row.get("email")?,
            password_hash: row.get("password_hash")?,
            elo_rating: row.get("elo_rating")?,
            created_at: Utc.timestamp_opt(created_at, 0).single().unwrap_or_default(),
            updated_at: Utc.timestamp_opt(updated_at, 0).single().unwrap_or_default(),
        })
    }

    fn get_by_field(&self, field: &str, value: &str) -> DatabaseResult<Option<UserEntity>> {
        let conn = get_connection(&self.pool)?;
        let query = format!("SELECT * FROM users WHERE {} = ?1", field);
        let mut stmt = conn.prepare(&query).map_err(DatabaseError::QueryError)?;
        let mut rows = stmt
            .query_map([value], Self::from_row)
            .map_err(DatabaseError::QueryError)?;
        match rows.next() {
            Some(Ok(user)) => Ok(Some(user)),
            Some(Err(e)) => Err(DatabaseError::QueryError(e)),
            None => Ok(None),
        }
    }
}

impl UserRepository for SqliteUserRepository {
    fn create(&self, user: &UserEntity) -> DatabaseResult<()> {
        let conn = get_connection(&self.pool)?;
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, elo_rating, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                user.id.to_string(),
                user.username,
                user.email,
                user.password_hash,
                user.elo_rating,
                user.created_at.timestamp(),
                user.updated_at.timestamp(),
            ],
        )
        .map_err(DatabaseError::QueryError)?;
        Ok(())
    }

    fn get_by_id(&self, id: &UserId) -> DatabaseResult<Option<UserEntity>> {
        self.get_by_field("id", &id.to_string())
    }

    fn get_by_username(&self, username: &str) -> DatabaseResult<Option<UserEntity>> {
        self.get_by_field("username", username)
    }

    fn get_by_email(&self, email: &str) -> DatabaseResult<Option<UserEntity>> {
        self.get_by_field("email", email)
    }

    fn update(&self, id: &UserId, update: &UserUpdate) -> DatabaseResult<()> {
        if update.username.is_none()
            && update.password_hash.is_none()
            && update.elo_rating.is_none()
        {
            return Ok(());
        }
        let id = id.to_string();
        let updated_at = Utc::now().timestamp();
        let value_pairs: Vec<(&str, Option<&dyn ToSql>)> = vec![
            ("username", to_sql_option(&update.username)),
            ("password_hash", to_sql_option(&update.password_hash)),
            ("elo_rating", to_sql_option(&update.elo_rating)),
            ("updated_at", Some(&updated_at)),
        ];
        update_entry(&self.pool, "users", ("id", &id), value_pairs)
    }
}
