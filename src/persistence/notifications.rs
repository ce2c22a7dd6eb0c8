use chrono::{TimeZone, Utc};
use rusqlite::Row;
use uuid::Uuid;

use crate::notification::{Notification, NotificationId};
use crate::persistence::{DatabaseError, DatabaseResult, DbPool, get_connection};
use crate::users::UserId;

pub trait NotificationRepository: Send + Sync {
    fn create(&self, notification: &Notification) -> DatabaseResult<()>;
    fn list_for_user(
        &self,
        user_id: &UserId,
        unread_only: bool,
        limit: u32,
    ) -> DatabaseResult<Vec<Notification>>;
    fn mark_read(&self, user_id: &UserId, id: &NotificationId) -> DatabaseResult<bool>;
    fn mark_all_read(&self, user_id: &UserId) -> DatabaseResult<u64>;
    fn delete(&self, user_id: &UserId, id: &NotificationId) -> DatabaseResult<bool>;
}

pub type ArcNotificationRepository = std::sync::Arc<Box<dyn NotificationRepository>>;

pub struct SqliteNotificationRepository {
    pool: DbPool,
}

impl SqliteNotificationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &Row) -> Result<Notification, rusqlite::Error> {
        let id: String = row.get("id")?;
        let user_id: String = row.get("user_id")?;
        let data: String = row.get("data")?;
        let created_at: i64 = row.get("created_at")?;
        Ok(Notification {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            user_id: Uuid::parse_str(&user_id).unwrap_or_default(),
            kind: row.get("kind")?,
            title: row.get("title")?,
            message: row.get("message")?,
            data: serde_json::from_str(&data).unwrap_or_default(),
            read: row.get::<_, i64>("read")? != 0,
            created_at: Utc.timestamp_opt(created_at, 0).single().unwrap_or_default(),
        })
    }
}

impl NotificationRepository for SqliteNotificationRepository {
    fn create(&self, notification: &Notification) -> DatabaseResult<()> {
        let data = serde_json::to_string(&notification.data).unwrap_or_else(|_| "{}".to_string());
        let conn = get_connection(&self.pool)?;
        conn.execute(
            "INSERT INTO notifications (id, user_id, kind, title, message, data, read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                notification.id.to_string(),
                notification.user_id.to_string(),
                notification.kind,
                notification.title,
                notification.message,
                data,
                notification.read,
                notification.created_at.timestamp(),
            ],
        )
        .map_err(DatabaseError::QueryError)?;
        Ok(())
    }

    fn list_for_user(
        &self,
        user_id: &UserId,
        unread_only: bool,
        limit: u32,
    ) -> DatabaseResult<Vec<Notification>> {
        let conn = get_connection(&self.pool)?;
        let query = if unread_only {
            "SELECT * FROM notifications WHERE user_id = ?1 AND read = 0
             ORDER BY created_at DESC LIMIT ?2"
        } else {
            "SELECT * FROM notifications WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2"
        };
        let mut stmt = conn.prepare(query).map_err(DatabaseError::QueryError)?;
        let rows = stmt
            .query_map(
                rusqlite::params![user_id.to_string(), limit],
                Self::from_row,
            )
            .map_err(DatabaseError::QueryError)?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row.map_err(DatabaseError::QueryError)?);
        }
        Ok(notifications)
    }

    fn mark_read(&self, user_id: &UserId, id: &NotificationId) -> DatabaseResult<bool> {
        let conn = get_connection(&self.pool)?;
        let changed = conn
            .execute(
                "UPDATE notifications SET read = 1 WHERE id = ?1 AND user_id = ?2",
                rusqlite::params![id.to_string(), user_id.to_string()],
            )
            .map_err(DatabaseError::QueryError)?;
        Ok(changed > 0)
    }

    fn mark_all_read(&self, user_id: &UserId) -> DatabaseResult<u64> {
        let conn = get_connection(&self.pool)?;
        let changed = conn
            .execute(
                "UPDATE notifications SET read = 1 WHERE user_id = ?1 AND read = 0",
                rusqlite::params![user_id.to_string()],
            )
            .map_err(DatabaseError::QueryError)?;
        Ok(changed as u64)
    }

    fn delete(&self, user_id: &UserId, id: &NotificationId) -> DatabaseResult<bool> {
        let conn = get_connection(&self.pool)?;
        let changed = conn
            .execute(
                "DELETE FROM notifications WHERE id = ?1 AND user_id = ?2",
                rusqlite::params![id.to_string(), user_id.to_string()],
            )
            .map_err(DatabaseError::QueryError)?;
        Ok(changed > 0)
    }
}
