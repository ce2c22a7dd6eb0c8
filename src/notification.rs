use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    ServiceResult,
    persistence::notifications::ArcNotificationRepository,
    users::UserId,
};

pub type NotificationId = Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

pub trait NotificationService: Send + Sync {
    fn create(
        &self,
        user_id: &UserId,
        kind: &str,
        title: &str,
        message: &str,
        data: HashMap<String, String>,
    ) -> ServiceResult<Notification>;
    fn list(&self, user_id: &UserId, unread_only: bool, limit: u32) -> ServiceResult<Vec<Notification>>;
    fn mark_read(&self, user_id: &UserId, id: &NotificationId) -> ServiceResult<bool>;
    fn mark_all_read(&self, user_id: &UserId) -> ServiceResult<u64>;
    fn delete(&self, user_id: &UserId, id: &NotificationId) -> ServiceResult<bool>;
}

pub type ArcNotificationService = Arc<Box<dyn NotificationService + Send + Sync>>;

const LIST_LIMIT_DEFAULT: u32 = 50;
const LIST_LIMIT_MAX: u32 = 100;

pub struct NotificationServiceImpl {
    repo: ArcNotificationRepository,
}

impl NotificationServiceImpl {
    pub fn new(repo: ArcNotificationRepository) -> Self {
        Self { repo }
    }
}

impl NotificationService for NotificationServiceImpl {
    fn create(
        &self,
        user_id: &UserId,
        kind: &str,
        title: &str,
        message: &str,
        data: HashMap<String, String>,
    ) -> ServiceResult<Notification> {
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: *user_id,
            kind: kind.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            data,
            read: false,
            created_at: Utc::now(),
        };
        self.repo.create(&notification)?;
        Ok(notification)
    }

    fn list(
        &self,
        user_id: &UserId,
        unread_only: bool,
        limit: u32,
    ) -> ServiceResult<Vec<Notification>> {
        let limit = if limit == 0 || limit > LIST_LIMIT_MAX {
            LIST_LIMIT_DEFAULT
        } else {
            limit
        };
        Ok(self.repo.list_for_user(user_id, unread_only, limit)?)
    }

    fn mark_read(&self, user_id: &UserId, id: &NotificationId) -> ServiceResult<bool> {
        Ok(self.repo.mark_read(user_id, id)?)
    }

    fn mark_all_read(&self, user_id: &UserId) -> ServiceResult<u64> {
        Ok(self.repo.mark_all_read(user_id)?)
    }

    fn delete(&self, user_id: &UserId, id: &NotificationId) -> ServiceResult<bool> {
        Ok(self.repo.delete(user_id, id)?)
    }
}

#[derive(Clone, Default)]
pub struct MockNotificationService {
    pub created: Arc<std::sync::Mutex<Vec<Notification>>>,
}

impl NotificationService for MockNotificationService {
    fn create(
        &self,
        user_id: &UserId,
        kind: &str,
        title: &str,
        message: &str,
        data: HashMap<String, String>,
    ) -> ServiceResult<Notification> {
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: *user_id,
            kind: kind.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            data,
            read: false,
            created_at: Utc::now(),
        };
        self.created.lock().unwrap().push(notification.clone());
        Ok(notification)
    }

    fn list(
        &self,
        user_id: &UserId,
        unread_only: bool,
        _limit: u32,
    ) -> ServiceResult<Vec<Notification>> {
        Ok(self
            .created
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.user_id == *user_id && (!unread_only || !n.read))
            .cloned()
            .collect())
    }

    fn mark_read(&self, user_id: &UserId, id: &NotificationId) -> ServiceResult<bool> {
        let mut created = self.created.lock().unwrap();
        for n in created.iter_mut() {
            if n.id == *id && n.user_id == *user_id {
                n.read = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn mark_all_read(&self, user_id: &UserId) -> ServiceResult<u64> {
        let mut created = self.created.lock().unwrap();
        let mut count = 0;
        for n in created.iter_mut() {
            if n.user_id == *user_id && !n.read {
                n.read = true;
                count += 1;
            }
        }
        Ok(count)
    }

    fn delete(&self, user_id: &UserId, id: &NotificationId) -> ServiceResult<bool> {
        let mut created = self.created.lock().unwrap();
        let before = created.len();
        created.retain(|n| !(n.id == *id && n.user_id == *user_id));
        Ok(created.len() < before)
    }
}
