use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    ServiceError, ServiceResult,
    persistence::users::{ArcUserRepository, UserEntity, UserUpdate},
};

pub type UserId = Uuid;

pub const INITIAL_ELO_RATING: i64 = 1200;
pub const ELO_RATING_FLOOR: i64 = 100;

/// Identity pair threaded through service calls so display names never need a
/// durable-store round trip on the hot path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub username: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub elo_rating: i64,
    pub created_at: DateTime<Utc>,
}

impl From<&UserEntity> for UserProfile {
    fn from(user: &UserEntity) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            elo_rating: user.elo_rating,
            created_at: user.created_at,
        }
    }
}

pub trait UserService: Send + Sync {
    fn get_user(&self, id: &UserId) -> ServiceResult<UserEntity>;
    fn get_profile(&self, username: &str) -> ServiceResult<UserProfile>;
    fn update_username(&self, id: &UserId, new_username: &str) -> ServiceResult<UserProfile>;
    fn change_password(&self, id: &UserId, current: &str, new: &str) -> ServiceResult<()>;
    fn rating_of(&self, id: &UserId) -> ServiceResult<i64>;
    /// Used by the stats service after game completion; the caller has
    /// already applied the rating floor.
    fn set_rating(&self, id: &UserId, rating: i64) -> ServiceResult<()>;
}

pub type ArcUserService = Arc<Box<dyn UserService + Send + Sync>>;

const USER_CACHE_CAPACITY: u64 = 10_000;

pub struct UserServiceImpl {
    user_repo: ArcUserRepository,
    cache: moka::sync::Cache<UserId, UserEntity>,
}

impl UserServiceImpl {
    pub fn new(user_repo: ArcUserRepository) -> Self {
        Self {
            user_repo,
            cache: moka::sync::Cache::builder()
                .max_capacity(USER_CACHE_CAPACITY)
                .build(),
        }
    }

    fn fetch(&self, id: &UserId) -> ServiceResult<UserEntity> {
        if let Some(user) = self.cache.get(id) {
            return Ok(user);
        }
        let Some(user) = self.user_repo.get_by_id(id)? else {
            return ServiceError::not_found("User not found");
        };
        self.cache.insert(*id, user.clone());
        Ok(user)
    }
}

pub fn validate_username(username: &str) -> ServiceResult<()> {
    if username.len() < 3 || username.len() > 20 {
        return ServiceError::validation("Username must be between 3 and 20 characters");
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return ServiceError::validation(
            "Username may only contain letters, digits and underscores",
        );
    }
    Ok(())
}

pub fn validate_password(password: &str) -> ServiceResult<()> {
    if password.len() < 8 {
        return ServiceError::validation("Password must be at least 8 characters");
    }
    Ok(())
}

impl UserService for UserServiceImpl {
    fn get_user(&self, id: &UserId) -> ServiceResult<UserEntity> {
        self.fetch(id)
    }

    fn get_profile(&self, username: &str) -> ServiceResult<UserProfile> {
        let Some(user) = self.user_repo.get_by_username(username)? else {
            return ServiceError::not_found("User not found");
        };
        Ok(UserProfile::from(&user))
    }

    fn update_username(&self, id: &UserId, new_username: &str) -> ServiceResult<UserProfile> {
        validate_username(new_username)?;
        let user = self.fetch(id)?;
        if user.username == new_username {
            return Ok(UserProfile::from(&user));
        }
        if self.user_repo.get_by_username(new_username)?.is_some() {
            return ServiceError::conflict("Username already taken");
        }
        self.user_repo.update(
            id,
            &UserUpdate {
                username: Some(new_username.to_string()),
                ..Default::default()
            },
        )?;
        self.cache.invalidate(id);
        let updated = self.fetch(id)?;
        log::info!("User {} renamed to {}", id, new_username);
        Ok(UserProfile::from(&updated))
    }

    fn change_password(&self, id: &UserId, current: &str, new: &str) -> ServiceResult<()> {
        validate_password(new)?;
        let user = self.fetch(id)?;
        let matches = bcrypt::verify(current, &user.password_hash).unwrap_or(false);
        if !matches {
            return ServiceError::unauthorized("Current password is incorrect");
        }
        let hash = bcrypt::hash(new, bcrypt::DEFAULT_COST)
            .map_err(|e| ServiceError::Internal(format!("Failed to hash password: {}", e)))?;
        self.user_repo.update(
            id,
            &UserUpdate {
                password_hash: Some(hash),
                ..Default::default()
            },
        )?;
        self.cache.invalidate(id);
        Ok(())
    }

    fn rating_of(&self, id: &UserId) -> ServiceResult<i64> {
        Ok(self.fetch(id)?.elo_rating)
    }

    fn set_rating(&self, id: &UserId, rating: i64) -> ServiceResult<()> {
        self.user_repo.update(
            id,
            &UserUpdate {
                elo_rating: Some(rating),
                ..Default::default()
            },
        )?;
        self.cache.invalidate(id);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockUserService {
    pub users: Arc<dashmap::DashMap<UserId, UserEntity>>,
}

impl MockUserService {
    pub fn insert(&self, id: UserId, username: &str, elo_rating: i64) {
        let now = Utc::now();
        self.users.insert(
            id,
            UserEntity {
                id,
                username: username.to_string(),
                email: format!("{}@example.com", username),
                password_hash: String::new(),
                elo_rating,
                created_at: now,
                updated_at: now,
            },
        );
    }
}

impl UserService for MockUserService {
    fn get_user(&self, id: &UserId) -> ServiceResult<UserEntity> {
        match self.users.get(id) {
            Some(user) => Ok(user.value().clone()),
            None => ServiceError::not_found("User not found"),
        }
    }

    fn get_profile(&self, username: &str) -> ServiceResult<UserProfile> {
        self.users
            .iter()
            .find(|entry| entry.username == username)
            .map(|entry| UserProfile::from(entry.value()))
            .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))
    }

    fn update_username(&self, id: &UserId, new_username: &str) -> ServiceResult<UserProfile> {
        let mut user = match self.users.get_mut(id) {
            Some(user) => user,
            None => return ServiceError::not_found("User not found"),
        };
        user.username = new_username.to_string();
        Ok(UserProfile::from(&*user))
    }

    fn change_password(&self, _id: &UserId, _current: &str, _new: &str) -> ServiceResult<()> {
        Ok(())
    }

    fn rating_of(&self, id: &UserId) -> ServiceResult<i64> {
        Ok(self.get_user(id)?.elo_rating)
    }

    fn set_rating(&self, id: &UserId, rating: i64) -> ServiceResult<()> {
        let mut user = match self.users.get_mut(id) {
            Some(user) => user,
            None => return ServiceError::not_found("User not found"),
        };
        user.elo_rating = rating;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_validation() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("a_1").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username("with space").is_err());
        assert!(validate_username("twentyone_characters_").is_err());
    }

    #[test]
    fn test_password_validation() {
        assert!(validate_password("longenough").is_ok());
        assert!(validate_password("short").is_err());
    }
}
