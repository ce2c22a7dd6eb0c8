use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::{RequestPartsExt, extract::FromRequestParts, http::request::Parts};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    ServiceError, ServiceResult,
    persistence::users::{ArcUserRepository, UserEntity},
    store::ArcEphemeralStore,
    users::{INITIAL_ELO_RATING, UserId, validate_password, validate_username},
};

const ACCESS_TOKEN_MINUTES: i64 = 15;
const REFRESH_TOKEN_DAYS: i64 = 7;
const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn refresh_token_key(user_id: &UserId) -> String {
    format!("refresh_token:{}", user_id)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub exp: usize,
}

/// Authenticated identity attached to every request context.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub id: UserId,
    pub username: String,
    pub email: String,
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Keys {
    fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

static KEYS: OnceLock<Keys> = OnceLock::new();

/// Install the symmetric signing secret from the loaded configuration.
/// Called once at boot, before any token is minted or checked.
pub fn init_keys(secret: &str) {
    let _ = KEYS.set(Keys::new(secret.as_bytes()));
}

fn keys() -> &'static Keys {
    KEYS.get_or_init(|| {
        log::warn!("JWT keys used before configuration, generating a random secret");
        Keys::new(Uuid::new_v4().as_bytes())
    })
}

fn generate_token(user: &UserEntity, lifetime: chrono::Duration) -> ServiceResult<String> {
    let claims = Claims {
        user_id: user.id.to_string(),
        username: user.username.clone(),
        email: user.email.clone(),
        exp: (Utc::now() + lifetime).timestamp() as usize,
    };
    encode(&Header::default(), &claims, &keys().encoding)
        .map_err(|e| ServiceError::Internal(format!("Failed to sign token: {}", e)))
}

/// Decode and verify a bearer token into the request identity.
pub fn validate_token(token: &str) -> ServiceResult<AuthUser> {
    let data = decode::<Claims>(token, &keys().decoding, &Validation::default())
        .map_err(|_| ServiceError::Unauthorized("Invalid token".to_string()))?;
    let id = Uuid::parse_str(&data.claims.user_id)
        .map_err(|_| ServiceError::Unauthorized("Invalid token".to_string()))?;
    Ok(AuthUser {
        id,
        username: data.claims.username,
        email: data.claims.email,
    })
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| ServiceError::Unauthorized("Missing bearer token".to_string()))?;
        validate_token(bearer.token())
    }
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthUserView {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub elo_rating: i64,
}

impl From<&UserEntity> for AuthUserView {
    fn from(user: &UserEntity) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            elo_rating: user.elo_rating,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: AuthUserView,
    pub access_token: String,
    pub refresh_token: String,
}

pub trait AuthService: Send + Sync {
    fn signup(&self, req: &SignupRequest) -> ServiceResult<AuthResponse>;
    fn login(&self, req: &LoginRequest) -> ServiceResult<AuthResponse>;
    fn refresh(&self, refresh_token: &str) -> ServiceResult<AuthResponse>;
    fn logout(&self, user_id: &UserId) -> ServiceResult<()>;
    fn me(&self, user_id: &UserId) -> ServiceResult<AuthUserView>;
}

pub type ArcAuthService = Arc<Box<dyn AuthService + Send + Sync>>;

pub struct AuthServiceImpl {
    user_repo: ArcUserRepository,
    store: ArcEphemeralStore,
}

impl AuthServiceImpl {
    pub fn new(user_repo: ArcUserRepository, store: ArcEphemeralStore) -> Self {
        Self { user_repo, store }
    }

    /// Mint both tokens and rotate the stored refresh token.
    fn issue_tokens(&self, user: &UserEntity) -> ServiceResult<AuthResponse> {
        let access_token = generate_token(user, chrono::Duration::minutes(ACCESS_TOKEN_MINUTES))?;
        let refresh_token = generate_token(user, chrono::Duration::days(REFRESH_TOKEN_DAYS))?;
        self.store
            .set_ex(&refresh_token_key(&user.id), &refresh_token, REFRESH_TOKEN_TTL);
        Ok(AuthResponse {
            user: AuthUserView::from(user),
            access_token,
            refresh_token,
        })
    }
}

impl AuthService for AuthServiceImpl {
    fn signup(&self, req: &SignupRequest) -> ServiceResult<AuthResponse> {
        validate_username(&req.username)?;
        validate_password(&req.password)?;
        if !req.email.contains('@') {
            return ServiceError::validation("Invalid email address");
        }
        if self.user_repo.get_by_email(&req.email)?.is_some() {
            return ServiceError::conflict("Email already registered");
        }
        if self.user_repo.get_by_username(&req.username)?.is_some() {
            return ServiceError::conflict("Username already taken");
        }

        let password_hash = bcrypt::hash(&req.password, bcrypt::DEFAULT_COST)
            .map_err(|e| ServiceError::Internal(format!("Failed to hash password: {}", e)))?;
        let now = Utc::now();
        let user = UserEntity {
            id: Uuid::new_v4(),
            username: req.username.clone(),
            email: req.email.clone(),
            password_hash,
            elo_rating: INITIAL_ELO_RATING,
            created_at: now,
            updated_at: now,
        };
        self.user_repo.create(&user)?;
        log::info!("User {} signed up", user.username);

        self.issue_tokens(&user)
    }

    fn login(&self, req: &LoginRequest) -> ServiceResult<AuthResponse> {
        let Some(user) = self.user_repo.get_by_email(&req.email)? else {
            return ServiceError::unauthorized("Invalid credentials");
        };
        let matches = bcrypt::verify(&req.password, &user.password_hash).unwrap_or(false);
        if !matches {
            return ServiceError::unauthorized("Invalid credentials");
        }
        self.issue_tokens(&user)
    }

    fn refresh(&self, refresh_token: &str) -> ServiceResult<AuthResponse> {
        let identity = validate_token(refresh_token)?;
        let stored = self.store.get(&refresh_token_key(&identity.id));
        if stored.as_deref() != Some(refresh_token) {
            return ServiceError::unauthorized("Refresh token revoked");
        }
        let Some(user) = self.user_repo.get_by_id(&identity.id)? else {
            return ServiceError::unauthorized("Unknown user");
        };
        // rotation: the old refresh token is replaced atomically by issue
        self.issue_tokens(&user)
    }

    fn logout(&self, user_id: &UserId) -> ServiceResult<()> {
        // access tokens expire on their own within 15 minutes
        self.store.del(&refresh_token_key(user_id));
        Ok(())
    }

    fn me(&self, user_id: &UserId) -> ServiceResult<AuthUserView> {
        let Some(user) = self.user_repo.get_by_id(user_id)? else {
            return ServiceError::not_found("User not found");
        };
        Ok(AuthUserView::from(&user))
    }
}
