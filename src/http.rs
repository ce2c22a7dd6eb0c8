use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::{
    AppState, ServiceError,
    auth::{AuthUser, LoginRequest, SignupRequest, validate_token},
    client::MAX_FRAME_BYTES,
    config::Config,
    engine::GameKind,
    game::GameSessionView,
    room::CreateRoomRequest,
    tournament::{CreateTournamentRequest, TournamentStatus},
    users::UserRef,
};

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Database(_) | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        }
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub fn router(state: AppState, config: &Config) -> Router {
    let cors = if config.cors_origins.trim() == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .cors_origins
            .split(',')
            .filter_map(|o| o.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/profile", put(update_profile))
        .route("/profile/password", post(change_password))
        .route("/profile/{username}", get(get_profile))
        .route("/games/create", post(create_game))
        .route("/games/join", post(join_game))
        .route("/games/{id}", get(get_game))
        .route("/games/{id}/spectate", post(spectate).delete(unspectate))
        .route("/games/{id}/spectators", get(get_spectators))
        .route("/stats", get(get_stats))
        .route("/stats/leaderboard", get(leaderboard))
        .route("/stats/history", get(match_history))
        .route("/stats/{game_type}", get(get_kind_stats))
        .route("/matchmaking/queue", post(join_queue).delete(leave_queue))
        .route("/matchmaking/status", get(queue_status))
        .route("/rooms/create", post(create_room))
        .route("/rooms/join", post(join_room_by_code))
        .route("/rooms/{id}", get(get_room))
        .route("/rooms/{id}/join", post(join_room))
        .route("/rooms/{id}/leave", post(leave_room))
        .route("/rooms/{id}/ready", post(set_ready))
        .route("/rooms/{id}/start", post(start_room_game))
        .route("/tournaments/create", post(create_tournament))
        .route("/tournaments", get(list_tournaments))
        .route("/tournaments/{id}", get(get_tournament))
        .route("/tournaments/{id}/join", post(join_tournament))
        .route("/tournaments/{id}/start", post(start_tournament))
        .route("/notifications", get(list_notifications))
        .route("/notifications/read-all", post(read_all_notifications))
        .route(
            "/notifications/{id}",
            delete(delete_notification),
        )
        .route("/notifications/{id}/read", post(read_notification))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .with_state(state)
}

fn user_ref(user: &AuthUser) -> UserRef {
    UserRef {
        id: user.id,
        username: user.username.clone(),
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(raw).map_err(|_| ServiceError::Validation("Invalid id".to_string()))
}

// --- auth ---

async fn signup(
    State(app): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let response = app.auth_service.signup(&req)?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn login(
    State(app): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(app.auth_service.login(&req)?))
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh(
    State(app): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(app.auth_service.refresh(&req.refresh_token)?))
}

async fn logout(
    State(app): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    app.auth_service.logout(&user.id)?;
    Ok(Json(json!({ "message": "Logged out" })))
}

async fn me(
    State(app): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(app.auth_service.me(&user.id)?))
}

// --- profile ---

#[derive(Deserialize)]
struct UpdateProfileRequest {
    username: String,
}

async fn update_profile(
    State(app): State<AppState>,
    user: AuthUser,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(
        app.user_service.update_username(&user.id, &req.username)?,
    ))
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(app): State<AppState>,
    user: AuthUser,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    app.user_service
        .change_password(&user.id, &req.current_password, &req.new_password)?;
    Ok(Json(json!({ "message": "Password updated" })))
}

async fn get_profile(
    State(app): State<AppState>,
    _user: AuthUser,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(app.user_service.get_profile(&username)?))
}

// --- games ---

#[derive(Deserialize)]
struct CreateGameRequest {
    game_type: GameKind,
    #[serde(default)]
    game_settings: Option<crate::engine::GameSettings>,
}

async fn create_game(
    State(app): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateGameRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = app.game_service.create(
        req.game_type,
        &user_ref(&user),
        req.game_settings.as_ref(),
    )?;
    Ok((StatusCode::CREATED, Json(session.view())))
}

#[derive(Deserialize)]
struct JoinGameRequest {
    game_id: String,
}

async fn join_game(
    State(app): State<AppState>,
    user: AuthUser,
    Json(req): Json<JoinGameRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&req.game_id)?;
    Ok(Json(app.game_service.join(&id, &user_ref(&user))?.view()))
}

/// Fetch a game; a tournament match whose backing session does not exist yet
/// is reified on demand.
async fn get_game(
    State(app): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<GameSessionView>, ServiceError> {
    let id = parse_id(&id)?;
    match app.game_service.get(&id) {
        Ok(session) => Ok(Json(session.view())),
        Err(ServiceError::NotFound(_)) => {
            match app.tournament_service.ensure_match_game(&id)? {
                Some(session) => Ok(Json(session.view())),
                None => Err(ServiceError::NotFound("Game not found".to_string())),
            }
        }
        Err(e) => Err(e),
    }
}

async fn spectate(
    State(app): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(
        app.game_service.add_spectator(&id, &user_ref(&user))?.view(),
    ))
}

async fn unspectate(
    State(app): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(app.game_service.remove_spectator(&id, &user.id)?.view()))
}

async fn get_spectators(
    State(app): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    let spectators = app.game_service.get_spectators(&id)?;
    Ok(Json(json!({
        "game_id": id,
        "count": spectators.len(),
        "spectators": spectators,
    })))
}

// --- stats ---

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default)]
    game_type: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

fn parse_kind(raw: &str) -> Result<GameKind, ServiceError> {
    GameKind::from_str(raw)
        .ok_or_else(|| ServiceError::Validation(format!("Unknown game type: {}", raw)))
}

async fn get_stats(
    State(app): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(app.stats_service.aggregated_stats(&user.id)?))
}

async fn get_kind_stats(
    State(app): State<AppState>,
    user: AuthUser,
    Path(game_type): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let kind = parse_kind(&game_type)?;
    Ok(Json(app.stats_service.player_stats(&user.id, kind)?))
}

async fn leaderboard(
    State(app): State<AppState>,
    _user: AuthUser,
    Query(query): Query<StatsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let kind = query.game_type.as_deref().map(parse_kind).transpose()?;
    Ok(Json(
        app.stats_service
            .leaderboard(kind, query.limit.unwrap_or(0))?,
    ))
}

async fn match_history(
    State(app): State<AppState>,
    user: AuthUser,
    Query(query): Query<StatsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let kind = query.game_type.as_deref().map(parse_kind).transpose()?;
    Ok(Json(app.stats_service.match_history(
        &user.id,
        kind,
        query.limit.unwrap_or(0),
    )?))
}

// --- matchmaking ---

#[derive(Deserialize)]
struct QueueRequest {
    game_type: GameKind,
}

async fn join_queue(
    State(app): State<AppState>,
    user: AuthUser,
    Json(req): Json<QueueRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let rating = app.user_service.rating_of(&user.id)?;
    let entry = app
        .matchmaking_service
        .join_queue(&user_ref(&user), req.game_type, rating)?;
    Ok(Json(json!({ "queue_entry": entry })))
}

async fn leave_queue(
    State(app): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    app.matchmaking_service.leave_queue(&user.id)?;
    Ok(Json(json!({ "message": "Left the queue" })))
}

async fn queue_status(
    State(app): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(
        json!({ "queue_entry": app.matchmaking_service.queue_status(&user.id)? }),
    ))
}

// --- rooms ---

async fn create_room(
    State(app): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let room = app.room_service.create(&user_ref(&user), &req)?;
    Ok((StatusCode::CREATED, Json(room)))
}

#[derive(Deserialize)]
struct JoinByCodeRequest {
    join_code: String,
}

async fn join_room_by_code(
    State(app): State<AppState>,
    user: AuthUser,
    Json(req): Json<JoinByCodeRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(
        app.room_service
            .join_by_code(&req.join_code, &user_ref(&user))?,
    ))
}

async fn get_room(
    State(app): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(app.room_service.get(&id)?))
}

async fn join_room(
    State(app): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(app.room_service.join(&id, &user_ref(&user))?))
}

async fn leave_room(
    State(app): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    app.room_service.leave(&id, &user.id)?;
    Ok(Json(json!({ "message": "Left the room" })))
}

#[derive(Deserialize)]
struct ReadyRequest {
    is_ready: bool,
}

async fn set_ready(
    State(app): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<ReadyRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(app.room_service.set_ready(&id, &user.id, req.is_ready)?))
}

async fn start_room_game(
    State(app): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(app.room_service.start_game(&id, &user.id)?))
}

// --- tournaments ---

async fn create_tournament(
    State(app): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateTournamentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let tournament = app.tournament_service.create(&user_ref(&user), &req)?;
    Ok((StatusCode::CREATED, Json(tournament)))
}

#[derive(Deserialize)]
struct TournamentListQuery {
    #[serde(default)]
    status: Option<TournamentStatus>,
    #[serde(default)]
    limit: Option<u32>,
}

async fn list_tournaments(
    State(app): State<AppState>,
    _user: AuthUser,
    Query(query): Query<TournamentListQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let tournaments = app
        .tournament_service
        .list(query.status, query.limit.unwrap_or(0))?;
    Ok(Json(json!({
        "total": tournaments.len(),
        "tournaments": tournaments,
    })))
}

async fn get_tournament(
    State(app): State<AppState>,
    _user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(app.tournament_service.get(&id)?))
}

#[derive(Deserialize, Default)]
struct JoinTournamentRequest {
    #[serde(default)]
    join_code: Option<String>,
}

async fn join_tournament(
    State(app): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<JoinTournamentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(app.tournament_service.join(
        &id,
        &user_ref(&user),
        req.join_code.as_deref(),
    )?))
}

async fn start_tournament(
    State(app): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(app.tournament_service.start(&id, &user.id)?))
}

// --- notifications ---

#[derive(Deserialize)]
struct NotificationQuery {
    #[serde(default)]
    unread: Option<bool>,
    #[serde(default)]
    limit: Option<u32>,
}

async fn list_notifications(
    State(app): State<AppState>,
    user: AuthUser,
    Query(query): Query<NotificationQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let notifications = app.notification_service.list(
        &user.id,
        query.unread.unwrap_or(false),
        query.limit.unwrap_or(0),
    )?;
    Ok(Json(json!({ "notifications": notifications })))
}

async fn read_notification(
    State(app): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    if !app.notification_service.mark_read(&user.id, &id)? {
        return ServiceError::not_found("Notification not found");
    }
    Ok(Json(json!({ "message": "Notification read" })))
}

async fn read_all_notifications(
    State(app): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, ServiceError> {
    let updated = app.notification_service.mark_all_read(&user.id)?;
    Ok(Json(json!({ "updated": updated })))
}

async fn delete_notification(
    State(app): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let id = parse_id(&id)?;
    if !app.notification_service.delete(&user.id, &id)? {
        return ServiceError::not_found("Notification not found");
    }
    Ok(Json(json!({ "message": "Notification deleted" })))
}

// --- websocket ---

#[derive(Deserialize)]
struct WsQuery {
    token: String,
}

async fn ws_upgrade(
    State(app): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServiceError> {
    let user = validate_token(&query.token)?;
    Ok(ws
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            app.client_service.handle_socket(socket, user).await;
        }))
}
