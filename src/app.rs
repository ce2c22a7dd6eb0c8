use std::sync::Arc;

use crate::{
    auth::{ArcAuthService, AuthServiceImpl},
    client::{ArcClientService, HubService},
    game::{ArcGameService, ArcTournamentAdvancer, GameServiceImpl},
    matchmaking::{ArcMatchmakingService, MatchmakingServiceImpl},
    notification::{ArcNotificationService, NotificationServiceImpl},
    persistence::{
        DbPool,
        games::{ArcCompletedGameRepository, SqliteCompletedGameRepository},
        notifications::{ArcNotificationRepository, SqliteNotificationRepository},
        rooms::{ArcRoomRepository, SqliteRoomRepository},
        stats::{ArcStatsRepository, SqliteStatsRepository},
        tournaments::{ArcTournamentRepository, SqliteTournamentRepository},
        users::{ArcUserRepository, SqliteUserRepository},
    },
    room::{ArcRoomService, RoomServiceImpl},
    stats::{ArcStatsService, StatsServiceImpl},
    store::ArcEphemeralStore,
    tournament::{ArcTournamentService, TournamentServiceImpl},
    users::{ArcUserService, UserServiceImpl},
};

#[derive(Clone)]
pub struct AppState {
    pub store: ArcEphemeralStore,
    pub auth_service: ArcAuthService,
    pub user_service: ArcUserService,
    pub game_service: ArcGameService,
    pub room_service: ArcRoomService,
    pub matchmaking_service: ArcMatchmakingService,
    pub tournament_service: ArcTournamentService,
    pub stats_service: ArcStatsService,
    pub notification_service: ArcNotificationService,
    pub client_service: ArcClientService,
}

/// Build the full service graph. The game ↔ tournament cycle is closed after
/// construction by handing the tournament service to the game service as its
/// advancement seam. The concrete matchmaking service is returned alongside
/// so the caller can launch its worker.
pub fn construct_app(pool: &DbPool, store: ArcEphemeralStore) -> (AppState, MatchmakingServiceImpl) {
    let user_repo: ArcUserRepository =
        Arc::new(Box::new(SqliteUserRepository::new(pool.clone())));
    let game_repo: ArcCompletedGameRepository =
        Arc::new(Box::new(SqliteCompletedGameRepository::new(pool.clone())));
    let stats_repo: ArcStatsRepository =
        Arc::new(Box::new(SqliteStatsRepository::new(pool.clone())));
    let tournament_repo: ArcTournamentRepository =
        Arc::new(Box::new(SqliteTournamentRepository::new(pool.clone())));
    let room_repo: ArcRoomRepository = Arc::new(Box::new(SqliteRoomRepository::new(pool.clone())));
    let notification_repo: ArcNotificationRepository =
        Arc::new(Box::new(SqliteNotificationRepository::new(pool.clone())));

    let user_service: ArcUserService =
        Arc::new(Box::new(UserServiceImpl::new(user_repo.clone())));

    let auth_service: ArcAuthService = Arc::new(Box::new(AuthServiceImpl::new(
        user_repo.clone(),
        store.clone(),
    )));

    let stats_service: ArcStatsService = Arc::new(Box::new(StatsServiceImpl::new(
        user_service.clone(),
        stats_repo,
        game_repo.clone(),
    )));

    let game_service: ArcGameService = Arc::new(Box::new(GameServiceImpl::new(
        store.clone(),
        stats_service.clone(),
        game_repo,
    )));

    let room_service: ArcRoomService = Arc::new(Box::new(RoomServiceImpl::new(
        store.clone(),
        game_service.clone(),
        room_repo,
    )));

    let matchmaking_impl = MatchmakingServiceImpl::new(store.clone(), room_service.clone());
    let matchmaking_service: ArcMatchmakingService =
        Arc::new(Box::new(matchmaking_impl.clone()));

    let tournament_impl = TournamentServiceImpl::new(
        store.clone(),
        tournament_repo,
        room_service.clone(),
        game_service.clone(),
        user_service.clone(),
    );
    let tournament_service: ArcTournamentService = Arc::new(Box::new(tournament_impl.clone()));

    // close the game ↔ tournament cycle
    let advancer: ArcTournamentAdvancer = Arc::new(Box::new(tournament_impl));
    game_service.init_advancer(advancer);

    let notification_service: ArcNotificationService =
        Arc::new(Box::new(NotificationServiceImpl::new(notification_repo)));

    let client_service: ArcClientService = Arc::new(Box::new(HubService::new(
        game_service.clone(),
        room_service.clone(),
    )));

    (
        AppState {
            store,
            auth_service,
            user_service,
            game_service,
            room_service,
            matchmaking_service,
            tournament_service,
            stats_service,
            notification_service,
            client_service,
        },
        matchmaking_impl,
    )
}
