use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    ServiceResult,
    engine::GameKind,
    persistence::{
        games::ArcCompletedGameRepository,
        stats::{ArcStatsRepository, LeaderboardEntry, PlayerStatsEntity},
    },
    users::{ArcUserService, ELO_RATING_FLOOR, UserId},
};

const ELO_K_FACTOR: f64 = 32.0;

// Progressive tournament stakes: cheap entry round, double-stakes finals.
const TOURNAMENT_ROUND1_MULTIPLIER: f64 = 0.8;
const TOURNAMENT_QUARTERFINALS_MULTIPLIER: f64 = 1.2;
const TOURNAMENT_SEMIFINALS_MULTIPLIER: f64 = 1.5;
const TOURNAMENT_FINALS_MULTIPLIER: f64 = 2.0;

// Tournament losers take only half the ordinary rating loss.
const TOURNAMENT_LOSS_PENALTY: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameOutcome {
    Player1Win,
    Player2Win,
    Draw,
}

impl GameOutcome {
    pub fn from_winner(p1: &UserId, p2: &UserId, winner: Option<&UserId>) -> Self {
        match winner {
            Some(w) if w == p1 => GameOutcome::Player1Win,
            Some(w) if w == p2 => GameOutcome::Player2Win,
            _ => GameOutcome::Draw,
        }
    }

    fn scores(&self) -> (f64, f64) {
        match self {
            GameOutcome::Player1Win => (1.0, 0.0),
            GameOutcome::Player2Win => (0.0, 1.0),
            GameOutcome::Draw => (0.5, 0.5),
        }
    }
}

fn expected_score(own: i64, opponent: i64) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent - own) as f64 / 400.0))
}

fn clamp_rating(rating: f64) -> i64 {
    (rating.round() as i64).max(ELO_RATING_FLOOR)
}

/// Standard ELO update, K = 32, floor 100.
pub fn calculate_ratings(r1: i64, r2: i64, outcome: GameOutcome) -> (i64, i64) {
    let (s1, s2) = outcome.scores();
    let new1 = r1 as f64 + ELO_K_FACTOR * (s1 - expected_score(r1, r2));
    let new2 = r2 as f64 + ELO_K_FACTOR * (s2 - expected_score(r2, r1));
    (clamp_rating(new1), clamp_rating(new2))
}

/// The multiplier for a tournament round: literal round 1 is the discounted
/// entry round, the last three rounds carry quarterfinal/semifinal/final
/// stakes, anything in between is unscaled.
pub fn tournament_multiplier(round: u32, total_rounds: u32) -> f64 {
    if round >= total_rounds {
        TOURNAMENT_FINALS_MULTIPLIER
    } else if round == 1 {
        TOURNAMENT_ROUND1_MULTIPLIER
    } else if round + 1 == total_rounds {
        TOURNAMENT_SEMIFINALS_MULTIPLIER
    } else if round + 2 == total_rounds {
        TOURNAMENT_QUARTERFINALS_MULTIPLIER
    } else {
        1.0
    }
}

/// Tournament ELO: the winner's delta is scaled by the round multiplier, the
/// loser's by the loss penalty; draws scale both by the midpoint.
pub fn calculate_tournament_ratings(
    r1: i64,
    r2: i64,
    outcome: GameOutcome,
    round: u32,
    total_rounds: u32,
) -> (i64, i64) {
    let (s1, s2) = outcome.scores();
    let multiplier = tournament_multiplier(round, total_rounds);
    let mut delta1 = ELO_K_FACTOR * (s1 - expected_score(r1, r2));
    let mut delta2 = ELO_K_FACTOR * (s2 - expected_score(r2, r1));
    match outcome {
        GameOutcome::Player1Win => {
            delta1 *= multiplier;
            delta2 *= TOURNAMENT_LOSS_PENALTY;
        }
        GameOutcome::Player2Win => {
            delta2 *= multiplier;
            delta1 *= TOURNAMENT_LOSS_PENALTY;
        }
        GameOutcome::Draw => {
            let draw_scale = (multiplier + 1.0) / 2.0;
            delta1 *= draw_scale;
            delta2 *= draw_scale;
        }
    }
    (
        clamp_rating(r1 as f64 + delta1),
        clamp_rating(r2 as f64 + delta2),
    )
}

#[derive(Clone, Debug, Serialize)]
pub struct MatchHistoryEntry {
    pub game_id: Uuid,
    pub game_type: String,
    pub player1_name: String,
    pub player2_name: Option<String>,
    pub winner_id: Option<UserId>,
    pub won: bool,
    pub draw: bool,
    pub ended_at: Option<DateTime<Utc>>,
}

pub trait StatsService: Send + Sync {
    fn update_game_stats(
        &self,
        kind: GameKind,
        player1: &UserId,
        player2: &UserId,
        winner: Option<&UserId>,
    ) -> ServiceResult<()>;
    fn update_tournament_game_stats(
        &self,
        kind: GameKind,
        player1: &UserId,
        player2: &UserId,
        winner: Option<&UserId>,
        round: u32,
        total_rounds: u32,
    ) -> ServiceResult<()>;
    fn player_stats(&self, user_id: &UserId, kind: GameKind) -> ServiceResult<PlayerStatsEntity>;
    /// Summed counters across kinds; streaks are the per-kind maxima, not a
    /// true cross-kind running streak.
    fn aggregated_stats(&self, user_id: &UserId) -> ServiceResult<PlayerStatsEntity>;
    fn leaderboard(
        &self,
        kind: Option<GameKind>,
        limit: u32,
    ) -> ServiceResult<Vec<LeaderboardEntry>>;
    fn match_history(
        &self,
        user_id: &UserId,
        kind: Option<GameKind>,
        limit: u32,
    ) -> ServiceResult<Vec<MatchHistoryEntry>>;
}

pub type ArcStatsService = Arc<Box<dyn StatsService + Send + Sync>>;

const LIST_LIMIT_DEFAULT: u32 = 50;
const LIST_LIMIT_MAX: u32 = 100;

fn clamp_limit(limit: u32) -> u32 {
    if limit == 0 || limit > LIST_LIMIT_MAX {
        LIST_LIMIT_DEFAULT
    } else {
        limit
    }
}

pub struct StatsServiceImpl {
    user_service: ArcUserService,
    stats_repo: ArcStatsRepository,
    game_repo: ArcCompletedGameRepository,
}

impl StatsServiceImpl {
    pub fn new(
        user_service: ArcUserService,
        stats_repo: ArcStatsRepository,
        game_repo: ArcCompletedGameRepository,
    ) -> Self {
        Self {
            user_service,
            stats_repo,
            game_repo,
        }
    }

    fn apply_update(
        &self,
        kind: GameKind,
        player1: &UserId,
        player2: &UserId,
        winner: Option<&UserId>,
        tournament_round: Option<(u32, u32)>,
    ) -> ServiceResult<()> {
        let r1 = self.user_service.rating_of(player1)?;
        let r2 = self.user_service.rating_of(player2)?;
        let outcome = GameOutcome::from_winner(player1, player2, winner);

        let (new1, new2) = match tournament_round {
            Some((round, total_rounds)) => {
                calculate_tournament_ratings(r1, r2, outcome, round, total_rounds)
            }
            None => calculate_ratings(r1, r2, outcome),
        };

        self.user_service.set_rating(player1, new1)?;
        self.user_service.set_rating(player2, new2)?;

        let draw = outcome == GameOutcome::Draw;
        self.stats_repo.record_result(
            player1,
            kind.as_str(),
            outcome == GameOutcome::Player1Win,
            draw,
        )?;
        self.stats_repo.record_result(
            player2,
            kind.as_str(),
            outcome == GameOutcome::Player2Win,
            draw,
        )?;

        log::info!(
            "Stats updated for {} game: {} {}->{}, {} {}->{}",
            kind,
            player1,
            r1,
            new1,
            player2,
            r2,
            new2
        );
        Ok(())
    }
}

impl StatsService for StatsServiceImpl {
    fn update_game_stats(
        &self,
        kind: GameKind,
        player1: &UserId,
        player2: &UserId,
        winner: Option<&UserId>,
    ) -> ServiceResult<()> {
        self.apply_update(kind, player1, player2, winner, None)
    }

    fn update_tournament_game_stats(
        &self,
        kind: GameKind,
        player1: &UserId,
        player2: &UserId,
        winner: Option<&UserId>,
        round: u32,
        total_rounds: u32,
    ) -> ServiceResult<()> {
        self.apply_update(kind, player1, player2, winner, Some((round, total_rounds)))
    }

    fn player_stats(&self, user_id: &UserId, kind: GameKind) -> ServiceResult<PlayerStatsEntity> {
        Ok(self.stats_repo.get_or_create(user_id, kind.as_str())?)
    }

    fn aggregated_stats(&self, user_id: &UserId) -> ServiceResult<PlayerStatsEntity> {
        let mut aggregated = PlayerStatsEntity {
            user_id: *user_id,
            game_type: "all".to_string(),
            ..Default::default()
        };
        for kind in GameKind::ALL {
            let stats = self.stats_repo.get_or_create(user_id, kind.as_str())?;
            aggregated.wins += stats.wins;
            aggregated.losses += stats.losses;
            aggregated.draws += stats.draws;
            aggregated.total_games += stats.total_games;
            aggregated.current_streak = aggregated.current_streak.max(stats.current_streak);
            aggregated.best_streak = aggregated.best_streak.max(stats.best_streak);
        }
        Ok(aggregated)
    }

    fn leaderboard(
        &self,
        kind: Option<GameKind>,
        limit: u32,
    ) -> ServiceResult<Vec<LeaderboardEntry>> {
        Ok(self
            .stats_repo
            .leaderboard(kind.map(|k| k.as_str()), clamp_limit(limit))?)
    }

    fn match_history(
        &self,
        user_id: &UserId,
        kind: Option<GameKind>,
        limit: u32,
    ) -> ServiceResult<Vec<MatchHistoryEntry>> {
        let games = self.game_repo.list_for_user(
            user_id,
            kind.map(|k| k.as_str()),
            clamp_limit(limit),
        )?;
        Ok(games
            .into_iter()
            .map(|g| MatchHistoryEntry {
                game_id: g.id,
                game_type: g.game_type,
                player1_name: g.player1_name,
                player2_name: g.player2_name,
                won: g.winner_id.as_ref() == Some(user_id),
                draw: g.winner_id.is_none(),
                winner_id: g.winner_id,
                ended_at: g.ended_at,
            })
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct MockStatsService {
    pub updates: Arc<std::sync::Mutex<Vec<(GameKind, UserId, UserId, Option<UserId>)>>>,
    pub tournament_updates: Arc<std::sync::Mutex<Vec<(GameKind, Option<UserId>, u32, u32)>>>,
}

impl StatsService for MockStatsService {
    fn update_game_stats(
        &self,
        kind: GameKind,
        player1: &UserId,
        player2: &UserId,
        winner: Option<&UserId>,
    ) -> ServiceResult<()> {
        self.updates
            .lock()
            .unwrap()
            .push((kind, *player1, *player2, winner.copied()));
        Ok(())
    }

    fn update_tournament_game_stats(
        &self,
        kind: GameKind,
        _player1: &UserId,
        _player2: &UserId,
        winner: Option<&UserId>,
        round: u32,
        total_rounds: u32,
    ) -> ServiceResult<()> {
        self.tournament_updates
            .lock()
            .unwrap()
            .push((kind, winner.copied(), round, total_rounds));
        Ok(())
    }

    fn player_stats(&self, user_id: &UserId, kind: GameKind) -> ServiceResult<PlayerStatsEntity> {
        Ok(PlayerStatsEntity {
            user_id: *user_id,
            game_type: kind.as_str().to_string(),
            ..Default::default()
        })
    }

    fn aggregated_stats(&self, user_id: &UserId) -> ServiceResult<PlayerStatsEntity> {
        Ok(PlayerStatsEntity {
            user_id: *user_id,
            game_type: "all".to_string(),
            ..Default::default()
        })
    }

    fn leaderboard(
        &self,
        _kind: Option<GameKind>,
        _limit: u32,
    ) -> ServiceResult<Vec<LeaderboardEntry>> {
        Ok(Vec::new())
    }

    fn match_history(
        &self,
        _user_id: &UserId,
        _kind: Option<GameKind>,
        _limit: u32,
    ) -> ServiceResult<Vec<MatchHistoryEntry>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_match_win() {
        let (r1, r2) = calculate_ratings(1200, 1200, GameOutcome::Player1Win);
        assert_eq!(r1, 1216);
        assert_eq!(r2, 1184);
    }

    #[test]
    fn test_even_match_draw_changes_nothing() {
        let (r1, r2) = calculate_ratings(1200, 1200, GameOutcome::Draw);
        assert_eq!(r1, 1200);
        assert_eq!(r2, 1200);
    }

    #[test]
    fn test_upset_pays_more() {
        let (underdog, favourite) = calculate_ratings(1000, 1400, GameOutcome::Player1Win);
        assert!(underdog - 1000 > 16);
        assert!(1400 - favourite > 16);
    }

    #[test]
    fn test_rating_floor() {
        let (_, loser) = calculate_ratings(1200, 100, GameOutcome::Player1Win);
        assert_eq!(loser, 100);
        let (_, loser) = calculate_tournament_ratings(1200, 105, GameOutcome::Player1Win, 2, 2);
        assert!(loser >= 100);
    }

    #[test]
    fn test_tournament_multiplier_by_round() {
        // 4 players, 2 rounds: discounted entry round, double-stakes final
        assert_eq!(tournament_multiplier(1, 2), 0.8);
        assert_eq!(tournament_multiplier(2, 2), 2.0);
        // 16 players, 4 rounds
        assert_eq!(tournament_multiplier(1, 4), 0.8);
        assert_eq!(tournament_multiplier(2, 4), 1.2);
        assert_eq!(tournament_multiplier(3, 4), 1.5);
        assert_eq!(tournament_multiplier(4, 4), 2.0);
        // 32 players, 5 rounds: round 2 is unscaled
        assert_eq!(tournament_multiplier(2, 5), 1.0);
    }

    #[test]
    fn test_tournament_finals_doubles_winner_and_halves_loser() {
        let (winner, loser) = calculate_tournament_ratings(1200, 1200, GameOutcome::Player1Win, 4, 4);
        assert_eq!(winner, 1200 + 32); // 16 × 2.0
        assert_eq!(loser, 1200 - 8); // 16 × 0.5
    }

    #[test]
    fn test_tournament_entry_round_discount() {
        let (winner, loser) = calculate_tournament_ratings(1200, 1200, GameOutcome::Player1Win, 1, 2);
        assert_eq!(winner, 1200 + 13); // round(16 × 0.8)
        assert_eq!(loser, 1200 - 8);
    }

    #[test]
    fn test_tournament_draw_uses_midpoint_scale() {
        let (r1, r2) = calculate_tournament_ratings(1200, 1400, GameOutcome::Draw, 4, 4);
        let (b1, b2) = calculate_ratings(1200, 1400, GameOutcome::Draw);
        // finals draw scale is 1.5×, so deltas grow accordingly
        assert!((r1 - 1200).abs() > (b1 - 1200).abs());
        assert!((1400 - r2).abs() > (1400 - b2).abs());
    }
}
