use serde::{Deserialize, Serialize};

use crate::engine::MoveError;
use crate::users::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpsChoice {
    Rock,
    Paper,
    Scissors,
}

impl RpsChoice {
    pub fn beats(&self, other: RpsChoice) -> bool {
        matches!(
            (self, other),
            (RpsChoice::Rock, RpsChoice::Scissors)
                | (RpsChoice::Scissors, RpsChoice::Paper)
                | (RpsChoice::Paper, RpsChoice::Rock)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpsRound {
    pub round_number: u32,
    pub player1_choice: RpsChoice,
    pub player2_choice: RpsChoice,
    pub winner_id: Option<UserId>,
}

/// Best-of-K with simultaneous hidden submissions. Choices stay in the
/// per-round slots until both are set, then the round resolves into the log
/// with both revealed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpsState {
    pub player1_id: UserId,
    pub player2_id: Option<UserId>,
    pub current_round: u32,
    pub player1_score: u32,
    pub player2_score: u32,
    pub rounds: Vec<RpsRound>,
    pub player1_choice: Option<RpsChoice>,
    pub player2_choice: Option<RpsChoice>,
    pub max_rounds: u32,
    pub wins_needed: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpsMove {
    pub choice: RpsChoice,
}

impl RpsState {
    pub fn new(player1: UserId, player2: Option<UserId>, best_of: u32) -> Self {
        Self {
            player1_id: player1,
            player2_id: player2,
            current_round: 1,
            player1_score: 0,
            player2_score: 0,
            rounds: Vec::new(),
            player1_choice: None,
            player2_choice: None,
            max_rounds: best_of,
            wins_needed: best_of / 2 + 1,
        }
    }

    pub fn validate(&self, player: UserId, _mv: &RpsMove) -> Result<(), MoveError> {
        if self.check_terminal().1 {
            return Err(MoveError::GameOver);
        }
        if player != self.player1_id && Some(player) != self.player2_id {
            return Err(MoveError::NotAPlayer);
        }
        let already_chosen = if player == self.player1_id {
            self.player1_choice.is_some()
        } else {
            self.player2_choice.is_some()
        };
        if already_chosen {
            return Err(MoveError::invalid("you have already made a choice this round"));
        }
        Ok(())
    }

    pub fn apply(&mut self, player: UserId, mv: &RpsMove) -> Result<(), MoveError> {
        self.validate(player, mv)?;

        if player == self.player1_id {
            self.player1_choice = Some(mv.choice);
        } else {
            self.player2_choice = Some(mv.choice);
        }

        if let (Some(c1), Some(c2)) = (self.player1_choice, self.player2_choice) {
            self.resolve_round(c1, c2);
        }
        Ok(())
    }

    fn resolve_round(&mut self, c1: RpsChoice, c2: RpsChoice) {
        let winner_id = if c1.beats(c2) {
            self.player1_score += 1;
            Some(self.player1_id)
        } else if c2.beats(c1) {
            self.player2_score += 1;
            self.player2_id
        } else {
            None // tie, no score
        };

        self.rounds.push(RpsRound {
            round_number: self.current_round,
            player1_choice: c1,
            player2_choice: c2,
            winner_id,
        });

        self.player1_choice = None;
        self.player2_choice = None;
        self.current_round += 1;
    }

    pub fn check_terminal(&self) -> (Option<UserId>, bool) {
        if self.player1_score >= self.wins_needed {
            return (Some(self.player1_id), true);
        }
        if self.player2_score >= self.wins_needed {
            return (self.player2_id, true);
        }
        if self.current_round > self.max_rounds {
            // all rounds played without reaching the threshold (ties)
            return if self.player1_score > self.player2_score {
                (Some(self.player1_id), true)
            } else if self.player2_score > self.player1_score {
                (self.player2_id, true)
            } else {
                (None, true)
            };
        }
        (None, false)
    }

    /// True while the given player's slot for the open round is empty.
    pub fn may_submit(&self, player: UserId) -> bool {
        if player == self.player1_id {
            self.player1_choice.is_none()
        } else if Some(player) == self.player2_id {
            self.player2_choice.is_none()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn new_game(best_of: u32) -> (RpsState, UserId, UserId) {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        (RpsState::new(p1, Some(p2), best_of), p1, p2)
    }

    fn mv(choice: RpsChoice) -> RpsMove {
        RpsMove { choice }
    }

    #[test]
    fn test_wins_needed() {
        assert_eq!(new_game(3).0.wins_needed, 2);
        assert_eq!(new_game(5).0.wins_needed, 3);
        assert_eq!(new_game(9).0.wins_needed, 5);
    }

    #[test]
    fn test_choices_hidden_until_both_submitted() {
        let (mut game, p1, p2) = new_game(5);
        game.apply(p1, &mv(RpsChoice::Rock)).unwrap();
        // round not resolved yet
        assert_eq!(game.current_round, 1);
        assert!(game.rounds.is_empty());
        assert!(!game.may_submit(p1));
        assert!(game.may_submit(p2));

        game.apply(p2, &mv(RpsChoice::Scissors)).unwrap();
        assert_eq!(game.current_round, 2);
        assert_eq!(game.rounds.len(), 1);
        assert_eq!(game.rounds[0].winner_id, Some(p1));
        assert_eq!(game.player1_score, 1);
        // slots cleared for the next round
        assert!(game.player1_choice.is_none());
        assert!(game.player2_choice.is_none());
    }

    #[test]
    fn test_double_submission_rejected() {
        let (mut game, p1, _) = new_game(5);
        game.apply(p1, &mv(RpsChoice::Rock)).unwrap();
        assert_eq!(
            game.apply(p1, &mv(RpsChoice::Paper)),
            Err(MoveError::invalid("you have already made a choice this round"))
        );
    }

    #[test]
    fn test_tie_round_scores_nothing() {
        let (mut game, p1, p2) = new_game(3);
        game.apply(p1, &mv(RpsChoice::Paper)).unwrap();
        game.apply(p2, &mv(RpsChoice::Paper)).unwrap();
        assert_eq!(game.player1_score, 0);
        assert_eq!(game.player2_score, 0);
        assert_eq!(game.rounds[0].winner_id, None);
        assert_eq!(game.current_round, 2);
    }

    #[test]
    fn test_best_of_three_early_termination() {
        let (mut game, p1, p2) = new_game(3);
        game.apply(p1, &mv(RpsChoice::Rock)).unwrap();
        game.apply(p2, &mv(RpsChoice::Scissors)).unwrap();
        assert_eq!(game.check_terminal(), (None, false));

        game.apply(p1, &mv(RpsChoice::Rock)).unwrap();
        game.apply(p2, &mv(RpsChoice::Scissors)).unwrap();
        assert_eq!(game.check_terminal(), (Some(p1), true));

        // the third round never happens
        assert_eq!(game.apply(p2, &mv(RpsChoice::Rock)), Err(MoveError::GameOver));
        assert_eq!(game.rounds.len(), 2);
    }

    #[test]
    fn test_outsider_rejected() {
        let (mut game, _, _) = new_game(5);
        let stranger = Uuid::new_v4();
        assert_eq!(
            game.apply(stranger, &mv(RpsChoice::Rock)),
            Err(MoveError::NotAPlayer)
        );
    }

    #[test]
    fn test_all_ties_is_a_draw() {
        let (mut game, p1, p2) = new_game(3);
        for _ in 0..3 {
            game.apply(p1, &mv(RpsChoice::Rock)).unwrap();
            game.apply(p2, &mv(RpsChoice::Rock)).unwrap();
        }
        assert_eq!(game.check_terminal(), (None, true));
    }
}
