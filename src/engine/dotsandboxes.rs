use serde::{Deserialize, Serialize};

use crate::engine::MoveError;
use crate::users::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineOrientation {
    Horizontal,
    Vertical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub row: i32,
    pub col: i32,
    pub orientation: LineOrientation,
    pub owner_id: UserId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxClaim {
    pub row: i32,
    pub col: i32,
    pub owner_id: UserId,
}

/// N×N grid of dots, (N−1)² unit boxes. A move that completes one or more
/// squares awards points for every square of the largest completed side and
/// grants another turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DotsAndBoxesState {
    pub player1_id: UserId,
    pub player2_id: Option<UserId>,
    pub current_player: UserId,
    pub lines: Vec<Line>,
    pub boxes: Vec<BoxClaim>,
    pub player1_score: u32,
    pub player2_score: u32,
    pub total_boxes: u32,
    pub last_move_boxed: bool,
    pub grid_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotsAndBoxesMove {
    pub row: i32,
    pub col: i32,
    pub orientation: LineOrientation,
}

impl DotsAndBoxesState {
    pub fn new(player1: UserId, player2: Option<UserId>, grid_size: usize) -> Self {
        let boxes_per_side = (grid_size - 1) as u32;
        Self {
            player1_id: player1,
            player2_id: player2,
            current_player: player1,
            lines: Vec::new(),
            boxes: Vec::new(),
            player1_score: 0,
            player2_score: 0,
            total_boxes: boxes_per_side * boxes_per_side,
            last_move_boxed: false,
            grid_size,
        }
    }

    pub fn validate(&self, player: UserId, mv: &DotsAndBoxesMove) -> Result<(), MoveError> {
        if self.check_terminal().1 {
            return Err(MoveError::GameOver);
        }
        if player != self.player1_id && Some(player) != self.player2_id {
            return Err(MoveError::NotAPlayer);
        }
        if player != self.current_player {
            return Err(MoveError::NotYourTurn);
        }
        let n = self.grid_size as i32;
        let in_bounds = match mv.orientation {
            // horizontal line at (r,c): 0 ≤ r < N, 0 ≤ c < N−1
            LineOrientation::Horizontal => {
                mv.row >= 0 && mv.row < n && mv.col >= 0 && mv.col < n - 1
            }
            // vertical line at (r,c): 0 ≤ r < N−1, 0 ≤ c < N
            LineOrientation::Vertical => {
                mv.row >= 0 && mv.row < n - 1 && mv.col >= 0 && mv.col < n
            }
        };
        if !in_bounds {
            return Err(MoveError::invalid("line position out of bounds"));
        }
        if self.has_line(mv.row, mv.col, mv.orientation) {
            return Err(MoveError::invalid("line already drawn"));
        }
        if self.is_line_useless(mv.row, mv.col, mv.orientation) {
            return Err(MoveError::invalid(
                "this line only borders already-claimed boxes",
            ));
        }
        Ok(())
    }

    pub fn apply(&mut self, player: UserId, mv: &DotsAndBoxesMove) -> Result<(), MoveError> {
        self.validate(player, mv)?;

        self.lines.push(Line {
            row: mv.row,
            col: mv.col,
            orientation: mv.orientation,
            owner_id: player,
        });

        let (points, claimed) = self.completed_squares();
        if points > 0 {
            if player == self.player1_id {
                self.player1_score += points;
            } else {
                self.player2_score += points;
            }
            self.boxes.extend(claimed);
            self.last_move_boxed = true;
            // completing a square grants another turn
        } else {
            self.last_move_boxed = false;
            self.current_player = if self.current_player == self.player1_id {
                self.player2_id.unwrap_or(self.player1_id)
            } else {
                self.player1_id
            };
        }
        Ok(())
    }

    /// Largest-square rule: scan side lengths from the maximum down; the first
    /// size with any completed squares wins, every square of that size scores
    /// s² and claims its interior unit boxes. Smaller coincidental completions
    /// are ignored.
    fn completed_squares(&self) -> (u32, Vec<BoxClaim>) {
        let boxes_per_side = (self.grid_size - 1) as i32;
        for size in (1..=boxes_per_side).rev() {
            let mut found = Vec::new();
            for row in 0..=(boxes_per_side - size) {
                for col in 0..=(boxes_per_side - size) {
                    if self.is_square_complete(row, col, size) {
                        found.push((row, col));
                    }
                }
            }
            if found.is_empty() {
                continue;
            }
            let mut points = 0;
            let mut claimed = Vec::new();
            for (row, col) in found {
                points += (size * size) as u32;
                for r in row..row + size {
                    for c in col..col + size {
                        claimed.push(BoxClaim {
                            row: r,
                            col: c,
                            owner_id: self.current_player,
                        });
                    }
                }
            }
            return (points, claimed);
        }
        (0, Vec::new())
    }

    /// A square is complete when its whole perimeter is drawn and every
    /// interior unit box is still unclaimed.
    fn is_square_complete(&self, row: i32, col: i32, size: i32) -> bool {
        for r in row..row + size {
            for c in col..col + size {
                if self.is_box_claimed(r, c) {
                    return false;
                }
            }
        }
        for c in col..col + size {
            if !self.has_line(row, c, LineOrientation::Horizontal)
                || !self.has_line(row + size, c, LineOrientation::Horizontal)
            {
                return false;
            }
        }
        for r in row..row + size {
            if !self.has_line(r, col, LineOrientation::Vertical)
                || !self.has_line(r, col + size, LineOrientation::Vertical)
            {
                return false;
            }
        }
        true
    }

    fn is_box_claimed(&self, row: i32, col: i32) -> bool {
        self.boxes.iter().any(|b| b.row == row && b.col == col)
    }

    fn has_line(&self, row: i32, col: i32, orientation: LineOrientation) -> bool {
        self.lines
            .iter()
            .any(|l| l.row == row && l.col == col && l.orientation == orientation)
    }

    /// A line touching no unclaimed box is useless and rejected.
    fn is_line_useless(&self, row: i32, col: i32, orientation: LineOrientation) -> bool {
        let adjacent = self.adjacent_boxes(row, col, orientation);
        !adjacent.is_empty()
            && adjacent
                .iter()
                .all(|&(r, c)| self.is_box_claimed(r, c))
    }

    fn adjacent_boxes(&self, row: i32, col: i32, orientation: LineOrientation) -> Vec<(i32, i32)> {
        let boxes_per_side = (self.grid_size - 1) as i32;
        let mut adjacent = Vec::new();
        match orientation {
            LineOrientation::Horizontal => {
                if row > 0 && row - 1 < boxes_per_side && col < boxes_per_side {
                    adjacent.push((row - 1, col));
                }
                if row < boxes_per_side && col < boxes_per_side {
                    adjacent.push((row, col));
                }
            }
            LineOrientation::Vertical => {
                if col > 0 && row < boxes_per_side && col - 1 < boxes_per_side {
                    adjacent.push((row, col - 1));
                }
                if col < boxes_per_side && row < boxes_per_side {
                    adjacent.push((row, col));
                }
            }
        }
        adjacent
    }

    pub fn check_terminal(&self) -> (Option<UserId>, bool) {
        let half = self.total_boxes / 2;
        // more than half the boxes is an unassailable lead
        if self.player1_score > half {
            return (Some(self.player1_id), true);
        }
        if self.player2_score > half {
            return (self.player2_id, true);
        }
        if self.boxes.len() as u32 >= self.total_boxes {
            return if self.player1_score > self.player2_score {
                (Some(self.player1_id), true)
            } else if self.player2_score > self.player1_score {
                (self.player2_id, true)
            } else {
                (None, true) // exact parity
            };
        }
        (None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn new_game(grid_size: usize) -> (DotsAndBoxesState, UserId, UserId) {
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        (DotsAndBoxesState::new(p1, Some(p2), grid_size), p1, p2)
    }

    fn h(row: i32, col: i32) -> DotsAndBoxesMove {
        DotsAndBoxesMove {
            row,
            col,
            orientation: LineOrientation::Horizontal,
        }
    }

    fn v(row: i32, col: i32) -> DotsAndBoxesMove {
        DotsAndBoxesMove {
            row,
            col,
            orientation: LineOrientation::Vertical,
        }
    }

    #[test]
    fn test_total_boxes() {
        assert_eq!(new_game(4).0.total_boxes, 9);
        assert_eq!(new_game(8).0.total_boxes, 49);
    }

    #[test]
    fn test_single_box_completion_awards_point_and_keeps_turn() {
        let (mut game, p1, p2) = new_game(4);
        game.apply(p1, &h(0, 0)).unwrap(); // top
        game.apply(p2, &v(0, 0)).unwrap(); // left
        game.apply(p1, &v(0, 1)).unwrap(); // right
        assert_eq!(game.current_player, p2);
        game.apply(p2, &h(1, 0)).unwrap(); // bottom closes the box
        assert_eq!(game.player2_score, 1);
        assert!(game.last_move_boxed);
        assert_eq!(game.current_player, p2); // another turn
        assert_eq!(game.boxes.len(), 1);
        assert_eq!(game.boxes[0].owner_id, p2);
    }

    #[test]
    fn test_duplicate_line_rejected() {
        let (mut game, p1, p2) = new_game(4);
        game.apply(p1, &h(0, 0)).unwrap();
        assert_eq!(
            game.apply(p2, &h(0, 0)),
            Err(MoveError::invalid("line already drawn"))
        );
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let (mut game, p1, _) = new_game(4);
        assert!(game.apply(p1, &h(0, 3)).is_err()); // col must be < N-1
        assert!(game.apply(p1, &v(3, 0)).is_err()); // row must be < N-1
        assert!(game.apply(p1, &h(4, 0)).is_err());
        assert!(game.lines.is_empty());
    }

    #[test]
    fn test_two_by_two_square_awards_four_and_keeps_turn() {
        let (mut game, p1, p2) = new_game(4);
        // perimeter of the 2×2 square at (0,0); interior lines never drawn,
        // so no unit box can complete before the closing move
        game.apply(p1, &h(0, 0)).unwrap();
        game.apply(p2, &h(0, 1)).unwrap();
        game.apply(p1, &h(2, 0)).unwrap();
        game.apply(p2, &h(2, 1)).unwrap();
        game.apply(p1, &v(0, 0)).unwrap();
        game.apply(p2, &v(1, 0)).unwrap();
        game.apply(p1, &v(0, 2)).unwrap();
        assert_eq!(game.player1_score, 0);
        assert_eq!(game.player2_score, 0);

        // the closing edge completes the 2×2; the largest-size rule awards
        // s² = 4 for the one square, not four 1×1 completions
        game.apply(p2, &v(1, 2)).unwrap();
        assert_eq!(game.player2_score, 4);
        assert_eq!(game.boxes.len(), 4);
        assert!(game.boxes.iter().all(|b| b.owner_id == p2));
        assert_eq!(game.current_player, p2);
        // 4 of 9 boxes is not yet a win
        assert_eq!(game.check_terminal(), (None, false));
    }

    #[test]
    fn test_useless_line_rejected() {
        let (mut game, p1, p2) = new_game(4);
        // both boxes bordering h(1,0) already claimed
        game.boxes.push(BoxClaim {
            row: 0,
            col: 0,
            owner_id: p2,
        });
        game.boxes.push(BoxClaim {
            row: 1,
            col: 0,
            owner_id: p2,
        });
        assert_eq!(
            game.apply(p1, &h(1, 0)),
            Err(MoveError::invalid(
                "this line only borders already-claimed boxes"
            ))
        );
        // a line with at least one open neighbour is fine
        game.apply(p1, &h(1, 1)).unwrap();
    }

    #[test]
    fn test_early_termination_past_half() {
        let (mut game, p1, _) = new_game(4);
        // hand p1 five of nine boxes directly; the engine treats score as
        // authoritative for the unassailable-lead check
        game.player1_score = 5;
        assert_eq!(game.check_terminal(), (Some(p1), true));
    }

    #[test]
    fn test_draw_at_exact_parity() {
        let (mut game, p1, p2) = new_game(4);
        game.total_boxes = 8; // even split possible
        game.player1_score = 4;
        game.player2_score = 4;
        for i in 0..8 {
            game.boxes.push(BoxClaim {
                row: i / 3,
                col: i % 3,
                owner_id: if i % 2 == 0 { p1 } else { p2 },
            });
        }
        assert_eq!(game.check_terminal(), (None, true));
    }

    #[test]
    fn test_turn_order_enforced() {
        let (mut game, p1, p2) = new_game(4);
        assert_eq!(game.apply(p2, &h(0, 0)), Err(MoveError::NotYourTurn));
        game.apply(p1, &h(0, 0)).unwrap();
        assert_eq!(game.apply(p1, &h(0, 1)), Err(MoveError::NotYourTurn));
    }
}
