use serde::{Deserialize, Serialize};

use crate::engine::MoveError;
use crate::users::UserId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mark {
    #[serde(rename = "X")]
    X,
    #[serde(rename = "O")]
    O,
    #[serde(rename = "")]
    #[default]
    Empty,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TicTacToeState {
    pub board: Vec<Vec<Mark>>,
    pub player1_id: UserId,
    pub player2_id: Option<UserId>,
    pub current_player: UserId,
    pub move_count: u32,
    pub grid_size: usize,
    pub win_length: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicTacToeMove {
    pub row: i32,
    pub col: i32,
}

const SCAN_DIRECTIONS: [(i32, i32); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];

impl TicTacToeState {
    pub fn new(player1: UserId, player2: Option<UserId>, grid_size: usize, win_length: usize) -> Self {
        Self {
            board: vec![vec![Mark::Empty; grid_size]; grid_size],
            player1_id: player1,
            player2_id: player2,
            current_player: player1,
            move_count: 0,
            grid_size,
            win_length,
        }
    }

    pub fn validate(&self, player: UserId, mv: &TicTacToeMove) -> Result<(), MoveError> {
        if self.check_terminal().1 {
            return Err(MoveError::GameOver);
        }
        if player != self.player1_id && Some(player) != self.player2_id {
            return Err(MoveError::NotAPlayer);
        }
        if player != self.current_player {
            return Err(MoveError::NotYourTurn);
        }
        if mv.row < 0
            || mv.row as usize >= self.grid_size
            || mv.col < 0
            || mv.col as usize >= self.grid_size
        {
            return Err(MoveError::invalid("position out of bounds"));
        }
        if self.board[mv.row as usize][mv.col as usize] != Mark::Empty {
            return Err(MoveError::invalid("position already occupied"));
        }
        Ok(())
    }

    pub fn apply(&mut self, player: UserId, mv: &TicTacToeMove) -> Result<(), MoveError> {
        self.validate(player, mv)?;

        let mark = if player == self.player1_id {
            Mark::X
        } else {
            Mark::O
        };
        self.board[mv.row as usize][mv.col as usize] = mark;
        self.move_count += 1;
        self.switch_turn();
        Ok(())
    }

    fn switch_turn(&mut self) {
        self.current_player = if self.current_player == self.player1_id {
            self.player2_id.unwrap_or(self.player1_id)
        } else {
            self.player1_id
        };
    }

    /// Scan every cell in all four directions for `win_length` consecutive
    /// equal marks; this covers rows, columns and both diagonals uniformly.
    pub fn check_terminal(&self) -> (Option<UserId>, bool) {
        let n = self.grid_size as i32;
        let len = self.win_length as i32;
        for row in 0..n {
            for col in 0..n {
                let mark = self.board[row as usize][col as usize];
                if mark == Mark::Empty {
                    continue;
                }
                for (dr, dc) in SCAN_DIRECTIONS {
                    let end_row = row + (len - 1) * dr;
                    let end_col = col + (len - 1) * dc;
                    if end_row >= n || end_col < 0 || end_col >= n {
                        continue;
                    }
                    if (1..len)
                        .all(|i| self.board[(row + i * dr) as usize][(col + i * dc) as usize] == mark)
                    {
                        return (Some(self.player_for(mark)), true);
                    }
                }
            }
        }
        if self.move_count as usize >= self.grid_size * self.grid_size {
            return (None, true); // draw
        }
        (None, false)
    }

    fn player_for(&self, mark: Mark) -> UserId {
        if mark == Mark::X {
            self.player1_id
        } else {
            self.player2_id.unwrap_or(self.player1_id)
        }
    }
}
