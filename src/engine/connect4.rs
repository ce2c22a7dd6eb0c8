use serde::{Deserialize, Serialize};

use crate::engine::MoveError;
use crate::users::UserId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disc {
    #[serde(rename = "R")]
    Red,
    #[serde(rename = "Y")]
    Yellow,
    #[serde(rename = "")]
    #[default]
    Empty,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connect4State {
    pub board: Vec<Vec<Disc>>,
    pub player1_id: UserId,
    pub player2_id: Option<UserId>,
    pub current_player: UserId,
    pub move_count: u32,
    pub rows: usize,
    pub cols: usize,
    pub win_length: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect4Move {
    pub column: i32,
}

const SCAN_DIRECTIONS: [(i32, i32); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];

impl Connect4State {
    pub fn new(
        player1: UserId,
        player2: Option<UserId>,
        rows: usize,
        cols: usize,
        win_length: usize,
    ) -> Self {
        Self {
            board: vec![vec![Disc::Empty; cols]; rows],
            player1_id: player1,
            player2_id: player2,
            current_player: player1,
            move_count: 0,
            rows,
            cols,
            win_length,
        }
    }

    pub fn validate(&self, player: UserId, mv: &Connect4Move) -> Result<(), MoveError> {
        if self.check_terminal().1 {
            return Err(MoveError::GameOver);
        }
        if player != self.player1_id && Some(player) != self.player2_id {
            return Err(MoveError::NotAPlayer);
        }
        if player != self.current_player {
            return Err(MoveError::NotYourTurn);
        }
        if mv.column < 0 || mv.column as usize >= self.cols {
            return Err(MoveError::invalid("column out of bounds"));
        }
        if self.board[0][mv.column as usize] != Disc::Empty {
            return Err(MoveError::invalid("column is full"));
        }
        Ok(())
    }

    pub fn apply(&mut self, player: UserId, mv: &Connect4Move) -> Result<(), MoveError> {
        self.validate(player, mv)?;

        let disc = if player == self.player1_id {
            Disc::Red
        } else {
            Disc::Yellow
        };
        let col = mv.column as usize;
        // gravity: the piece lands on the lowest empty row of the column
        for row in (0..self.rows).rev() {
            if self.board[row][col] == Disc::Empty {
                self.board[row][col] = disc;
                break;
            }
        }
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

    pub fn check_terminal(&self) -> (Option<UserId>, bool) {
        let rows = self.rows as i32;
        let cols = self.cols as i32;
        let len = self.win_length as i32;
        for row in 0..rows {
            for col in 0..cols {
                let disc = self.board[row as usize][col as usize];
                if disc == Disc::Empty {
                    continue;
                }
                for (dr, dc) in SCAN_DIRECTIONS {
                    let end_row = row + (len - 1) * dr;
                    let end_col = col + (len - 1) * dc;
                    if end_row >= rows || end_col < 0 || end_col >= cols {
                        continue;
                    }
                    if (1..len).all(|i| {
                        self.board[(row + i * dr) as usize][(col + i * dc) as usize] == disc
                    }) {
                        return (Some(self.player_for(disc)), true);
                    }
                }
            }
        }
        if (0..self.cols).all(|col| self.board[0][col] != Disc::Empty) {
            return (None, true); // draw, board full
        }
        (None, false)
    }

    fn player_for(&self, disc: Disc) -> UserId {
        if disc == Disc::Red {
            self.player1_id
        } else {
            self.player2_id.unwrap_or(self.player1_id)
        }
    }
}
