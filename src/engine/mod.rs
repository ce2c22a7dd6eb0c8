mod connect4;
mod dotsandboxes;
mod rps;
mod tictactoe;

pub use connect4::{Connect4Move, Connect4State};
pub use dotsandboxes::{DotsAndBoxesMove, DotsAndBoxesState, Line, LineOrientation};
pub use rps::{RpsChoice, RpsMove, RpsRound, RpsState};
pub use tictactoe::{TicTacToeMove, TicTacToeState};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::users::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameKind {
    TicTacToe,
    Connect4,
    Rps,
    DotsAndBoxes,
}

impl GameKind {
    pub const ALL: [GameKind; 4] = [
        GameKind::TicTacToe,
        GameKind::Connect4,
        GameKind::Rps,
        GameKind::DotsAndBoxes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GameKind::TicTacToe => "tictactoe",
            GameKind::Connect4 => "connect4",
            GameKind::Rps => "rps",
            GameKind::DotsAndBoxes => "dotsandboxes",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "tictactoe" => Some(GameKind::TicTacToe),
            "connect4" => Some(GameKind::Connect4),
            "rps" => Some(GameKind::Rps),
            "dotsandboxes" => Some(GameKind::DotsAndBoxes),
            _ => None,
        }
    }
}

impl std::fmt::Display for GameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MoveError {
    #[error("it's not your turn")]
    NotYourTurn,

    #[error("you are not a player in this game")]
    NotAPlayer,

    #[error("the game has already ended")]
    GameOver,

    #[error("invalid move: {0}")]
    Invalid(String),
}

impl MoveError {
    pub fn invalid<T>(msg: T) -> Self
    where
        T: Into<String>,
    {
        MoveError::Invalid(msg.into())
    }
}

/// Optional per-game settings as sent by clients. Absent or out-of-range
/// fields resolve to the per-kind defaults in [`GameConfig::resolve`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GameSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tictactoe_grid_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tictactoe_win_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect4_rows: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect4_cols: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect4_win_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rps_best_of: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dots_grid_size: Option<u32>,
}

/// Bounds-checked per-kind configuration. Constructing one is the only way
/// settings reach an engine, so every engine starts from valid bounds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "game", rename_all = "lowercase")]
pub enum GameConfig {
    TicTacToe { grid_size: usize, win_length: usize },
    Connect4 { rows: usize, cols: usize, win_length: usize },
    Rps { best_of: u32 },
    DotsAndBoxes { grid_size: usize },
}

impl GameConfig {
    pub fn default_for(kind: GameKind) -> Self {
        match kind {
            GameKind::TicTacToe => GameConfig::TicTacToe {
                grid_size: 3,
                win_length: 3,
            },
            GameKind::Connect4 => GameConfig::Connect4 {
                rows: 6,
                cols: 7,
                win_length: 4,
            },
            GameKind::Rps => GameConfig::Rps { best_of: 5 },
            GameKind::DotsAndBoxes => GameConfig::DotsAndBoxes { grid_size: 5 },
        }
    }

    /// Fill defaults and clamp everything into the per-kind bounds.
    pub fn resolve(kind: GameKind, settings: Option<&GameSettings>) -> Self {
        let Some(settings) = settings else {
            return Self::default_for(kind);
        };
        match kind {
            GameKind::TicTacToe => {
                let grid_size = settings
                    .tictactoe_grid_size
                    .map(|v| (v as usize).clamp(3, 5))
                    .unwrap_or(3);
                let win_length = match settings.tictactoe_win_length {
                    Some(v) if v >= 1 && v as usize <= grid_size => v as usize,
                    Some(_) => grid_size,
                    None => 3.min(grid_size),
                };
                GameConfig::TicTacToe {
                    grid_size,
                    win_length,
                }
            }
            GameKind::Connect4 => {
                let rows = settings
                    .connect4_rows
                    .map(|v| (v as usize).clamp(4, 10))
                    .unwrap_or(6);
                let cols = settings
                    .connect4_cols
                    .map(|v| (v as usize).clamp(4, 10))
                    .unwrap_or(7);
                let win_length = settings
                    .connect4_win_length
                    .map(|v| (v as usize).clamp(4, 6))
                    .unwrap_or(4)
                    .min(rows.min(cols));
                GameConfig::Connect4 {
                    rows,
                    cols,
                    win_length,
                }
            }
            GameKind::Rps => {
                let best_of = match settings.rps_best_of {
                    Some(v) if matches!(v, 3 | 5 | 7 | 9) => v,
                    _ => 5,
                };
                GameConfig::Rps { best_of }
            }
            GameKind::DotsAndBoxes => {
                let grid_size = settings
                    .dots_grid_size
                    .map(|v| (v as usize).clamp(4, 8))
                    .unwrap_or(5);
                GameConfig::DotsAndBoxes { grid_size }
            }
        }
    }

    pub fn kind(&self) -> GameKind {
        match self {
            GameConfig::TicTacToe { .. } => GameKind::TicTacToe,
            GameConfig::Connect4 { .. } => GameKind::Connect4,
            GameConfig::Rps { .. } => GameKind::Rps,
            GameConfig::DotsAndBoxes { .. } => GameKind::DotsAndBoxes,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GameMove {
    TicTacToe(TicTacToeMove),
    Connect4(Connect4Move),
    Rps(RpsMove),
    DotsAndBoxes(DotsAndBoxesMove),
}

impl GameMove {
    /// Parse the wire payload of a move for the given game kind.
    pub fn from_value(kind: GameKind, value: &serde_json::Value) -> Result<Self, MoveError> {
        let malformed = |_| MoveError::invalid("malformed move payload");
        match kind {
            GameKind::TicTacToe => serde_json::from_value(value.clone())
                .map(GameMove::TicTacToe)
                .map_err(malformed),
            GameKind::Connect4 => serde_json::from_value(value.clone())
                .map(GameMove::Connect4)
                .map_err(malformed),
            GameKind::Rps => serde_json::from_value(value.clone())
                .map(GameMove::Rps)
                .map_err(malformed),
            GameKind::DotsAndBoxes => serde_json::from_value(value.clone())
                .map(GameMove::DotsAndBoxes)
                .map_err(malformed),
        }
    }
}

/// The four rule engines behind one face. Pure with respect to the session
/// record: no storage, no locking, no clocks.
#[derive(Clone, Debug, PartialEq)]
pub enum GameEngine {
    TicTacToe(TicTacToeState),
    Connect4(Connect4State),
    Rps(RpsState),
    DotsAndBoxes(DotsAndBoxesState),
}

impl GameEngine {
    pub fn new(config: &GameConfig, player1: UserId, player2: Option<UserId>) -> Self {
        match *config {
            GameConfig::TicTacToe {
                grid_size,
                win_length,
            } => GameEngine::TicTacToe(TicTacToeState::new(player1, player2, grid_size, win_length)),
            GameConfig::Connect4 {
                rows,
                cols,
                win_length,
            } => GameEngine::Connect4(Connect4State::new(player1, player2, rows, cols, win_length)),
            GameConfig::Rps { best_of } => GameEngine::Rps(RpsState::new(player1, player2, best_of)),
            GameConfig::DotsAndBoxes { grid_size } => {
                GameEngine::DotsAndBoxes(DotsAndBoxesState::new(player1, player2, grid_size))
            }
        }
    }

    pub fn kind(&self) -> GameKind {
        match self {
            GameEngine::TicTacToe(_) => GameKind::TicTacToe,
            GameEngine::Connect4(_) => GameKind::Connect4,
            GameEngine::Rps(_) => GameKind::Rps,
            GameEngine::DotsAndBoxes(_) => GameKind::DotsAndBoxes,
        }
    }

    pub fn validate(&self, player: UserId, mv: &GameMove) -> Result<(), MoveError> {
        match (self, mv) {
            (GameEngine::TicTacToe(s), GameMove::TicTacToe(m)) => s.validate(player, m),
            (GameEngine::Connect4(s), GameMove::Connect4(m)) => s.validate(player, m),
            (GameEngine::Rps(s), GameMove::Rps(m)) => s.validate(player, m),
            (GameEngine::DotsAndBoxes(s), GameMove::DotsAndBoxes(m)) => s.validate(player, m),
            _ => Err(MoveError::invalid("move does not match the game kind")),
        }
    }

    /// Apply a move. Fails with exactly the reason `validate` would report,
    /// before any mutation.
    pub fn apply(&mut self, player: UserId, mv: &GameMove) -> Result<(), MoveError> {
        match (self, mv) {
            (GameEngine::TicTacToe(s), GameMove::TicTacToe(m)) => s.apply(player, m),
            (GameEngine::Connect4(s), GameMove::Connect4(m)) => s.apply(player, m),
            (GameEngine::Rps(s), GameMove::Rps(m)) => s.apply(player, m),
            (GameEngine::DotsAndBoxes(s), GameMove::DotsAndBoxes(m)) => s.apply(player, m),
            _ => Err(MoveError::invalid("move does not match the game kind")),
        }
    }

    pub fn check_terminal(&self) -> (Option<UserId>, bool) {
        match self {
            GameEngine::TicTacToe(s) => s.check_terminal(),
            GameEngine::Connect4(s) => s.check_terminal(),
            GameEngine::Rps(s) => s.check_terminal(),
            GameEngine::DotsAndBoxes(s) => s.check_terminal(),
        }
    }

    /// The player whose turn it is; `None` for simultaneous-submission games.
    pub fn current_player(&self) -> Option<UserId> {
        match self {
            GameEngine::TicTacToe(s) => Some(s.current_player),
            GameEngine::Connect4(s) => Some(s.current_player),
            GameEngine::Rps(_) => None,
            GameEngine::DotsAndBoxes(s) => Some(s.current_player),
        }
    }

    pub fn set_player2(&mut self, player2: UserId) {
        match self {
            GameEngine::TicTacToe(s) => s.player2_id = Some(player2),
            GameEngine::Connect4(s) => s.player2_id = Some(player2),
            GameEngine::Rps(s) => s.player2_id = Some(player2),
            GameEngine::DotsAndBoxes(s) => s.player2_id = Some(player2),
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        match self {
            GameEngine::TicTacToe(s) => serde_json::to_value(s),
            GameEngine::Connect4(s) => serde_json::to_value(s),
            GameEngine::Rps(s) => serde_json::to_value(s),
            GameEngine::DotsAndBoxes(s) => serde_json::to_value(s),
        }
        .expect("engine state serialization is infallible")
    }

    /// The outer session record routes to the right deserializer by kind.
    pub fn from_snapshot(
        kind: GameKind,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            GameKind::TicTacToe => GameEngine::TicTacToe(serde_json::from_value(value)?),
            GameKind::Connect4 => GameEngine::Connect4(serde_json::from_value(value)?),
            GameKind::Rps => GameEngine::Rps(serde_json::from_value(value)?),
            GameKind::DotsAndBoxes => GameEngine::DotsAndBoxes(serde_json::from_value(value)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn players() -> (UserId, UserId) {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn test_kind_wire_names() {
        for kind in GameKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(GameKind::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_config_defaults() {
        assert_eq!(
            GameConfig::resolve(GameKind::TicTacToe, None),
            GameConfig::TicTacToe {
                grid_size: 3,
                win_length: 3
            }
        );
        assert_eq!(
            GameConfig::resolve(GameKind::Connect4, None),
            GameConfig::Connect4 {
                rows: 6,
                cols: 7,
                win_length: 4
            }
        );
        assert_eq!(
            GameConfig::resolve(GameKind::Rps, None),
            GameConfig::Rps { best_of: 5 }
        );
        assert_eq!(
            GameConfig::resolve(GameKind::DotsAndBoxes, None),
            GameConfig::DotsAndBoxes { grid_size: 5 }
        );
    }

    #[test]
    fn test_config_clamping() {
        let settings = GameSettings {
            tictactoe_grid_size: Some(9),
            tictactoe_win_length: Some(9),
            ..Default::default()
        };
        assert_eq!(
            GameConfig::resolve(GameKind::TicTacToe, Some(&settings)),
            GameConfig::TicTacToe {
                grid_size: 5,
                win_length: 5
            }
        );

        let settings = GameSettings {
            connect4_rows: Some(4),
            connect4_cols: Some(12),
            connect4_win_length: Some(6),
            ..Default::default()
        };
        // win length never exceeds the shorter board dimension
        assert_eq!(
            GameConfig::resolve(GameKind::Connect4, Some(&settings)),
            GameConfig::Connect4 {
                rows: 4,
                cols: 10,
                win_length: 4
            }
        );

        let settings = GameSettings {
            rps_best_of: Some(4),
            ..Default::default()
        };
        assert_eq!(
            GameConfig::resolve(GameKind::Rps, Some(&settings)),
            GameConfig::Rps { best_of: 5 }
        );

        let settings = GameSettings {
            dots_grid_size: Some(2),
            ..Default::default()
        };
        assert_eq!(
            GameConfig::resolve(GameKind::DotsAndBoxes, Some(&settings)),
            GameConfig::DotsAndBoxes { grid_size: 4 }
        );
    }

    #[test]
    fn test_move_parse_by_kind() {
        let mv = serde_json::json!({"row": 1, "col": 2});
        assert_eq!(
            GameMove::from_value(GameKind::TicTacToe, &mv).unwrap(),
            GameMove::TicTacToe(TicTacToeMove { row: 1, col: 2 })
        );
        let mv = serde_json::json!({"column": 3});
        assert_eq!(
            GameMove::from_value(GameKind::Connect4, &mv).unwrap(),
            GameMove::Connect4(Connect4Move { column: 3 })
        );
        let mv = serde_json::json!({"choice": "rock"});
        assert_eq!(
            GameMove::from_value(GameKind::Rps, &mv).unwrap(),
            GameMove::Rps(RpsMove {
                choice: RpsChoice::Rock
            })
        );
        let mv = serde_json::json!({"choice": "lizard"});
        assert!(GameMove::from_value(GameKind::Rps, &mv).is_err());
    }

    #[test]
    fn test_mismatched_move_rejected() {
        let (p1, p2) = players();
        let config = GameConfig::default_for(GameKind::TicTacToe);
        let mut engine = GameEngine::new(&config, p1, Some(p2));
        let mv = GameMove::Connect4(Connect4Move { column: 0 });
        assert!(matches!(
            engine.apply(p1, &mv),
            Err(MoveError::Invalid(_))
        ));
    }

    #[test]
    fn test_snapshot_round_trip_is_byte_equal() {
        let (p1, p2) = players();
        for kind in GameKind::ALL {
            let config = GameConfig::default_for(kind);
            let mut engine = GameEngine::new(&config, p1, Some(p2));
            // put some state into the engine first
            let mv = match kind {
                GameKind::TicTacToe => GameMove::TicTacToe(TicTacToeMove { row: 0, col: 0 }),
                GameKind::Connect4 => GameMove::Connect4(Connect4Move { column: 3 }),
                GameKind::Rps => GameMove::Rps(RpsMove {
                    choice: RpsChoice::Paper,
                }),
                GameKind::DotsAndBoxes => GameMove::DotsAndBoxes(DotsAndBoxesMove {
                    row: 0,
                    col: 0,
                    orientation: LineOrientation::Horizontal,
                }),
            };
            engine.apply(p1, &mv).unwrap();

            let first = serde_json::to_string(&engine.snapshot()).unwrap();
            let restored = GameEngine::from_snapshot(kind, engine.snapshot()).unwrap();
            let second = serde_json::to_string(&restored.snapshot()).unwrap();
            assert_eq!(first, second, "round trip must be byte-equal for {kind}");
            assert_eq!(engine, restored);
        }
    }
}
