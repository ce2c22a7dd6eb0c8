use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed tag set of the session protocol. Wire names are snake_case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    // connection
    Connected,
    Disconnected,
    Error,
    Ping,
    Pong,
    // game lifecycle
    GameCreated,
    GameJoined,
    GameStarted,
    GameMove,
    GameOver,
    GameState,
    // player presence
    PlayerJoined,
    PlayerLeft,
    // client requests
    JoinGame,
    // matchmaking
    MatchmakingQueued,
    MatchmakingMatched,
    MatchmakingCancelled,
    MatchmakingTimeout,
    // rooms
    RoomCreated,
    RoomJoined,
    RoomLeft,
    RoomUpdated,
    RoomClosed,
    RoomParticipantReady,
    // tournaments
    TournamentCreated,
    TournamentJoined,
    TournamentStarted,
    TournamentUpdated,
    TournamentMatchReady,
    TournamentMatchComplete,
    TournamentComplete,
    // spectators
    SpectatorJoined,
    SpectatorLeft,
    SpectatorCount,
}

impl FrameType {
    pub fn from_event_name(name: &str) -> Option<Self> {
        serde_json::from_value(Value::String(name.to_string())).ok()
    }
}

/// Client ⇄ server frame envelope: `{type, payload, timestamp}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Value) -> Self {
        Self {
            frame_type,
            payload: Some(payload),
            timestamp: Utc::now(),
        }
    }

    pub fn empty(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(code: u16, message: &str) -> Self {
        Self::new(
            FrameType::Error,
            serde_json::json!({ "code": code, "message": message }),
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("frame serialization is infallible")
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct JoinGamePayload {
    pub game_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GameMovePayload {
    pub game_id: String,
    #[serde(rename = "move")]
    pub game_move: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RoomJoinPayload {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub join_code: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RoomLeavePayload {
    pub room_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RoomReadyPayload {
    pub room_id: String,
    pub is_ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&FrameType::MatchmakingMatched).unwrap(),
            "\"matchmaking_matched\""
        );
        assert_eq!(
            serde_json::to_string(&FrameType::TournamentMatchReady).unwrap(),
            "\"tournament_match_ready\""
        );
        assert_eq!(
            FrameType::from_event_name("game_move"),
            Some(FrameType::GameMove)
        );
        assert_eq!(FrameType::from_event_name("bogus"), None);
    }

    #[test]
    fn test_frame_round_trip() {
        let frame = Frame::new(FrameType::GameMove, serde_json::json!({"game_id": "x"}));
        let json = frame.to_json();
        let parsed: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.frame_type, FrameType::GameMove);
        assert!(parsed.payload.is_some());
    }

    #[test]
    fn test_frame_without_payload_omits_field() {
        let json = Frame::empty(FrameType::Pong).to_json();
        assert!(!json.contains("payload"));
    }
}
