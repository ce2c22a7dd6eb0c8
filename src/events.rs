use std::collections::HashMap;

use serde_json::Value;
use tokio::select;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    client::ArcClientService,
    game::GameEventEnvelope,
    matchmaking::QueueEntry,
    notification::ArcNotificationService,
    protocol::{Frame, FrameType},
    store::{ArcEphemeralStore, StoreEvent},
};

/// Single consumer on the pub/sub backbone: relays entity-topic events into
/// the hub and produces notification records for user-facing ones.
pub fn spawn_event_relay(
    store: ArcEphemeralStore,
    hub: ArcClientService,
    notifications: ArcNotificationService,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = store.subscribe();
    tokio::spawn(async move {
        log::info!("Event relay started");
        loop {
            let event = select! {
                _ = cancel_token.cancelled() => {
                    log::info!("Event relay stopped");
                    return;
                }
                event = rx.recv() => match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Event relay lagged, skipped {} events", skipped);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
            };
            relay_event(&hub, &notifications, &event);
        }
    })
}

fn relay_event(
    hub: &ArcClientService,
    notifications: &ArcNotificationService,
    event: &StoreEvent,
) {
    if let Some(id) = event.topic.strip_prefix("game:") {
        relay_game_event(hub, id, &event.payload);
    } else if event.topic.starts_with("tournament:match:") {
        // match-index writes are not events
    } else if let Some(rest) = event.topic.strip_prefix("tournament:") {
        relay_entity_event(hub, rest, &event.payload, "tournament");
    } else if let Some(id) = event.topic.strip_prefix("room:") {
        if !id.starts_with("code:") {
            relay_entity_event(hub, id, &event.payload, "room");
        }
    } else if event.topic == "matchmaking:match_found" {
        relay_match_found(hub, notifications, &event.payload);
    } else if event.topic == "matchmaking:timeout" {
        relay_match_timeout(hub, notifications, &event.payload);
    }
}

fn relay_game_event(hub: &ArcClientService, id: &str, payload: &str) {
    let Ok(game_id) = Uuid::parse_str(id) else {
        return;
    };
    let Ok(envelope) = serde_json::from_str::<GameEventEnvelope>(payload) else {
        log::warn!("Dropping malformed game event on game:{}", id);
        return;
    };
    let Some(frame_type) = FrameType::from_event_name(&envelope.event) else {
        log::warn!("Unknown game event {}", envelope.event);
        return;
    };
    hub.broadcast_to_game(&game_id, &Frame::new(frame_type, envelope.payload), None);
}

/// Room and tournament events carry the full entity; deliver the frame to
/// each participant's live connection.
fn relay_entity_event(hub: &ArcClientService, id: &str, payload: &str, entity: &str) {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        log::warn!("Dropping malformed {} event on {}:{}", entity, entity, id);
        return;
    };
    let Some(event_name) = value.get("type").and_then(Value::as_str) else {
        return;
    };
    let frame_type = match FrameType::from_event_name(event_name) {
        Some(frame_type) => frame_type,
        // internal event names that differ from the wire tag
        None => match event_name {
            "participant_ready" => FrameType::RoomParticipantReady,
            "game_started" => FrameType::GameStarted,
            _ => {
                log::warn!("Unknown {} event {}", entity, event_name);
                return;
            }
        },
    };

    let participants = value
        .get(entity)
        .and_then(|e| e.get("participants"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let frame = Frame::new(frame_type, value.get(entity).cloned().unwrap_or(Value::Null));
    for participant in participants {
        let Some(user_id) = participant
            .get("user_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            continue;
        };
        hub.send_to_user(&user_id, &frame);
    }
}

fn relay_match_found(
    hub: &ArcClientService,
    notifications: &ArcNotificationService,
    payload: &str,
) {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return;
    };
    let room_id = value.get("room_id").cloned().unwrap_or(Value::Null);
    let join_code = value
        .get("join_code")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    for key in ["entry1", "entry2"] {
        let Some(entry) = value
            .get(key)
            .and_then(|e| serde_json::from_value::<QueueEntry>(e.clone()).ok())
        else {
            continue;
        };
        let frame = Frame::new(
            FrameType::MatchmakingMatched,
            serde_json::json!({
                "room_id": room_id,
                "join_code": join_code,
                "entry": entry,
            }),
        );
        hub.send_to_user(&entry.user_id, &frame);

        let mut data = HashMap::new();
        data.insert("room_id".to_string(), room_id.as_str().map(str::to_string).unwrap_or_else(|| room_id.to_string()));
        data.insert("join_code".to_string(), join_code.clone());
        if let Err(e) = notifications.create(
            &entry.user_id,
            "matchmaking_matched",
            "Match found",
            &format!("An opponent was found for {}", entry.game_type),
            data,
        ) {
            log::error!("Failed to create match notification: {}", e);
        }
    }
}

fn relay_match_timeout(
    hub: &ArcClientService,
    notifications: &ArcNotificationService,
    payload: &str,
) {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return;
    };
    let Some(user_id) = value
        .get("user_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        return;
    };
    hub.send_to_user(
        &user_id,
        &Frame::new(FrameType::MatchmakingTimeout, value.clone()),
    );
    if let Err(e) = notifications.create(
        &user_id,
        "matchmaking_timeout",
        "Matchmaking timed out",
        "No opponent was found in time, please queue again",
        HashMap::new(),
    ) {
        log::error!("Failed to create timeout notification: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClientService;
    use crate::notification::MockNotificationService;
    use crate::store::{EphemeralStore, MemoryStore};
    use chrono::Utc;

    fn services() -> (MockClientService, MockNotificationService, ArcClientService, ArcNotificationService) {
        let hub = MockClientService::default();
        let notifications = MockNotificationService::default();
        let arc_hub: ArcClientService = std::sync::Arc::new(Box::new(hub.clone())
            as Box<dyn crate::client::ClientService + Send + Sync>);
        let arc_notifications: ArcNotificationService = std::sync::Arc::new(Box::new(
            notifications.clone(),
        )
            as Box<dyn crate::notification::NotificationService + Send + Sync>);
        (hub, notifications, arc_hub, arc_notifications)
    }

    #[test]
    fn test_game_event_broadcasts_to_members() {
        let (hub, _, arc_hub, arc_notifications) = services();
        let game_id = Uuid::new_v4();
        let envelope = GameEventEnvelope {
            event: "game_move".to_string(),
            game_id,
            payload: serde_json::json!({"status": "active"}),
            timestamp: Utc::now(),
        };
        let event = StoreEvent {
            topic: format!("game:{}", game_id),
            payload: serde_json::to_string(&envelope).unwrap(),
        };
        relay_event(&arc_hub, &arc_notifications, &event);

        let broadcasts = hub.broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].0, game_id);
        assert_eq!(broadcasts[0].1.frame_type, FrameType::GameMove);
    }

    #[test]
    fn test_room_event_delivered_to_participants() {
        let (hub, _, arc_hub, arc_notifications) = services();
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();
        let event = StoreEvent {
            topic: format!("room:{}", Uuid::new_v4()),
            payload: serde_json::json!({
                "type": "room_joined",
                "room": {
                    "participants": [
                        {"user_id": user_a, "username": "a"},
                        {"user_id": user_b, "username": "b"},
                    ],
                },
            })
            .to_string(),
        };
        relay_event(&arc_hub, &arc_notifications, &event);

        let direct = hub.direct.lock().unwrap();
        assert_eq!(direct.len(), 2);
        assert!(direct.iter().all(|(_, f)| f.frame_type == FrameType::RoomJoined));
        assert!(direct.iter().any(|(u, _)| *u == user_a));
        assert!(direct.iter().any(|(u, _)| *u == user_b));
    }

    #[test]
    fn test_match_found_notifies_both_users() {
        let (hub, notifications, arc_hub, arc_notifications) = services();
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        let entry = |name: &str| QueueEntry {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            username: name.to_string(),
            game_type: crate::engine::GameKind::TicTacToe,
            rating: 1200,
            status: crate::matchmaking::QueueStatus::Matched,
            queued_at: Utc::now(),
            matched_room_id: None,
            expires_at: Utc::now(),
        };
        let e1 = entry("alice");
        let e2 = entry("bob");
        store.publish(
            "matchmaking:match_found",
            &serde_json::json!({
                "entry1": e1,
                "entry2": e2,
                "room_id": Uuid::new_v4(),
                "join_code": "ABC234",
            })
            .to_string(),
        );
        let event = rx.try_recv().unwrap();
        relay_event(&arc_hub, &arc_notifications, &event);

        let direct = hub.direct.lock().unwrap();
        assert_eq!(direct.len(), 2);
        assert!(direct.iter().any(|(u, _)| *u == e1.user_id));
        assert!(direct.iter().any(|(u, _)| *u == e2.user_id));
        assert!(
            direct
                .iter()
                .all(|(_, f)| f.frame_type == FrameType::MatchmakingMatched)
        );

        let created = notifications.created.lock().unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|n| n.kind == "matchmaking_matched"));
        assert!(created.iter().all(|n| n.data["join_code"] == "ABC234"));
    }

    #[test]
    fn test_timeout_event_notifies_user() {
        let (hub, notifications, arc_hub, arc_notifications) = services();
        let user_id = Uuid::new_v4();
        let event = StoreEvent {
            topic: "matchmaking:timeout".to_string(),
            payload: serde_json::json!({
                "entry_id": Uuid::new_v4(),
                "user_id": user_id,
            })
            .to_string(),
        };
        relay_event(&arc_hub, &arc_notifications, &event);

        assert_eq!(hub.direct.lock().unwrap().len(), 1);
        let created = notifications.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].user_id, user_id);
        assert_eq!(created[0].kind, "matchmaking_timeout");
    }

    #[test]
    fn test_malformed_events_are_dropped() {
        let (hub, notifications, arc_hub, arc_notifications) = services();
        for (topic, payload) in [
            ("game:not-a-uuid", "{}"),
            (&format!("game:{}", Uuid::new_v4()), "not json"),
            ("room:x", "{\"type\": \"room_joined\"}"),
            ("matchmaking:match_found", "{}"),
        ] {
            relay_event(
                &arc_hub,
                &arc_notifications,
                &StoreEvent {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                },
            );
        }
        assert!(hub.broadcasts.lock().unwrap().is_empty());
        assert!(hub.direct.lock().unwrap().is_empty());
        assert!(notifications.created.lock().unwrap().is_empty());
    }
}
