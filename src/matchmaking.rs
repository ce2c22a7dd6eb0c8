use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::select;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    ServiceError, ServiceResult,
    engine::GameKind,
    room::{ArcRoomService, CreateRoomRequest, RoomId, RoomType},
    store::ArcEphemeralStore,
    users::{UserId, UserRef},
};

const QUEUE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MATCHED_INFO_TTL: Duration = Duration::from_secs(5 * 60);
const WORKER_INTERVAL: Duration = Duration::from_secs(2);

// the acceptable rating gap starts at 200 and widens by 50 every 30 seconds,
// so every queued user is paired or timed out within the queue timeout
const RATING_RANGE: i64 = 200;
const RATING_RANGE_INCREASE: i64 = 50;
const RATING_RANGE_STEP_SECS: i64 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Matched,
    Timeout,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub username: String,
    pub game_type: GameKind,
    pub rating: i64,
    pub status: QueueStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_room_id: Option<RoomId>,
    pub expires_at: DateTime<Utc>,
}

fn queue_key(kind: GameKind) -> String {
    format!("matchmaking:queue:{}", kind)
}

fn entry_key(id: &Uuid) -> String {
    format!("matchmaking:entry:{}", id)
}

fn user_key(user_id: &UserId) -> String {
    format!("matchmaking:user:{}", user_id)
}

pub trait MatchmakingService: Send + Sync {
    fn join_queue(&self, user: &UserRef, kind: GameKind, rating: i64) -> ServiceResult<QueueEntry>;
    fn leave_queue(&self, user_id: &UserId) -> ServiceResult<()>;
    fn queue_status(&self, user_id: &UserId) -> ServiceResult<Option<QueueEntry>>;
    /// One worker tick for one game kind.
    fn find_matches(&self, kind: GameKind) -> ServiceResult<()>;
}

pub type ArcMatchmakingService = Arc<Box<dyn MatchmakingService + Send + Sync>>;

#[derive(Clone)]
pub struct MatchmakingServiceImpl {
    store: ArcEphemeralStore,
    room_service: ArcRoomService,
    // serializes the check-then-insert in join_queue so a user can never
    // hold two active entries
    join_lock: Arc<Mutex<()>>,
}

impl MatchmakingServiceImpl {
    pub fn new(store: ArcEphemeralStore, room_service: ArcRoomService) -> Self {
        Self {
            store,
            room_service,
            join_lock: Arc::new(Mutex::new(())),
        }
    }

    fn load_entry(&self, id: &Uuid) -> Option<QueueEntry> {
        let json = self.store.get(&entry_key(id))?;
        serde_json::from_str(&json).ok()
    }

    fn save_entry(&self, entry: &QueueEntry, ttl: Duration) {
        let json = serde_json::to_string(entry).expect("entry serialization is infallible");
        self.store.set_ex(&entry_key(&entry.id), &json, ttl);
    }

    fn acceptable_range(entry: &QueueEntry, now: DateTime<Utc>) -> i64 {
        let waited = (now - entry.queued_at).num_seconds().max(0);
        RATING_RANGE + RATING_RANGE_INCREASE * (waited / RATING_RANGE_STEP_SECS)
    }

    fn create_match(&self, entry1: &mut QueueEntry, entry2: &mut QueueEntry) -> ServiceResult<()> {
        let host = UserRef {
            id: entry1.user_id,
            username: entry1.username.clone(),
        };
        let guest = UserRef {
            id: entry2.user_id,
            username: entry2.username.clone(),
        };
        let room = self.room_service.create(
            &host,
            &CreateRoomRequest {
                game_type: entry1.game_type,
                room_type: RoomType::Quickplay,
                max_players: 2,
                game_settings: None,
            },
        )?;
        self.room_service.join(&room.id, &guest)?;

        entry1.status = QueueStatus::Matched;
        entry1.matched_room_id = Some(room.id);
        entry2.status = QueueStatus::Matched;
        entry2.matched_room_id = Some(room.id);

        // matched entries stick around briefly so both users can fetch the
        // room from their queue status
        self.save_entry(entry1, MATCHED_INFO_TTL);
        self.save_entry(entry2, MATCHED_INFO_TTL);
        self.store.zrem(&queue_key(entry1.game_type), &entry1.id.to_string());
        self.store.zrem(&queue_key(entry2.game_type), &entry2.id.to_string());
        self.store.expire(&user_key(&entry1.user_id), MATCHED_INFO_TTL);
        self.store.expire(&user_key(&entry2.user_id), MATCHED_INFO_TTL);

        let payload = serde_json::json!({
            "entry1": entry1,
            "entry2": entry2,
            "room_id": room.id,
            "join_code": room.join_code,
        });
        self.store
            .publish("matchmaking:match_found", &payload.to_string());
        log::info!(
            "Matched {} ({}) with {} ({}) in room {}",
            entry1.username,
            entry1.rating,
            entry2.username,
            entry2.rating,
            room.id
        );
        Ok(())
    }

    fn handle_timeout(&self, entry: &mut QueueEntry) {
        entry.status = QueueStatus::Timeout;
        self.save_entry(entry, MATCHED_INFO_TTL);
        self.store
            .zrem(&queue_key(entry.game_type), &entry.id.to_string());
        self.store.expire(&user_key(&entry.user_id), MATCHED_INFO_TTL);

        let payload = serde_json::json!({
            "entry_id": entry.id,
            "user_id": entry.user_id,
        });
        self.store
            .publish("matchmaking:timeout", &payload.to_string());
        log::info!("Queue entry {} for {} timed out", entry.id, entry.username);
    }

    /// Periodic pairing across the fixed set of game kinds until cancelled.
    pub fn run_worker(&self, cancel_token: CancellationToken) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WORKER_INTERVAL);
            log::info!("Matchmaking worker started");
            loop {
                select! {
                    _ = cancel_token.cancelled() => {
                        log::info!("Matchmaking worker stopped");
                        return;
                    }
                    _ = interval.tick() => {}
                }
                for kind in GameKind::ALL {
                    if let Err(e) = service.find_matches(kind) {
                        log::error!("Matchmaking error for {}: {}", kind, e);
                    }
                }
            }
        });
    }
}

impl MatchmakingService for MatchmakingServiceImpl {
    fn join_queue(&self, user: &UserRef, kind: GameKind, rating: i64) -> ServiceResult<QueueEntry> {
        let _guard = self.join_lock.lock().unwrap();

        // at most one active entry per user, across all game kinds; stale
        // timeout/cancel records do not block a fresh queue attempt
        if let Some(existing_id) = self.store.get(&user_key(&user.id)) {
            if let Ok(id) = Uuid::parse_str(&existing_id) {
                if let Some(entry) = self.load_entry(&id) {
                    if matches!(entry.status, QueueStatus::Queued | QueueStatus::Matched) {
                        return Ok(entry);
                    }
                }
            }
        }

        let now = Utc::now();
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            user_id: user.id,
            username: user.username.clone(),
            game_type: kind,
            rating,
            status: QueueStatus::Queued,
            queued_at: now,
            matched_room_id: None,
            expires_at: now + chrono::Duration::from_std(QUEUE_TIMEOUT).unwrap(),
        };

        self.save_entry(&entry, QUEUE_TIMEOUT);
        self.store
            .zadd(&queue_key(kind), &entry.id.to_string(), rating as f64);
        self.store
            .set_ex(&user_key(&user.id), &entry.id.to_string(), QUEUE_TIMEOUT);

        log::info!(
            "{} joined the {} queue at rating {}",
            user.username,
            kind,
            rating
        );
        Ok(entry)
    }

    fn leave_queue(&self, user_id: &UserId) -> ServiceResult<()> {
        let _guard = self.join_lock.lock().unwrap();

        let Some(entry_id) = self.store.get(&user_key(user_id)) else {
            return ServiceError::not_found("User not in queue");
        };
        let entry_id = Uuid::parse_str(&entry_id)
            .map_err(|_| ServiceError::Internal("Corrupt queue index".to_string()))?;
        let Some(entry) = self.load_entry(&entry_id) else {
            self.store.del(&user_key(user_id));
            return ServiceError::not_found("Queue entry not found");
        };

        self.store.del(&entry_key(&entry_id));
        self.store
            .zrem(&queue_key(entry.game_type), &entry_id.to_string());
        self.store.del(&user_key(user_id));
        log::info!("{} left the {} queue", entry.username, entry.game_type);
        Ok(())
    }

    fn queue_status(&self, user_id: &UserId) -> ServiceResult<Option<QueueEntry>> {
        let Some(entry_id) = self.store.get(&user_key(user_id)) else {
            return Ok(None);
        };
        let Ok(entry_id) = Uuid::parse_str(&entry_id) else {
            return Ok(None);
        };
        Ok(self.load_entry(&entry_id))
    }

    fn find_matches(&self, kind: GameKind) -> ServiceResult<()> {
        let members = self.store.zrange_with_scores(&queue_key(kind));
        if members.len() < 2 {
            // a lone expired entry still needs its timeout handled
            if let Some((member, _)) = members.first() {
                if let Ok(id) = Uuid::parse_str(member) {
                    if let Some(mut entry) = self.load_entry(&id) {
                        if Utc::now() > entry.expires_at {
                            self.handle_timeout(&mut entry);
                        }
                    } else {
                        self.store.zrem(&queue_key(kind), member);
                    }
                }
            }
            return Ok(());
        }

        let now = Utc::now();
        let mut matched = std::collections::HashSet::new();

        for i in 0..members.len() {
            if matched.contains(&members[i].0) {
                continue;
            }
            let Ok(id1) = Uuid::parse_str(&members[i].0) else {
                continue;
            };
            let Some(mut entry1) = self.load_entry(&id1) else {
                // entry evaporated (TTL); drop the dangling queue member
                self.store.zrem(&queue_key(kind), &members[i].0);
                continue;
            };
            if now > entry1.expires_at {
                self.handle_timeout(&mut entry1);
                continue;
            }

            let range = Self::acceptable_range(&entry1, now);

            for j in (i + 1)..members.len() {
                if matched.contains(&members[j].0) {
                    continue;
                }
                let Ok(id2) = Uuid::parse_str(&members[j].0) else {
                    continue;
                };
                let Some(mut entry2) = self.load_entry(&id2) else {
                    self.store.zrem(&queue_key(kind), &members[j].0);
                    continue;
                };
                if now > entry2.expires_at {
                    self.handle_timeout(&mut entry2);
                    continue;
                }

                if (entry1.rating - entry2.rating).abs() <= range {
                    if let Err(e) = self.create_match(&mut entry1, &mut entry2) {
                        log::error!("Failed to create match: {}", e);
                        continue;
                    }
                    matched.insert(members[i].0.clone());
                    matched.insert(members[j].0.clone());
                    break;
                }
            }
        }
        Ok(())
    }
}
