use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::{select, sync::broadcast};
use tokio_util::sync::CancellationToken;

/// Key-value store with per-key TTL, rating-sorted sets and a pub/sub
/// backbone. Hot state (game sessions, rooms, matchmaking queues, refresh
/// tokens) lives here; the durable store only sees completed aggregates.
pub trait EphemeralStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set_ex(&self, key: &str, value: &str, ttl: Duration);
    fn del(&self, key: &str);
    /// Reset the TTL of an existing key. Returns false if the key is absent.
    fn expire(&self, key: &str, ttl: Duration) -> bool;

    fn zadd(&self, key: &str, member: &str, score: f64);
    fn zrem(&self, key: &str, member: &str);
    /// Members ordered by ascending (score, member).
    fn zrange_with_scores(&self, key: &str) -> Vec<(String, f64)>;

    fn publish(&self, topic: &str, payload: &str);
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

pub type ArcEphemeralStore = Arc<Box<dyn EphemeralStore>>;

#[derive(Clone, Debug)]
pub struct StoreEvent {
    pub topic: String,
    pub payload: String,
}

const PUBSUB_CAPACITY: usize = 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct ValueEntry {
    value: String,
    expires_at: Instant,
}

/// In-process implementation. Expired keys are dropped lazily on read and
/// periodically by the sweeper task; sorted sets carry no TTL (members are
/// removed explicitly by their owners).
pub struct MemoryStore {
    values: DashMap<String, ValueEntry>,
    sorted_sets: DashMap<String, Vec<(String, f64)>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            values: DashMap::new(),
            sorted_sets: DashMap::new(),
            events,
        }
    }

    pub fn run_sweeper(self: &Arc<Self>, cancel_token: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                select! {
                    _ = cancel_token.cancelled() => {
                        log::info!("Store sweeper stopped");
                        return;
                    }
                    _ = interval.tick() => {}
                }
                let now = Instant::now();
                let before = store.values.len();
                store.values.retain(|_, entry| entry.expires_at > now);
                let swept = before - store.values.len();
                if swept > 0 {
                    log::debug!("Store sweeper removed {} expired keys", swept);
                }
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeralStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let entry = self.values.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.values.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) {
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn del(&self, key: &str) {
        self.values.remove(key);
    }

    fn expire(&self, key: &str, ttl: Duration) -> bool {
        match self.values.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Instant::now() + ttl;
                true
            }
            None => false,
        }
    }

    fn zadd(&self, key: &str, member: &str, score: f64) {
        let mut set = self.sorted_sets.entry(key.to_string()).or_default();
        match set.iter_mut().find(|(m, _)| m == member) {
            Some(slot) => slot.1 = score,
            None => set.push((member.to_string(), score)),
        }
    }

    fn zrem(&self, key: &str, member: &str) {
        if let Some(mut set) = self.sorted_sets.get_mut(key) {
            set.retain(|(m, _)| m != member);
        }
    }

    fn zrange_with_scores(&self, key: &str) -> Vec<(String, f64)> {
        let Some(set) = self.sorted_sets.get(key) else {
            return Vec::new();
        };
        let mut members = set.value().clone();
        members.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        members
    }

    fn publish(&self, topic: &str, payload: &str) {
        // no subscribers is not an error
        let _ = self.events.send(StoreEvent {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

// forwarding impl so an `Arc<MemoryStore>` handle (kept for the sweeper or
// for tests) can also be boxed behind the trait
impl EphemeralStore for Arc<MemoryStore> {
    fn get(&self, key: &str) -> Option<String> {
        self.as_ref().get(key)
    }
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) {
        self.as_ref().set_ex(key, value, ttl)
    }
    fn del(&self, key: &str) {
        self.as_ref().del(key)
    }
    fn expire(&self, key: &str, ttl: Duration) -> bool {
        self.as_ref().expire(key, ttl)
    }
    fn zadd(&self, key: &str, member: &str, score: f64) {
        self.as_ref().zadd(key, member, score)
    }
    fn zrem(&self, key: &str, member: &str) {
        self.as_ref().zrem(key, member)
    }
    fn zrange_with_scores(&self, key: &str) -> Vec<(String, f64)> {
        self.as_ref().zrange_with_scores(key)
    }
    fn publish(&self, topic: &str, payload: &str) {
        self.as_ref().publish(topic, payload)
    }
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.as_ref().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_del() {
        let store = MemoryStore::new();
        store.set_ex("game:1", "{}", Duration::from_secs(60));
        assert_eq!(store.get("game:1"), Some("{}".to_string()));
        store.del("game:1");
        assert_eq!(store.get("game:1"), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store.set_ex("short", "v", Duration::from_millis(10));
        assert!(store.get("short").is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get("short"), None);
    }

    #[test]
    fn test_expire_extends_ttl() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", Duration::from_millis(10));
        assert!(store.expire("k", Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get("k"), Some("v".to_string()));
        assert!(!store.expire("missing", Duration::from_secs(1)));
    }

    #[test]
    fn test_sorted_set_ordering() {
        let store = MemoryStore::new();
        store.zadd("queue:rps", "c", 1400.0);
        store.zadd("queue:rps", "a", 1200.0);
        store.zadd("queue:rps", "b", 1300.0);
        let members: Vec<String> = store
            .zrange_with_scores("queue:rps")
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["a", "b", "c"]);

        // re-adding updates the score in place
        store.zadd("queue:rps", "a", 1500.0);
        let members = store.zrange_with_scores("queue:rps");
        assert_eq!(members.last().unwrap().0, "a");
        assert_eq!(members.len(), 3);

        store.zrem("queue:rps", "b");
        assert_eq!(store.zrange_with_scores("queue:rps").len(), 2);
    }

    #[test]
    fn test_pubsub_delivery() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.publish("game:42", "payload");
        let event = rx.try_recv().expect("event should be delivered");
        assert_eq!(event.topic, "game:42");
        assert_eq!(event.payload, "payload");
    }
}
