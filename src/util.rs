use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;
use rand::Rng;

/// A thread-safe, lazily initialized value.
/// The value is initialized on the first call to `init`.
/// Subsequent calls to `init` will return an error.
/// The value can be accessed via `get` after initialization.
pub struct LazyInit<T> {
    inner: OnceLock<T>,
}

impl<T> LazyInit<T> {
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Initialize the value.
    /// Returns an error if the value has already been initialized.
    pub fn init(&self, value: T) -> Result<(), T> {
        self.inner.set(value)
    }

    /// Get a reference to the initialized value.
    /// Panics if the value has not been initialized.
    pub fn get(&self) -> &T {
        self.inner
            .get()
            .expect("LazyInit used before initialization")
    }

    pub fn try_get(&self) -> Option<&T> {
        self.inner.get()
    }
}

impl<T> Default for LazyInit<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-entity mutex table. Locking the mutex for an id serializes all
/// mutations on that entity; mutexes are created on first access and never
/// removed (entity counts are bounded by the ephemeral store TTLs).
pub struct EntityLocks<K>
where
    K: std::hash::Hash + Eq + Clone,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> EntityLocks<K>
where
    K: std::hash::Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// The mutex guarding the entity with the given id. Callers hold the
    /// guard for the duration of a load-modify-store cycle:
    ///
    /// ```ignore
    /// let lock = locks.entry_lock(&id);
    /// let _guard = lock.lock().unwrap();
    /// ```
    pub fn entry_lock(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

impl<K> Default for EntityLocks<K>
where
    K: std::hash::Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const JOIN_CODE_LENGTH: usize = 6;

/// Random 6-character join code over an alphabet without ambiguous glyphs.
pub fn generate_join_code() -> String {
    let mut rng = rand::thread_rng();
    (0..JOIN_CODE_LENGTH)
        .map(|_| JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_init() {
        let cell: LazyInit<u32> = LazyInit::new();
        assert!(cell.try_get().is_none());
        assert!(cell.init(1).is_ok());
        assert!(cell.init(2).is_err());
        assert_eq!(*cell.get(), 1);
    }

    #[test]
    fn test_entity_locks_serialize_same_key() {
        let locks: Arc<EntityLocks<u32>> = Arc::new(EntityLocks::new());
        let counter = Arc::new(Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let lock = locks.entry_lock(&7);
                    let _guard = lock.lock().unwrap();
                    let mut c = counter.lock().unwrap();
                    *c += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 800);
    }

    #[test]
    fn test_join_code_shape() {
        for _ in 0..50 {
            let code = generate_join_code();
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| JOIN_CODE_ALPHABET.contains(&b)));
            // ambiguous glyphs never appear
            assert!(!code.contains('O') && !code.contains('0'));
            assert!(!code.contains('I') && !code.contains('1'));
        }
    }
}
