use parking_lot::Mutex;
use std::{collections::HashMap, hash::Hash, sync::Arc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A table of independent mutexes, one per key, each guarding a `V`.
///
/// Holders of different keys never contend. The table itself is behind a
/// short-lived [`parking_lot::Mutex`] that is only held while looking up (or
/// inserting) a slot, never across an `.await`; the per-key lock is a
/// [`tokio::sync::Mutex`], so its guard may be held across awaits.
///
/// ```
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use idgen::KeyedMutex;
///
/// let locks: KeyedMutex<&str, u32> = KeyedMutex::new();
/// *locks.lock(&"a").await += 1;
/// assert_eq!(*locks.lock(&"a").await, 1);
/// assert_eq!(*locks.lock(&"b").await, 0);
/// # });
/// ```
pub struct KeyedMutex<K, V> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<V>>>>,
}

impl<K, V> KeyedMutex<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &K) -> Arc<AsyncMutex<V>> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Waits for exclusive access to the value under `key`, creating a default
    /// value on first use.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<V> {
        self.slot(key).lock_owned().await
    }

    /// Like [`Self::lock`], but returns `None` instead of waiting.
    pub fn try_lock(&self, key: &K) -> Option<OwnedMutexGuard<V>> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Drops the slot for `key`. Guards already handed out stay valid but are
    /// detached from the table.
    pub fn remove(&self, key: &K) -> bool {
        self.slots.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for KeyedMutex<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks: KeyedMutex<u32, Vec<u32>> = KeyedMutex::new();
        let guard = locks.lock(&1).await;
        assert!(locks.try_lock(&1).is_none());
        drop(guard);
        assert!(locks.try_lock(&1).is_some());
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks: KeyedMutex<u32, ()> = KeyedMutex::new();
        let _held = locks.lock(&1).await;
        let other = tokio::time::timeout(Duration::from_millis(100), locks.lock(&2)).await;
        assert!(other.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn serializes_read_modify_write() {
        let locks: Arc<KeyedMutex<&'static str, u64>> = Arc::new(KeyedMutex::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = Arc::clone(&locks);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let mut guard = locks.lock(&"counter").await;
                    let seen = *guard;
                    tokio::task::yield_now().await;
                    *guard = seen + 1;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*locks.lock(&"counter").await, 1600);
    }

    #[tokio::test]
    async fn remove_detaches_slot() {
        let locks: KeyedMutex<u32, u32> = KeyedMutex::new();
        *locks.lock(&7).await = 42;
        assert!(locks.remove(&7));
        assert!(locks.is_empty());
        assert_eq!(*locks.lock(&7).await, 0);
    }
}
