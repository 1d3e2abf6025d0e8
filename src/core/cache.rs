//! Small bounded TTL map for ephemeral per-chat state.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Entry<V> {
    value: V,
    inserted: Instant,
}

pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl: Duration,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        self.make_room(&mut entries, &key, now);
        entries.insert(
            key,
            Entry {
                value,
                inserted: now,
            },
        );
    }

    /// Inserts only when no live entry exists. Returns whether it inserted.
    pub async fn insert_if_absent(&self, key: K, value: V) -> bool {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some(existing) = entries.get(&key)
            && now.duration_since(existing.inserted) < self.ttl
        {
            return false;
        }
        self.make_room(&mut entries, &key, now);
        entries.insert(
            key,
            Entry {
                value,
                inserted: now,
            },
        );
        true
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().await;
        let entry = entries.get(key)?;
        (Instant::now().duration_since(entry.inserted) < self.ttl).then(|| entry.value.clone())
    }

    pub async fn contains(&self, key: &K) -> bool {
        self.get(key).await.is_some()
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().await.remove(key).map(|e| e.value)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drops expired entries and returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.inserted) < self.ttl);
        before - entries.len()
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.sweep().await;
                        if removed > 0 {
                            debug!("[cache] Swept {} expired entries", removed);
                        }
                    }
                }
            }
        })
    }

    fn make_room(&self, entries: &mut HashMap<K, Entry<V>>, key: &K, now: Instant) {
        if entries.contains_key(key) || entries.len() < self.capacity {
            return;
        }
        entries.retain(|_, e| now.duration_since(e.inserted) < self.ttl);
        while entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(10), 16);
        cache.insert("a", 1).await;
        assert_eq!(cache.get(&"a").await, Some(1));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get(&"a").await, None);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn insert_if_absent_dedupes_within_ttl() {
        let cache = TtlCache::new(Duration::from_secs(5), 16);
        assert!(cache.insert_if_absent(("telegram", "1"), ()).await);
        assert!(!cache.insert_if_absent(("telegram", "1"), ()).await);
        assert!(cache.insert_if_absent(("discord", "1"), ()).await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.insert_if_absent(("telegram", "1"), ()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_oldest() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert(1, "one").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert(2, "two").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert(3, "three").await;

        assert_eq!(cache.len().await, 2);
        assert!(!cache.contains(&1).await);
        assert!(cache.contains(&2).await);
        assert!(cache.contains(&3).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_until_cancelled() {
        let cache = Arc::new(TtlCache::new(Duration::from_secs(1), 16));
        cache.insert("k", 1).await;
        let token = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(5), token.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.len().await, 0);

        token.cancel();
        handle.await.unwrap();
    }
}
