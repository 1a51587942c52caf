//! Name→ID cache: per-realm, bounded-TTL, single-flight lookup from
//! symbolic names to internal ids.
//!
//! A concurrent, TTL-bounded store keyed by name. Each key's slot is an
//! [`arc_swap::ArcSwapOption`] so a refresh is a single atomic pointer swap
//! — readers never block behind a writer — while [`dashmap::DashMap`]
//! gives the outer key space lock-striped concurrent access for keys that
//! don't yet exist.

use crate::error::PolicyError;
use crate::model::Id;
use arc_swap::ArcSwapOption;
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct Slot<V> {
    value: ArcSwapOption<(V, Instant)>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Slot {
            value: ArcSwapOption::empty(),
        }
    }
}

/// A single-flight, TTL-bounded map from `K` to `V`. Concurrent misses on
/// the same key collapse into one fetch: a cache miss populates the slot
/// under a single-flight guarantee, so concurrent requests for the same
/// key issue at most one underlying fetch.
pub struct SingleFlightCache<K, V> {
    slots: DashMap<K, Slot<V>>,
    in_flight: DashMap<K, Arc<Notify>>,
    ttl: Duration,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        SingleFlightCache {
            slots: DashMap::new(),
            in_flight: DashMap::new(),
            ttl,
        }
    }

    fn fresh(&self, key: &K) -> Option<V> {
        let slot = self.slots.get(key)?;
        let guard = slot.value.load();
        let entry: &Arc<(V, Instant)> = guard.as_ref()?;
        let (value, inserted_at) = (&entry.0, &entry.1);
        if inserted_at.elapsed() < self.ttl {
            Some(value.clone())
        } else {
            None
        }
    }

    /// Returns the cached value if fresh; otherwise runs `fetch` exactly
    /// once across however many concurrent callers miss on `key`, and
    /// populates the slot with the result.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V, PolicyError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, PolicyError>>,
    {
        loop {
            if let Some(value) = self.fresh(&key) {
                return Ok(value);
            }

            match self.in_flight.entry(key.clone()) {
                DashEntry::Occupied(occupied) => {
                    let notify = Arc::clone(occupied.get());
                    drop(occupied);
                    notify.notified().await;
                    continue;
                }
                DashEntry::Vacant(vacant) => {
                    vacant.insert(Arc::new(Notify::new()));
                    break;
                }
            }
        }

        let result = fetch().await;
        if let Ok(value) = &result {
            let slot = self.slots.entry(key.clone()).or_default();
            slot.value.store(Some(Arc::new((value.clone(), Instant::now()))));
        }
        if let Some((_, notify)) = self.in_flight.remove(&key) {
            notify.notify_waiters();
        }
        result
    }

    /// Atomically clears a key's slot; any mutation on the underlying
    /// entity invalidates the relevant slice this way.
    pub fn invalidate(&self, key: &K) {
        if let Some(slot) = self.slots.get(key) {
            slot.value.store(None);
        }
    }

    pub fn invalidate_all(&self) {
        self.slots.clear();
    }
}

/// The four lookup kinds the cache serves, per realm.
pub struct RealmCache {
    pub actions: SingleFlightCache<String, Id>,
    /// type name -> (id, is_public)
    pub types: SingleFlightCache<String, (Id, bool)>,
    pub roles: SingleFlightCache<String, Id>,
    /// (resource_type_id, external_id) -> resource_id
    pub external_ids: SingleFlightCache<(Id, String), Id>,
}

impl RealmCache {
    pub fn new(ttl: Duration) -> Self {
        RealmCache {
            actions: SingleFlightCache::new(ttl),
            types: SingleFlightCache::new(ttl),
            roles: SingleFlightCache::new(ttl),
            external_ids: SingleFlightCache::new(ttl),
        }
    }
}

/// Top-level cache, one [`RealmCache`] per realm name. New realms are
/// inserted lock-free via `DashMap::entry`; there is no whole-cache
/// invalidation path because a realm's children cascade-delete the realm
/// itself, which simply drops that entry.
pub struct NameIdCache {
    realms: DashMap<String, Arc<RealmCache>>,
    ttl: Duration,
}

impl NameIdCache {
    pub fn new(ttl: Duration) -> Self {
        NameIdCache {
            realms: DashMap::new(),
            ttl,
        }
    }

    pub fn realm(&self, realm_name: &str) -> Arc<RealmCache> {
        self.realms
            .entry(realm_name.to_string())
            .or_insert_with(|| Arc::new(RealmCache::new(self.ttl)))
            .clone()
    }

    pub fn drop_realm(&self, realm_name: &str) {
        self.realms.remove(realm_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn caches_value_after_first_fetch() {
        let cache: SingleFlightCache<String, Id> = SingleFlightCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let value = cache
            .get_or_fetch("view".to_string(), || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let value2 = cache
            .get_or_fetch("view".to_string(), || async { Ok(999) })
            .await
            .unwrap();
        assert_eq!(value2, 42, "second call should hit the cache, not refetch");
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_to_one_fetch() {
        let cache = Arc::new(SingleFlightCache::<String, Id>::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("action".to_string(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(7)
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let cache: SingleFlightCache<String, Id> =
            SingleFlightCache::new(Duration::from_millis(10));
        cache
            .get_or_fetch("x".to_string(), || async { Ok(1) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let v = cache
            .get_or_fetch("x".to_string(), || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let cache: SingleFlightCache<String, Id> = SingleFlightCache::new(Duration::from_secs(60));
        cache
            .get_or_fetch("x".to_string(), || async { Ok(1) })
            .await
            .unwrap();
        cache.invalidate(&"x".to_string());
        let v = cache
            .get_or_fetch("x".to_string(), || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test]
    async fn fetch_error_is_not_cached() {
        let cache: SingleFlightCache<String, Id> = SingleFlightCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_fetch("x".to_string(), || async {
                Err(PolicyError::unknown(crate::error::EntityKind::Action, "x"))
            })
            .await;
        assert!(err.is_err());
        let ok = cache
            .get_or_fetch("x".to_string(), || async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(ok, 5);
    }

    #[test]
    fn realm_buckets_are_created_lazily_and_reused() {
        let cache = NameIdCache::new(Duration::from_secs(60));
        let a = cache.realm("r1");
        let b = cache.realm("r1");
        assert!(Arc::ptr_eq(&a, &b));
        cache.drop_realm("r1");
        let c = cache.realm("r1");
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
