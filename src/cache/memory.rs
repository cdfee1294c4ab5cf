//! In-process cache storage backed by tokio `RwLock`-guarded maps.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::{BoxFuture, Cache, CacheError, CacheKey, CacheStorage};
use crate::http::Response;

// Switches shared by a storage and every store it has handed out.
#[derive(Debug, Default)]
struct Switches {
    unavailable: AtomicBool,
}

impl Switches {
    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(CacheError::Backend("storage unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
struct Entries {
    order: Vec<CacheKey>,
    map: HashMap<CacheKey, Response>,
}

/// One named in-memory store.
#[derive(Debug)]
pub struct MemoryCache {
    name: String,
    quota: Option<usize>,
    deleted: AtomicBool,
    switches: Arc<Switches>,
    entries: RwLock<Entries>,
}

impl MemoryCache {
    fn new(name: &str, quota: Option<usize>, switches: Arc<Switches>) -> Self {
        Self {
            name: name.to_owned(),
            quota,
            deleted: AtomicBool::new(false),
            switches,
            entries: RwLock::new(Entries::default()),
        }
    }

    fn check_writable(&self) -> Result<(), CacheError> {
        self.switches.check()?;
        if self.deleted.load(Ordering::Acquire) {
            return Err(CacheError::Deleted(self.name.clone()));
        }
        Ok(())
    }

    // Number of entries after inserting `keys` into `entries`.
    fn projected_len<'k>(entries: &Entries, keys: impl Iterator<Item = &'k CacheKey>) -> usize {
        let fresh: HashSet<&CacheKey> = keys.filter(|k| !entries.map.contains_key(*k)).collect();
        entries.map.len() + fresh.len()
    }

    fn insert(entries: &mut Entries, key: CacheKey, response: Response) {
        if entries.map.insert(key.clone(), response).is_none() {
            entries.order.push(key);
        }
    }
}

impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn get<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<Option<Response>, CacheError>> {
        Box::pin(async move {
            self.switches.check()?;
            let entries = self.entries.read().await;
            Ok(entries.map.get(key).map(Response::duplicate))
        })
    }

    fn put(&self, key: CacheKey, response: Response) -> BoxFuture<'_, Result<(), CacheError>> {
        self.put_all(vec![(key, response)])
    }

    fn put_all(&self, batch: Vec<(CacheKey, Response)>) -> BoxFuture<'_, Result<(), CacheError>> {
        Box::pin(async move {
            self.check_writable()?;
            let mut entries = self.entries.write().await;

            if let Some(limit) = self.quota {
                if Self::projected_len(&entries, batch.iter().map(|(k, _)| k)) > limit {
                    return Err(CacheError::QuotaExceeded {
                        cache: self.name.clone(),
                        limit,
                    });
                }
            }

            for (key, response) in batch {
                trace!(cache = %self.name, key = %key, "stored");
                Self::insert(&mut entries, key, response);
            }
            Ok(())
        })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<CacheKey>, CacheError>> {
        Box::pin(async move {
            self.switches.check()?;
            Ok(self.entries.read().await.order.clone())
        })
    }
}

/// In-memory [`CacheStorage`].
///
/// Stores live as long as the storage value. Cloning a `MemoryStorage`
/// yields another handle to the same stores.
///
/// # Examples
///
/// ```
/// use offcache::cache::{Cache, CacheKey, CacheStorage, MemoryStorage};
/// use offcache::http::{Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), offcache::cache::CacheError> {
/// let storage = MemoryStorage::new();
/// let cache = storage.open("site-v1").await?;
/// cache.put(CacheKey::for_url("/"), Response::new(StatusCode::OK)).await?;
///
/// assert_eq!(storage.keys().await?, vec!["site-v1".to_string()]);
/// assert!(storage.match_any(&CacheKey::for_url("/")).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    stores: Arc<RwLock<Vec<Arc<MemoryCache>>>>,
    quota: Option<usize>,
    switches: Arc<Switches>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps every store created from now on at `max_entries`; writes past the
    /// cap fail with [`CacheError::QuotaExceeded`].
    #[must_use]
    pub fn with_quota(mut self, max_entries: usize) -> Self {
        self.quota = Some(max_entries);
        self
    }

    /// Makes every operation on this storage and its stores fail with
    /// [`CacheError::Backend`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.switches.unavailable.store(unavailable, Ordering::Release);
    }

    async fn find(&self, name: &str) -> Option<Arc<MemoryCache>> {
        self.stores
            .read()
            .await
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }
}

impl CacheStorage for MemoryStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Arc<dyn Cache>, CacheError>> {
        Box::pin(async move {
            self.switches.check()?;
            if let Some(existing) = self.find(name).await {
                return Ok(existing as Arc<dyn Cache>);
            }

            let mut stores = self.stores.write().await;
            // Another task may have created it between the two locks.
            if let Some(existing) = stores.iter().find(|c| c.name == name) {
                return Ok(Arc::clone(existing) as Arc<dyn Cache>);
            }
            debug!(cache = %name, "creating cache store");
            let cache = Arc::new(MemoryCache::new(name, self.quota, Arc::clone(&self.switches)));
            stores.push(Arc::clone(&cache));
            Ok(cache as Arc<dyn Cache>)
        })
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move {
            self.switches.check()?;
            Ok(self.find(name).await.is_some())
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move {
            self.switches.check()?;
            let mut stores = self.stores.write().await;
            let Some(pos) = stores.iter().position(|c| c.name == name) else {
                return Ok(false);
            };
            let removed = stores.remove(pos);
            removed.deleted.store(true, Ordering::Release);
            debug!(cache = %name, "deleted cache store");
            Ok(true)
        })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>> {
        Box::pin(async move {
            self.switches.check()?;
            Ok(self
                .stores
                .read()
                .await
                .iter()
                .map(|c| c.name.clone())
                .collect())
        })
    }

    fn match_any<'a>(
        &'a self,
        key: &'a CacheKey,
    ) -> BoxFuture<'a, Result<Option<Response>, CacheError>> {
        Box::pin(async move {
            self.switches.check()?;
            let stores: Vec<Arc<MemoryCache>> = self.stores.read().await.clone();
            for store in stores {
                if let Some(hit) = store.get(key).await? {
                    return Ok(Some(hit));
                }
            }
            Ok(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;

    fn ok(body: &'static str) -> Response {
        Response::new(StatusCode::OK).body(body)
    }

    #[tokio::test]
    async fn open_is_create_or_reuse() {
        let storage = MemoryStorage::new();
        let a = storage.open("v1").await.unwrap();
        a.put(CacheKey::for_url("/"), ok("home")).await.unwrap();

        let b = storage.open("v1").await.unwrap();
        assert_eq!(b.keys().await.unwrap(), vec![CacheKey::for_url("/")]);
        assert_eq!(storage.keys().await.unwrap(), vec!["v1".to_string()]);
    }

    #[tokio::test]
    async fn keys_keep_creation_order() {
        let storage = MemoryStorage::new();
        for name in ["b", "a", "c"] {
            storage.open(name).await.unwrap();
        }
        assert_eq!(storage.keys().await.unwrap(), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn delete_absent_store_is_noop() {
        let storage = MemoryStorage::new();
        storage.open("v1").await.unwrap();
        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn writes_to_deleted_handle_fail() {
        let storage = MemoryStorage::new();
        let stale = storage.open("v1").await.unwrap();
        storage.delete("v1").await.unwrap();

        let err = stale.put(CacheKey::for_url("/"), ok("x")).await.unwrap_err();
        assert!(matches!(err, CacheError::Deleted(name) if name == "v1"));
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_replaces_without_reordering() {
        let storage = MemoryStorage::new();
        let cache = storage.open("v1").await.unwrap();
        cache.put(CacheKey::for_url("/a"), ok("1")).await.unwrap();
        cache.put(CacheKey::for_url("/b"), ok("2")).await.unwrap();
        cache.put(CacheKey::for_url("/a"), ok("3")).await.unwrap();

        let keys = cache.keys().await.unwrap();
        assert_eq!(keys, vec![CacheKey::for_url("/a"), CacheKey::for_url("/b")]);
        let hit = cache.get(&CacheKey::for_url("/a")).await.unwrap().unwrap();
        assert_eq!(hit.body_bytes().as_ref(), b"3");
    }

    #[tokio::test]
    async fn quota_rejects_whole_batch() {
        let storage = MemoryStorage::new().with_quota(2);
        let cache = storage.open("v1").await.unwrap();
        cache.put(CacheKey::for_url("/a"), ok("a")).await.unwrap();

        let batch = vec![
            (CacheKey::for_url("/b"), ok("b")),
            (CacheKey::for_url("/c"), ok("c")),
        ];
        let err = cache.put_all(batch).await.unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { limit: 2, .. }));
        assert_eq!(cache.keys().await.unwrap().len(), 1);

        // Overwriting an existing key does not count against the quota.
        cache.put(CacheKey::for_url("/a"), ok("a2")).await.unwrap();
        cache.put(CacheKey::for_url("/b"), ok("b")).await.unwrap();
    }

    #[tokio::test]
    async fn match_any_searches_oldest_first() {
        let storage = MemoryStorage::new();
        let old = storage.open("v1").await.unwrap();
        let new = storage.open("v2").await.unwrap();
        old.put(CacheKey::for_url("/"), ok("old")).await.unwrap();
        new.put(CacheKey::for_url("/"), ok("new")).await.unwrap();
        new.put(CacheKey::for_url("/only-new"), ok("n")).await.unwrap();

        let hit = storage.match_any(&CacheKey::for_url("/")).await.unwrap().unwrap();
        assert_eq!(hit.body_bytes().as_ref(), b"old");
        assert!(storage
            .match_any(&CacheKey::for_url("/only-new"))
            .await
            .unwrap()
            .is_some());
        assert!(storage
            .match_any(&CacheKey::for_url("/nowhere"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unavailable_storage_fails_every_operation() {
        let storage = MemoryStorage::new();
        let cache = storage.open("v1").await.unwrap();
        storage.set_unavailable(true);

        assert!(storage.keys().await.is_err());
        assert!(cache.get(&CacheKey::for_url("/")).await.is_err());
        assert!(cache.put(CacheKey::for_url("/"), ok("x")).await.is_err());

        storage.set_unavailable(false);
        assert!(cache.put(CacheKey::for_url("/"), ok("x")).await.is_ok());
    }
}
