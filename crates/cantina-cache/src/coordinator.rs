use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use std::fmt;

use moka::future::Cache;
use moka::ops::compute::Op;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::CacheConfig;
use crate::error::FetchResult;
use crate::key::CacheKey;
use crate::store::PersistentStore;
use crate::time::Instant;

/// One resolved value in the in-memory registry.
struct CachedValue<T> {
    value: Arc<T>,
    /// When this value's fetch was initiated. For values adopted from the
    /// persistent store this is the original fetch instant, not the moment
    /// of adoption, so the TTL window spans restarts.
    fetched_at: Instant,
    /// The floored TTL the value was fetched under.
    ttl: Duration,
}

// https://github.com/rust-lang/rust/issues/26925
impl<T> Clone for CachedValue<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            ttl: self.ttl,
        }
    }
}

impl<T> CachedValue<T> {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }

    fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.fetched_at.elapsed())
    }
}

/// A [`moka::Expiry`] that evicts each registry entry at the deadline its own
/// TTL dictates.
struct RegistryExpiration;

impl<T> moka::Expiry<CacheKey, CachedValue<T>> for RegistryExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &CachedValue<T>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.remaining())
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &CachedValue<T>,
        _updated_at: std::time::Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.remaining())
    }
}

/// The process-wide fetch coordinator.
///
/// Guarantees at most one producer run per cache key per TTL window, no
/// matter how many callers ask for the key concurrently, and lets all of
/// them share the run's outcome. Lookup order on each [`resolve`] is:
///
/// 1. The in-memory registry. A live entry fresh under the caller's TTL is
///    returned as-is; callers racing in while its fetch is still pending
///    wait on that same fetch.
/// 2. The [`PersistentStore`]. A fresh record is adopted into the registry
///    with its original timestamp and returned without running the producer.
/// 3. The caller's producer, run exactly once. Success is persisted
///    best-effort; failure is handed to every coalesced waiter and nothing
///    is cached, so the next resolve retries cold.
///
/// The coordinator is cheap to clone; clones share the registry and store.
///
/// [`resolve`]: Coordinator::resolve
pub struct Coordinator<T> {
    config: CacheConfig,
    registry: Cache<CacheKey, CachedValue<T>>,
    store: Arc<PersistentStore>,
}

impl<T> fmt::Debug for Coordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("in-memory entries", &self.registry.entry_count())
            .field("store", &self.store)
            .finish()
    }
}

// https://github.com/rust-lang/rust/issues/26925
impl<T> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: self.registry.clone(),
            store: Arc::clone(&self.store),
        }
    }
}

impl<T> Coordinator<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a coordinator, creating the storage directories if a
    /// `cache_dir` is configured.
    pub fn new(config: CacheConfig) -> io::Result<Self> {
        let store = Arc::new(PersistentStore::new(&config)?);
        let registry = Cache::builder()
            .name("fetch-registry")
            .max_capacity(config.in_memory_capacity)
            .expire_after(RegistryExpiration)
            .build();

        Ok(Self {
            config,
            registry,
            store,
        })
    }

    /// The TTL actually used for a caller-supplied value, after applying the
    /// default and the floor.
    pub fn effective_ttl(&self, ttl: Option<Duration>) -> Duration {
        self.config.effective_ttl(ttl)
    }

    /// The persistent layer, exposed mainly for the cleanup job.
    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    /// Resolves `key`, running `producer` only if no layer can serve it.
    ///
    /// Concurrent resolves for the same key within the same TTL window
    /// observe the identical settlement: the same value, or the same error.
    /// `ttl` is floored to the configured minimum.
    pub async fn resolve<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        producer: F,
    ) -> FetchResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        let ttl = self.effective_ttl(Some(ttl));

        // A live entry that is stale under *this* caller's window must not
        // be served again. The removal is conditional and checked per-key
        // under moka's entry lock, so a fresh value landed by a concurrent
        // refresh in the meantime survives and is adopted below.
        self.registry
            .entry_by_ref(key)
            .and_compute_with(|entry| {
                let op = match entry {
                    Some(entry) if entry.value().is_expired(ttl) => Op::Remove,
                    _ => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        match self
            .registry
            .try_get_with_by_ref(key, self.load_or_produce(key, ttl, producer))
            .await
        {
            Ok(cached) => Ok(Arc::clone(&cached.value)),
            // The error is shared by every coalesced waiter. Nothing was
            // cached, so the next resolve retries cold.
            Err(err) => Err((*err).clone()),
        }
    }

    /// Removes both the in-memory entry and the persisted record for `key`.
    ///
    /// The next [`resolve`](Coordinator::resolve) behaves like a cold start.
    pub async fn invalidate(&self, key: &CacheKey) {
        self.registry.invalidate(key).await;
        self.store.remove(key);
    }

    /// The most recently resolved value for `key`, without fetching.
    pub async fn peek(&self, key: &CacheKey) -> Option<Arc<T>> {
        self.registry
            .get(key)
            .await
            .map(|cached| Arc::clone(&cached.value))
    }

    /// The registry-miss path: adopt a fresh persisted record, or run the
    /// producer. Runs at most once per coalesced fetch.
    async fn load_or_produce<F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        producer: F,
    ) -> FetchResult<CachedValue<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        if let Some((value, stored_at)) = self.store.read::<T>(key, ttl) {
            tracing::trace!(key = %key, "adopting persisted cache record");
            let age = SystemTime::now()
                .duration_since(stored_at)
                .unwrap_or_default();
            let fetched_at = Instant::now()
                .checked_sub(age)
                .unwrap_or_else(Instant::now);
            return Ok(CachedValue {
                value: Arc::new(value),
                fetched_at,
                ttl,
            });
        }

        tracing::trace!(key = %key, "running producer");
        let fetched_at = Instant::now();
        let value = producer().await?;
        if let Err(err) = self.store.write(key, &value, SystemTime::now()) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                key = %key,
                "failed to persist cache record",
            );
        }

        Ok(CachedValue {
            value: Arc::new(value),
            fetched_at,
            ttl,
        })
    }
}
