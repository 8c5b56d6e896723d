//! Keyed store of [`Resource`]s with sliding TTL eviction and request deduplication.
//!
//! [`ResourceCache::get_or_create`] normalizes the caller's key, returns the live
//! resource for it if one exists, and otherwise creates, stores, and returns a new
//! one. Every lookup pushes the entry's expiration to `now + ttl`; a background
//! sweep started with [`ResourceCache::start`] removes entries whose expiration has
//! passed.
//!
//! ## Entry lifecycle
//!
//! ```text
//! Absent ──get_or_create──▶ Live(expires = t0 + ttl)
//!                             │  get_or_create at t1
//!                             ▼
//!                           Live(expires = t1 + ttl)
//!                             │  sweep with now > expires
//!                             ▼
//!                           Absent
//! ```
//!
//! Eviction only forgets the mapping. An operation that is still running when its
//! entry is evicted runs to completion; its outcome is simply no longer reachable
//! through the cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::background::{Sweep, Sweeper};
use crate::resource::{Fetch, Resource};

pub mod config;

pub use config::{CacheConfig, ConfigError};

/// A normalized cache key.
///
/// Keys are case-folded with Unicode lowercasing, which does not depend on the
/// process locale, so textually-equivalent requests share one entry.
///
/// # Examples
///
/// ```
/// use rescache::cache::CacheKey;
///
/// assert_eq!(CacheKey::normalize("PIKACHU"), CacheKey::normalize("Pikachu"));
/// assert_eq!(CacheKey::normalize("Pikachu").as_str(), "pikachu");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Normalizes a raw request key.
    pub fn normalize(raw: &str) -> Self {
        Self(raw.to_lowercase())
    }

    /// Returns the normalized key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Counters describing cache activity since construction.
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sweeps: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Lookups that returned an existing resource.
    pub hits: u64,
    /// Lookups that created a new resource.
    pub misses: u64,
    /// Entries removed by sweeps.
    pub evictions: u64,
    /// Completed sweep passes.
    pub sweeps: u64,
}

struct Entry<T, E> {
    resource: Resource<T, E>,
    expires_at: Instant,
}

impl<T, E> Entry<T, E> {
    /// Pushes the expiration out to `expires_at`. Never moves it backwards.
    fn touch(&mut self, expires_at: Instant) {
        self.expires_at = self.expires_at.max(expires_at);
    }
}

// State shared with the sweep task.
struct Store<T, E> {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, Entry<T, E>>>,
    stats: CacheStats,
}

impl<T, E> Store<T, E> {
    fn evict_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, entry| {
            let keep = entry.expires_at >= now;
            if !keep {
                debug!(%key, "evicting expired resource");
            }
            keep
        });
        let evicted = before - entries.len();
        drop(entries);

        self.stats.sweeps.fetch_add(1, Ordering::Relaxed);
        self.stats
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }
}

impl<T, E> Sweep for Store<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn sweep(&self) -> usize {
        self.evict_expired(Instant::now())
    }
}

/// In-memory cache mapping normalized keys to shared [`Resource`]s.
///
/// At most one resource is live per key: concurrent callers asking for the same
/// key while it is cached all receive the same handle, so the underlying
/// operation runs once per TTL window.
///
/// A failed resource is cached like a successful one. Asking for the same key
/// again within the TTL returns the same rejected resource; a fresh attempt
/// happens only after the entry has gone unaccessed for a full TTL and has been
/// swept.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use rescache::{Resource, ResourceCache};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = ResourceCache::<String, String>::with_ttl(Duration::from_secs(5));
/// cache.start();
///
/// let a = cache.get_or_create("Pikachu", |key| {
///     let name = key.to_owned();
///     Resource::new(async move { Ok(name) })
/// });
/// let b = cache.get_or_create("PIKACHU", |_| unreachable!("deduplicated"));
///
/// assert!(a.ptr_eq(&b));
/// assert_eq!(*a.settled().await.unwrap(), "pikachu");
///
/// cache.stop().await;
/// # }
/// ```
pub struct ResourceCache<T, E> {
    config: CacheConfig,
    store: Arc<Store<T, E>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<T, E> ResourceCache<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates an empty cache. The sweep does not run until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroSweepInterval`] if `config` cannot drive a timer.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    /// Creates a cache with the given TTL and the default sweep interval.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::from_config(CacheConfig::with_ttl(ttl))
    }

    fn from_config(config: CacheConfig) -> Self {
        Self {
            config,
            store: Arc::new(Store {
                ttl: config.ttl,
                entries: Mutex::new(HashMap::new()),
                stats: CacheStats::default(),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Returns the resource cached for `raw_key`, creating it with `create` if absent.
    ///
    /// `create` receives the normalized key and is called at most once, only when
    /// no live entry exists. In both cases the entry's expiration is reset to
    /// `now + ttl`.
    ///
    /// `create` runs while the cache is locked and must not call back into this
    /// cache.
    pub fn get_or_create<F>(&self, raw_key: &str, create: F) -> Resource<T, E>
    where
        F: FnOnce(&str) -> Resource<T, E>,
    {
        let key = CacheKey::normalize(raw_key);

        let mut entries = self.store.entries.lock();
        let expires_at = Instant::now() + self.store.ttl;
        if let Some(entry) = entries.get_mut(&key) {
            entry.touch(expires_at);
            self.store.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "resource cache hit");
            return entry.resource.clone();
        }

        let resource = create(key.as_str());
        debug!(%key, "resource created");
        entries.insert(
            key,
            Entry {
                resource: resource.clone(),
                expires_at,
            },
        );
        self.store.stats.misses.fetch_add(1, Ordering::Relaxed);
        resource
    }

    /// Like [`get_or_create`](Self::get_or_create), building missing resources
    /// with `fetcher`.
    pub fn get_or_fetch<F>(&self, raw_key: &str, fetcher: &F) -> Resource<T, E>
    where
        F: Fetch<T, E> + ?Sized,
    {
        self.get_or_create(raw_key, |key| Resource::fetch(fetcher, key))
    }

    /// Starts the background sweep. Returns `false` if it was already running.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(Sweeper::is_running) {
            return false;
        }
        if let Some(stale) = sweeper.take() {
            stale.signal_shutdown();
        }
        *sweeper = Some(Sweeper::spawn(&self.store, self.config.sweep_interval));
        true
    }
}

impl<T, E> ResourceCache<T, E> {
    /// Stops the background sweep and waits for it to exit.
    ///
    /// Returns `false` if it was not running. Cached entries are kept; calling
    /// [`start`](Self::start) again resumes sweeping them.
    pub async fn stop(&self) -> bool {
        let sweeper = self.sweeper.lock().take();
        match sweeper {
            Some(sweeper) => {
                sweeper.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Returns `true` while the background sweep is active.
    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(Sweeper::is_running)
    }

    #[cfg(test)]
    fn sweep_at(&self, now: Instant) -> usize {
        self.store.evict_expired(now)
    }

    /// Returns the configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Returns the configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of cached entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.store.entries.lock().len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.store.entries.lock().is_empty()
    }

    /// Returns `true` if an entry exists for `raw_key`. Does not refresh its TTL.
    pub fn contains(&self, raw_key: &str) -> bool {
        self.store
            .entries
            .lock()
            .contains_key(&CacheKey::normalize(raw_key))
    }

    /// Returns the expiration instant for `raw_key`. Does not refresh its TTL.
    pub fn expires_at(&self, raw_key: &str) -> Option<Instant> {
        self.store
            .entries
            .lock()
            .get(&CacheKey::normalize(raw_key))
            .map(|entry| entry.expires_at)
    }

    /// Snapshot of the cached keys, sorted.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.store.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns a copy of the activity counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        let stats = &self.store.stats;
        CacheStatsSnapshot {
            hits: stats.hits.load(Ordering::Relaxed),
            misses: stats.misses.load(Ordering::Relaxed),
            evictions: stats.evictions.load(Ordering::Relaxed),
            sweeps: stats.sweeps.load(Ordering::Relaxed),
        }
    }
}

impl<T, E> Default for ResourceCache<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::with_ttl(config::DEFAULT_TTL)
    }
}

impl<T, E> fmt::Debug for ResourceCache<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("config", &self.config)
            .field("len", &self.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<T, E> Drop for ResourceCache<T, E> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.signal_shutdown();
            info!("resource cache dropped, sweep cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::oneshot;
    use tokio::time::sleep;

    use super::*;

    type Cache = ResourceCache<String, String>;

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn counting(calls: &Arc<AtomicUsize>) -> impl FnOnce(&str) -> Resource<String, String> {
        let calls = Arc::clone(calls);
        move |key| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let value = format!("{key}#{n}");
            Resource::new(async move { Ok(value) })
        }
    }

    #[test]
    fn key_normalization() {
        assert_eq!(CacheKey::normalize("Pikachu").as_str(), "pikachu");
        assert_eq!(CacheKey::normalize("ÉVOLI"), CacheKey::normalize("évoli"));
        assert_eq!(CacheKey::normalize("already lower").to_string(), "already lower");
    }

    #[test]
    fn rejects_zero_sweep_interval() {
        let config = CacheConfig::default().sweep_interval(Duration::ZERO);
        assert!(matches!(
            Cache::new(config),
            Err(ConfigError::ZeroSweepInterval)
        ));
    }

    #[tokio::test]
    async fn creates_once_per_key() {
        let cache = Cache::with_ttl(ms(5_000));
        let calls = Arc::new(AtomicUsize::new(0));

        let a = cache.get_or_create("Pikachu", counting(&calls));
        let b = cache.get_or_create("pikachu", counting(&calls));
        let c = cache.get_or_create("PIKACHU", counting(&calls));

        assert!(a.ptr_eq(&b));
        assert!(b.ptr_eq(&c));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*a.settled().await.unwrap(), "pikachu#0");
        assert_eq!(cache.keys(), vec![CacheKey::normalize("pikachu")]);
    }

    #[tokio::test]
    async fn create_receives_normalized_key() {
        let cache = Cache::default();
        let resource = cache.get_or_create("MewTwo", |key| {
            let key = key.to_owned();
            Resource::new(async move { Ok(key) })
        });
        assert_eq!(*resource.settled().await.unwrap(), "mewtwo");
    }

    #[tokio::test]
    async fn get_or_fetch_uses_the_fetcher_once() {
        let cache = Cache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = move |key: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            let value = key.to_uppercase();
            async move { Ok::<_, String>(value) }
        };

        let a = cache.get_or_fetch("Onix", &fetcher);
        let b = cache.get_or_fetch("onix", &fetcher);

        assert!(a.ptr_eq(&b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*b.settled().await.unwrap(), "ONIX");
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_resources() {
        let cache = Cache::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = cache.get_or_create("bulbasaur", counting(&calls));
        let b = cache.get_or_create("charmander", counting(&calls));

        assert!(!a.ptr_eq(&b));
        assert_eq!(cache.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn access_slides_expiration() {
        let cache = Cache::with_ttl(ms(5_000));
        let start = Instant::now();

        cache.get_or_create("pikachu", counting(&Arc::default()));
        assert_eq!(cache.expires_at("pikachu"), Some(start + ms(5_000)));

        sleep(ms(4_000)).await;
        cache.get_or_create("Pikachu", |_| unreachable!());
        assert_eq!(cache.expires_at("PIKACHU"), Some(start + ms(9_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn expiration_never_moves_backwards() {
        let cache = Cache::with_ttl(ms(5_000));
        let start = Instant::now();
        cache.get_or_create("pikachu", counting(&Arc::default()));

        sleep(ms(1_000)).await;
        cache.get_or_create("pikachu", |_| unreachable!());
        assert_eq!(cache.expires_at("pikachu"), Some(start + ms(6_000)));

        // A refresh computed from an earlier clock reading loses to the later one.
        let key = CacheKey::normalize("pikachu");
        if let Some(entry) = cache.store.entries.lock().get_mut(&key) {
            entry.touch(start + ms(5_000));
        }
        assert_eq!(cache.expires_at("pikachu"), Some(start + ms(6_000)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn contended_access_keeps_latest_expiration() {
        let cache = Arc::new(Cache::with_ttl(ms(5_000)));
        cache.get_or_create("gengar", counting(&Arc::default()));
        let mut latest = Instant::now();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    let before = Instant::now();
                    cache.get_or_create("GENGAR", |_| unreachable!());
                    before
                })
            })
            .collect();

        for handle in handles {
            latest = latest.max(handle.await.unwrap());
        }

        let expires_at = cache.expires_at("gengar").unwrap();
        assert!(expires_at >= latest + ms(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_only_strictly_expired() {
        let cache = Cache::with_ttl(ms(1_000));
        let start = Instant::now();
        cache.get_or_create("pikachu", counting(&Arc::default()));

        // Expiration equal to `now` is not yet expired.
        assert_eq!(cache.sweep_at(start + ms(1_000)), 0);
        assert!(cache.contains("pikachu"));

        assert_eq!(cache.sweep_at(start + ms(1_001)), 1);
        assert!(!cache.contains("pikachu"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recreates_after_eviction() {
        let cache = Cache::with_ttl(ms(1_000));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache.get_or_create("eevee", counting(&calls));
        cache.sweep_at(Instant::now() + ms(2_000));
        let second = cache.get_or_create("eevee", counting(&calls));

        assert!(!first.ptr_eq(&second));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*second.settled().await.unwrap(), "eevee#1");
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_does_not_cancel_pending_operation() {
        let cache = Cache::with_ttl(ms(10));
        let (tx, rx) = oneshot::channel::<String>();

        let resource = cache.get_or_create("snorlax", move |_| {
            Resource::new(async move { rx.await.map_err(|e| e.to_string()) })
        });
        assert_eq!(cache.sweep_at(Instant::now() + ms(100)), 1);
        assert!(resource.is_pending());

        tx.send("zzz".to_owned()).unwrap();
        assert_eq!(*resource.settled().await.unwrap(), "zzz");
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_resource_stays_cached_while_accessed() {
        let cache = Cache::with_ttl(ms(1_000));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let create = move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            Resource::new(async { Err("missingno".to_owned()) })
        };

        let failed = cache.get_or_create("missingno", create.clone());
        assert!(failed.settled().await.is_err());

        sleep(ms(800)).await;
        let again = cache.get_or_create("missingno", create.clone());
        assert!(failed.ptr_eq(&again));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Access refreshed the TTL, so the failure survives a sweep that would
        // otherwise have removed it.
        assert_eq!(cache.sweep_at(Instant::now() + ms(500)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_evicts() {
        let cache = Cache::new(CacheConfig::with_ttl(ms(100)).sweep_interval(ms(50))).unwrap();
        assert!(cache.start());

        cache.get_or_create("ditto", counting(&Arc::default()));
        sleep(ms(120)).await;
        assert!(cache.contains("ditto"));

        sleep(ms(40)).await;
        assert!(!cache.contains("ditto"));

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.sweeps, 3);

        assert!(cache.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let cache = Cache::new(CacheConfig::with_ttl(ms(100)).sweep_interval(ms(50))).unwrap();

        assert!(cache.start());
        assert!(!cache.start());
        assert!(cache.is_running());

        sleep(ms(260)).await;
        // One timer: sweeps at 50, 100, 150, 200, 250.
        assert_eq!(cache.stats().sweeps, 5);

        assert!(cache.stop().await);
        assert!(!cache.stop().await);
        assert!(!cache.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_cycles_do_not_leak_timers() {
        let cache = Cache::new(CacheConfig::with_ttl(ms(100)).sweep_interval(ms(50))).unwrap();

        for _ in 0..5 {
            assert!(cache.start());
            assert!(cache.stop().await);
        }
        assert!(cache.start());

        sleep(ms(110)).await;
        assert_eq!(cache.stats().sweeps, 2);

        cache.stop().await;
        sleep(ms(1_000)).await;
        assert_eq!(cache.stats().sweeps, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_cache_cancels_the_sweep() {
        let cache = Cache::new(CacheConfig::with_ttl(ms(100)).sweep_interval(ms(50))).unwrap();
        // Keep the store alive so only the shutdown signal can stop the task.
        let store = Arc::clone(&cache.store);
        assert!(cache.start());

        sleep(ms(110)).await;
        assert_eq!(store.stats.sweeps.load(Ordering::Relaxed), 2);

        drop(cache);
        sleep(ms(500)).await;
        assert_eq!(store.stats.sweeps.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_operation() {
        let cache = Arc::new(Cache::with_ttl(ms(5_000)));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let name = if i % 2 == 0 { "Jigglypuff" } else { "JIGGLYPUFF" };
                tokio::spawn(async move { cache.get_or_create(name, counting(&calls)) })
            })
            .collect();

        let mut resources = Vec::new();
        for handle in handles {
            resources.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(resources.windows(2).all(|w| w[0].ptr_eq(&w[1])));
    }

    #[tokio::test]
    async fn stats_count_hits_and_misses() {
        let cache = Cache::default();
        let calls = Arc::new(AtomicUsize::new(0));

        cache.get_or_create("a", counting(&calls));
        cache.get_or_create("A", counting(&calls));
        cache.get_or_create("b", counting(&calls));

        assert_eq!(
            cache.stats(),
            CacheStatsSnapshot {
                hits: 1,
                misses: 2,
                evictions: 0,
                sweeps: 0,
            }
        );
    }
}
