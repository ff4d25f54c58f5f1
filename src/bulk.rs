//! Provides a cache which is populated as a whole by a single producer call.
//!
//! A [BulkCache] is the right tool if all values are cheaper to load at once than one by one
//! (think of "fetch the whole code table"). The producer receives a [BulkWriter] and calls
//! [BulkWriter::set] for each entry it provides.
//!
//! Right after creation, the background task runs the producer once. All readers wait until this
//! first population succeeded (or give up when their token is cancelled). Afterwards, the task
//! sweeps every 5/16 of a **refresh_interval**: it evicts entries which are older than
//! **keep_time** and re-runs the producer once **refresh_interval** has elapsed since the last
//! successful run. Note that a **keep_time** of zero doesn't disable eviction here: each sweep
//! then evicts every entry written before it.
//!
//! # Additive refreshes
//! A refresh merges into the existing entries, it doesn't replace them: a key which isn't written
//! by a later producer run keeps its previous value until it ages out via **keep_time**. Readers
//! may therefore observe entries from several producer runs at the same time. Producers which
//! need removed keys to vanish promptly should use a short **keep_time**.
//!
//! # Examples
//!
//! ```
//! # use evergreen::bulk::BulkCache;
//! # use evergreen::config::CacheConfig;
//! # use evergreen::CancellationToken;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let config = CacheConfig::new(Duration::from_secs(60), Duration::from_secs(60 * 60)).unwrap();
//! let cache = BulkCache::new(config, |_ctx, writer| async move {
//!     for i in 0..10 {
//!         writer.set(i.to_string(), i);
//!     }
//!     true
//! });
//!
//! // The first read waits until the producer ran...
//! let ctx = CancellationToken::new();
//! assert_eq!(cache.get(&ctx, &"5".to_owned()).await, Some(5));
//! assert_eq!(cache.get(&ctx, &"42".to_owned()).await, None);
//!
//! cache.shutdown().await;
//! # }
//! ```
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::fmt::{format_duration, format_short_duration};
use crate::gate::Gate;
use crate::lifecycle::Maintenance;
use crate::map::{ConcurrentMap, ShardedMap};
use crate::stats::{CacheStats, Counters, Watch};

/// The boxed form of the producer of a bulk cache.
type Producer<K, V, M> =
    Box<dyn Fn(CancellationToken, BulkWriter<K, V, M>) -> BoxFuture<'static, bool> + Send + Sync>;

/// A value stored in a [BulkCache] along with the time it was written.
pub struct BulkEntry<V> {
    value: V,
    created_at: Instant,
}

impl<V> BulkEntry<V> {
    /// Returns the stored value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Returns when the value was written.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// The state shared between the cache handle, its maintenance task and all writers.
struct Shared<K, V, M> {
    map: M,
    config: CacheConfig,
    ready: Gate,
    stats: Counters,
    _marker: PhantomData<fn(K, V)>,
}

/// Stores values into a [BulkCache] on behalf of its producer.
///
/// Each written entry is stamped with the current time, overwriting any previous entry for the
/// same key. Writers are cheap to clone. Once the cache has been closed, writing is a no-op.
pub struct BulkWriter<K, V, M = ShardedMap<K, Arc<BulkEntry<V>>>> {
    shared: Arc<Shared<K, V, M>>,
    closed: CancellationToken,
}

impl<K, V, M> Clone for BulkWriter<K, V, M> {
    fn clone(&self) -> Self {
        BulkWriter {
            shared: self.shared.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<K, V, M> BulkWriter<K, V, M>
where
    K: Clone,
    M: ConcurrentMap<K, Arc<BulkEntry<V>>>,
{
    /// Stores the given value for the given key.
    pub fn set(&self, key: K, value: V) {
        if self.closed.is_cancelled() {
            return;
        }

        self.shared.map.set(
            key.clone(),
            Arc::new(BulkEntry {
                value,
                created_at: Instant::now(),
            }),
        );

        // A close which raced this write may already have cleared the map.
        if self.closed.is_cancelled() {
            self.shared.map.remove_all(&[key]);
            return;
        }

        self.shared.stats.record_write();
    }
}

struct Inner<K, V, M> {
    shared: Arc<Shared<K, V, M>>,
    producer: Producer<K, V, M>,
}

impl<K, V, M> Inner<K, V, M>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    M: ConcurrentMap<K, Arc<BulkEntry<V>>> + 'static,
{
    async fn maintain(self: Arc<Self>, token: CancellationToken) {
        // Once the task ends, nobody could ever resolve the gate, so readers are released.
        let _release = self.shared.ready.guard();

        let mut last_refresh = self.populate(&token).await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.shared.config.bulk_sweep_interval()) => (),
            }

            self.evict_expired();

            if last_refresh
                .is_some_and(|at| at.elapsed() < self.shared.config.refresh_interval())
            {
                continue;
            }

            if let Some(at) = self.populate(&token).await {
                last_refresh = Some(at);
            }
        }

        self.shared.map.clear();
        log::debug!("Bulk cache maintenance stopped.");
    }

    /// Runs the producer once and returns its start time if it succeeded.
    async fn populate(&self, token: &CancellationToken) -> Option<Instant> {
        let start = Instant::now();
        let watch = Watch::start();
        let writer = BulkWriter {
            shared: self.shared.clone(),
            closed: token.clone(),
        };

        let success = tokio::select! {
            success = (self.producer)(token.child_token(), writer) => success,
            _ = token.cancelled() => false,
        };
        let micros = watch.micros();
        self.shared.stats.record_computation(watch, success);

        if token.is_cancelled() {
            return None;
        }

        if success {
            if self.shared.ready.resolve() {
                log::info!(
                    "Bulk cache initially populated with {} entries in {}.",
                    self.shared.map.len(),
                    format_short_duration(micros)
                );
            } else {
                log::debug!(
                    "Bulk cache refreshed in {} ({} entries).",
                    format_short_duration(micros),
                    self.shared.map.len()
                );
            }
            Some(start)
        } else {
            log::warn!("Populating a bulk cache failed. Retrying during the next sweep.");
            None
        }
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        let is_expired = |entry: &Arc<BulkEntry<V>>| {
            self.shared
                .config
                .exceeds_keep_time(now.saturating_duration_since(entry.created_at))
        };

        let expired: Vec<K> = self
            .shared
            .map
            .snapshot()
            .into_iter()
            .filter(|(_, entry)| is_expired(entry))
            .map(|(key, _)| key)
            .collect();

        if !expired.is_empty() {
            // Keys rewritten since the snapshot carry a new timestamp and are kept.
            let evicted = self.shared.map.remove_if(&expired, is_expired);
            self.shared.stats.record_evictions(evicted);
            log::debug!("Evicted {} entries from a bulk cache.", evicted);
        }
    }
}

/// A cache whose entries are all written by one periodically re-run producer.
///
/// See the [module documentation](crate::bulk) for the refresh and eviction policy.
///
/// The cache owns a background task. It is stopped via [close](BulkCache::close) or
/// [shutdown](BulkCache::shutdown) and also once the cache is dropped.
pub struct BulkCache<K, V, M = ShardedMap<K, Arc<BulkEntry<V>>>> {
    shared: Arc<Shared<K, V, M>>,
    maintenance: Maintenance,
}

impl<K, V> BulkCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new cache backed by a [ShardedMap].
    ///
    /// The **producer** receives a token which is cancelled once the cache is closed and a
    /// writer to store its entries. It returns **true** if the run was successful.
    ///
    /// Note that this doesn't wait for the first population, this is performed by the
    /// background task.
    ///
    /// # Panics
    /// Panics if not called from within a tokio runtime.
    pub fn new<F, Fut>(config: CacheConfig, producer: F) -> Self
    where
        F: Fn(CancellationToken, BulkWriter<K, V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        BulkCache::with_map(config, ShardedMap::new(), producer)
    }
}

impl<K, V, M> BulkCache<K, V, M>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: ConcurrentMap<K, Arc<BulkEntry<V>>> + 'static,
{
    /// Creates a new cache which stores its entries in the given map.
    ///
    /// # Panics
    /// Panics if not called from within a tokio runtime.
    pub fn with_map<F, Fut>(config: CacheConfig, map: M, producer: F) -> Self
    where
        F: Fn(CancellationToken, BulkWriter<K, V, M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            map,
            config,
            ready: Gate::new(),
            stats: Counters::default(),
            _marker: PhantomData,
        });
        let inner = Arc::new(Inner {
            shared: shared.clone(),
            producer: Box::new(move |ctx, writer| producer(ctx, writer).boxed()),
        });

        log::info!(
            "Starting bulk cache (refresh interval: {}, keep time: {})...",
            format_duration(config.refresh_interval()),
            format_duration(config.keep_time())
        );

        let maintenance = Maintenance::spawn(|token| inner.maintain(token));

        BulkCache {
            shared,
            maintenance,
        }
    }

    /// Returns the value for the given key.
    ///
    /// Until the first population succeeded, this waits for it or until **ctx** is cancelled,
    /// whatever happens first. Afterwards this is a plain lookup.
    ///
    /// Returns **None** if the key is unknown, if **ctx** was cancelled before the cache became
    /// ready or if the cache has been closed.
    pub async fn get(&self, ctx: &CancellationToken, key: &K) -> Option<V> {
        if !self.shared.ready.wait_or_cancel(ctx).await {
            return None;
        }

        let result = self.shared.map.get(key).map(|entry| entry.value.clone());
        self.shared.stats.record_read(result.is_some());

        result
    }

    /// Determines if the first population has completed successfully (or the cache was closed).
    pub fn is_ready(&self) -> bool {
        self.shared.ready.is_resolved()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.shared.map.len()
    }

    /// Determines if the cache has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.shared.map.is_empty()
    }

    /// Returns the settings of this cache.
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Returns a snapshot of the metrics of this cache.
    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot(self.shared.map.len())
    }

    /// Determines if the cache has not been closed yet.
    pub fn is_running(&self) -> bool {
        self.maintenance.is_running()
    }

    /// Stops the maintenance task and releases all entries.
    ///
    /// Readers which are still waiting for the first population are released and receive
    /// **None**. Calling this more than once has no effect.
    pub fn close(&self) {
        if self.maintenance.close() {
            self.shared.map.clear();
            let _ = self.shared.ready.resolve();
            log::info!("Bulk cache closed.");
        }
    }

    /// Closes the cache and waits until its maintenance task has terminated.
    pub async fn shutdown(&self) {
        self.close();
        self.maintenance.join().await;
    }
}

#[cfg(test)]
mod tests {
    use crate::bulk::BulkCache;
    use crate::config::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};
    use tokio_util::sync::CancellationToken;

    fn config(refresh_secs: u64, keep_secs: u64) -> CacheConfig {
        CacheConfig::new(
            Duration::from_secs(refresh_secs),
            Duration::from_secs(keep_secs),
        )
        .unwrap()
    }

    fn key(i: usize) -> String {
        i.to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn readers_wait_for_the_first_population() {
        let cache = BulkCache::new(config(4, 3600), |ctx, writer| async move {
            sleep(Duration::from_secs(1)).await;
            for i in 0..10 {
                if ctx.is_cancelled() {
                    break;
                }
                writer.set(key(i), i);
            }
            true
        });
        let ctx = CancellationToken::new();
        assert!(!cache.is_ready());

        let start = Instant::now();
        assert_eq!(cache.get(&ctx, &key(1)).await, Some(1));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert!(cache.is_ready());

        let start = Instant::now();
        assert_eq!(cache.get(&ctx, &key(5)).await, Some(5));
        assert_eq!(cache.get(&ctx, &key(10)).await, None);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(cache.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_readers_give_up() {
        let cache = BulkCache::new(config(4, 3600), |_ctx, writer| async move {
            sleep(Duration::from_secs(10)).await;
            writer.set(key(1), 1);
            true
        });

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        let _ = tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        assert_eq!(cache.get(&ctx, &key(1)).await, None);
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        // Once populated, even a cancelled token gets its answer...
        sleep(Duration::from_secs(10)).await;
        assert_eq!(cache.get(&ctx, &key(1)).await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_populations_are_retried() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let cache = BulkCache::new(config(16, 3600), move |_ctx, writer| {
            let run = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if run < 2 {
                    return false;
                }
                writer.set(key(run), run);
                true
            }
        });

        // Retries happen with each sweep (every 5s) until the producer succeeds...
        let ctx = CancellationToken::new();
        let start = Instant::now();
        assert_eq!(cache.get(&ctx, &key(2)).await, Some(2));
        assert_eq!(start.elapsed(), Duration::from_secs(10));

        let stats = cache.stats();
        assert_eq!(stats.computations, 3);
        assert_eq!(stats.failed_computations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_merge_into_existing_entries() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let cache = BulkCache::new(config(16, 3600), move |_ctx, writer| {
            let run = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                // The first run provides all keys, later runs only a subset...
                let keys = if run == 0 { 0..10 } else { 0..3 };
                for i in keys {
                    writer.set(key(i), i * 100 + run);
                }
                true
            }
        });
        let ctx = CancellationToken::new();
        assert_eq!(cache.get(&ctx, &key(5)).await, Some(500));

        // The refresh interval elapses during the 4th sweep (at 20s)...
        sleep(Duration::from_secs(21)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // Mentioned keys are updated, all others are kept as they are...
        assert_eq!(cache.get(&ctx, &key(1)).await, Some(101));
        assert_eq!(cache.get(&ctx, &key(5)).await, Some(500));
        assert_eq!(cache.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn old_entries_are_evicted() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let cache = BulkCache::new(config(16, 30), move |_ctx, writer| {
            let run = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                writer.set("always".to_owned(), run);
                if run == 0 {
                    writer.set("once".to_owned(), run);
                }
                true
            }
        });
        let ctx = CancellationToken::new();
        assert_eq!(cache.get(&ctx, &"once".to_owned()).await, Some(0));

        // "once" is written at 0s and evicted by the first sweep after 30s (35s). "always" is
        // rewritten by each refresh (20s, 40s)...
        sleep(Duration::from_secs(36)).await;
        assert_eq!(cache.get(&ctx, &"once".to_owned()).await, None);
        assert_eq!(cache.get(&ctx, &"always".to_owned()).await, Some(1));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_keep_time_evicts_on_each_sweep() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let cache = BulkCache::new(config(16, 0), move |_ctx, writer| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                writer.set(key(1), 1);
                true
            }
        });
        let ctx = CancellationToken::new();
        assert_eq!(cache.get(&ctx, &key(1)).await, Some(1));

        // The first sweep (at 5s) removes everything, the next refresh (at 20s) brings it back...
        sleep(Duration::from_secs(6)).await;
        assert!(cache.is_empty());
        assert_eq!(cache.get(&ctx, &key(1)).await, None);
        assert_eq!(cache.stats().evictions, 1);

        sleep(Duration::from_secs(15)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(&ctx, &key(1)).await, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_runs_leave_their_entries_behind() {
        let cache = BulkCache::new(config(4, 3600), |_ctx, writer| async move {
            writer.set(key(1), 1);
            false
        });

        // The cache never becomes ready, but keeps what the producer wrote...
        sleep(Duration::from_secs(60)).await;
        assert!(!cache.is_ready());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writers_are_disabled_once_the_cache_is_closed() {
        let (sender, receiver) = tokio::sync::oneshot::channel();
        let sender = std::sync::Mutex::new(Some(sender));
        let cache = BulkCache::new(config(4, 3600), move |_ctx, writer| {
            if let Some(sender) = sender.lock().unwrap().take() {
                let _ = sender.send(writer.clone());
            }
            writer.set(key(1), 1);
            async { true }
        });
        let writer = receiver.await.unwrap();

        cache.shutdown().await;
        writer.set(key(2), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().writes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_releases_waiting_readers() {
        let cache = Arc::new(BulkCache::new(config(4, 3600), |ctx, writer| async move {
            ctx.cancelled().await;
            writer.set(key(1), 1);
            true
        }));

        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&CancellationToken::new(), &key(1)).await })
        };
        tokio::task::yield_now().await;

        // The maintenance task notices the shutdown right away, not after its next sleep...
        let start = Instant::now();
        cache.shutdown().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(reader.await.unwrap(), None);
        assert!(!cache.is_running());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().computations, 1);
    }
}
