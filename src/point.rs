//! Provides a cache which lazily computes each value on first access and keeps hot values fresh.
//!
//! A [PointCache] maps each key to a value computed by a producer. The first `get` for a key runs
//! the producer, every concurrent `get` for the same key waits for this very computation instead
//! of starting its own (request coalescing).
//!
//! A background task wakes up four times per **refresh_interval** and walks all entries. Using the
//! creation time of the value and the time of its last read, it decides per entry (in this order):
//!
//! 1. If the value is older than **keep_time** (and keep time is non-zero), the entry is evicted.
//! 2. If the value is younger than **refresh_interval**, it is fresh and left alone.
//! 3. If the value hasn't been read since it was (re)computed, it is left alone. Refreshing data
//!    nobody looks at would only waste producer calls, the entry will eventually age out.
//! 4. If the value has been read within the last half **refresh_interval**, the producer is
//!    invoked (bounded by a timeout of half a **refresh_interval**). On success the value is
//!    replaced, on failure the stale value keeps being served.
//! 5. Otherwise the entry is stale and cold and is left to decay.
//!
//! This way, hot keys never make a reader wait for a recomputation once they have been populated.
//!
//! Values are stored as immutable snapshots which are swapped atomically. A reader therefore
//! always observes a value along with its matching creation time, even while a refresh runs.
//!
//! # Examples
//!
//! ```
//! # use evergreen::config::CacheConfig;
//! # use evergreen::point::PointCache;
//! # use evergreen::CancellationToken;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let config = CacheConfig::new(Duration::from_secs(3), Duration::from_secs(60 * 60)).unwrap();
//! let cache = PointCache::new(config, |key: String, _ctx| async move { Some(key.len()) });
//!
//! let ctx = CancellationToken::new();
//! assert_eq!(cache.get(&ctx, "one".to_owned()).await, Some(3));
//!
//! // Values can also be provided manually...
//! cache.set("four".to_owned(), 42);
//! assert_eq!(cache.get(&ctx, "four".to_owned()).await, Some(42));
//!
//! // Stopping the cache is mandatory to release the background task right away...
//! cache.shutdown().await;
//! # }
//! ```
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::fmt::format_duration;
use crate::gate::Gate;
use crate::lifecycle::Maintenance;
use crate::map::{ConcurrentMap, ShardedMap};
use crate::stats::{CacheStats, Counters, Watch};

/// The boxed form of the producer of a point cache.
type Producer<K, V> =
    Box<dyn Fn(K, CancellationToken) -> BoxFuture<'static, Option<V>> + Send + Sync>;

/// A value along with the time it was computed.
struct Snapshot<V> {
    value: V,
    created_at: Instant,
}

/// Represents the slot of a single key within a [PointCache].
///
/// The slot is visible to readers as soon as it has been inserted, which is before its first
/// computation completed. Readers then wait for its readiness gate, which is resolved by the task
/// which inserted the slot once the computation finished (successfully or not).
pub struct PointEntry<V> {
    inserted_at: Instant,
    snapshot: ArcSwapOption<Snapshot<V>>,
    // Nanos since inserted_at plus one, zero if never read.
    last_used: AtomicU64,
    ready: Option<Gate>,
}

/// What the maintenance task does with an entry.
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Evict,
    Fresh,
    Unused,
    Refresh,
    Idle,
}

impl<V> PointEntry<V> {
    /// Creates a slot whose value is yet to be computed.
    fn pending(now: Instant) -> Self {
        PointEntry {
            inserted_at: now,
            snapshot: ArcSwapOption::empty(),
            last_used: AtomicU64::new(0),
            ready: Some(Gate::new()),
        }
    }

    /// Creates a slot which already carries a value (which counts as used).
    fn resolved(value: V, now: Instant) -> Self {
        let entry = PointEntry {
            inserted_at: now,
            snapshot: ArcSwapOption::empty(),
            last_used: AtomicU64::new(0),
            ready: None,
        };
        entry.publish(value, now);
        entry.touch(now);

        entry
    }

    fn publish(&self, value: V, now: Instant) {
        self.snapshot.store(Some(Arc::new(Snapshot {
            value,
            created_at: now,
        })));
    }

    fn touch(&self, now: Instant) {
        let nanos = now.saturating_duration_since(self.inserted_at).as_nanos();
        self.last_used.store(
            u64::try_from(nanos).unwrap_or(u64::MAX - 1) + 1,
            Ordering::Relaxed,
        );
    }

    /// Returns when the value was last (re)computed or **None** if there is no value.
    pub fn created_at(&self) -> Option<Instant> {
        self.snapshot
            .load_full()
            .map(|snapshot| snapshot.created_at)
    }

    /// Returns when the value was last successfully read or **None** if it never was.
    pub fn last_used_at(&self) -> Option<Instant> {
        match self.last_used.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(self.inserted_at + Duration::from_nanos(nanos - 1)),
        }
    }

    /// Determines if the first computation of this slot is still running.
    pub fn is_pending(&self) -> bool {
        self.ready.as_ref().is_some_and(|gate| !gate.is_resolved())
    }

    fn classify(&self, now: Instant, config: &CacheConfig) -> Verdict {
        // Slots without a value (pending or failed) still age from the moment they were inserted.
        let created_at = self.created_at().unwrap_or(self.inserted_at);
        let age = now.saturating_duration_since(created_at);

        if config.is_expired(age) {
            return Verdict::Evict;
        }
        if age < config.refresh_interval() {
            return Verdict::Fresh;
        }

        match self.last_used_at() {
            Some(last_used) if created_at <= last_used => {
                if now.saturating_duration_since(last_used) < config.recent_use_window() {
                    Verdict::Refresh
                } else {
                    Verdict::Idle
                }
            }
            _ => Verdict::Unused,
        }
    }
}

impl<V: Clone> PointEntry<V> {
    /// Returns a copy of the current value, if one is present.
    pub fn value(&self) -> Option<V> {
        self.snapshot
            .load_full()
            .map(|snapshot| snapshot.value.clone())
    }
}

/// The state shared between the cache handle and its maintenance task.
struct Inner<K, V, M> {
    map: M,
    config: CacheConfig,
    producer: Producer<K, V>,
    stats: Counters,
}

/// The outcome of a proactive refresh.
enum Refresh {
    Done,
    Failed,
    TimedOut,
    Cancelled,
}

impl<K, V, M> Inner<K, V, M>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: ConcurrentMap<K, Arc<PointEntry<V>>> + 'static,
{
    /// Waits for the first computation of a slot to complete and reads its value.
    async fn await_entry(&self, ctx: &CancellationToken, entry: &PointEntry<V>) -> Option<V> {
        if let Some(ready) = &entry.ready {
            if !ready.wait_or_cancel(ctx).await {
                return None;
            }
        }

        // A slot without a value after its gate opened has a failed first computation.
        let value = entry.value()?;
        entry.touch(Instant::now());

        Some(value)
    }

    /// Runs the first computation for a freshly inserted slot.
    ///
    /// This runs as a task of its own, so that the slot is populated even if the reader which
    /// inserted it gives up. Only closing the cache (which cancels **token**) aborts it.
    async fn compute(
        self: Arc<Self>,
        key: K,
        entry: Arc<PointEntry<V>>,
        token: CancellationToken,
    ) {
        // Waiters are released on every exit path, even if the producer panics.
        let _ready = entry.ready.as_ref().map(Gate::guard);

        let watch = Watch::start();
        let value = tokio::select! {
            value = (self.producer)(key, token.clone()) => value,
            _ = token.cancelled() => return,
        };
        self.stats.record_computation(watch, value.is_some());

        if let Some(value) = value {
            entry.publish(value, Instant::now());
        }
    }

    async fn maintain(self: Arc<Self>, token: CancellationToken) {
        log::debug!(
            "Point cache maintenance started (sweeping every {}).",
            format_duration(self.config.sweep_interval())
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.sweep_interval()) => self.sweep(&token).await,
            }
        }

        self.map.clear();
        log::debug!("Point cache maintenance stopped.");
    }

    /// Performs a single sweep cycle.
    async fn sweep(&self, token: &CancellationToken) {
        let mut expired = Vec::new();
        let mut refreshed = 0;
        let mut failed = 0;

        for (key, entry) in self.map.snapshot() {
            if token.is_cancelled() {
                return;
            }

            match entry.classify(Instant::now(), &self.config) {
                Verdict::Evict => expired.push(key),
                Verdict::Refresh => match self.refresh(token, key, &entry).await {
                    Refresh::Done => refreshed += 1,
                    Refresh::Failed | Refresh::TimedOut => failed += 1,
                    Refresh::Cancelled => return,
                },
                Verdict::Fresh | Verdict::Unused | Verdict::Idle => (),
            }
        }

        // Refreshes may have taken a while, so each entry is judged again right before its
        // removal. Entries which have been replaced in the meantime are kept.
        let mut evicted = 0;
        if !expired.is_empty() {
            let now = Instant::now();
            evicted = self.map.remove_if(&expired, |entry| {
                entry.classify(now, &self.config) == Verdict::Evict
            });
            self.stats.record_evictions(evicted);
        }

        if refreshed + failed + evicted > 0 {
            log::debug!(
                "Point cache sweep: {} refreshed, {} failed refreshes, {} evicted.",
                refreshed,
                failed,
                evicted
            );
        }
    }

    /// Recomputes the value of a hot entry and swaps it in on success.
    async fn refresh(&self, token: &CancellationToken, key: K, entry: &PointEntry<V>) -> Refresh {
        let ctx = token.child_token();
        let watch = Watch::start();
        let computation = tokio::time::timeout(
            self.config.refresh_timeout(),
            (self.producer)(key, ctx.clone()),
        );

        let outcome = tokio::select! {
            result = computation => match result {
                Ok(Some(value)) => {
                    entry.publish(value, Instant::now());
                    Refresh::Done
                }
                Ok(None) => Refresh::Failed,
                Err(_) => Refresh::TimedOut,
            },
            _ = token.cancelled() => Refresh::Cancelled,
        };
        ctx.cancel();

        match outcome {
            Refresh::Done => {
                self.stats.record_computation(watch, true);
                self.stats.record_refresh();
            }
            Refresh::Failed => {
                self.stats.record_computation(watch, false);
                log::warn!("A proactive refresh failed. Keeping the stale value.");
            }
            Refresh::TimedOut => {
                self.stats.record_computation(watch, false);
                log::warn!(
                    "A proactive refresh didn't complete within {}. Keeping the stale value.",
                    format_duration(self.config.refresh_timeout())
                );
            }
            Refresh::Cancelled => (),
        }

        outcome
    }
}

/// A lazily populated cache which keeps frequently read entries fresh.
///
/// See the [module documentation](crate::point) for the refresh and eviction policy.
///
/// The cache owns a background task. It is stopped via [close](PointCache::close) or
/// [shutdown](PointCache::shutdown) and also once the cache is dropped. Share the cache via an
/// **Arc** rather than cloning it.
pub struct PointCache<K, V, M = ShardedMap<K, Arc<PointEntry<V>>>> {
    inner: Arc<Inner<K, V, M>>,
    maintenance: Maintenance,
}

impl<K, V> PointCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new cache backed by a [ShardedMap].
    ///
    /// The **producer** is invoked with the key to compute and a token which is cancelled once
    /// the result is no longer of interest. It returns **None** if no value can be provided.
    ///
    /// # Panics
    /// Panics if not called from within a tokio runtime.
    pub fn new<F, Fut>(config: CacheConfig, producer: F) -> Self
    where
        F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<V>> + Send + 'static,
    {
        PointCache::with_map(config, ShardedMap::new(), producer)
    }
}

impl<K, V, M> PointCache<K, V, M>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: ConcurrentMap<K, Arc<PointEntry<V>>> + 'static,
{
    /// Creates a new cache which stores its entries in the given map.
    ///
    /// # Panics
    /// Panics if not called from within a tokio runtime.
    pub fn with_map<F, Fut>(config: CacheConfig, map: M, producer: F) -> Self
    where
        F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<V>> + Send + 'static,
    {
        let inner = Arc::new(Inner {
            map,
            config,
            producer: Box::new(move |key, ctx| producer(key, ctx).boxed()),
            stats: Counters::default(),
        });

        log::info!(
            "Starting point cache (refresh interval: {}, keep time: {})...",
            format_duration(config.refresh_interval()),
            format_duration(config.keep_time())
        );

        let maintenance = Maintenance::spawn(|token| inner.clone().maintain(token));

        PointCache { inner, maintenance }
    }

    /// Returns the value for the given key, computing it if necessary.
    ///
    /// If the key is unknown, the producer is started and this call waits for its result. If
    /// another task is already computing the value, this waits for that computation instead.
    /// Either way, once **ctx** is cancelled, **None** is returned right away. The running
    /// computation isn't affected by this and still populates the entry.
    ///
    /// Returns **None** if the first computation of the value failed. Such a key keeps yielding
    /// **None** until it is either [set](PointCache::set) or evicted. Also returns **None** once
    /// the cache has been closed.
    pub async fn get(&self, ctx: &CancellationToken, key: K) -> Option<V> {
        if !self.maintenance.is_running() {
            return None;
        }

        let now = Instant::now();
        let (entry, existed) = self
            .inner
            .map
            .get_or_insert_with(key.clone(), || Arc::new(PointEntry::pending(now)));

        if !existed {
            let _ = tokio::spawn(self.inner.clone().compute(
                key,
                entry.clone(),
                self.maintenance.token().child_token(),
            ));
        }

        let result = self.inner.await_entry(ctx, &entry).await;
        self.inner.stats.record_read(result.is_some());
        result
    }

    /// Stores the given value, replacing any previous entry.
    ///
    /// Note that tasks which are currently waiting for a running first computation of the same
    /// key still receive the result of that computation. This race is accepted for a manual
    /// override, all subsequent reads observe the given value.
    pub fn set(&self, key: K, value: V) {
        if !self.maintenance.is_running() {
            return;
        }

        self.inner
            .map
            .set(key, Arc::new(PointEntry::resolved(value, Instant::now())));
        self.inner.stats.record_write();
    }

    /// Returns the number of entries, including pending and failed ones.
    pub fn len(&self) -> usize {
        self.inner.map.len()
    }

    /// Determines if the cache has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }

    /// Returns the settings of this cache.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns a snapshot of the metrics of this cache.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot(self.inner.map.len())
    }

    /// Determines if the cache has not been closed yet.
    pub fn is_running(&self) -> bool {
        self.maintenance.is_running()
    }

    /// Stops the maintenance task and releases all entries.
    ///
    /// Calling this more than once has no effect.
    pub fn close(&self) {
        if self.maintenance.close() {
            self.inner.map.clear();
            log::info!("Point cache closed.");
        }
    }

    /// Closes the cache and waits until its maintenance task has terminated.
    pub async fn shutdown(&self) {
        self.close();
        self.maintenance.join().await;
    }
}
