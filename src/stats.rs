//! Keeps track of what a cache is doing.
//!
//! All counters are plain atomics so that recording a read or a producer call never blocks. A
//! [CacheStats] snapshot can be obtained from each cache at any time.
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

use crate::fmt::format_micros;

/// The number of samples after which [SlidingAverage] starts to fade out old values.
const AVERAGE_WINDOW: u64 = 100;

/// Computes a lock free, sliding average of producer durations (in microseconds).
///
/// Sum and sample count are packed into a single **u64** (32 bits each) which is updated with a
/// compare and swap loop. Once the window is full or the sum would overflow, both halves are
/// halved, so that older samples gradually lose weight.
#[derive(Default)]
pub(crate) struct SlidingAverage {
    packed: AtomicU64,
}

impl SlidingAverage {
    fn unpack(packed: u64) -> (u64, u64) {
        (packed >> 32, packed & 0xFFFF_FFFF)
    }

    /// Records another sample.
    pub(crate) fn add(&self, micros: u64) {
        let micros = micros.min(u32::MAX as u64);
        let _ = self
            .packed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |packed| {
                let (mut sum, mut count) = SlidingAverage::unpack(packed);
                while count >= AVERAGE_WINDOW || sum + micros > u32::MAX as u64 {
                    if count <= 1 {
                        sum = 0;
                        count = 0;
                        break;
                    }
                    sum /= 2;
                    count /= 2;
                }

                Some(((sum + micros) << 32) | (count + 1))
            });
    }

    /// Returns the current average.
    pub(crate) fn avg(&self) -> u64 {
        match SlidingAverage::unpack(self.packed.load(Ordering::Relaxed)) {
            (_, 0) => 0,
            (sum, count) => sum / count,
        }
    }
}

/// A simple stopwatch used to measure producer calls.
pub(crate) struct Watch {
    start: Instant,
}

impl Watch {
    pub(crate) fn start() -> Self {
        Watch {
            start: Instant::now(),
        }
    }

    pub(crate) fn micros(&self) -> u64 {
        self.start.elapsed().as_micros().min(u64::MAX as u128) as u64
    }
}

/// The live counters of a cache.
#[derive(Default)]
pub(crate) struct Counters {
    reads: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
    computations: AtomicU64,
    failed_computations: AtomicU64,
    refreshes: AtomicU64,
    evictions: AtomicU64,
    producer_duration: SlidingAverage,
}

impl Counters {
    pub(crate) fn record_read(&self, hit: bool) {
        let _ = self.reads.fetch_add(1, Ordering::Relaxed);
        if hit {
            let _ = self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_write(&self) {
        let _ = self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a producer call which was measured by the given watch.
    pub(crate) fn record_computation(&self, watch: Watch, success: bool) {
        let _ = self.computations.fetch_add(1, Ordering::Relaxed);
        if !success {
            let _ = self.failed_computations.fetch_add(1, Ordering::Relaxed);
        }
        self.producer_duration.add(watch.micros());
    }

    pub(crate) fn record_refresh(&self) {
        let _ = self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, evicted: usize) {
        let _ = self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
    }

    /// Creates a snapshot of all counters.
    pub(crate) fn snapshot(&self, entries: usize) -> CacheStats {
        CacheStats {
            entries,
            reads: self.reads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            failed_computations: self.failed_computations.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            avg_producer_micros: self.producer_duration.avg(),
        }
    }
}

/// A point in time snapshot of the metrics of a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// The number of entries currently held (including failed or in-flight point entries).
    pub entries: usize,
    /// The number of completed `get` calls.
    pub reads: u64,
    /// The number of `get` calls which yielded a value.
    pub hits: u64,
    /// The number of values stored via `set` (point cache) or the setter (bulk cache).
    pub writes: u64,
    /// The total number of producer invocations (first computations, refreshes, populations).
    pub computations: u64,
    /// The number of producer invocations which failed or timed out.
    pub failed_computations: u64,
    /// The number of successful proactive refreshes (point cache only).
    pub refreshes: u64,
    /// The number of entries evicted due to their age.
    pub evictions: u64,
    /// The sliding average duration of a producer call in microseconds.
    pub avg_producer_micros: u64,
}

impl CacheStats {
    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            reads => self.hits as f32 / reads as f32 * 100.,
        }
    }
}

impl Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries, {} reads ({:.1}% hits), {} writes, {} computations ({} failed, ",
            self.entries,
            self.reads,
            self.hit_rate(),
            self.writes,
            self.computations,
            self.failed_computations
        )?;
        format_micros(self.avg_producer_micros, f)?;
        write!(
            f,
            " avg), {} refreshes, {} evictions",
            self.refreshes, self.evictions
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::stats::{CacheStats, Counters, SlidingAverage, Watch};

    #[test]
    fn empty_average_is_zero() {
        assert_eq!(SlidingAverage::default().avg(), 0);
    }

    #[test]
    fn average_of_some_values_works() {
        let avg = SlidingAverage::default();
        for i in 1..=10 {
            avg.add(i);
        }
        assert_eq!(avg.avg(), 5);
    }

    #[test]
    fn average_fades_out_old_values() {
        let avg = SlidingAverage::default();
        for _ in 0..1000 {
            avg.add(10);
        }
        for _ in 0..1000 {
            avg.add(1000);
        }
        assert!(avg.avg() > 900);
    }

    #[test]
    fn average_survives_huge_samples() {
        let avg = SlidingAverage::default();
        avg.add(u64::MAX);
        avg.add(u64::MAX);
        assert_eq!(avg.avg(), u32::MAX as u64);
    }

    #[test]
    fn counters_are_reflected_in_snapshots() {
        let counters = Counters::default();
        counters.record_read(true);
        counters.record_read(true);
        counters.record_read(true);
        counters.record_read(false);
        counters.record_write();
        counters.record_computation(Watch::start(), true);
        counters.record_computation(Watch::start(), false);
        counters.record_refresh();
        counters.record_evictions(3);

        let stats = counters.snapshot(7);
        assert_eq!(
            stats,
            CacheStats {
                entries: 7,
                reads: 4,
                hits: 3,
                writes: 1,
                computations: 2,
                failed_computations: 1,
                refreshes: 1,
                evictions: 3,
                avg_producer_micros: stats.avg_producer_micros,
            }
        );
        assert_eq!(stats.hit_rate().round() as i32, 75);
        assert!(stats.to_string().starts_with("7 entries, 4 reads (75.0% hits)"));
    }
}
