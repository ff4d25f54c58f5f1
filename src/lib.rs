//! Evergreen provides in-process caches which keep their entries fresh by periodically
//! re-running a producer, rather than merely letting them expire.
//!
//! # Introduction
//! Classic caches evict an entry once its time to live is over, and the next reader pays for the
//! recomputation. For data which is expensive to compute but read over and over, this leads to
//! latency spikes whenever a popular entry expires. The caches provided here instead own the
//! producer of their values and use a background task to recompute entries *before* readers would
//! notice. Readers only ever wait for the very first computation of a value.
//!
//! # Modules
//! * **PointCache**: Computes each key lazily on first access. Concurrent first reads of the same
//!   key share a single computation. Hot entries are refreshed in the background, cold ones are
//!   left to decay and are evicted once they reach their maximal age. See [crate::point].
//! * **BulkCache**: Populated as a whole by one producer call which writes many keys at once, for
//!   data which is cheaper to load in bulk (e.g. code tables). The producer is re-run on a fixed
//!   cadence. See [crate::bulk].
//!
//! Both caches are configured via a [CacheConfig](config::CacheConfig) and store their entries in
//! a [ConcurrentMap](map::ConcurrentMap) which can be replaced if required.
//!
//! # Lifecycle
//! Each cache spawns a maintenance task onto the current tokio runtime. This task is stopped by
//! calling `close` or `shutdown` on the cache, which is the expected way of disposing a cache, as
//! it deterministically releases the task and all entries. Dropping a cache stops the task as
//! well.
//!
//! # Examples
//!
//! ```
//! # use evergreen::config::CacheConfig;
//! # use evergreen::point::PointCache;
//! # use evergreen::CancellationToken;
//! # #[tokio::main]
//! # async fn main() {
//! let config = CacheConfig::from_yaml_str("refresh_interval: 3s\nkeep_time: 1h").unwrap();
//! let cache = PointCache::new(config, |name: String, _ctx| async move {
//!     // Perform some expensive computation or lookup here...
//!     Some(name.to_uppercase())
//! });
//!
//! let ctx = CancellationToken::new();
//! assert_eq!(cache.get(&ctx, "jupiter".to_owned()).await, Some("JUPITER".to_owned()));
//!
//! cache.shutdown().await;
//! # }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod bulk;
pub mod config;
pub mod fmt;
pub mod gate;
pub mod lifecycle;
pub mod map;
pub mod point;
pub mod stats;

pub use tokio_util::sync::CancellationToken;

/// Contains the version of the Evergreen library.
pub const EVERGREEN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes the logging system.
///
/// This is optional, as the caches only log via the **log** facade. Applications which already
/// install a logger should not call this.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Tests and applications might call this several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            eprintln!("Failed to initialize logging system: {}", error);
        }
    });
}

#[cfg(test)]
mod tests {
    #[test]
    fn logging_can_be_initialized_repeatedly() {
        crate::init_logging();
        crate::init_logging();
        log::debug!("Logging is up and running...");
    }
}
