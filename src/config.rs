//! Contains the settings which control the refresh and eviction timing of a cache.
//!
//! A cache is driven by two durations:
//! * **refresh_interval**: the target staleness window. Entries younger than this are never
//!   touched by the maintenance task. All other timings (sweep cadence, refresh timeout, the
//!   window which counts as "recently used") are derived from it.
//! * **keep_time**: the hard age limit after which an entry is evicted, no matter how often it is
//!   used. For a point cache, a value of zero disables age based eviction. A bulk cache has no
//!   such exemption: with zero, each sweep evicts everything written before it.
//!
//! Settings can either be built in code or be read from a YAML block:
//!
//! ```yaml
//! # Specifies how old an entry may get before it is refreshed.
//! # Supports common suffixes like: ms, s, m, h, d
//! refresh_interval: 30s
//! # Specifies after which age an entry is evicted (0 or missing: never, for point caches).
//! keep_time: 1h
//! ```
//!
//! # Examples
//!
//! ```
//! # use evergreen::config::CacheConfig;
//! # use std::time::Duration;
//! let config = CacheConfig::from_yaml_str("refresh_interval: 30s\nkeep_time: 1h").unwrap();
//! assert_eq!(config.refresh_interval(), Duration::from_secs(30));
//! assert_eq!(config.keep_time(), Duration::from_secs(60 * 60));
//!
//! // The sweeper wakes up four times per refresh interval...
//! assert_eq!(config.sweep_interval(), Duration::from_millis(7_500));
//! ```
use std::time::Duration;

use anyhow::Context;
use yaml_rust::{Yaml, YamlLoader};

use crate::fmt::{format_duration, parse_duration};

/// Describes the timing of a [PointCache](crate::point::PointCache) or a
/// [BulkCache](crate::bulk::BulkCache).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    refresh_interval: Duration,
    keep_time: Duration,
}

impl CacheConfig {
    /// Creates a new config with the given refresh interval and keep time.
    ///
    /// # Errors
    /// Fails if **refresh_interval** is zero, as the whole maintenance cadence is derived from it.
    ///
    /// A **keep_time** which is shorter than the **refresh_interval** is accepted but will most
    /// probably evict entries before they are ever refreshed, therefore a warning is logged.
    ///
    /// # Examples
    /// ```
    /// # use evergreen::config::CacheConfig;
    /// # use std::time::Duration;
    /// assert!(CacheConfig::new(Duration::from_secs(3), Duration::ZERO).is_ok());
    /// assert!(CacheConfig::new(Duration::ZERO, Duration::from_secs(60)).is_err());
    /// ```
    pub fn new(refresh_interval: Duration, keep_time: Duration) -> anyhow::Result<Self> {
        if refresh_interval.is_zero() {
            return Err(anyhow::anyhow!(
                "The refresh interval of a cache must not be zero."
            ));
        }

        if !keep_time.is_zero() && keep_time < refresh_interval {
            log::warn!(
                "The keep time ({}) is shorter than the refresh interval ({}). Entries will be evicted before they are ever refreshed.",
                format_duration(keep_time),
                format_duration(refresh_interval)
            );
        }

        Ok(CacheConfig {
            refresh_interval,
            keep_time,
        })
    }

    /// Reads the config from the given YAML object.
    ///
    /// The object has to provide a **refresh_interval** and may provide a **keep_time**. Both
    /// accept either a duration expression (see [parse_duration]) or a plain integer, which is
    /// treated as milliseconds.
    pub fn from_yaml(yaml: &Yaml) -> anyhow::Result<Self> {
        if yaml.as_hash().is_none() {
            return Err(anyhow::anyhow!(
                "A cache config has to be an object containing 'refresh_interval' and 'keep_time'."
            ));
        }

        let refresh_interval = match read_duration(yaml, "refresh_interval")? {
            Some(duration) => duration,
            None => return Err(anyhow::anyhow!("Missing 'refresh_interval' in cache config.")),
        };
        let keep_time = read_duration(yaml, "keep_time")?.unwrap_or(Duration::ZERO);

        CacheConfig::new(refresh_interval, keep_time)
    }

    /// Parses the given YAML document and reads the config from its root object.
    pub fn from_yaml_str(data: &str) -> anyhow::Result<Self> {
        let docs = YamlLoader::load_from_str(data).context("Cannot parse cache config")?;
        match docs.first() {
            Some(doc) => CacheConfig::from_yaml(doc),
            None => Err(anyhow::anyhow!("The cache config is empty.")),
        }
    }

    /// Returns the target staleness window.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Returns the hard eviction age (zero disables age based eviction of point caches).
    pub fn keep_time(&self) -> Duration {
        self.keep_time
    }

    /// Determines if an entry of a point cache with the given age has to be evicted.
    pub fn is_expired(&self, age: Duration) -> bool {
        !self.keep_time.is_zero() && age > self.keep_time
    }

    /// Determines if an entry of a bulk cache with the given age has to be evicted.
    ///
    /// Unlike [is_expired](CacheConfig::is_expired), a zero **keep_time** isn't special here.
    pub fn exceeds_keep_time(&self, age: Duration) -> bool {
        age > self.keep_time
    }

    /// Returns the pause between two sweeps of a point cache.
    pub fn sweep_interval(&self) -> Duration {
        self.refresh_interval / 4
    }

    /// Returns the pause between two sweeps of a bulk cache.
    pub fn bulk_sweep_interval(&self) -> Duration {
        self.refresh_interval / 4 + self.refresh_interval / 16
    }

    /// Returns how long a proactive refresh of a single entry may take.
    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_interval / 2
    }

    /// Returns the window in which a read marks an entry as "hot" enough to be refreshed.
    pub fn recent_use_window(&self) -> Duration {
        self.refresh_interval / 2
    }
}

fn read_duration(yaml: &Yaml, key: &str) -> anyhow::Result<Option<Duration>> {
    match &yaml[key] {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::Integer(millis) if *millis >= 0 => Ok(Some(Duration::from_millis(*millis as u64))),
        Yaml::String(expression) => parse_duration(expression)
            .map(Some)
            .with_context(|| format!("Invalid '{}' in cache config", key)),
        other => Err(anyhow::anyhow!(
            "Invalid '{}' in cache config: expected a duration but got {:?}",
            key,
            other
        )),
    }
}
