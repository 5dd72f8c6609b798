// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tuning configuration for the sync core.
//!
//! Four knobs, read once at startup: the scheduler's concurrency cap,
//! per-interval token quota and refill interval, plus the bounded-cache
//! capacity. Each can come from the environment; values that fail to
//! parse or fall outside the documented bounds are replaced by the
//! default with a logged warning, never an error.
//!
//! # Example
//!
//! ```
//! use docsync::SyncTuning;
//!
//! let tuning = SyncTuning::default();
//! assert_eq!(tuning.max_concurrent, 4);
//! assert_eq!(tuning.interval_ms, 1000);
//!
//! let tuning = SyncTuning {
//!     max_concurrent: 2,
//!     ..Default::default()
//! };
//! assert_eq!(tuning.scheduler_config().max_concurrent, 2);
//! ```

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::scheduler::SchedulerConfig;

/// Environment keys, read by [`SyncTuning::from_env`].
pub const ENV_MAX_CONCURRENT: &str = "DOCSYNC_MAX_CONCURRENT";
pub const ENV_MAX_PER_INTERVAL: &str = "DOCSYNC_MAX_PER_INTERVAL";
pub const ENV_INTERVAL_MS: &str = "DOCSYNC_INTERVAL_MS";
pub const ENV_CACHE_CAPACITY: &str = "DOCSYNC_CACHE_CAPACITY";

/// Tuning knobs for the scheduler and caches.
///
/// All fields have sensible defaults; [`from_env`](Self::from_env) layers
/// environment overrides on top with clamping.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncTuning {
    /// Max concurrently executing outbound tasks (bounds: 1..=64)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Tasks admitted per refill interval (bounds: 1..=1000)
    #[serde(default = "default_max_per_interval")]
    pub max_per_interval: usize,

    /// Token refill interval in milliseconds (bounds: 100..=60_000)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Bounded cache capacity in entries (bounds: 1..=10_000)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_max_concurrent() -> usize { 4 }
fn default_max_per_interval() -> usize { 12 }
fn default_interval_ms() -> u64 { 1000 }
fn default_cache_capacity() -> usize { 256 }

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_per_interval: default_max_per_interval(),
            interval_ms: default_interval_ms(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl SyncTuning {
    /// Read tuning from the environment, falling back to defaults with a
    /// warning on any value that does not parse or is out of bounds.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            max_concurrent: env_bounded(ENV_MAX_CONCURRENT, default_max_concurrent(), 1, 64),
            max_per_interval: env_bounded(
                ENV_MAX_PER_INTERVAL,
                default_max_per_interval(),
                1,
                1000,
            ),
            interval_ms: env_bounded(ENV_INTERVAL_MS, default_interval_ms(), 100, 60_000),
            cache_capacity: env_bounded(ENV_CACHE_CAPACITY, default_cache_capacity(), 1, 10_000),
        }
    }

    /// The scheduler config these knobs describe.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent,
            max_per_interval: self.max_per_interval,
            interval: Duration::from_millis(self.interval_ms),
        }
        .clamped()
    }
}

/// Parse an integer env var, clamping to `[min, max]`. Missing vars use
/// the default silently; unparsable or out-of-range values use the
/// default with a warning.
fn env_bounded<T>(key: &str, default: T, min: T, max: T) -> T
where
    T: std::str::FromStr + PartialOrd + Copy + std::fmt::Display,
{
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value >= min && value <= max => value,
        Ok(value) => {
            warn!(
                key,
                value = %value,
                min = %min,
                max = %max,
                default = %default,
                "Tuning value out of bounds, using default"
            );
            default
        }
        Err(_) => {
            warn!(key, raw = %raw, default = %default, "Unparsable tuning value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each uses a distinct key space
    // via set/remove around the assertion.

    #[test]
    fn test_defaults() {
        let tuning = SyncTuning::default();
        assert_eq!(tuning.max_concurrent, 4);
        assert_eq!(tuning.max_per_interval, 12);
        assert_eq!(tuning.interval_ms, 1000);
        assert_eq!(tuning.cache_capacity, 256);
    }

    #[test]
    fn test_env_bounded_accepts_in_range() {
        std::env::set_var("DOCSYNC_TEST_IN_RANGE", "8");
        assert_eq!(env_bounded("DOCSYNC_TEST_IN_RANGE", 4usize, 1, 64), 8);
        std::env::remove_var("DOCSYNC_TEST_IN_RANGE");
    }

    #[test]
    fn test_env_bounded_rejects_out_of_range() {
        std::env::set_var("DOCSYNC_TEST_TOO_BIG", "9999");
        assert_eq!(env_bounded("DOCSYNC_TEST_TOO_BIG", 4usize, 1, 64), 4);
        std::env::remove_var("DOCSYNC_TEST_TOO_BIG");
    }

    #[test]
    fn test_env_bounded_rejects_negative_and_garbage() {
        std::env::set_var("DOCSYNC_TEST_NEGATIVE", "-3");
        // usize parse fails on negative input
        assert_eq!(env_bounded("DOCSYNC_TEST_NEGATIVE", 4usize, 1, 64), 4);
        std::env::remove_var("DOCSYNC_TEST_NEGATIVE");

        std::env::set_var("DOCSYNC_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_bounded("DOCSYNC_TEST_GARBAGE", 4usize, 1, 64), 4);
        std::env::remove_var("DOCSYNC_TEST_GARBAGE");
    }

    #[test]
    fn test_env_bounded_missing_uses_default_silently() {
        std::env::remove_var("DOCSYNC_TEST_MISSING");
        assert_eq!(env_bounded("DOCSYNC_TEST_MISSING", 4usize, 1, 64), 4);
    }

    #[test]
    fn test_scheduler_config_clamps() {
        let tuning = SyncTuning {
            max_concurrent: 0,
            max_per_interval: 0,
            interval_ms: 1,
            cache_capacity: 0,
        };
        let config = tuning.scheduler_config();
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.max_per_interval, 1);
        assert_eq!(config.interval, Duration::from_millis(100));
    }
}
