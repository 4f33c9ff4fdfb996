//! Session configuration.

use std::time::Duration;

/// Tuning knobs for one sync session.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period before queued edits are flushed to the row store. Default: 300ms.
    pub flush_debounce: Duration,
    /// Upper bound on how long a continuous burst can postpone the flush. Default: 2s.
    pub max_flush_delay: Duration,
    /// Maximum queued operations before the oldest are evicted. Default: 1000.
    pub queue_capacity: usize,
    /// How long tombstones are kept to reject stale re-creates. Default: 30min.
    pub tombstone_retention: Duration,
    /// Interval of the maintenance pass (tombstone GC). Default: 60s.
    pub maintenance_interval: Duration,
    /// First reconnect delay. Default: 1s.
    pub backoff_base: Duration,
    /// Reconnect delay ceiling. Default: 30s.
    pub backoff_max: Duration,
    /// Consecutive failed store flushes before the session reports degraded. Default: 3.
    pub degraded_after_failures: u32,
    /// Seed the first local version from wall-clock time when the clock is empty.
    pub bootstrap_from_wall_clock: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            flush_debounce: Duration::from_millis(300),
            max_flush_delay: Duration::from_secs(2),
            queue_capacity: 1000,
            tombstone_retention: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(60),
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
            degraded_after_failures: 3,
            bootstrap_from_wall_clock: true,
        }
    }
}

impl SyncConfig {
    /// Config for testing (small queue, short windows, plain Lamport versions).
    pub fn for_testing() -> Self {
        Self {
            flush_debounce: Duration::from_millis(50),
            max_flush_delay: Duration::from_millis(500),
            queue_capacity: 64,
            tombstone_retention: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
            degraded_after_failures: 3,
            bootstrap_from_wall_clock: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.flush_debounce, Duration::from_millis(300));
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_max, Duration::from_secs(30));
        assert!(config.bootstrap_from_wall_clock);
    }

    #[test]
    fn test_sync_config_for_testing() {
        let config = SyncConfig::for_testing();
        assert!(config.flush_debounce < config.max_flush_delay);
        assert!(!config.bootstrap_from_wall_clock);
    }
}
