//! # Fleet Constants
//!
//! Fixed bounds that are part of the data model rather than tunable policy. Tunable
//! values (batch sizes, timeouts, thresholds) live in [`crate::config`].

/// Capacity of a worker's log ring; the oldest entries are evicted first
pub const WORKER_LOG_CAPACITY: usize = 100;

/// Bounds on the number of tabs a worker may own
pub const MIN_TABS: u32 = 1;
pub const MAX_TABS: u32 = 10;

/// Bounds on a box's worker-count target
pub const MIN_WORKERS_PER_BOX: u32 = 1;
pub const MAX_WORKERS_PER_BOX: u32 = 50;

/// Persisted record kinds
pub mod kinds {
    pub const BOX: &str = "box";
    pub const WORKER: &str = "worker";
    pub const STREAM: &str = "stream";
}

/// Defaults used by `FleetConfig::default()`
pub mod defaults {
    pub const PERSISTENCE_MAX_ATTEMPTS: u32 = 5;
    pub const PERSISTENCE_BACKOFF_BASE_MS: u64 = 200;
    pub const PERSISTENCE_WRITE_TIMEOUT_MS: u64 = 10_000;

    pub const SCHEDULER_BATCH_SIZE: usize = 3;
    pub const SCHEDULER_INTER_BATCH_DELAY_MS: u64 = 5_000;
    pub const SCHEDULER_INTRA_BATCH_STAGGER_MS: u64 = 500;

    pub const FAILURE_THRESHOLD: u32 = 3;
    pub const RESTART_DELAY_MS: u64 = 5_000;

    pub const SAMPLE_INTERVAL_MS: u64 = 10_000;
    pub const MEMORY_SWEEP_INTERVAL_MS: u64 = 300_000;
    pub const IDLE_TIMEOUT_MS: u64 = 30 * 60 * 1_000;
    pub const MEMORY_THRESHOLD_MB: u64 = 4_096;
    pub const HARD_LIMIT_MULTIPLIER: f64 = 1.5;
    pub const EVICTION_COOLDOWN_MS: u64 = 5_000;
    pub const GC_AFTER_STOPPED_VIEWERS: u64 = 5;

    pub const VIEWERS_PER_BOX: u32 = 5;
    pub const DEFAULT_TABS: u32 = 1;
    pub const MAX_TABS: u32 = 3;

    pub const WORKER_CPU_PERCENT: f64 = 50.0;
    pub const WORKER_MEMORY_MB: f64 = 1_024.0;
    pub const WORKER_NETWORK_MBPS: f64 = 20.0;

    pub const BOX_CPU_PERCENT: f64 = 400.0;
    pub const BOX_MEMORY_MB: f64 = 8_192.0;
    pub const BOX_NETWORK_MBPS: f64 = 100.0;

    /// Synthetic estimate used when a session cannot report its own usage
    pub const ESTIMATED_BASE_MEMORY_MB: f64 = 180.0;
    pub const ESTIMATED_TAB_MEMORY_MB: f64 = 120.0;
    pub const ESTIMATED_TAB_CPU_PERCENT: f64 = 6.0;
}
