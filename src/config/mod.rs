//! # Fleet Configuration System
//!
//! YAML-based configuration with environment-specific override sections and an
//! environment-variable overlay. Every tunable policy value of the orchestrator
//! (batching, backoff, timeouts, thresholds) lives here rather than in code.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fleet_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let batch_size = manager.config().scheduler.batch_size;
//! let stagger = manager.config().scheduler.intra_batch_stagger();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::{self, defaults};
use crate::models::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring fleet-config.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Fleet shape defaults
    pub fleet: FleetSettings,

    /// Persistence coordinator retry policy
    pub persistence: PersistenceConfig,

    /// Batched worker startup policy
    pub scheduler: SchedulerConfig,

    /// Upstream call timeouts
    pub timeouts: TimeoutConfig,

    /// Failure recovery and identity rotation policy
    pub recovery: RecoveryConfig,

    /// Resource monitor and evictor settings
    pub monitor: MonitorConfig,

    /// Persistent store connection
    pub database: DatabaseConfig,

    /// Runtime environment, filled in by the loader
    #[serde(skip_deserializing)]
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Worker-count target given to newly created boxes
    pub viewers_per_box: u32,
    /// Upper bound on tabs per worker
    pub max_tabs: u32,
    /// Tabs requested when a worker is started without an explicit count
    pub default_tabs: u32,
    /// Stream used when a box has no target of its own
    pub default_target: Option<String>,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            viewers_per_box: defaults::VIEWERS_PER_BOX,
            max_tabs: defaults::MAX_TABS,
            default_tabs: defaults::DEFAULT_TABS,
            default_target: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::PERSISTENCE_MAX_ATTEMPTS,
            backoff_base_ms: defaults::PERSISTENCE_BACKOFF_BASE_MS,
            write_timeout_ms: defaults::PERSISTENCE_WRITE_TIMEOUT_MS,
        }
    }
}

impl PersistenceConfig {
    /// Delay before retry `attempt` (1-based), doubling from the base
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << exponent))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub intra_batch_stagger_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::SCHEDULER_BATCH_SIZE,
            inter_batch_delay_ms: defaults::SCHEDULER_INTER_BATCH_DELAY_MS,
            intra_batch_stagger_ms: defaults::SCHEDULER_INTRA_BATCH_STAGGER_MS,
        }
    }
}

impl SchedulerConfig {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn intra_batch_stagger(&self) -> Duration {
        Duration::from_millis(self.intra_batch_stagger_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub egress_connect_ms: u64,
    pub egress_disconnect_ms: u64,
    pub session_start_ms: u64,
    pub session_stop_ms: u64,
    pub probe_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            egress_connect_ms: 60_000,
            egress_disconnect_ms: 30_000,
            session_start_ms: 90_000,
            session_stop_ms: 15_000,
            probe_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn egress_connect(&self) -> Duration {
        Duration::from_millis(self.egress_connect_ms)
    }

    pub fn egress_disconnect(&self) -> Duration {
        Duration::from_millis(self.egress_disconnect_ms)
    }

    pub fn session_start(&self) -> Duration {
        Duration::from_millis(self.session_start_ms)
    }

    pub fn session_stop(&self) -> Duration {
        Duration::from_millis(self.session_stop_ms)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Blocked-fault count above which a worker gets a fresh identity
    pub failure_threshold: u32,
    pub restart_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::FAILURE_THRESHOLD,
            restart_delay_ms: defaults::RESTART_DELAY_MS,
        }
    }
}

impl RecoveryConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub sample_interval_ms: u64,
    pub memory_sweep_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub memory_threshold_mb: u64,
    pub hard_limit_multiplier: f64,
    pub eviction_cooldown_ms: u64,
    pub gc_after_stopped_viewers: u64,
    pub default_worker_limits: ResourceLimits,
    pub default_box_limits: ResourceLimits,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: defaults::SAMPLE_INTERVAL_MS,
            memory_sweep_interval_ms: defaults::MEMORY_SWEEP_INTERVAL_MS,
            idle_timeout_ms: defaults::IDLE_TIMEOUT_MS,
            memory_threshold_mb: defaults::MEMORY_THRESHOLD_MB,
            hard_limit_multiplier: defaults::HARD_LIMIT_MULTIPLIER,
            eviction_cooldown_ms: defaults::EVICTION_COOLDOWN_MS,
            gc_after_stopped_viewers: defaults::GC_AFTER_STOPPED_VIEWERS,
            default_worker_limits: ResourceLimits::worker_defaults(),
            default_box_limits: ResourceLimits::box_defaults(),
        }
    }
}

impl MonitorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn memory_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.memory_sweep_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn eviction_cooldown(&self) -> Duration {
        Duration::from_millis(self.eviction_cooldown_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL URL; when absent the in-memory store is used
    pub url: Option<String>,
    pub pool: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: None, pool: 10 }
    }
}

impl FleetConfig {
    /// Validate ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let fleet = &self.fleet;
        if !(constants::MIN_WORKERS_PER_BOX..=constants::MAX_WORKERS_PER_BOX)
            .contains(&fleet.viewers_per_box)
        {
            return Err(ConfigurationError::invalid_value(
                "fleet.viewers_per_box",
                fleet.viewers_per_box,
                "must be between 1 and 50",
            ));
        }

        if !(constants::MIN_TABS..=constants::MAX_TABS).contains(&fleet.max_tabs) {
            return Err(ConfigurationError::invalid_value(
                "fleet.max_tabs",
                fleet.max_tabs,
                "must be between 1 and 10",
            ));
        }

        if fleet.default_tabs == 0 || fleet.default_tabs > fleet.max_tabs {
            return Err(ConfigurationError::invalid_value(
                "fleet.default_tabs",
                fleet.default_tabs,
                "must be between 1 and fleet.max_tabs",
            ));
        }

        if self.persistence.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "persistence.max_attempts",
                0,
                "at least one write attempt is required",
            ));
        }

        if self.scheduler.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.batch_size",
                0,
                "batch size must be greater than 0",
            ));
        }

        if self.monitor.hard_limit_multiplier <= 1.0 {
            return Err(ConfigurationError::invalid_value(
                "monitor.hard_limit_multiplier",
                self.monitor.hard_limit_multiplier,
                "must be greater than 1.0",
            ));
        }

        if self.monitor.eviction_cooldown_ms < defaults::EVICTION_COOLDOWN_MS {
            return Err(ConfigurationError::invalid_value(
                "monitor.eviction_cooldown_ms",
                self.monitor.eviction_cooldown_ms,
                "eviction cooldown must be at least 5000ms",
            ));
        }

        if self.monitor.sample_interval_ms == 0 || self.monitor.memory_sweep_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "monitor.sample_interval_ms",
                self.monitor.sample_interval_ms,
                "monitor intervals must be greater than 0",
            ));
        }

        if let Some(url) = &self.database.url {
            if url.is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    "database.url",
                    "database configuration",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.batch_size, 3);
        assert_eq!(config.scheduler.inter_batch_delay(), Duration::from_secs(5));
        assert_eq!(config.scheduler.intra_batch_stagger(), Duration::from_millis(500));
        assert_eq!(config.persistence.max_attempts, 5);
    }

    #[test]
    fn test_backoff_doubles_from_base() {
        let persistence = PersistenceConfig::default();
        assert_eq!(persistence.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(persistence.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(persistence.backoff_for_attempt(4), Duration::from_millis(1600));
    }

    #[test]
    fn test_validation_rejects_short_cooldown() {
        let mut config = FleetConfig::default();
        config.monitor.eviction_cooldown_ms = 1_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_default_tabs_above_max() {
        let mut config = FleetConfig::default();
        config.fleet.max_tabs = 2;
        config.fleet.default_tabs = 3;
        assert!(config.validate().is_err());
    }
}
