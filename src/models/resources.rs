use crate::constants::defaults;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sampled resource usage embedded in boxes and workers
///
/// Produced only by the resource monitor; never accepted from callers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_rx_mbps: f64,
    pub network_tx_mbps: f64,
    pub disk_mb: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    /// True when the figures are an estimate rather than a live measurement
    #[serde(default)]
    pub estimated: bool,
}

impl ResourceSnapshot {
    pub fn network_mbps(&self) -> f64 {
        self.network_rx_mbps + self.network_tx_mbps
    }

    /// Sum snapshots into an aggregate stamped with the current time
    pub fn aggregate<'a>(snapshots: impl IntoIterator<Item = &'a ResourceSnapshot>) -> Self {
        let mut total = ResourceSnapshot::default();
        let mut disk: Option<f64> = None;

        for snapshot in snapshots {
            total.cpu_percent += snapshot.cpu_percent;
            total.memory_mb += snapshot.memory_mb;
            total.network_rx_mbps += snapshot.network_rx_mbps;
            total.network_tx_mbps += snapshot.network_tx_mbps;
            total.estimated |= snapshot.estimated;
            if let Some(d) = snapshot.disk_mb {
                disk = Some(disk.unwrap_or(0.0) + d);
            }
        }

        total.disk_mb = disk;
        total.updated_at = Some(Utc::now());
        total
    }
}

/// Configured ceilings for an entity's resource usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_mbps: f64,
}

impl ResourceLimits {
    pub fn worker_defaults() -> Self {
        Self {
            cpu_percent: defaults::WORKER_CPU_PERCENT,
            memory_mb: defaults::WORKER_MEMORY_MB,
            network_mbps: defaults::WORKER_NETWORK_MBPS,
        }
    }

    pub fn box_defaults() -> Self {
        Self {
            cpu_percent: defaults::BOX_CPU_PERCENT,
            memory_mb: defaults::BOX_MEMORY_MB,
            network_mbps: defaults::BOX_NETWORK_MBPS,
        }
    }

    /// List every limit the snapshot exceeds, as `(resource, observed, limit)`
    pub fn violations(&self, snapshot: &ResourceSnapshot) -> Vec<LimitViolation> {
        let checks = [
            ("cpu_percent", snapshot.cpu_percent, self.cpu_percent),
            ("memory_mb", snapshot.memory_mb, self.memory_mb),
            ("network_mbps", snapshot.network_mbps(), self.network_mbps),
        ];

        checks
            .into_iter()
            .filter(|(_, observed, limit)| *limit > 0.0 && observed > limit)
            .map(|(resource, observed, limit)| LimitViolation {
                resource,
                observed,
                limit,
            })
            .collect()
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::worker_defaults()
    }
}

/// One exceeded limit
#[derive(Debug, Clone, PartialEq)]
pub struct LimitViolation {
    pub resource: &'static str,
    pub observed: f64,
    pub limit: f64,
}

impl LimitViolation {
    /// How many times over the limit the observation is
    pub fn ratio(&self) -> f64 {
        self.observed / self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violations_report_only_exceeded_limits() {
        let limits = ResourceLimits {
            cpu_percent: 50.0,
            memory_mb: 1000.0,
            network_mbps: 10.0,
        };
        let snapshot = ResourceSnapshot {
            cpu_percent: 20.0,
            memory_mb: 1600.0,
            network_rx_mbps: 4.0,
            network_tx_mbps: 1.0,
            ..Default::default()
        };

        let violations = limits.violations(&snapshot);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].resource, "memory_mb");
        assert!((violations[0].ratio() - 1.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_aggregate_sums_usage() {
        let a = ResourceSnapshot {
            cpu_percent: 10.0,
            memory_mb: 100.0,
            ..Default::default()
        };
        let b = ResourceSnapshot {
            cpu_percent: 5.0,
            memory_mb: 50.0,
            disk_mb: Some(12.0),
            estimated: true,
            ..Default::default()
        };

        let total = ResourceSnapshot::aggregate([&a, &b]);
        assert_eq!(total.cpu_percent, 15.0);
        assert_eq!(total.memory_mb, 150.0);
        assert_eq!(total.disk_mb, Some(12.0));
        assert!(total.estimated);
        assert!(total.updated_at.is_some());
    }
}
