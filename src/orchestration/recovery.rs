//! # Failure Recovery Policy
//!
//! Maps structured driver faults onto recovery actions. Blocked faults count toward
//! identity rotation; once a worker's counter exceeds the threshold its next start
//! launches with a freshly generated identity.

use crate::config::RecoveryConfig;
use crate::upstream::{DriverFault, FaultKind};
use std::time::Duration;

/// What the lifecycle manager should do about a fault on a live worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Restart after the restart delay, generating a new identity first if asked
    Restart { rotate_identity: bool },
    /// Transient; keep the session
    Ignore,
    /// Record the fault and move the worker to error
    Fail,
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    failure_threshold: u32,
    restart_delay: Duration,
}

impl RecoveryPolicy {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            restart_delay: config.restart_delay(),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    /// Whether a fault of this kind increments the worker's failure counter
    pub fn counts_as_detection(kind: FaultKind) -> bool {
        kind == FaultKind::Blocked
    }

    /// Whether the next start must use a new identity
    pub fn should_rotate(&self, failure_count: u32) -> bool {
        failure_count > self.failure_threshold
    }

    /// Decide the action for `fault`, given the failure count after it was recorded
    pub fn classify(&self, fault: &DriverFault, failure_count: u32) -> RecoveryAction {
        match fault.kind {
            FaultKind::Blocked => RecoveryAction::Restart {
                rotate_identity: self.should_rotate(failure_count),
            },
            FaultKind::Crashed => RecoveryAction::Restart {
                rotate_identity: false,
            },
            FaultKind::Timeout => RecoveryAction::Ignore,
            FaultKind::Other => RecoveryAction::Fail,
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::new(&RecoveryConfig::default())
    }
}
