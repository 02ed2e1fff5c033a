//! # Fleet Orchestration
//!
//! Lifecycle management for boxes and workers on top of the persistence coordinator.
//!
//! ## Core Components
//!
//! - **SessionRegistry**: live map from worker id to session handle
//! - **WorkerLifecycleManager**: worker start/stop/restart, tabs, fault recovery
//! - **BoxLifecycleManager**: egress acquisition, worker provisioning, box teardown
//! - **StartupScheduler**: batched, staggered worker bring-up
//! - **RecoveryPolicy**: structured fault classification and identity rotation
//! - **ResourceMonitor**: usage sampling, limit enforcement, idle and memory sweeps
//! - **FleetOrchestrator**: the facade a control plane talks to

pub mod box_lifecycle;
pub mod fleet;
pub mod monitor;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod streams;
pub mod worker_lifecycle;

pub use box_lifecycle::{BoxLifecycleManager, BoxUpdate, NewBox};
pub use fleet::{FleetOrchestrator, FleetStatus};
pub use monitor::{MonitorMetrics, MonitorSnapshot, ProcessMemory, ResourceMonitor, SysinfoMemory};
pub use recovery::{RecoveryAction, RecoveryPolicy};
pub use registry::{LiveSession, Registration, SessionRegistry};
pub use scheduler::{BatchReport, StartOutcome, StartupReport, StartupScheduler, WorkerStarter};
pub use streams::StreamDirectory;
pub use worker_lifecycle::WorkerLifecycleManager;

use std::future::Future;
use std::time::Duration;

/// Await `fut` for at most `limit`, mapping an elapsed deadline through `on_timeout`
pub(crate) async fn within<T, E, F>(
    limit: Duration,
    fut: F,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}
