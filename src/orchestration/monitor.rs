//! # Resource Monitor & Evictor
//!
//! Two independent timers:
//!
//! - the **sampler** records per-worker usage and playback, aggregates usage per box,
//!   warns on limit violations and evicts workers beyond the hard multiplier;
//! - the **memory sweep** checks process resident memory and stops idle workers.
//!
//! An eviction stops the worker, waits out the cooldown and starts it again. Sampling
//! never blocks on a failing driver: usage falls back to the last known snapshot and
//! then to a synthetic estimate.

use super::recovery::RecoveryPolicy;
use super::worker_lifecycle::WorkerLifecycleManager;
use super::within;
use crate::config::{FleetConfig, MonitorConfig};
use crate::constants::defaults;
use crate::error::Result;
use crate::models::{FleetBox, LogLevel, PlaybackSnapshot, ResourceSnapshot, Worker};
use crate::persistence::PersistenceCoordinator;
use crate::state_machine::{BoxState, WorkerState};
use crate::upstream::{DriverFault, PlaybackStatus, ResourceSample, SessionDriver, SessionHandle};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of the orchestrator process's resident memory
pub trait ProcessMemory: Send + Sync {
    /// Resident set size in MB, if it can be determined
    fn resident_mb(&self) -> Option<f64>;
}

/// [`ProcessMemory`] backed by sysinfo
pub struct SysinfoMemory {
    pid: Option<Pid>,
    system: parking_lot::Mutex<System>,
}

impl SysinfoMemory {
    pub fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: parking_lot::Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMemory for SysinfoMemory {
    fn resident_mb(&self) -> Option<f64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system
            .process(pid)
            .map(|process| process.memory() as f64 / (1024.0 * 1024.0))
    }
}

/// Read-only monitor counters
#[derive(Debug, Default)]
pub struct MonitorMetrics {
    checks: AtomicU64,
    sweeps: AtomicU64,
    workers_stopped: AtomicU64,
    evictions: AtomicU64,
    collections: AtomicU64,
    memory_recovered_mb: parking_lot::Mutex<f64>,
    last_check_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
    last_collection_at: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub checks: u64,
    pub sweeps: u64,
    pub workers_stopped: u64,
    pub evictions: u64,
    pub collections: u64,
    /// Sum of the last sampled memory of every worker the monitor stopped
    pub memory_recovered_mb: f64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_collection_at: Option<DateTime<Utc>>,
}

impl MonitorMetrics {
    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            checks: self.checks.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            workers_stopped: self.workers_stopped.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            collections: self.collections.load(Ordering::Relaxed),
            memory_recovered_mb: *self.memory_recovered_mb.lock(),
            last_check_at: *self.last_check_at.lock(),
            last_collection_at: *self.last_collection_at.lock(),
        }
    }

    fn record_stop(&self, memory_mb: f64) {
        self.workers_stopped.fetch_add(1, Ordering::Relaxed);
        *self.memory_recovered_mb.lock() += memory_mb;
    }
}

pub struct ResourceMonitor {
    coordinator: Arc<PersistenceCoordinator>,
    workers: Arc<WorkerLifecycleManager>,
    driver: Arc<dyn SessionDriver>,
    memory: Arc<dyn ProcessMemory>,
    config: Arc<FleetConfig>,
    metrics: MonitorMetrics,
    evicting: DashSet<String>,
    stopped_since_collection: AtomicU64,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("metrics", &self.metrics)
            .field("evicting", &self.evicting.len())
            .finish_non_exhaustive()
    }
}

/// What one sampling pass learned about a worker's tabs
#[derive(Debug, Default)]
struct TabObservations {
    playback: Vec<(u32, PlaybackSnapshot)>,
    faults: Vec<(u32, DriverFault)>,
}

impl From<ResourceSample> for ResourceSnapshot {
    fn from(sample: ResourceSample) -> Self {
        Self {
            cpu_percent: sample.cpu_percent,
            memory_mb: sample.memory_mb,
            network_rx_mbps: sample.network_rx_mbps,
            network_tx_mbps: sample.network_tx_mbps,
            disk_mb: sample.disk_mb,
            updated_at: Some(Utc::now()),
            estimated: false,
        }
    }
}

/// Synthetic usage for a session that cannot report its own
fn estimated_usage(open_tabs: usize) -> ResourceSnapshot {
    let tabs = open_tabs as f64;
    ResourceSnapshot {
        cpu_percent: defaults::ESTIMATED_TAB_CPU_PERCENT * tabs,
        memory_mb: defaults::ESTIMATED_BASE_MEMORY_MB + defaults::ESTIMATED_TAB_MEMORY_MB * tabs,
        updated_at: Some(Utc::now()),
        estimated: true,
        ..Default::default()
    }
}

/// Idle threshold for a sweep
fn idle_threshold(config: &MonitorConfig, only_very_idle: bool) -> Duration {
    if only_very_idle {
        config.idle_timeout() * 2
    } else {
        config.idle_timeout()
    }
}

/// How long the worker has been idle at `now`, if it has ever been active
pub fn idle_for(worker: &Worker, now: DateTime<Utc>) -> Option<Duration> {
    let since = worker.last_activity_at.or(worker.started_at)?;
    (now - since).to_std().ok()
}

impl ResourceMonitor {
    pub fn new(
        coordinator: Arc<PersistenceCoordinator>,
        workers: Arc<WorkerLifecycleManager>,
        driver: Arc<dyn SessionDriver>,
        memory: Arc<dyn ProcessMemory>,
        config: Arc<FleetConfig>,
    ) -> Self {
        Self {
            coordinator,
            workers,
            driver,
            memory,
            config,
            metrics: MonitorMetrics::default(),
            evicting: DashSet::new(),
            stopped_since_collection: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> MonitorSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_evicting(&self, worker_id: &str) -> bool {
        self.evicting.contains(worker_id)
    }

    /// Spawn the sampler and the memory sweep; both stop when `shutdown` fires
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let monitor = &self.config.monitor;
        info!(
            sample_interval_ms = monitor.sample_interval_ms,
            memory_sweep_interval_ms = monitor.memory_sweep_interval_ms,
            "📈 MONITOR: Starting resource monitor"
        );

        let sampler = {
            let this = Arc::clone(self);
            let shutdown = shutdown.clone();
            let period = monitor.sample_interval();
            tokio::spawn(async move {
                this.run_every(period, shutdown, |m| async move {
                    if let Err(e) = m.sample_once().await {
                        warn!(error = %e, "📈 MONITOR: Sampling pass failed");
                    }
                })
                .await;
            })
        };

        let sweeper = {
            let this = Arc::clone(self);
            let period = monitor.memory_sweep_interval();
            tokio::spawn(async move {
                this.run_every(period, shutdown, |m| async move {
                    if let Err(e) = m.memory_sweep_once().await {
                        warn!(error = %e, "🧹 MONITOR: Memory sweep failed");
                    }
                })
                .await;
            })
        };

        vec![sampler, sweeper]
    }

    async fn run_every<F, Fut>(self: Arc<Self>, period: Duration, shutdown: CancellationToken, pass: F)
    where
        F: Fn(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => pass(Arc::clone(&self)).await,
            }
        }
    }

    /// One sampling pass over every serving worker and every running box
    pub async fn sample_once(self: &Arc<Self>) -> Result<()> {
        let workers: Vec<Worker> = self.coordinator.all().await?;
        let hard = self.config.monitor.hard_limit_multiplier;
        let mut usage_by_box: HashMap<String, Vec<(String, ResourceSnapshot)>> = HashMap::new();

        for worker in workers.iter().filter(|w| w.status.is_serving()) {
            let Some(handle) = self.workers.registry().handle(&worker.id) else {
                continue;
            };

            let usage = self.sample_usage(worker, &handle).await;
            let observations = self.probe_tabs(worker, &handle).await;
            let violations = worker.resource_limits.violations(&usage);

            let recorded = self
                .coordinator
                .update::<Worker, _>(&worker.id, |w| {
                    if !w.status.is_serving() {
                        return Ok(());
                    }
                    w.resource_usage = usage.clone();
                    let mut playing = false;
                    for (index, snapshot) in &observations.playback {
                        if let Some(tab) = w.tab_mut(*index) {
                            if tab.status.is_live() {
                                tab.status = snapshot.tab_state();
                                tab.playback = Some(snapshot.clone());
                                playing |= snapshot.is_playing;
                            }
                        }
                    }
                    if playing {
                        w.last_activity_at = Some(Utc::now());
                    }
                    w.mirror_primary_tab();
                    for v in &violations {
                        w.push_log(
                            LogLevel::Warn,
                            format!("{} {:.1} exceeds limit {:.1}", v.resource, v.observed, v.limit),
                        );
                    }
                    Ok(())
                })
                .await;

            let recorded = match recorded {
                Ok(w) if w.status.is_serving() => w,
                Ok(_) => continue,
                Err(e) => {
                    warn!(worker_id = %worker.id, error = %e, "📈 MONITOR: Could not record sample");
                    continue;
                }
            };

            usage_by_box
                .entry(recorded.box_id.clone())
                .or_default()
                .push((recorded.id.clone(), usage.clone()));

            for (index, fault) in observations.faults {
                if RecoveryPolicy::counts_as_detection(fault.kind) {
                    warn!(worker_id = %worker.id, tab = index, fault = %fault, "📈 MONITOR: Probe reported a block");
                    if let Err(e) = self.workers.handle_fault(&worker.id, fault).await {
                        warn!(worker_id = %worker.id, error = %e, "📈 MONITOR: Fault routing failed");
                    }
                    break;
                }
                debug!(worker_id = %worker.id, tab = index, fault = %fault, "📈 MONITOR: Probe failed");
            }

            if let Some(worst) = violations.iter().find(|v| v.ratio() > hard) {
                warn!(
                    worker_id = %worker.id,
                    resource = worst.resource,
                    observed = worst.observed,
                    limit = worst.limit,
                    "🚨 MONITOR: Worker beyond hard limit, evicting"
                );
                self.spawn_eviction(&worker.id);
            }
        }

        self.sample_boxes(&usage_by_box).await?;

        self.metrics.checks.fetch_add(1, Ordering::Relaxed);
        *self.metrics.last_check_at.lock() = Some(Utc::now());
        Ok(())
    }

    async fn sample_boxes(self: &Arc<Self>, usage_by_box: &HashMap<String, Vec<(String, ResourceSnapshot)>>) -> Result<()> {
        let boxes: Vec<FleetBox> = self.coordinator.all().await?;
        let hard = self.config.monitor.hard_limit_multiplier;

        for fleet_box in boxes.iter().filter(|b| b.status == BoxState::Running) {
            let members = usage_by_box.get(&fleet_box.id).map(Vec::as_slice).unwrap_or(&[]);
            let total = ResourceSnapshot::aggregate(members.iter().map(|(_, usage)| usage));
            let violations = fleet_box.resource_limits.violations(&total);

            if let Err(e) = self
                .coordinator
                .update::<FleetBox, _>(&fleet_box.id, |b| {
                    b.resource_usage = total.clone();
                    Ok(())
                })
                .await
            {
                warn!(box_id = %fleet_box.id, error = %e, "📈 MONITOR: Could not record box usage");
                continue;
            }

            for v in &violations {
                warn!(
                    box_id = %fleet_box.id,
                    resource = v.resource,
                    observed = v.observed,
                    limit = v.limit,
                    "📈 MONITOR: Box over resource limit"
                );
            }

            if violations.iter().any(|v| v.ratio() > hard) {
                let heaviest = members
                    .iter()
                    .filter(|(id, _)| !self.evicting.contains(id))
                    .max_by(|a, b| a.1.memory_mb.total_cmp(&b.1.memory_mb));
                if let Some((worker_id, _)) = heaviest {
                    warn!(box_id = %fleet_box.id, worker_id = %worker_id, "🚨 MONITOR: Box beyond hard limit, evicting heaviest worker");
                    self.spawn_eviction(worker_id);
                }
            }
        }
        Ok(())
    }

    async fn sample_usage(&self, worker: &Worker, handle: &SessionHandle) -> ResourceSnapshot {
        let sampled = within(
            self.config.timeouts.probe(),
            self.driver.resource_usage(handle),
            || DriverFault::timeout("resource usage query timed out"),
        )
        .await;

        match sampled {
            Ok(sample) => sample.into(),
            Err(fault) => {
                debug!(worker_id = %worker.id, fault = %fault, "📈 MONITOR: Falling back to estimated usage");
                if worker.resource_usage.updated_at.is_some() {
                    ResourceSnapshot {
                        estimated: true,
                        updated_at: Some(Utc::now()),
                        ..worker.resource_usage.clone()
                    }
                } else {
                    estimated_usage(worker.open_tab_count())
                }
            }
        }
    }

    async fn probe_tabs(&self, worker: &Worker, handle: &SessionHandle) -> TabObservations {
        let mut observations = TabObservations::default();
        for tab in worker.tabs.iter().filter(|t| t.status.is_live()) {
            let probed: std::result::Result<PlaybackStatus, DriverFault> = within(
                self.config.timeouts.probe(),
                self.driver.probe(handle, tab.index),
                || DriverFault::timeout(format!("probe of tab {} timed out", tab.index)),
            )
            .await;
            match probed {
                Ok(status) => observations
                    .playback
                    .push((tab.index, PlaybackSnapshot::from_status(&status))),
                Err(fault) => observations.faults.push((tab.index, fault)),
            }
        }
        observations
    }

    fn spawn_eviction(self: &Arc<Self>, worker_id: &str) {
        let monitor = Arc::clone(self);
        let id = worker_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = monitor.evict(&id).await {
                warn!(worker_id = %id, error = %e, "🚨 MONITOR: Eviction failed");
            }
        });
    }

    /// Stop a worker, wait out the cooldown, then start it again on the same target
    ///
    /// Returns false if an eviction of this worker was already in progress.
    pub async fn evict(&self, worker_id: &str) -> Result<bool> {
        if !self.evicting.insert(worker_id.to_string()) {
            return Ok(false);
        }
        let outcome = self.run_eviction(worker_id).await;
        self.evicting.remove(worker_id);
        outcome.map(|()| true)
    }

    async fn run_eviction(&self, worker_id: &str) -> Result<()> {
        let worker = self.workers.get(worker_id).await?;
        if !worker.status.is_active() {
            return Ok(());
        }
        let target = worker.target.clone();
        let tabs = self.workers.tabs_for_restart(&worker);

        self.workers.stop(worker_id).await?;
        self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_stop(worker.resource_usage.memory_mb);
        self.note_stopped(1);

        tokio::time::sleep(self.config.monitor.eviction_cooldown()).await;

        let Some(target) = target else {
            return Ok(());
        };
        let current = self.workers.get(worker_id).await?;
        if current.status != WorkerState::Idle {
            debug!(worker_id = %worker_id, status = %current.status, "🚨 MONITOR: Worker changed during cooldown, not restarting");
            return Ok(());
        }
        match self.coordinator.get::<FleetBox>(&current.box_id).await? {
            Some(b) if b.status == BoxState::Running => {}
            _ => return Ok(()),
        }

        self.workers.assign_target(worker_id, &target).await?;
        let state = self.workers.start_and_wait(worker_id, Some(tabs)).await?;
        info!(worker_id = %worker_id, status = %state, "🚨 MONITOR: Evicted worker restarted");
        Ok(())
    }

    /// Stop serving workers idle for longer than the idle timeout
    /// (twice the timeout when `only_very_idle`)
    pub async fn stop_idle_workers(&self, only_very_idle: bool) -> Result<usize> {
        let threshold = idle_threshold(&self.config.monitor, only_very_idle);
        let now = Utc::now();
        let workers: Vec<Worker> = self.coordinator.all().await?;

        let mut stopped = 0;
        for worker in workers.iter().filter(|w| w.status.is_serving()) {
            let Some(idle) = idle_for(worker, now) else {
                continue;
            };
            if idle <= threshold || self.evicting.contains(&worker.id) {
                continue;
            }

            match self.workers.stop(&worker.id).await {
                Ok(_) => {
                    info!(
                        worker_id = %worker.id,
                        idle_secs = idle.as_secs(),
                        only_very_idle,
                        "🧹 MONITOR: Stopped idle worker"
                    );
                    self.metrics.record_stop(worker.resource_usage.memory_mb);
                    stopped += 1;
                }
                Err(e) if e.is_invalid_state() => {
                    debug!(worker_id = %worker.id, error = %e, "🧹 MONITOR: Worker changed state before idle stop");
                }
                Err(e) => return Err(e),
            }
        }

        if stopped > 0 {
            self.note_stopped(stopped as u64);
        }
        Ok(stopped)
    }

    /// One global memory sweep
    pub async fn memory_sweep_once(&self) -> Result<usize> {
        let threshold = self.config.monitor.memory_threshold_mb as f64;
        let resident = self.memory.resident_mb();
        let over = resident.is_some_and(|mb| mb > threshold);

        if over {
            warn!(
                resident_mb = resident.unwrap_or_default(),
                threshold_mb = threshold,
                "🧹 MONITOR: Resident memory above threshold, stopping idle workers"
            );
        }
        let stopped = self.stop_idle_workers(!over).await?;
        self.metrics.sweeps.fetch_add(1, Ordering::Relaxed);
        Ok(stopped)
    }

    fn note_stopped(&self, count: u64) {
        let total = self.stopped_since_collection.fetch_add(count, Ordering::Relaxed) + count;
        if total >= self.config.monitor.gc_after_stopped_viewers {
            self.reclaim();
        }
    }

    /// Best-effort release of memory held by torn-down sessions
    fn reclaim(&self) {
        self.stopped_since_collection.store(0, Ordering::Relaxed);
        self.workers.registry().shrink_to_fit();
        self.metrics.collections.fetch_add(1, Ordering::Relaxed);
        *self.metrics.last_collection_at.lock() = Some(Utc::now());
        debug!("🧹 MONITOR: Reclamation pass requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_idle_threshold_doubles_for_very_idle() {
        let config = MonitorConfig {
            idle_timeout_ms: 60_000,
            ..Default::default()
        };
        assert_eq!(idle_threshold(&config, false), Duration::from_secs(60));
        assert_eq!(idle_threshold(&config, true), Duration::from_secs(120));
    }

    #[test]
    fn test_idle_for_prefers_last_activity() {
        let now = Utc::now();
        let mut worker = Worker::new("box-1", false);
        assert!(idle_for(&worker, now).is_none());

        worker.started_at = Some(now - ChronoDuration::minutes(10));
        assert_eq!(idle_for(&worker, now), Some(Duration::from_secs(600)));

        worker.last_activity_at = Some(now - ChronoDuration::minutes(2));
        assert_eq!(idle_for(&worker, now), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_estimate_scales_with_tabs() {
        let one = estimated_usage(1);
        let three = estimated_usage(3);
        assert!(one.estimated);
        assert!(three.memory_mb > one.memory_mb);
        assert_eq!(
            three.memory_mb,
            defaults::ESTIMATED_BASE_MEMORY_MB + 3.0 * defaults::ESTIMATED_TAB_MEMORY_MB
        );
    }

    #[test]
    fn test_metrics_accumulate_recovered_memory() {
        let metrics = MonitorMetrics::default();
        metrics.record_stop(300.0);
        metrics.record_stop(150.5);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.workers_stopped, 2);
        assert_eq!(snapshot.memory_recovered_mb, 450.5);
    }
}
