//! # Fleet Orchestrator
//!
//! The facade a control plane (HTTP layer, CLI) talks to. Wires the store, the
//! persistence coordinator, both lifecycle managers and the resource monitor, and
//! owns the background tasks they spawn.

use super::box_lifecycle::{BoxLifecycleManager, BoxUpdate, NewBox};
use super::monitor::{MonitorSnapshot, ProcessMemory, ResourceMonitor, SysinfoMemory};
use super::registry::SessionRegistry;
use super::streams::StreamDirectory;
use super::worker_lifecycle::WorkerLifecycleManager;
use crate::config::FleetConfig;
use crate::error::Result;
use crate::models::{FleetBox, StreamRecord, Worker};
use crate::persistence::{CoordinatorStats, PersistenceCoordinator};
use crate::state_machine::{BoxState, WorkerState};
use crate::store::{DocumentStore, EntityStore, MemoryDocumentStore};
use crate::upstream::{ArtifactRef, EgressProvider, SessionDriver};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Read-only fleet status for the control plane
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub environment: String,
    pub boxes: BTreeMap<String, usize>,
    pub workers: BTreeMap<String, usize>,
    pub live_sessions: usize,
    pub persistence: CoordinatorStats,
    pub monitor: MonitorSnapshot,
}

pub struct FleetOrchestrator {
    config: Arc<FleetConfig>,
    coordinator: Arc<PersistenceCoordinator>,
    streams: Arc<StreamDirectory>,
    workers: Arc<WorkerLifecycleManager>,
    boxes: Arc<BoxLifecycleManager>,
    monitor: Arc<ResourceMonitor>,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for FleetOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetOrchestrator")
            .field("environment", &self.config.environment)
            .field("workers", &self.workers)
            .field("boxes", &self.boxes)
            .finish_non_exhaustive()
    }
}

impl FleetOrchestrator {
    pub fn new(
        config: FleetConfig,
        backend: Arc<dyn DocumentStore>,
        driver: Arc<dyn SessionDriver>,
        egress: Arc<dyn EgressProvider>,
    ) -> Self {
        Self::with_process_memory(config, backend, driver, egress, Arc::new(SysinfoMemory::new()))
    }

    /// Like [`Self::new`] with an explicit resident-memory source for the memory sweep
    pub fn with_process_memory(
        config: FleetConfig,
        backend: Arc<dyn DocumentStore>,
        driver: Arc<dyn SessionDriver>,
        egress: Arc<dyn EgressProvider>,
        memory: Arc<dyn ProcessMemory>,
    ) -> Self {
        let config = Arc::new(config);
        let store = EntityStore::new(backend, config.persistence.write_timeout());
        let coordinator = Arc::new(PersistenceCoordinator::new(store, config.persistence.clone()));
        let streams = Arc::new(StreamDirectory::new(Arc::clone(&coordinator)));
        let registry = Arc::new(SessionRegistry::new());

        let workers = Arc::new(WorkerLifecycleManager::new(
            Arc::clone(&coordinator),
            Arc::clone(&driver),
            registry,
            Arc::clone(&streams),
            Arc::clone(&config),
        ));
        let boxes = Arc::new(BoxLifecycleManager::new(
            Arc::clone(&coordinator),
            Arc::clone(&workers),
            egress,
            Arc::clone(&streams),
            Arc::clone(&config),
        ));
        let monitor = Arc::new(ResourceMonitor::new(
            Arc::clone(&coordinator),
            Arc::clone(&workers),
            driver,
            memory,
            Arc::clone(&config),
        ));

        Self {
            config,
            coordinator,
            streams,
            workers,
            boxes,
            monitor,
            shutdown: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Build an orchestrator over the store selected by `database.url`
    ///
    /// Without a URL (or without the `postgres` feature) records live in memory.
    pub async fn from_config(
        config: FleetConfig,
        driver: Arc<dyn SessionDriver>,
        egress: Arc<dyn EgressProvider>,
    ) -> Result<Self> {
        let backend = Self::backend_for(&config).await?;
        Ok(Self::new(config, backend, driver, egress))
    }

    #[cfg(feature = "postgres")]
    async fn backend_for(config: &FleetConfig) -> Result<Arc<dyn DocumentStore>> {
        match &config.database.url {
            Some(url) => {
                let store = crate::store::PgDocumentStore::connect(url, config.database.pool).await?;
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(MemoryDocumentStore::new())),
        }
    }

    #[cfg(not(feature = "postgres"))]
    async fn backend_for(config: &FleetConfig) -> Result<Arc<dyn DocumentStore>> {
        if config.database.url.is_some() {
            warn!("💾 PERSISTENCE: database.url set but the postgres feature is disabled, using memory store");
        }
        Ok(Arc::new(MemoryDocumentStore::new()))
    }

    /// Spawn the session event listener and, if enabled, the resource monitor
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("🚀 FLEET: Background tasks already running");
            return;
        }
        if let Some(listener) = self.workers.spawn_event_listener(self.shutdown.child_token()) {
            tasks.push(listener);
        }
        if self.config.monitor.enabled {
            tasks.extend(self.monitor.start(self.shutdown.child_token()));
        }
        info!(
            environment = %self.config.environment,
            background_tasks = tasks.len(),
            "🚀 FLEET: Orchestrator started"
        );
    }

    /// Cancel background work, stop every running box and terminate leftover sessions
    pub async fn shutdown(&self) -> Result<()> {
        info!("🛑 FLEET: Shutting down orchestrator");
        self.shutdown.cancel();
        self.boxes.cancel_all_starts().await;

        for fleet_box in self.boxes.list().await? {
            if matches!(fleet_box.status, BoxState::Running | BoxState::Starting) {
                if let Err(e) = self.boxes.stop(&fleet_box.id).await {
                    warn!(box_id = %fleet_box.id, error = %e, "🛑 FLEET: Box did not stop cleanly");
                }
            }
        }

        let terminated = self.workers.terminate_all().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!(terminated, "🛑 FLEET: Orchestrator stopped");
        Ok(())
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<PersistenceCoordinator> {
        &self.coordinator
    }

    pub fn workers(&self) -> &Arc<WorkerLifecycleManager> {
        &self.workers
    }

    pub fn boxes(&self) -> &Arc<BoxLifecycleManager> {
        &self.boxes
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    // Box operations

    pub async fn create_box(&self, request: NewBox) -> Result<FleetBox> {
        self.boxes.create(request).await
    }

    pub async fn update_box(&self, box_id: &str, changes: BoxUpdate) -> Result<FleetBox> {
        self.boxes.update(box_id, changes).await
    }

    pub async fn delete_box(&self, box_id: &str) -> Result<()> {
        self.boxes.delete(box_id).await
    }

    pub async fn start_box(&self, box_id: &str) -> Result<FleetBox> {
        self.boxes.start(box_id).await
    }

    pub async fn stop_box(&self, box_id: &str) -> Result<FleetBox> {
        self.boxes.stop(box_id).await
    }

    pub async fn refresh_address(&self, box_id: &str) -> Result<FleetBox> {
        self.boxes.refresh_address(box_id).await
    }

    pub async fn get_box(&self, box_id: &str) -> Result<FleetBox> {
        self.boxes.get(box_id).await
    }

    pub async fn list_boxes(&self) -> Result<Vec<FleetBox>> {
        self.boxes.list().await
    }

    // Worker operations

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker> {
        self.workers.get(worker_id).await
    }

    pub async fn list_workers(&self, box_id: &str) -> Result<Vec<Worker>> {
        self.workers.list_for_box(box_id).await
    }

    pub async fn assign_target(&self, worker_id: &str, target: &str) -> Result<Worker> {
        self.workers.assign_target(worker_id, target).await
    }

    pub async fn start_worker(&self, worker_id: &str, tab_count: Option<u32>) -> Result<Worker> {
        self.workers.start(worker_id, tab_count).await
    }

    pub async fn stop_worker(&self, worker_id: &str) -> Result<Worker> {
        self.workers.stop(worker_id).await
    }

    pub async fn restart_worker(&self, worker_id: &str) -> Result<Worker> {
        self.workers.restart(worker_id).await
    }

    pub async fn add_tab(&self, worker_id: &str) -> Result<Worker> {
        self.workers.add_tab(worker_id).await
    }

    pub async fn close_tab(&self, worker_id: &str, index: u32) -> Result<Worker> {
        self.workers.close_tab(worker_id, index).await
    }

    pub async fn capture(&self, worker_id: &str, index: u32) -> Result<ArtifactRef> {
        self.workers.capture(worker_id, index).await
    }

    pub async fn find_stream(&self, target: &str) -> Result<Option<StreamRecord>> {
        self.streams.find(target).await
    }

    // Status

    pub fn persistence_stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    pub fn monitor_metrics(&self) -> MonitorSnapshot {
        self.monitor.metrics()
    }

    pub async fn status(&self) -> Result<FleetStatus> {
        let boxes: Vec<FleetBox> = self.coordinator.all().await?;
        let workers: Vec<Worker> = self.coordinator.all().await?;

        let mut box_counts = BTreeMap::new();
        for state in boxes.iter().map(|b| b.status) {
            *box_counts.entry(state.to_string()).or_insert(0) += 1;
        }
        let mut worker_counts = BTreeMap::new();
        for state in workers.iter().map(|w| w.status) {
            *worker_counts.entry(state.to_string()).or_insert(0) += 1;
        }

        Ok(FleetStatus {
            environment: self.config.environment.clone(),
            boxes: box_counts,
            workers: worker_counts,
            live_sessions: self.workers.registry().len(),
            persistence: self.coordinator.stats(),
            monitor: self.monitor.metrics(),
        })
    }

    /// Workers of a box that have not yet reached a start outcome
    pub async fn pending_workers(&self, box_id: &str) -> Result<usize> {
        Ok(self
            .workers
            .list_for_box(box_id)
            .await?
            .iter()
            .filter(|w| w.status == WorkerState::Starting)
            .count())
    }
}
