#![allow(dead_code)]
//! # Fleet Test Harness
//!
//! Builds a `FleetOrchestrator` over the in-memory store and the simulated upstreams.
//! Run time-dependent tests under `#[tokio::test(start_paused = true)]`; every delay
//! in the orchestrator is a tokio timer, so the paused clock advances through
//! scheduler staggers, restart delays and eviction cooldowns instantly.

use fleet_core::config::FleetConfig;
use fleet_core::models::{FleetBox, Worker};
use fleet_core::orchestration::{FleetOrchestrator, NewBox, ProcessMemory};
use fleet_core::simulation::{SimulatedEgressProvider, SimulatedSessionDriver};
use async_trait::async_trait;
use fleet_core::state_machine::{BoxState, WorkerState};
use fleet_core::store::{
    DocumentFilter, DocumentStore, MemoryDocumentStore, StoreError, StoreResult, VersionedDocument,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub const TARGET: &str = "stream-a";

/// Process memory source with a settable value
#[derive(Debug, Default)]
pub struct FixedMemory(Mutex<Option<f64>>);

impl FixedMemory {
    pub fn set(&self, memory_mb: f64) {
        *self.0.lock() = Some(memory_mb);
    }
}

impl ProcessMemory for FixedMemory {
    fn resident_mb(&self) -> Option<f64> {
        *self.0.lock()
    }
}

/// Memory store whose writes to one record kind can be made to fail
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: Arc<MemoryDocumentStore>,
    /// Remaining failing writes per kind
    failing: Mutex<HashMap<String, u32>>,
}

impl FlakyStore {
    pub fn over(inner: Arc<MemoryDocumentStore>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `count` writes of `kind`
    pub fn fail_writes(&self, kind: &str, count: u32) {
        self.failing.lock().insert(kind.to_string(), count);
    }

    /// Fail every write of `kind` until healed
    pub fn break_writes(&self, kind: &str) {
        self.fail_writes(kind, u32::MAX);
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    fn take_failure(&self, kind: &str) -> bool {
        let mut failing = self.failing.lock();
        match failing.get_mut(kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, kind: &str, id: &str) -> StoreResult<Option<VersionedDocument>> {
        self.inner.get(kind, id).await
    }

    async fn put(
        &self,
        kind: &str,
        id: &str,
        body: Value,
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        if self.take_failure(kind) {
            return Err(StoreError::Backend(format!("write to {kind} '{id}' refused")));
        }
        self.inner.put(kind, id, body, expected_version).await
    }

    async fn delete(&self, kind: &str, id: &str) -> StoreResult<bool> {
        self.inner.delete(kind, id).await
    }

    async fn query(&self, kind: &str, filter: &DocumentFilter) -> StoreResult<Vec<VersionedDocument>> {
        self.inner.query(kind, filter).await
    }
}

/// Default configuration with the background monitor disabled
pub fn test_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.environment = "test".to_string();
    config.monitor.enabled = false;
    config
}

pub struct FleetHarness {
    pub fleet: Arc<FleetOrchestrator>,
    pub driver: Arc<SimulatedSessionDriver>,
    pub egress: Arc<SimulatedEgressProvider>,
    pub store: Arc<MemoryDocumentStore>,
    pub flaky: Arc<FlakyStore>,
    pub memory: Arc<FixedMemory>,
}

impl FleetHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: FleetConfig) -> Self {
        let driver = Arc::new(SimulatedSessionDriver::new());
        let egress = Arc::new(SimulatedEgressProvider::new());
        let store = Arc::new(MemoryDocumentStore::new());
        let flaky = Arc::new(FlakyStore::over(store.clone()));
        let memory = Arc::new(FixedMemory::default());

        let fleet = Arc::new(FleetOrchestrator::with_process_memory(
            config,
            flaky.clone(),
            driver.clone(),
            egress.clone(),
            memory.clone(),
        ));

        Self {
            fleet,
            driver,
            egress,
            store,
            flaky,
            memory,
        }
    }

    pub async fn create_box(&self, name: &str, workers: u32) -> FleetBox {
        self.fleet
            .create_box(NewBox {
                name: name.to_string(),
                egress_profile: "eu-west".to_string(),
                worker_count: Some(workers),
                target: Some(TARGET.to_string()),
                resource_limits: None,
            })
            .await
            .expect("box created")
    }

    /// Start a box and wait until egress, provisioning and worker startup settled
    pub async fn start_box_and_settle(&self, box_id: &str) -> FleetBox {
        self.fleet
            .boxes()
            .start_and_wait(box_id)
            .await
            .expect("box start accepted")
    }

    /// A running box with one running worker of `tabs` tabs
    pub async fn running_worker(&self, tabs: u32) -> (FleetBox, Worker) {
        let tabs = tabs.max(1);
        let fleet_box = self.create_box("solo", 1).await;
        let fleet_box = self.start_box_and_settle(&fleet_box.id).await;
        assert_eq!(fleet_box.status, BoxState::Running);

        let worker = self
            .fleet
            .list_workers(&fleet_box.id)
            .await
            .expect("workers listed")
            .pop()
            .expect("one worker");

        if tabs != 1 {
            self.fleet.stop_worker(&worker.id).await.expect("stopped");
            self.fleet
                .assign_target(&worker.id, TARGET)
                .await
                .expect("target assigned");
            let state = self
                .fleet
                .workers()
                .start_and_wait(&worker.id, Some(tabs))
                .await
                .expect("worker started");
            assert!(state.is_serving(), "worker ended start in {state}");
        }

        let worker = self.worker(&worker.id).await;
        assert!(matches!(worker.status, WorkerState::Running | WorkerState::Partial));
        (fleet_box, worker)
    }

    pub async fn worker(&self, worker_id: &str) -> Worker {
        self.fleet.get_worker(worker_id).await.expect("worker exists")
    }

    pub async fn fleet_box(&self, box_id: &str) -> FleetBox {
        self.fleet.get_box(box_id).await.expect("box exists")
    }
}
