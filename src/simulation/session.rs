//! Simulated worker session driver

use super::take_one;
use crate::upstream::{
    ArtifactRef, ClientIdentity, DriverFault, FaultKind, LaunchRequest, PlaybackStatus,
    ResourceSample, SessionDriver, SessionEvent, SessionEventSender, SessionHandle,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

const BASE_MEMORY_MB: f64 = 150.0;
const TAB_MEMORY_MB: f64 = 100.0;
const TAB_CPU_PERCENT: f64 = 5.0;

#[derive(Debug)]
struct SimulatedSession {
    worker_id: String,
    open_tabs: BTreeSet<u32>,
    events: SessionEventSender,
}

#[derive(Debug, Default)]
pub struct SimulatedSessionDriver {
    launch_delay: Mutex<Duration>,
    tab_delay: Mutex<Duration>,
    blocked_launches: AtomicU32,
    failing_tabs: Mutex<HashMap<u32, FaultKind>>,
    memory_overrides: DashMap<String, f64>,
    usage_unavailable: AtomicBool,
    probe_faults: DashMap<String, DriverFault>,
    sessions: DashMap<String, SimulatedSession>,
    /// (worker id, identity id) for every launch attempt, in order
    launches: Mutex<Vec<(String, String)>>,
    identities: AtomicU64,
    captures: AtomicU64,
    terminated: AtomicU64,
}

impl SimulatedSessionDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_launch_delay(self, delay: Duration) -> Self {
        *self.launch_delay.lock() = delay;
        self
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *self.launch_delay.lock() = delay;
    }

    pub fn set_tab_delay(&self, delay: Duration) {
        *self.tab_delay.lock() = delay;
    }

    /// Refuse the next `count` launches with a blocked fault
    pub fn block_next_launches(&self, count: u32) {
        self.blocked_launches.store(count, Ordering::SeqCst);
    }

    /// Make every attempt to open tab `index` fail with a fault of `kind`
    pub fn fail_tab(&self, index: u32, kind: FaultKind) {
        self.failing_tabs.lock().insert(index, kind);
    }

    pub fn clear_tab_failures(&self) {
        self.failing_tabs.lock().clear();
    }

    /// Report `memory_mb` as the worker's session memory
    pub fn set_memory(&self, worker_id: &str, memory_mb: f64) {
        self.memory_overrides.insert(worker_id.to_string(), memory_mb);
    }

    pub fn clear_memory(&self, worker_id: &str) {
        self.memory_overrides.remove(worker_id);
    }

    /// Make resource usage queries fail
    pub fn set_usage_unavailable(&self, unavailable: bool) {
        self.usage_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next probe of any tab of the worker with `fault`
    pub fn inject_probe_fault(&self, worker_id: &str, fault: DriverFault) {
        self.probe_faults.insert(worker_id.to_string(), fault);
    }

    /// Drop the worker's session as if it crashed, notifying the orchestrator
    ///
    /// Returns false if the worker had no live session.
    pub fn disconnect(&self, worker_id: &str, reason: &str) -> bool {
        let session_id = self
            .sessions
            .iter()
            .find(|entry| entry.value().worker_id == worker_id)
            .map(|entry| entry.key().clone());
        let Some((session_id, session)) = session_id.and_then(|id| self.sessions.remove(&id)) else {
            return false;
        };

        session
            .events
            .send(SessionEvent::Disconnected {
                worker_id: worker_id.to_string(),
                session_id,
                reason: reason.to_string(),
            })
            .is_ok()
    }

    /// Identity ids used by every launch attempt of the worker, in order
    pub fn launched_identities(&self, worker_id: &str) -> Vec<String> {
        self.launches
            .lock()
            .iter()
            .filter(|(worker, _)| worker == worker_id)
            .map(|(_, identity)| identity.clone())
            .collect()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, worker_id: &str) -> bool {
        self.sessions.iter().any(|entry| entry.value().worker_id == worker_id)
    }

    pub fn terminated_count(&self) -> u64 {
        self.terminated.load(Ordering::SeqCst)
    }

    fn gone(handle: &SessionHandle) -> DriverFault {
        DriverFault::crashed(format!("session {} is not running", handle.session_id))
    }

    async fn pause(delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SessionDriver for SimulatedSessionDriver {
    async fn generate_identity(&self) -> ClientIdentity {
        let n = self.identities.fetch_add(1, Ordering::SeqCst) + 1;
        let mut attributes = BTreeMap::new();
        attributes.insert("user_agent".to_string(), format!("SimBrowser/{}.0", 100 + n % 20));
        attributes.insert("viewport".to_string(), if n % 2 == 0 { "1920x1080" } else { "1366x768" }.to_string());
        ClientIdentity {
            id: format!("identity-{n}"),
            attributes,
        }
    }

    async fn launch(&self, request: LaunchRequest) -> Result<SessionHandle, DriverFault> {
        self.launches
            .lock()
            .push((request.worker_id.clone(), request.identity.id.clone()));
        let delay = *self.launch_delay.lock();
        Self::pause(delay).await;

        if take_one(&self.blocked_launches) {
            return Err(DriverFault::blocked(format!(
                "target refused identity {}",
                request.identity.id
            )));
        }

        let handle = SessionHandle {
            session_id: Uuid::new_v4().to_string(),
            worker_id: request.worker_id.clone(),
        };
        self.sessions.insert(
            handle.session_id.clone(),
            SimulatedSession {
                worker_id: request.worker_id,
                open_tabs: BTreeSet::new(),
                events: request.events,
            },
        );
        Ok(handle)
    }

    async fn open_tab(&self, handle: &SessionHandle, index: u32, target: &str) -> Result<(), DriverFault> {
        let delay = *self.tab_delay.lock();
        Self::pause(delay).await;

        let failure = self.failing_tabs.lock().get(&index).copied();
        if let Some(kind) = failure {
            return Err(DriverFault::new(kind, format!("tab {index} could not attach to {target}")));
        }

        let mut session = self.sessions.get_mut(&handle.session_id).ok_or_else(|| Self::gone(handle))?;
        session.open_tabs.insert(index);
        Ok(())
    }

    async fn close_tab(&self, handle: &SessionHandle, index: u32) -> Result<(), DriverFault> {
        let mut session = self.sessions.get_mut(&handle.session_id).ok_or_else(|| Self::gone(handle))?;
        session.open_tabs.remove(&index);
        Ok(())
    }

    async fn probe(&self, handle: &SessionHandle, index: u32) -> Result<PlaybackStatus, DriverFault> {
        if let Some((_, fault)) = self.probe_faults.remove(&handle.worker_id) {
            return Err(fault);
        }
        let session = self.sessions.get(&handle.session_id).ok_or_else(|| Self::gone(handle))?;
        if !session.open_tabs.contains(&index) {
            return Err(DriverFault::other(format!("tab {index} is not open")));
        }
        Ok(PlaybackStatus {
            is_playing: true,
            is_buffering: false,
            error: None,
        })
    }

    async fn capture(&self, handle: &SessionHandle, index: u32) -> Result<ArtifactRef, DriverFault> {
        let session = self.sessions.get(&handle.session_id).ok_or_else(|| Self::gone(handle))?;
        if !session.open_tabs.contains(&index) {
            return Err(DriverFault::other(format!("tab {index} is not open")));
        }
        let n = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("capture://{}/{index}/{n}.png", handle.session_id))
    }

    async fn resource_usage(&self, handle: &SessionHandle) -> Result<ResourceSample, DriverFault> {
        if self.usage_unavailable.load(Ordering::SeqCst) {
            return Err(DriverFault::other("usage reporting unavailable"));
        }
        let session = self.sessions.get(&handle.session_id).ok_or_else(|| Self::gone(handle))?;
        let tabs = session.open_tabs.len() as f64;
        let memory_mb = self
            .memory_overrides
            .get(&handle.worker_id)
            .map(|m| *m.value())
            .unwrap_or(BASE_MEMORY_MB + TAB_MEMORY_MB * tabs);

        Ok(ResourceSample {
            cpu_percent: TAB_CPU_PERCENT * tabs,
            memory_mb,
            network_rx_mbps: 2.5 * tabs,
            network_tx_mbps: 0.2 * tabs,
            disk_mb: None,
        })
    }

    async fn terminate(&self, handle: &SessionHandle) -> Result<(), DriverFault> {
        if self.sessions.remove(&handle.session_id).is_some() {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn request(driver_worker: &str, identity: ClientIdentity) -> (LaunchRequest, crate::upstream::SessionEventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LaunchRequest {
                worker_id: driver_worker.to_string(),
                identity,
                target: "stream-a".to_string(),
                events: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_blocked_launch_then_success() {
        let driver = SimulatedSessionDriver::new();
        driver.block_next_launches(1);

        let identity = driver.generate_identity().await;
        let (req, _rx) = request("w-1", identity.clone());
        let fault = driver.launch(req).await.unwrap_err();
        assert_eq!(fault.kind, FaultKind::Blocked);

        let (req, _rx) = request("w-1", identity);
        let handle = driver.launch(req).await.unwrap();
        assert!(driver.has_session("w-1"));
        assert_eq!(driver.launched_identities("w-1").len(), 2);

        driver.terminate(&handle).await.unwrap();
        assert_eq!(driver.live_sessions(), 0);
        assert_eq!(driver.terminated_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_listener() {
        let driver = SimulatedSessionDriver::new();
        let identity = driver.generate_identity().await;
        let (req, mut rx) = request("w-1", identity);
        let handle = driver.launch(req).await.unwrap();

        assert!(driver.disconnect("w-1", "renderer crashed"));
        match rx.recv().await {
            Some(SessionEvent::Disconnected { session_id, .. }) => {
                assert_eq!(session_id, handle.session_id)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!driver.disconnect("w-1", "again"));
    }

    #[tokio::test]
    async fn test_usage_scales_with_open_tabs() {
        let driver = SimulatedSessionDriver::new();
        let identity = driver.generate_identity().await;
        let (req, _rx) = request("w-1", identity);
        let handle = driver.launch(req).await.unwrap();
        driver.open_tab(&handle, 0, "stream-a").await.unwrap();
        driver.open_tab(&handle, 1, "stream-a").await.unwrap();

        let usage = driver.resource_usage(&handle).await.unwrap();
        assert_eq!(usage.memory_mb, BASE_MEMORY_MB + 2.0 * TAB_MEMORY_MB);

        driver.set_memory("w-1", 5_000.0);
        assert_eq!(driver.resource_usage(&handle).await.unwrap().memory_mb, 5_000.0);
    }
}
