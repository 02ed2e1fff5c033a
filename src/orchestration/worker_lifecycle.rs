//! # Worker Lifecycle Manager
//!
//! Drives workers through `idle → starting → running|partial|error → stopping → idle`.
//! Guards and validation run inside a coordinated update before anything is written;
//! driver calls happen outside the record lock.
//!
//! A start returns as soon as the worker is `starting`. The bring-up that follows is
//! tied to the worker's `start_attempt`: at every checkpoint it re-reads the record
//! and, if the worker was stopped or restarted meanwhile, tears down its own session
//! and leaves the record alone.

use super::recovery::{RecoveryAction, RecoveryPolicy};
use super::registry::{LiveSession, Registration, SessionRegistry};
use super::scheduler::{StartOutcome, WorkerStarter};
use super::streams::StreamDirectory;
use super::within;
use crate::config::FleetConfig;
use crate::constants::{kinds, MIN_TABS};
use crate::error::{FleetError, Result};
use crate::logging::log_worker_operation;
use crate::models::{FleetBox, LogLevel, Tab, Worker};
use crate::persistence::PersistenceCoordinator;
use crate::state_machine::{BoxState, TabState, WorkerEvent, WorkerState, WorkerStateMachine};
use crate::store::DocumentFilter;
use crate::upstream::{
    ArtifactRef, DriverFault, FaultKind, LaunchRequest, SessionDriver, SessionEvent,
    SessionEventReceiver, SessionEventSender, SessionHandle,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const DRIVER: &str = "session_driver";

/// How one bring-up ended; `blocked` marks a failure caused by a blocked condition
struct BringUp {
    state: WorkerState,
    blocked: bool,
}

impl From<WorkerState> for BringUp {
    fn from(state: WorkerState) -> Self {
        Self { state, blocked: false }
    }
}

pub struct WorkerLifecycleManager {
    coordinator: Arc<PersistenceCoordinator>,
    driver: Arc<dyn SessionDriver>,
    registry: Arc<SessionRegistry>,
    streams: Arc<StreamDirectory>,
    recovery: RecoveryPolicy,
    config: Arc<FleetConfig>,
    events_tx: SessionEventSender,
    events_rx: parking_lot::Mutex<Option<SessionEventReceiver>>,
    pending_restarts: DashSet<String>,
}

impl std::fmt::Debug for WorkerLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLifecycleManager")
            .field("live_sessions", &self.registry.len())
            .field("pending_restarts", &self.pending_restarts.len())
            .finish_non_exhaustive()
    }
}

/// Apply a worker event, converting a refused transition into `InvalidState`
fn transition(worker: &mut Worker, event: &WorkerEvent, operation: &str) -> Result<WorkerState> {
    let from = worker.status;
    WorkerStateMachine::apply(worker, event)
        .map_err(|_| FleetError::invalid_state(kinds::WORKER, worker.id.clone(), from, operation))
}

impl WorkerLifecycleManager {
    pub fn new(
        coordinator: Arc<PersistenceCoordinator>,
        driver: Arc<dyn SessionDriver>,
        registry: Arc<SessionRegistry>,
        streams: Arc<StreamDirectory>,
        config: Arc<FleetConfig>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            coordinator,
            driver,
            registry,
            streams,
            recovery: RecoveryPolicy::new(&config.recovery),
            config,
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            pending_restarts: DashSet::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn recovery(&self) -> &RecoveryPolicy {
        &self.recovery
    }

    pub async fn get(&self, worker_id: &str) -> Result<Worker> {
        self.coordinator.require(worker_id).await
    }

    pub async fn list(&self) -> Result<Vec<Worker>> {
        self.coordinator.all().await
    }

    pub async fn list_for_box(&self, box_id: &str) -> Result<Vec<Worker>> {
        self.coordinator
            .query(&DocumentFilter::new().eq("box_id", box_id))
            .await
    }

    /// Create an idle worker record owned by `box_id`
    pub async fn create(
        &self,
        box_id: &str,
        is_parse_chat_enabled: bool,
        target: Option<String>,
    ) -> Result<Worker> {
        let mut worker = Worker::new(box_id, is_parse_chat_enabled);
        worker.resource_limits = self.config.monitor.default_worker_limits.clone();
        worker.target = target;
        worker.push_log(LogLevel::Info, "worker created");
        self.coordinator.insert(worker).await
    }

    /// Point an idle or failed worker at a target stream
    pub async fn assign_target(&self, worker_id: &str, target: &str) -> Result<Worker> {
        let target = target.trim();
        if target.is_empty() {
            return Err(FleetError::validation("target must not be empty"));
        }

        self.coordinator
            .update::<Worker, _>(worker_id, |w| {
                if !matches!(w.status, WorkerState::Idle | WorkerState::Error) {
                    return Err(FleetError::invalid_state(
                        kinds::WORKER,
                        w.id.clone(),
                        w.status,
                        "assign target",
                    ));
                }
                if w.target.as_deref() != Some(target) {
                    w.target = Some(target.to_string());
                    w.push_log(LogLevel::Info, format!("target set to {target}"));
                }
                Ok(())
            })
            .await
    }

    /// Move a worker to `starting` and bring its session up in the background
    pub async fn start(self: &Arc<Self>, worker_id: &str, tab_count: Option<u32>) -> Result<Worker> {
        let worker = self.begin_start(worker_id, tab_count).await?;
        let manager = Arc::clone(self);
        let id = worker.id.clone();
        let attempt = worker.start_attempt;
        tokio::spawn(async move {
            manager.bring_up(&id, attempt).await;
        });
        Ok(worker)
    }

    /// Start a worker and wait for its start outcome
    pub async fn start_and_wait(self: &Arc<Self>, worker_id: &str, tab_count: Option<u32>) -> Result<WorkerState> {
        let worker = self.begin_start(worker_id, tab_count).await?;
        Ok(self.bring_up(&worker.id, worker.start_attempt).await)
    }

    /// Stop a worker, tear down its session and return it to idle
    #[instrument(skip(self))]
    pub async fn stop(&self, worker_id: &str) -> Result<Worker> {
        self.begin_stop(worker_id).await?;
        self.finish_stop(worker_id).await
    }

    /// Transition to `stopping`, terminate the live session and leave the stream
    pub async fn begin_stop(&self, worker_id: &str) -> Result<Worker> {
        let worker = self
            .coordinator
            .update::<Worker, _>(worker_id, |w| {
                transition(w, &WorkerEvent::Stop, "stop")?;
                w.push_log(LogLevel::Info, "stop requested");
                Ok(())
            })
            .await?;

        self.teardown_session(worker_id).await;
        if let Some(target) = &worker.target {
            if let Err(e) = self.streams.detach(target, worker_id).await {
                warn!(worker_id = %worker_id, error = %e, "🛑 WORKER: Failed to detach from stream");
            }
        }
        Ok(worker)
    }

    /// Complete a stop begun with [`Self::begin_stop`]
    ///
    /// A worker whose stop cannot be recorded is moved to `error` rather than left in
    /// `stopping`.
    pub async fn finish_stop(&self, worker_id: &str) -> Result<Worker> {
        let finished = self
            .coordinator
            .update::<Worker, _>(worker_id, |w| {
                if w.status != WorkerState::Stopping {
                    return Ok(());
                }
                transition(w, &WorkerEvent::Stopped, "finish stop")?;
                w.push_log(LogLevel::Info, "stopped");
                Ok(())
            })
            .await;

        let worker = match finished {
            Ok(worker) => worker,
            Err(err) => {
                error!(worker_id = %worker_id, error = %err, "🛑 WORKER: Could not complete stop");
                self.fail_stopping(worker_id, &format!("stop incomplete: {err}")).await;
                return Err(err);
            }
        };

        log_worker_operation("stop", &worker.id, Some(&worker.box_id), &worker.status.to_string(), None);
        Ok(worker)
    }

    async fn fail_stopping(&self, worker_id: &str, message: &str) {
        let failed = self
            .coordinator
            .update::<Worker, _>(worker_id, |w| {
                if w.status == WorkerState::Stopping {
                    transition(w, &WorkerEvent::fail_with_error(message), "fail stop")?;
                    w.push_log(LogLevel::Error, message);
                }
                Ok(())
            })
            .await;
        if let Err(e) = failed {
            error!(worker_id = %worker_id, error = %e, "🛑 WORKER: Worker left in stopping");
        }
    }

    /// Clear the target and session fields of an idle worker
    pub async fn reset_idle(&self, worker_id: &str) -> Result<Worker> {
        self.coordinator
            .update::<Worker, _>(worker_id, |w| {
                if w.status == WorkerState::Idle && w.target.is_some() {
                    w.clear_session_state();
                    w.target = None;
                }
                Ok(())
            })
            .await
    }

    /// Terminate the worker's live session, if it has one, without touching the record
    pub async fn release(&self, worker_id: &str) {
        self.teardown_session(worker_id).await;
    }

    /// Stop an active worker if needed and start it again on its previous target
    pub async fn restart(self: &Arc<Self>, worker_id: &str) -> Result<Worker> {
        let worker = self.get(worker_id).await?;
        let target = worker.target.clone().ok_or_else(|| {
            FleetError::validation(format!("worker '{worker_id}' has no target to restart on"))
        })?;
        let tabs = self.tabs_for_restart(&worker);

        if worker.status == WorkerState::Stopping {
            return Err(FleetError::invalid_state(
                kinds::WORKER,
                worker_id,
                worker.status,
                "restart",
            ));
        }
        if worker.status != WorkerState::Idle {
            self.stop(worker_id).await?;
        }
        self.relaunch(worker_id, &target, tabs).await
    }

    /// Assign `target` and start with `tabs` tabs; used after a stop cleared the target
    pub async fn relaunch(self: &Arc<Self>, worker_id: &str, target: &str, tabs: u32) -> Result<Worker> {
        self.assign_target(worker_id, target).await?;
        self.start(worker_id, Some(tabs)).await
    }

    pub fn tabs_for_restart(&self, worker: &Worker) -> u32 {
        let requested = if worker.requested_tabs > 0 {
            worker.requested_tabs
        } else {
            self.config.fleet.default_tabs
        };
        requested.clamp(MIN_TABS, self.config.fleet.max_tabs)
    }

    /// Open one more tab, reusing the first closed slot
    pub async fn add_tab(&self, worker_id: &str) -> Result<Worker> {
        let worker = self.get(worker_id).await?;
        let handle = self.serving_handle(&worker, "add tab")?;
        let max_tabs = self.config.fleet.max_tabs;

        let mut index = 0;
        let reserved = self
            .coordinator
            .update::<Worker, _>(worker_id, |w| {
                if !w.status.is_serving() {
                    return Err(FleetError::invalid_state(
                        kinds::WORKER,
                        w.id.clone(),
                        w.status,
                        "add tab",
                    ));
                }
                index = match w.tabs.iter().position(|t| t.status == TabState::Closed) {
                    Some(slot) => slot as u32,
                    None if (w.tabs.len() as u32) < max_tabs => {
                        let next = w.tabs.len() as u32;
                        w.tabs.push(Tab::new(next));
                        next
                    }
                    None => {
                        return Err(FleetError::validation(format!(
                            "worker '{}' already has the maximum of {max_tabs} tabs",
                            w.id
                        )))
                    }
                };
                if let Some(tab) = w.tab_mut(index) {
                    tab.status = TabState::Idle;
                    tab.error = None;
                }
                Ok(())
            })
            .await?;

        let target = reserved.target.clone().unwrap_or_default();
        let opened = within(
            self.config.timeouts.session_start(),
            self.driver.open_tab(&handle, index, &target),
            || DriverFault::timeout(format!("opening tab {index} timed out")),
        )
        .await;

        let updated = self
            .coordinator
            .update::<Worker, _>(worker_id, |w| {
                match &opened {
                    Ok(()) => {
                        if let Some(tab) = w.tab_mut(index) {
                            tab.mark_ready();
                        }
                        w.activate_tab(index);
                        w.push_log(LogLevel::Info, format!("tab {index} added"));
                    }
                    Err(fault) => {
                        if let Some(tab) = w.tab_mut(index) {
                            tab.mark_failed(fault.message.clone());
                        }
                        w.push_log(LogLevel::Warn, format!("tab {index} failed to open: {fault}"));
                    }
                }
                Ok(())
            })
            .await?;

        match opened {
            Ok(()) => Ok(updated),
            Err(fault) => Err(FleetError::upstream(DRIVER, fault.to_string())),
        }
    }

    /// Close one tab; the last open tab can only go away by stopping the worker
    pub async fn close_tab(&self, worker_id: &str, index: u32) -> Result<Worker> {
        let worker = self
            .coordinator
            .update::<Worker, _>(worker_id, |w| {
                if !w.status.is_serving() {
                    return Err(FleetError::invalid_state(
                        kinds::WORKER,
                        w.id.clone(),
                        w.status,
                        "close tab",
                    ));
                }
                let Some(tab) = w.tab(index) else {
                    return Err(FleetError::validation(format!("tab {index} does not exist")));
                };
                if tab.status == TabState::Closed {
                    return Err(FleetError::validation(format!("tab {index} is already closed")));
                }

                let remaining_live = w.live_tab_count() - usize::from(tab.status.is_live());
                if w.open_tab_count() <= 1 || remaining_live == 0 {
                    return Err(FleetError::invalid_state(
                        kinds::WORKER,
                        w.id.clone(),
                        w.status,
                        "close its last open tab",
                    ));
                }

                if let Some(tab) = w.tab_mut(index) {
                    tab.mark_closed();
                }
                w.deactivate_tab(index);
                if index == 0 {
                    w.mirror_primary_tab();
                }
                w.push_log(LogLevel::Info, format!("tab {index} closed"));
                Ok(())
            })
            .await?;

        if let Some(handle) = self.registry.handle(worker_id) {
            let closed = within(
                self.config.timeouts.probe(),
                self.driver.close_tab(&handle, index),
                || DriverFault::timeout(format!("closing tab {index} timed out")),
            )
            .await;
            if let Err(fault) = closed {
                warn!(worker_id = %worker_id, tab = index, error = %fault, "🗂️ WORKER: Driver failed to close tab");
            }
        }
        Ok(worker)
    }

    /// Capture a tab and remember the artifact on it
    pub async fn capture(&self, worker_id: &str, index: u32) -> Result<ArtifactRef> {
        let worker = self.get(worker_id).await?;
        let handle = self.serving_handle(&worker, "capture")?;
        match worker.tab(index) {
            Some(tab) if tab.status.is_live() => {}
            Some(tab) => {
                return Err(FleetError::validation(format!(
                    "tab {index} is {} and cannot be captured",
                    tab.status
                )))
            }
            None => return Err(FleetError::validation(format!("tab {index} does not exist"))),
        }

        let artifact = within(
            self.config.timeouts.probe(),
            self.driver.capture(&handle, index),
            || DriverFault::timeout(format!("capturing tab {index} timed out")),
        )
        .await
        .map_err(|fault| FleetError::upstream(DRIVER, fault.to_string()))?;

        self.coordinator
            .update::<Worker, _>(worker_id, |w| {
                if let Some(tab) = w.tab_mut(index) {
                    tab.last_capture = Some(artifact.clone());
                }
                Ok(())
            })
            .await?;
        Ok(artifact)
    }

    /// Route a driver fault observed on a live worker into recovery
    pub async fn handle_fault(self: &Arc<Self>, worker_id: &str, fault: DriverFault) -> Result<RecoveryAction> {
        let mut failure_count = 0;
        let worker = self
            .coordinator
            .update::<Worker, _>(worker_id, |w| {
                if !w.status.is_active() {
                    return Ok(());
                }
                if RecoveryPolicy::counts_as_detection(fault.kind) {
                    w.failure_count += 1;
                }
                failure_count = w.failure_count;
                w.push_log(LogLevel::Warn, format!("session fault: {fault}"));
                Ok(())
            })
            .await?;

        if !worker.status.is_active() {
            return Ok(RecoveryAction::Ignore);
        }

        let action = self.recovery.classify(&fault, failure_count);
        match action {
            RecoveryAction::Restart { rotate_identity } => {
                warn!(
                    worker_id = %worker_id,
                    fault = %fault,
                    failure_count,
                    rotate_identity,
                    "♻️ WORKER: Scheduling recovery restart"
                );
                self.schedule_restart(worker_id, worker.start_attempt);
            }
            RecoveryAction::Ignore => {
                debug!(worker_id = %worker_id, fault = %fault, "♻️ WORKER: Ignoring transient fault");
            }
            RecoveryAction::Fail => {
                self.fail_worker(worker_id, &fault.to_string()).await?;
            }
        }
        Ok(action)
    }

    /// Move an active worker to error and release its session
    pub async fn fail_worker(&self, worker_id: &str, message: &str) -> Result<Worker> {
        let worker = self
            .coordinator
            .update::<Worker, _>(worker_id, |w| {
                if !w.status.is_active() {
                    return Ok(());
                }
                transition(w, &WorkerEvent::fail_with_error(message), "fail")?;
                w.push_log(LogLevel::Error, message);
                Ok(())
            })
            .await?;

        self.teardown_session(worker_id).await;
        if let Some(target) = &worker.target {
            if let Err(e) = self.streams.detach(target, worker_id).await {
                warn!(worker_id = %worker_id, error = %e, "🛑 WORKER: Failed to detach from stream");
            }
        }
        Ok(worker)
    }

    /// Restart once after the restart delay, unless the worker left `start_attempt`
    /// or stopped being active in the meantime
    pub fn schedule_restart(self: &Arc<Self>, worker_id: &str, start_attempt: u64) {
        self.spawn_restart(worker_id, start_attempt, WorkerState::is_active);
    }

    /// Retry a start that failed on a blocked condition after the restart delay
    ///
    /// The retry only happens while the worker is still in `error` from that attempt.
    /// Once the failure counter exceeds the threshold the retry launches with a new
    /// identity.
    pub fn schedule_blocked_retry(self: &Arc<Self>, worker_id: &str, start_attempt: u64) {
        self.spawn_restart(worker_id, start_attempt, |state| *state == WorkerState::Error);
    }

    fn spawn_restart(self: &Arc<Self>, worker_id: &str, start_attempt: u64, eligible: fn(&WorkerState) -> bool) {
        if !self.pending_restarts.insert(worker_id.to_string()) {
            debug!(worker_id = %worker_id, "♻️ WORKER: Restart already pending");
            return;
        }

        let manager = Arc::clone(self);
        let id = worker_id.to_string();
        let delay = self.recovery.restart_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.pending_restarts.remove(&id);

            match manager.coordinator.get::<Worker>(&id).await {
                Ok(Some(worker)) if eligible(&worker.status) && worker.start_attempt == start_attempt => {
                    if let Err(e) = manager.restart(&id).await {
                        warn!(worker_id = %id, error = %e, "♻️ WORKER: Automatic restart failed");
                    }
                }
                Ok(_) => {
                    debug!(worker_id = %id, "♻️ WORKER: Worker moved on, restart skipped");
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "♻️ WORKER: Could not load worker for restart");
                }
            }
        });
    }

    pub fn has_pending_restart(&self, worker_id: &str) -> bool {
        self.pending_restarts.contains(worker_id)
    }

    /// Consume driver session events until shutdown
    ///
    /// Returns `None` if the listener was already started.
    pub fn spawn_event_listener(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let mut events = self.events_rx.lock().take()?;
        let manager = Arc::clone(self);

        Some(tokio::spawn(async move {
            info!("📨 WORKER: Session event listener started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => manager.on_session_event(event).await,
                        None => break,
                    },
                }
            }
            info!("📨 WORKER: Session event listener stopped");
        }))
    }

    async fn on_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Disconnected {
                worker_id,
                session_id,
                reason,
            } => {
                if self.registry.remove_session(&worker_id, &session_id).is_none() {
                    debug!(worker_id = %worker_id, session_id = %session_id, "📨 WORKER: Ignoring disconnect of a released session");
                    return;
                }

                let logged = self
                    .coordinator
                    .update::<Worker, _>(&worker_id, |w| {
                        if w.status.is_active() {
                            w.push_log(LogLevel::Warn, format!("session disconnected: {reason}"));
                        }
                        Ok(())
                    })
                    .await;

                match logged {
                    Ok(worker) if worker.status.is_active() => {
                        warn!(worker_id = %worker_id, reason = %reason, "📨 WORKER: Session disconnected unexpectedly");
                        self.schedule_restart(&worker_id, worker.start_attempt);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(worker_id = %worker_id, error = %e, "📨 WORKER: Failed to record disconnect"),
                }
            }
        }
    }

    /// Stop every worker of a box and delete the records
    pub async fn delete_for_box(&self, box_id: &str) -> Result<usize> {
        let workers = self.list_for_box(box_id).await?;
        for worker in &workers {
            if worker.status.is_active() {
                match self.stop(&worker.id).await {
                    Ok(_) => {}
                    Err(e) if e.is_invalid_state() => {}
                    Err(e) => return Err(e),
                }
            } else {
                self.teardown_session(&worker.id).await;
            }
            self.coordinator.delete::<Worker>(&worker.id).await?;
        }
        Ok(workers.len())
    }

    /// Terminate every registered session; used on shutdown
    pub async fn terminate_all(&self) -> usize {
        let ids = self.registry.worker_ids();
        for id in &ids {
            self.teardown_session(id).await;
        }
        ids.len()
    }

    async fn begin_start(&self, worker_id: &str, tab_count: Option<u32>) -> Result<Worker> {
        let max_tabs = self.config.fleet.max_tabs;
        let requested = tab_count.unwrap_or(self.config.fleet.default_tabs);
        if !(MIN_TABS..=max_tabs).contains(&requested) {
            return Err(FleetError::validation(format!(
                "tab count {requested} is outside 1..={max_tabs}"
            )));
        }

        let worker = self.get(worker_id).await?;
        self.require_box_running(&worker.box_id).await?;

        let worker = self
            .coordinator
            .update::<Worker, _>(worker_id, |w| {
                let target = w
                    .target
                    .clone()
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| {
                        FleetError::validation(format!("worker '{}' has no target assigned", w.id))
                    })?;
                transition(w, &WorkerEvent::Start, "start")?;
                w.clear_session_state();
                w.requested_tabs = requested;
                w.push_log(
                    LogLevel::Info,
                    format!("starting with {requested} tab(s) on {target}"),
                );
                Ok(())
            })
            .await?;

        log_worker_operation(
            "start",
            &worker.id,
            Some(&worker.box_id),
            &worker.status.to_string(),
            Some(&format!("attempt {}", worker.start_attempt)),
        );
        Ok(worker)
    }

    async fn require_box_running(&self, box_id: &str) -> Result<()> {
        let fleet_box = self.coordinator.require::<FleetBox>(box_id).await?;
        if fleet_box.status != BoxState::Running {
            return Err(FleetError::invalid_state(
                kinds::BOX,
                fleet_box.id,
                fleet_box.status,
                "start workers",
            ));
        }
        Ok(())
    }

    fn serving_handle(&self, worker: &Worker, operation: &str) -> Result<SessionHandle> {
        if !worker.status.is_serving() {
            return Err(FleetError::invalid_state(
                kinds::WORKER,
                worker.id.clone(),
                worker.status,
                operation,
            ));
        }
        self.registry.handle(&worker.id).ok_or_else(|| {
            FleetError::invalid_state(
                kinds::WORKER,
                worker.id.clone(),
                "without a live session",
                operation,
            )
        })
    }

    /// Run a bring-up to completion, recording any failure on the worker
    #[instrument(skip(self))]
    async fn bring_up(self: &Arc<Self>, worker_id: &str, attempt: u64) -> WorkerState {
        match self.try_bring_up(worker_id, attempt).await {
            Ok(BringUp { state, blocked }) => {
                if blocked && state == WorkerState::Error {
                    warn!(worker_id = %worker_id, attempt, "♻️ WORKER: Start blocked, scheduling retry");
                    self.schedule_blocked_retry(worker_id, attempt);
                }
                state
            }
            Err(err) => {
                error!(worker_id = %worker_id, attempt, error = %err, "🚀 WORKER: Bring-up failed");
                if let Some(session) = self.registry.get(worker_id) {
                    if session.start_attempt == attempt {
                        self.release_session(worker_id, &session.handle).await;
                    }
                }
                self.fail_attempt(worker_id, attempt, &err.to_string(), false).await
            }
        }
    }

    async fn try_bring_up(&self, worker_id: &str, attempt: u64) -> Result<BringUp> {
        let worker = self.get(worker_id).await?;
        let Some(target) = worker.target.clone() else {
            return Ok(self
                .fail_attempt(worker_id, attempt, "no target assigned", false)
                .await
                .into());
        };
        let requested = worker.requested_tabs.max(MIN_TABS);

        let identity = match worker.identity.clone() {
            Some(identity) if !self.recovery.should_rotate(worker.failure_count) => identity,
            previous => {
                let identity = self.driver.generate_identity().await;
                let rotated = previous.is_some();
                let recorded = self
                    .update_attempt(worker_id, attempt, |w| {
                        w.identity = Some(identity.clone());
                        if rotated {
                            w.push_log(
                                LogLevel::Warn,
                                format!(
                                    "identity rotated after {} blocked failures",
                                    w.failure_count
                                ),
                            );
                        }
                    })
                    .await?;
                if recorded.is_none() {
                    return Ok(self.current_state(worker_id).await.into());
                }
                if rotated {
                    info!(worker_id = %worker_id, identity = %identity.id, "🎭 WORKER: Rotated client identity");
                }
                identity
            }
        };

        let request = LaunchRequest {
            worker_id: worker_id.to_string(),
            identity,
            target: target.clone(),
            events: self.events_tx.clone(),
        };
        let launched = within(
            self.config.timeouts.session_start(),
            self.driver.launch(request),
            || DriverFault::timeout("session launch timed out"),
        )
        .await;

        let handle = match launched {
            Ok(handle) => handle,
            Err(fault) => {
                warn!(worker_id = %worker_id, fault = %fault, "🚀 WORKER: Session launch failed");
                let blocked = fault.kind == FaultKind::Blocked;
                let state = self
                    .fail_attempt(worker_id, attempt, &format!("launch failed: {fault}"), blocked)
                    .await;
                return Ok(BringUp { state, blocked });
            }
        };

        match self
            .registry
            .register(worker_id, LiveSession::new(handle.clone(), attempt))
        {
            Registration::Registered => {}
            Registration::Replaced(stale) => self.terminate(&stale.handle).await,
            Registration::Superseded => {
                self.terminate(&handle).await;
                return Ok(self.current_state(worker_id).await.into());
            }
        }

        if self
            .update_attempt(worker_id, attempt, |w| w.ensure_tabs(requested))
            .await?
            .is_none()
        {
            return Ok(self.abandon(worker_id, &handle).await.into());
        }

        // Sequential on purpose: one coordinated write per tab
        let mut ready = 0;
        let mut blocked_tabs = 0;
        for index in 0..requested {
            let opened = within(
                self.config.timeouts.session_start(),
                self.driver.open_tab(&handle, index, &target),
                || DriverFault::timeout(format!("opening tab {index} timed out")),
            )
            .await;
            match &opened {
                Ok(()) => ready += 1,
                Err(fault) if fault.kind == FaultKind::Blocked => blocked_tabs += 1,
                Err(_) => {}
            }

            let recorded = self
                .update_attempt(worker_id, attempt, |w| match &opened {
                    Ok(()) => {
                        if let Some(tab) = w.tab_mut(index) {
                            tab.mark_ready();
                        }
                        w.activate_tab(index);
                        w.push_log(LogLevel::Info, format!("tab {index} attached"));
                    }
                    Err(fault) => {
                        if let Some(tab) = w.tab_mut(index) {
                            tab.mark_failed(fault.message.clone());
                        }
                        if RecoveryPolicy::counts_as_detection(fault.kind) {
                            w.failure_count += 1;
                        }
                        w.push_log(LogLevel::Warn, format!("tab {index} failed: {fault}"));
                    }
                })
                .await?;
            if recorded.is_none() {
                return Ok(self.abandon(worker_id, &handle).await.into());
            }
        }

        let event = WorkerEvent::TabsInitialized { ready, requested };
        let settled = self
            .update_attempt(worker_id, attempt, |w| {
                if WorkerStateMachine::apply(w, &event).is_err() {
                    return;
                }
                if ready > 0 {
                    let now = Utc::now();
                    w.failure_count = 0;
                    w.started_at = Some(now);
                    w.last_activity_at = Some(now);
                    w.mirror_primary_tab();
                    w.push_log(LogLevel::Info, format!("{ready} of {requested} tabs ready"));
                } else {
                    w.push_log(LogLevel::Error, "no tabs initialised");
                }
            })
            .await?;

        let Some(worker) = settled else {
            return Ok(self.abandon(worker_id, &handle).await.into());
        };

        if worker.status.is_serving() {
            if let Err(e) = self.streams.attach(&target, worker_id).await {
                warn!(worker_id = %worker_id, error = %e, "📡 WORKER: Failed to attach to stream");
            }
            info!(
                worker_id = %worker_id,
                status = %worker.status,
                ready,
                requested,
                "🚀 WORKER: Worker is serving"
            );
        } else {
            self.release_session(worker_id, &handle).await;
        }

        log_worker_operation(
            "bring_up",
            worker_id,
            Some(&worker.box_id),
            &worker.status.to_string(),
            Some(&format!("{ready}/{requested} tabs")),
        );
        Ok(BringUp {
            state: worker.status,
            blocked: ready == 0 && blocked_tabs == requested,
        })
    }

    /// Update the worker only while it is still `starting` for `attempt`
    ///
    /// Returns `None` when the attempt was superseded or the worker is gone.
    async fn update_attempt<F>(&self, worker_id: &str, attempt: u64, mutate: F) -> Result<Option<Worker>>
    where
        F: FnOnce(&mut Worker),
    {
        let mut superseded = false;
        let result = self
            .coordinator
            .update::<Worker, _>(worker_id, |w| {
                if w.status != WorkerState::Starting || w.start_attempt != attempt {
                    superseded = true;
                    return Ok(());
                }
                mutate(w);
                Ok(())
            })
            .await;

        match result {
            Ok(_) if superseded => {
                debug!(worker_id = %worker_id, attempt, "🚀 WORKER: Start attempt superseded");
                Ok(None)
            }
            Ok(worker) => Ok(Some(worker)),
            Err(FleetError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fail_attempt(&self, worker_id: &str, attempt: u64, message: &str, blocked: bool) -> WorkerState {
        let failed = self
            .update_attempt(worker_id, attempt, |w| {
                if blocked {
                    w.failure_count += 1;
                }
                if WorkerStateMachine::apply(w, &WorkerEvent::fail_with_error(message)).is_ok() {
                    w.push_log(LogLevel::Error, message);
                }
            })
            .await;

        match failed {
            Ok(Some(worker)) => worker.status,
            Ok(None) => self.current_state(worker_id).await,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "🚀 WORKER: Could not record start failure");
                WorkerState::Error
            }
        }
    }

    async fn current_state(&self, worker_id: &str) -> WorkerState {
        match self.coordinator.get::<Worker>(worker_id).await {
            Ok(Some(worker)) => worker.status,
            _ => WorkerState::Idle,
        }
    }

    /// Give up a superseded bring-up and report the state that superseded it
    async fn abandon(&self, worker_id: &str, handle: &SessionHandle) -> WorkerState {
        debug!(worker_id = %worker_id, session_id = %handle.session_id, "🚀 WORKER: Abandoning superseded bring-up");
        self.release_session(worker_id, handle).await;
        self.current_state(worker_id).await
    }

    /// Terminate `handle` if it is still the worker's registered session
    async fn release_session(&self, worker_id: &str, handle: &SessionHandle) {
        if let Some(session) = self.registry.remove_session(worker_id, &handle.session_id) {
            self.terminate(&session.handle).await;
        }
    }

    async fn teardown_session(&self, worker_id: &str) {
        if let Some(session) = self.registry.remove(worker_id) {
            self.terminate(&session.handle).await;
        }
    }

    async fn terminate(&self, handle: &SessionHandle) {
        let stop_timeout = self.config.timeouts.session_stop();
        let terminated = within(stop_timeout, self.driver.terminate(handle), || {
            DriverFault::timeout(format!(
                "terminate timed out after {}ms",
                stop_timeout.as_millis()
            ))
        })
        .await;
        if let Err(fault) = terminated {
            warn!(
                worker_id = %handle.worker_id,
                session_id = %handle.session_id,
                fault = %fault,
                "🛑 WORKER: Session did not terminate cleanly"
            );
        }
    }
}

#[async_trait]
impl WorkerStarter for Arc<WorkerLifecycleManager> {
    async fn start_worker(&self, worker_id: &str) -> StartOutcome {
        match self.start_and_wait(worker_id, None).await {
            Ok(state) if state.is_serving() => StartOutcome::Started {
                worker_id: worker_id.to_string(),
                state,
            },
            Ok(state) => {
                let error = match self.coordinator.get::<Worker>(worker_id).await {
                    Ok(Some(worker)) => worker.error_message,
                    _ => None,
                };
                StartOutcome::Failed {
                    worker_id: worker_id.to_string(),
                    error: error.unwrap_or_else(|| format!("worker ended start in {state}")),
                }
            }
            Err(e) => StartOutcome::Failed {
                worker_id: worker_id.to_string(),
                error: e.to_string(),
            },
        }
    }
}

