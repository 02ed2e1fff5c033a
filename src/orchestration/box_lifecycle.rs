//! # Box Lifecycle Manager
//!
//! Owns egress acquisition and teardown for boxes and provisions the box's workers.
//! `start` returns once the box is `starting`; egress, provisioning and the batched
//! worker bring-up continue in a background task that `stop` cancels and awaits before
//! tearing anything down.

use super::scheduler::{StartupReport, StartupScheduler};
use super::streams::StreamDirectory;
use super::worker_lifecycle::WorkerLifecycleManager;
use super::within;
use crate::config::FleetConfig;
use crate::constants::{kinds, MAX_WORKERS_PER_BOX, MIN_WORKERS_PER_BOX};
use crate::error::{FleetError, Result};
use crate::logging::{log_box_operation, log_error};
use crate::models::{FleetBox, ResourceLimits, Worker};
use crate::persistence::PersistenceCoordinator;
use crate::state_machine::{BoxEvent, BoxState, BoxStateMachine, WorkerState};
use crate::upstream::{EgressError, EgressProvider};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const EGRESS: &str = "egress_provider";

/// Input for [`BoxLifecycleManager::create`]
#[derive(Debug, Clone, Default)]
pub struct NewBox {
    pub name: String,
    pub egress_profile: String,
    /// Defaults to `fleet.viewers_per_box`
    pub worker_count: Option<u32>,
    pub target: Option<String>,
    pub resource_limits: Option<ResourceLimits>,
}

/// Partial update for [`BoxLifecycleManager::update`]; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct BoxUpdate {
    pub name: Option<String>,
    pub egress_profile: Option<String>,
    pub worker_count: Option<u32>,
    pub target: Option<String>,
    pub resource_limits: Option<ResourceLimits>,
}

struct StartOperation {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct BoxLifecycleManager {
    coordinator: Arc<PersistenceCoordinator>,
    workers: Arc<WorkerLifecycleManager>,
    egress: Arc<dyn EgressProvider>,
    streams: Arc<StreamDirectory>,
    scheduler: StartupScheduler,
    config: Arc<FleetConfig>,
    operations: DashMap<String, StartOperation>,
    last_reports: DashMap<String, StartupReport>,
}

impl std::fmt::Debug for BoxLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxLifecycleManager")
            .field("in_flight_starts", &self.operations.len())
            .finish_non_exhaustive()
    }
}

fn transition(fleet_box: &mut FleetBox, event: &BoxEvent, operation: &str) -> Result<BoxState> {
    let from = fleet_box.status;
    BoxStateMachine::apply(fleet_box, event)
        .map_err(|_| FleetError::invalid_state(kinds::BOX, fleet_box.id.clone(), from, operation))
}

fn validate_worker_count(count: u32) -> Result<()> {
    if !(MIN_WORKERS_PER_BOX..=MAX_WORKERS_PER_BOX).contains(&count) {
        return Err(FleetError::validation(format!(
            "worker count {count} is outside {MIN_WORKERS_PER_BOX}..={MAX_WORKERS_PER_BOX}"
        )));
    }
    Ok(())
}

fn required_text(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FleetError::validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn egress_failure(operation: &str, err: &EgressError) -> String {
    format!("egress {operation} failed: {err}")
}

impl BoxLifecycleManager {
    pub fn new(
        coordinator: Arc<PersistenceCoordinator>,
        workers: Arc<WorkerLifecycleManager>,
        egress: Arc<dyn EgressProvider>,
        streams: Arc<StreamDirectory>,
        config: Arc<FleetConfig>,
    ) -> Self {
        Self {
            coordinator,
            workers,
            egress,
            streams,
            scheduler: StartupScheduler::new(config.scheduler.clone()),
            config,
            operations: DashMap::new(),
            last_reports: DashMap::new(),
        }
    }

    pub async fn get(&self, box_id: &str) -> Result<FleetBox> {
        self.coordinator.require(box_id).await
    }

    pub async fn list(&self) -> Result<Vec<FleetBox>> {
        self.coordinator.all().await
    }

    /// Report of the most recent batched startup of a box, if one finished
    pub fn last_startup_report(&self, box_id: &str) -> Option<StartupReport> {
        self.last_reports.get(box_id).map(|r| r.value().clone())
    }

    /// Whether a background start is still in flight for the box
    pub fn is_starting(&self, box_id: &str) -> bool {
        self.operations
            .get(box_id)
            .is_some_and(|op| !op.task.is_finished())
    }

    pub async fn create(&self, request: NewBox) -> Result<FleetBox> {
        let name = required_text("name", &request.name)?;
        let profile = required_text("egress_profile", &request.egress_profile)?;
        let worker_count = request
            .worker_count
            .unwrap_or(self.config.fleet.viewers_per_box);
        validate_worker_count(worker_count)?;

        let mut fleet_box = FleetBox::new(name, profile, worker_count);
        fleet_box.target = request
            .target
            .map(|t| required_text("target", &t))
            .transpose()?;
        fleet_box.resource_limits = request
            .resource_limits
            .unwrap_or_else(|| self.config.monitor.default_box_limits.clone());

        let created = self.coordinator.insert(fleet_box).await?;
        log_box_operation("create", &created.id, Some(&created.name), &created.status.to_string(), None);
        Ok(created)
    }

    /// Update a settled box; the worker-count target only changes while idle
    pub async fn update(&self, box_id: &str, changes: BoxUpdate) -> Result<FleetBox> {
        let name = changes.name.as_deref().map(|n| required_text("name", n)).transpose()?;
        let profile = changes
            .egress_profile
            .as_deref()
            .map(|p| required_text("egress_profile", p))
            .transpose()?;
        let target = changes
            .target
            .as_deref()
            .map(|t| required_text("target", t))
            .transpose()?;
        if let Some(count) = changes.worker_count {
            validate_worker_count(count)?;
        }

        let updated = self
            .coordinator
            .update::<FleetBox, _>(box_id, |b| {
                if !b.status.is_settled() {
                    return Err(FleetError::invalid_state(kinds::BOX, b.id.clone(), b.status, "update"));
                }
                if let Some(count) = changes.worker_count {
                    if count != b.worker_count && b.status != BoxState::Idle {
                        return Err(FleetError::invalid_state(
                            kinds::BOX,
                            b.id.clone(),
                            b.status,
                            "change its worker count",
                        ));
                    }
                    b.worker_count = count;
                }
                if let Some(name) = name {
                    b.name = name;
                }
                if let Some(profile) = profile {
                    b.egress_profile = profile;
                }
                if let Some(target) = target {
                    b.target = Some(target);
                }
                if let Some(limits) = changes.resource_limits {
                    b.resource_limits = limits;
                }
                Ok(())
            })
            .await?;

        log_box_operation("update", &updated.id, Some(&updated.name), &updated.status.to_string(), None);
        Ok(updated)
    }

    /// Delete a settled box together with its workers
    pub async fn delete(&self, box_id: &str) -> Result<()> {
        let fleet_box = self.get(box_id).await?;
        if !fleet_box.status.is_settled() {
            return Err(FleetError::invalid_state(kinds::BOX, box_id, fleet_box.status, "delete"));
        }

        let removed = self.workers.delete_for_box(box_id).await?;
        self.coordinator.delete::<FleetBox>(box_id).await?;
        self.last_reports.remove(box_id);
        log_box_operation(
            "delete",
            box_id,
            Some(&fleet_box.name),
            "deleted",
            Some(&format!("{removed} workers removed")),
        );
        Ok(())
    }

    /// Move the box to `starting` and continue egress and provisioning in the background
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, box_id: &str) -> Result<FleetBox> {
        let default_target = self.config.fleet.default_target.clone();
        let fleet_box = self
            .coordinator
            .update::<FleetBox, _>(box_id, |b| {
                if b.target.is_none() {
                    b.target = default_target;
                }
                if b.target.is_none() {
                    return Err(FleetError::validation(format!(
                        "box '{}' has no target and no default target is configured",
                        b.id
                    )));
                }
                transition(b, &BoxEvent::Start, "start")?;
                Ok(())
            })
            .await?;

        let cancel = CancellationToken::new();
        let manager = Arc::clone(self);
        let id = fleet_box.id.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            manager.run_start(&id, token).await;
        });
        if let Some(previous) = self
            .operations
            .insert(fleet_box.id.clone(), StartOperation { cancel, task })
        {
            previous.cancel.cancel();
        }

        log_box_operation("start", &fleet_box.id, Some(&fleet_box.name), &fleet_box.status.to_string(), None);
        Ok(fleet_box)
    }

    /// Start and wait for the background start to finish
    pub async fn start_and_wait(self: &Arc<Self>, box_id: &str) -> Result<FleetBox> {
        self.start(box_id).await?;
        self.wait_for_start(box_id).await;
        self.get(box_id).await
    }

    /// Wait for an in-flight background start of the box, if any
    pub async fn wait_for_start(&self, box_id: &str) {
        if let Some((_, operation)) = self.operations.remove(box_id) {
            if let Err(e) = operation.task.await {
                error!(box_id = %box_id, error = %e, "📦 BOX: Start task panicked");
            }
        }
    }

    async fn run_start(&self, box_id: &str, cancel: CancellationToken) {
        if let Err(err) = self.try_run_start(box_id, &cancel).await {
            log_error("box_lifecycle", "start", &err.to_string(), Some(box_id));
            self.fail_if_starting(box_id, &err.to_string()).await;
        }
    }

    async fn try_run_start(&self, box_id: &str, cancel: &CancellationToken) -> Result<()> {
        let fleet_box = self.get(box_id).await?;
        let target = fleet_box
            .target
            .clone()
            .ok_or_else(|| FleetError::validation(format!("box '{box_id}' has no target")))?;

        let connect_timeout = self.config.timeouts.egress_connect();
        let connected = within(
            connect_timeout,
            self.egress.connect(box_id, &fleet_box.egress_profile),
            || EgressError::new(format!("connect timed out after {}ms", connect_timeout.as_millis())),
        )
        .await;

        let assignment = match connected {
            Ok(assignment) => assignment,
            Err(err) => {
                warn!(box_id = %box_id, error = %err, "📦 BOX: Egress connect failed");
                self.fail_if_starting(box_id, &egress_failure("connect", &err)).await;
                return Ok(());
            }
        };
        info!(
            box_id = %box_id,
            address = %assignment.address,
            location = %assignment.location,
            "🌐 BOX: Egress established"
        );

        if cancel.is_cancelled() {
            debug!(box_id = %box_id, "📦 BOX: Start cancelled after egress connect");
            return Ok(());
        }

        let worker_ids = self.provision_workers(&fleet_box, &target).await?;
        self.streams.find_or_create(&target).await?;

        let running = self
            .coordinator
            .update::<FleetBox, _>(box_id, |b| {
                if b.status != BoxState::Starting {
                    return Ok(());
                }
                b.assign_egress(assignment.address.clone(), assignment.location.clone());
                transition(b, &BoxEvent::EgressReady, "finish start")?;
                Ok(())
            })
            .await?;

        if running.status != BoxState::Running {
            debug!(box_id = %box_id, status = %running.status, "📦 BOX: Box left starting before egress was recorded");
            return Ok(());
        }
        log_box_operation(
            "running",
            box_id,
            Some(&running.name),
            &running.status.to_string(),
            Some(&format!("{} workers scheduled", worker_ids.len())),
        );

        let report = self
            .scheduler
            .schedule_startup(worker_ids, &self.workers, cancel)
            .await;
        info!(
            box_id = %box_id,
            started = report.started(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "📦 BOX: Worker startup finished"
        );
        self.last_reports.insert(box_id.to_string(), report);
        Ok(())
    }

    /// Reconcile the box's worker records to its worker-count target
    ///
    /// Exactly one worker (the first) has chat parsing enabled. Every worker is pointed
    /// at the box's target.
    async fn provision_workers(&self, fleet_box: &FleetBox, target: &str) -> Result<Vec<String>> {
        let mut existing = self.workers.list_for_box(&fleet_box.id).await?;
        existing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let wanted = fleet_box.worker_count as usize;
        for surplus in existing.split_off(wanted.min(existing.len())) {
            if surplus.status.is_active() {
                self.workers.stop(&surplus.id).await?;
            }
            self.coordinator.delete::<Worker>(&surplus.id).await?;
        }

        let mut ids = Vec::with_capacity(wanted);
        for (position, worker) in existing.iter().enumerate() {
            let parse_chat = position == 0;
            let refreshed = self
                .coordinator
                .update::<Worker, _>(&worker.id, |w| {
                    w.is_parse_chat_enabled = parse_chat;
                    if matches!(w.status, WorkerState::Idle | WorkerState::Error) {
                        w.target = Some(target.to_string());
                    }
                    Ok(())
                })
                .await?;
            ids.push(refreshed.id);
        }

        for position in existing.len()..wanted {
            let created = self
                .workers
                .create(&fleet_box.id, position == 0, Some(target.to_string()))
                .await?;
            ids.push(created.id);
        }

        debug!(box_id = %fleet_box.id, workers = ids.len(), "📦 BOX: Workers provisioned");
        Ok(ids)
    }

    async fn fail_if_starting(&self, box_id: &str, message: &str) {
        let failed = self
            .coordinator
            .update::<FleetBox, _>(box_id, |b| {
                if b.status == BoxState::Starting {
                    transition(b, &BoxEvent::Fail(message.to_string()), "fail")?;
                }
                Ok(())
            })
            .await;
        match failed {
            Ok(b) if b.status == BoxState::Error => {
                log_box_operation("fail", box_id, Some(&b.name), "error", Some(message));
            }
            Ok(_) => {}
            Err(e) => error!(box_id = %box_id, error = %e, "📦 BOX: Could not record start failure"),
        }
    }

    /// Stop the box: cancel any in-flight start, stop every worker, release egress
    ///
    /// Once the box is `stopping` every step is attempted. A worker that cannot be
    /// stopped does not keep egress connected; the box ends in `error` with the
    /// collected failures instead of `idle`.
    #[instrument(skip(self))]
    pub async fn stop(&self, box_id: &str) -> Result<FleetBox> {
        let stopping = self
            .coordinator
            .update::<FleetBox, _>(box_id, |b| {
                transition(b, &BoxEvent::Stop, "stop")?;
                Ok(())
            })
            .await?;
        log_box_operation("stop", box_id, Some(&stopping.name), &stopping.status.to_string(), None);

        if let Some((_, operation)) = self.operations.remove(box_id) {
            operation.cancel.cancel();
            if let Err(e) = operation.task.await {
                error!(box_id = %box_id, error = %e, "📦 BOX: Start task panicked");
            }
        }

        let mut failures = Vec::new();
        let owned = match self.workers.list_for_box(box_id).await {
            Ok(workers) => workers,
            Err(e) => {
                failures.push(format!("listing workers: {e}"));
                Vec::new()
            }
        };

        let mut stopping_workers = Vec::new();
        for worker in owned {
            match worker.status {
                WorkerState::Stopping => continue,
                WorkerState::Idle => {
                    // Workers the scheduler never started still carry the box target
                    if worker.target.is_some() {
                        if let Err(e) = self.workers.reset_idle(&worker.id).await {
                            failures.push(format!("worker '{}': {e}", worker.id));
                        }
                    }
                    continue;
                }
                _ => {}
            }
            match self.workers.begin_stop(&worker.id).await {
                Ok(_) => stopping_workers.push(worker.id),
                Err(e) if e.is_invalid_state() => {
                    debug!(worker_id = %worker.id, error = %e, "📦 BOX: Worker already stopping");
                }
                Err(e) => {
                    warn!(worker_id = %worker.id, error = %e, "📦 BOX: Worker stop failed");
                    self.workers.release(&worker.id).await;
                    failures.push(format!("worker '{}': {e}", worker.id));
                }
            }
        }

        let disconnect_timeout = self.config.timeouts.egress_disconnect();
        let disconnected = within(disconnect_timeout, self.egress.disconnect(box_id), || {
            EgressError::new(format!(
                "disconnect timed out after {}ms",
                disconnect_timeout.as_millis()
            ))
        })
        .await;

        for worker_id in &stopping_workers {
            if let Err(e) = self.workers.finish_stop(worker_id).await {
                failures.push(format!("worker '{worker_id}': {e}"));
            }
        }

        let event = match &disconnected {
            Err(err) => {
                warn!(box_id = %box_id, error = %err, "📦 BOX: Egress disconnect failed");
                BoxEvent::Fail(egress_failure("disconnect", err))
            }
            Ok(()) if !failures.is_empty() => {
                warn!(box_id = %box_id, failed = failures.len(), "📦 BOX: Stop left workers behind");
                BoxEvent::Fail(format!("stop incomplete: {}", failures.join("; ")))
            }
            Ok(()) => BoxEvent::Stopped,
        };
        let stopped = self
            .coordinator
            .update::<FleetBox, _>(box_id, |b| {
                transition(b, &event, "finish stop")?;
                Ok(())
            })
            .await?;

        log_box_operation(
            "stopped",
            box_id,
            Some(&stopped.name),
            &stopped.status.to_string(),
            Some(&format!("{} workers stopped", stopping_workers.len())),
        );
        Ok(stopped)
    }

    /// Re-query the egress address and location of a running box
    pub async fn refresh_address(&self, box_id: &str) -> Result<FleetBox> {
        let fleet_box = self.get(box_id).await?;
        if fleet_box.status != BoxState::Running {
            return Err(FleetError::invalid_state(
                kinds::BOX,
                box_id,
                fleet_box.status,
                "refresh its address",
            ));
        }

        if self.egress.current_interface(box_id).await.is_none() {
            return Err(FleetError::upstream(EGRESS, format!("box '{box_id}' has no egress interface")));
        }
        let assignment = within(
            self.config.timeouts.egress_connect(),
            self.egress.lookup(box_id),
            || EgressError::new("address lookup timed out"),
        )
        .await
        .map_err(|e| FleetError::upstream(EGRESS, e.message))?;

        self.coordinator
            .update::<FleetBox, _>(box_id, |b| {
                if b.status != BoxState::Running {
                    return Err(FleetError::invalid_state(
                        kinds::BOX,
                        b.id.clone(),
                        b.status,
                        "refresh its address",
                    ));
                }
                b.assign_egress(assignment.address, assignment.location);
                Ok(())
            })
            .await
    }

    /// Cancel every in-flight start; used on shutdown
    pub async fn cancel_all_starts(&self) {
        let ids: Vec<String> = self.operations.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, operation)) = self.operations.remove(&id) {
                operation.cancel.cancel();
                let _ = operation.task.await;
            }
        }
    }
}
