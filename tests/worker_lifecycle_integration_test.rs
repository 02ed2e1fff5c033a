//! Worker lifecycle: tabs, captures, faults, recovery and superseded starts

mod common;

use common::{FleetHarness, TARGET};
use fleet_core::models::Worker;
use fleet_core::orchestration::RecoveryAction;
use fleet_core::state_machine::{TabState, WorkerState};
use fleet_core::upstream::{DriverFault, FaultKind};
use fleet_core::FleetError;
use std::time::Duration;

/// Poll until the worker is serving on a start attempt newer than `after_attempt`
async fn wait_for_restart(harness: &FleetHarness, worker_id: &str, after_attempt: u64) -> Worker {
    for _ in 0..600 {
        let worker = harness.worker(worker_id).await;
        if worker.start_attempt > after_attempt && worker.status.is_serving() {
            return worker;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("worker {worker_id} was not restarted");
}

#[tokio::test(start_paused = true)]
async fn test_closing_last_open_tab_is_refused() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;

    let refused = harness.fleet.close_tab(&worker.id, 0).await;
    assert!(matches!(refused, Err(FleetError::InvalidState { .. })));

    let unchanged = harness.worker(&worker.id).await;
    assert_eq!(unchanged.tabs, worker.tabs);
    assert_eq!(unchanged.active_tabs, vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_close_then_add_reuses_slot() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(2).await;
    assert_eq!(worker.tabs.len(), 2);

    let closed = harness.fleet.close_tab(&worker.id, 1).await.unwrap();
    assert_eq!(closed.tabs[1].status, TabState::Closed);
    assert_eq!(closed.active_tabs, vec![0]);

    let reopened = harness.fleet.add_tab(&worker.id).await.unwrap();
    assert_eq!(reopened.tabs.len(), 2);
    assert_eq!(reopened.tabs[1].status, TabState::Running);
    assert!(reopened.active_tabs.contains(&1));

    // Third tab is new, a fourth exceeds fleet.max_tabs
    let grown = harness.fleet.add_tab(&worker.id).await.unwrap();
    assert_eq!(grown.tabs.len(), 3);
    let refused = harness.fleet.add_tab(&worker.id).await;
    assert!(matches!(refused, Err(FleetError::Validation(_))));
}

#[tokio::test(start_paused = true)]
async fn test_failed_tab_yields_partial() {
    let harness = FleetHarness::new();
    harness.driver.fail_tab(1, FaultKind::Other);

    let (_, worker) = harness.running_worker(3).await;
    assert_eq!(worker.status, WorkerState::Partial);
    assert_eq!(worker.tabs[1].status, TabState::Error);
    assert!(worker.tabs[1].error.is_some());
    assert_eq!(worker.active_tabs.len(), 2);
    assert!(!worker.active_tabs.contains(&1));
    assert_eq!(worker.failure_count, 0);
    assert!(harness.driver.has_session(&worker.id));
}

#[tokio::test(start_paused = true)]
async fn test_no_ready_tabs_fails_start_and_releases_session() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;
    harness.fleet.stop_worker(&worker.id).await.unwrap();

    for index in 0..3 {
        harness.driver.fail_tab(index, FaultKind::Other);
    }
    harness.fleet.assign_target(&worker.id, TARGET).await.unwrap();
    let state = harness
        .fleet
        .workers()
        .start_and_wait(&worker.id, Some(3))
        .await
        .unwrap();

    assert_eq!(state, WorkerState::Error);
    let failed = harness.worker(&worker.id).await;
    assert!(failed
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("none of 3")));
    assert!(!harness.driver.has_session(&worker.id));
    assert!(harness.fleet.workers().registry().handle(&worker.id).is_none());
    assert!(!harness.fleet.workers().has_pending_restart(&worker.id));
}

#[tokio::test(start_paused = true)]
async fn test_all_tabs_blocked_schedules_retry() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;
    harness.fleet.stop_worker(&worker.id).await.unwrap();

    for index in 0..3 {
        harness.driver.fail_tab(index, FaultKind::Blocked);
    }
    harness.fleet.assign_target(&worker.id, TARGET).await.unwrap();
    let workers = harness.fleet.workers();
    let state = workers.start_and_wait(&worker.id, Some(3)).await.unwrap();

    assert_eq!(state, WorkerState::Error);
    let blocked = harness.worker(&worker.id).await;
    assert_eq!(blocked.failure_count, 3);
    assert!(workers.has_pending_restart(&worker.id));

    harness.driver.clear_tab_failures();
    let recovered = wait_for_restart(&harness, &worker.id, blocked.start_attempt).await;
    assert_eq!(recovered.status, WorkerState::Running);
    assert_eq!(recovered.active_tabs.len(), 3);
    assert_eq!(recovered.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_and_start_guards() {
    let harness = FleetHarness::new();
    let (fleet_box, worker) = harness.running_worker(1).await;

    let double_start = harness.fleet.start_worker(&worker.id, None).await;
    assert!(matches!(double_start, Err(FleetError::InvalidState { .. })));

    let too_many_tabs = harness.fleet.start_worker(&worker.id, Some(4)).await;
    assert!(matches!(too_many_tabs, Err(FleetError::Validation(_))));
    let no_tabs = harness.fleet.start_worker(&worker.id, Some(0)).await;
    assert!(matches!(no_tabs, Err(FleetError::Validation(_))));

    let stopped = harness.fleet.stop_worker(&worker.id).await.unwrap();
    assert_eq!(stopped.status, WorkerState::Idle);
    assert!(stopped.target.is_none());

    let again = harness.fleet.stop_worker(&worker.id).await;
    assert!(matches!(again, Err(FleetError::InvalidState { .. })));

    // Stopping cleared the target
    let untargeted = harness.fleet.start_worker(&worker.id, None).await;
    assert!(matches!(untargeted, Err(FleetError::Validation(_))));

    harness.fleet.stop_box(&fleet_box.id).await.unwrap();
    harness.fleet.assign_target(&worker.id, TARGET).await.unwrap();
    let box_idle = harness.fleet.start_worker(&worker.id, None).await;
    assert!(matches!(box_idle, Err(FleetError::InvalidState { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_capture_records_artifact_on_tab() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(2).await;

    let artifact = harness.fleet.capture(&worker.id, 1).await.unwrap();
    assert!(artifact.starts_with("capture://"));

    let captured = harness.worker(&worker.id).await;
    assert_eq!(captured.tabs[1].last_capture.as_deref(), Some(artifact.as_str()));
    assert!(captured.tabs[0].last_capture.is_none());

    harness.fleet.close_tab(&worker.id, 1).await.unwrap();
    let closed = harness.fleet.capture(&worker.id, 1).await;
    assert!(matches!(closed, Err(FleetError::Validation(_))));
    let missing = harness.fleet.capture(&worker.id, 7).await;
    assert!(matches!(missing, Err(FleetError::Validation(_))));
}

#[tokio::test(start_paused = true)]
async fn test_blocked_launches_retry_then_rotate_identity() {
    let harness = FleetHarness::new();
    harness.driver.block_next_launches(4);
    let fleet_box = harness.create_box("blocked", 1).await;
    harness.start_box_and_settle(&fleet_box.id).await;

    let worker = harness
        .fleet
        .list_workers(&fleet_box.id)
        .await
        .unwrap()
        .pop()
        .expect("one worker");
    assert_eq!(worker.status, WorkerState::Error);
    assert_eq!(worker.failure_count, 1);
    assert!(harness.fleet.workers().has_pending_restart(&worker.id));

    // Three retries keep the identity; the counter then exceeds the threshold
    let began = tokio::time::Instant::now();
    let recovered = wait_for_restart(&harness, &worker.id, worker.start_attempt).await;
    assert!(began.elapsed() >= Duration::from_secs(20));
    assert_eq!(recovered.status, WorkerState::Running);
    assert_eq!(recovered.start_attempt, worker.start_attempt + 4);

    let identities = harness.driver.launched_identities(&worker.id);
    assert_eq!(
        identities,
        vec!["identity-1", "identity-1", "identity-1", "identity-1", "identity-2"]
    );
    assert_eq!(recovered.failure_count, 0);
    assert_eq!(recovered.identity.map(|i| i.id).as_deref(), Some("identity-2"));
    assert_eq!(recovered.target.as_deref(), Some(TARGET));
    assert!(recovered
        .logs
        .iter()
        .any(|e| e.message.contains("identity rotated")));
    assert!(!harness.fleet.workers().has_pending_restart(&worker.id));
}

#[tokio::test(start_paused = true)]
async fn test_stopping_blocked_worker_drops_its_retry() {
    let harness = FleetHarness::new();
    harness.driver.block_next_launches(1);
    let fleet_box = harness.create_box("blocked", 1).await;
    harness.start_box_and_settle(&fleet_box.id).await;

    let worker = harness
        .fleet
        .list_workers(&fleet_box.id)
        .await
        .unwrap()
        .pop()
        .expect("one worker");
    assert_eq!(worker.status, WorkerState::Error);

    let stopped = harness.fleet.stop_worker(&worker.id).await.unwrap();
    assert_eq!(stopped.status, WorkerState::Idle);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let settled = harness.worker(&worker.id).await;
    assert_eq!(settled.status, WorkerState::Idle);
    assert_eq!(settled.start_attempt, worker.start_attempt);
    assert_eq!(harness.driver.launch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unrecorded_stop_moves_worker_to_error() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;
    let workers = harness.fleet.workers();

    workers.begin_stop(&worker.id).await.unwrap();
    harness.flaky.fail_writes("worker", 1);
    let failed = workers.finish_stop(&worker.id).await;
    assert!(matches!(failed, Err(FleetError::Store(_))));

    let errored = harness.worker(&worker.id).await;
    assert_eq!(errored.status, WorkerState::Error);
    assert!(errored
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("stop incomplete")));
    assert!(!harness.driver.has_session(&worker.id));

    let stopped = harness.fleet.stop_worker(&worker.id).await.unwrap();
    assert_eq!(stopped.status, WorkerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_triggers_restart_after_delay() {
    let harness = FleetHarness::new();
    harness.fleet.start();
    let (_, worker) = harness.running_worker(2).await;

    assert!(harness.driver.disconnect(&worker.id, "renderer crashed"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(harness.fleet.workers().has_pending_restart(&worker.id));
    assert_eq!(harness.worker(&worker.id).await.start_attempt, worker.start_attempt);

    let restarted = wait_for_restart(&harness, &worker.id, worker.start_attempt).await;
    assert_eq!(restarted.status, WorkerState::Running);
    assert_eq!(restarted.target.as_deref(), Some(TARGET));
    assert_eq!(restarted.requested_tabs, 2);
    assert!(harness.driver.has_session(&worker.id));
    assert!(!harness.fleet.workers().has_pending_restart(&worker.id));

    harness.fleet.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_slow_launch_wins() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;
    harness.fleet.stop_worker(&worker.id).await.unwrap();

    harness.driver.set_launch_delay(Duration::from_secs(10));
    harness.fleet.assign_target(&worker.id, TARGET).await.unwrap();
    let starting = harness.fleet.start_worker(&worker.id, Some(1)).await.unwrap();
    assert_eq!(starting.status, WorkerState::Starting);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stopped = harness.fleet.stop_worker(&worker.id).await.unwrap();
    assert_eq!(stopped.status, WorkerState::Idle);

    // Let the launch finish; the bring-up must notice it was superseded
    tokio::time::sleep(Duration::from_secs(15)).await;
    let settled = harness.worker(&worker.id).await;
    assert_eq!(settled.status, WorkerState::Idle);
    assert!(settled.tabs.is_empty());
    assert_eq!(harness.driver.live_sessions(), 0);
    assert!(harness.fleet.workers().registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fault_kinds_map_to_recovery_actions() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;
    let workers = harness.fleet.workers();

    let ignored = workers
        .handle_fault(&worker.id, DriverFault::timeout("probe slow"))
        .await
        .unwrap();
    assert_eq!(ignored, RecoveryAction::Ignore);
    assert_eq!(harness.worker(&worker.id).await.status, WorkerState::Running);

    let failed = workers
        .handle_fault(&worker.id, DriverFault::other("renderer gone"))
        .await
        .unwrap();
    assert_eq!(failed, RecoveryAction::Fail);

    let errored = harness.worker(&worker.id).await;
    assert_eq!(errored.status, WorkerState::Error);
    assert!(errored
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("renderer gone")));
    assert!(!harness.driver.has_session(&worker.id));

    // Faults on a worker that is no longer active are ignored
    let late = workers
        .handle_fault(&worker.id, DriverFault::blocked("late"))
        .await
        .unwrap();
    assert_eq!(late, RecoveryAction::Ignore);
    assert_eq!(harness.worker(&worker.id).await.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_crash_fault_schedules_single_restart() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;
    let workers = harness.fleet.workers();

    let first = workers
        .handle_fault(&worker.id, DriverFault::crashed("tab crashed"))
        .await
        .unwrap();
    assert_eq!(first, RecoveryAction::Restart { rotate_identity: false });
    workers
        .handle_fault(&worker.id, DriverFault::crashed("tab crashed again"))
        .await
        .unwrap();
    assert!(workers.has_pending_restart(&worker.id));

    let restarted = wait_for_restart(&harness, &worker.id, worker.start_attempt).await;
    assert_eq!(restarted.start_attempt, worker.start_attempt + 1);
    assert_eq!(harness.driver.launch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_manual_restart_keeps_target_and_tabs() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(2).await;

    let restarting = harness.fleet.restart_worker(&worker.id).await.unwrap();
    assert_eq!(restarting.status, WorkerState::Starting);
    assert_eq!(restarting.requested_tabs, 2);

    let restarted = wait_for_restart(&harness, &worker.id, worker.start_attempt).await;
    assert_eq!(restarted.target.as_deref(), Some(TARGET));
    assert_eq!(restarted.active_tabs.len(), 2);
    assert_eq!(harness.driver.live_sessions(), 1);
}
