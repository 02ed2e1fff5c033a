//! Resource monitor: sampling, fallback estimates, evictions and memory sweeps

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::FleetHarness;
use fleet_core::models::{ResourceLimits, Worker};
use fleet_core::orchestration::BoxUpdate;
use fleet_core::state_machine::WorkerState;
use fleet_core::upstream::DriverFault;
use std::time::Duration;

async fn set_last_activity(harness: &FleetHarness, worker_id: &str, minutes_ago: i64) {
    harness
        .fleet
        .coordinator()
        .update::<Worker, _>(worker_id, |w| {
            w.last_activity_at = Some(Utc::now() - ChronoDuration::minutes(minutes_ago));
            Ok(())
        })
        .await
        .expect("activity recorded");
}

/// Poll until no eviction of the worker is in progress and it is serving again
async fn wait_for_eviction(harness: &FleetHarness, worker_id: &str, after_attempt: u64) -> Worker {
    for _ in 0..200 {
        let worker = harness.worker(worker_id).await;
        if !harness.fleet.monitor().is_evicting(worker_id)
            && worker.start_attempt > after_attempt
            && worker.status.is_serving()
        {
            return worker;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("worker {worker_id} was not restarted after eviction");
}

#[tokio::test(start_paused = true)]
async fn test_memory_sweep_thresholds() {
    let harness = FleetHarness::new();
    let fleet_box = harness.create_box("sleepy", 3).await;
    harness.start_box_and_settle(&fleet_box.id).await;

    let workers = harness.fleet.list_workers(&fleet_box.id).await.unwrap();
    let (idle_45, idle_90, idle_10) = (&workers[0].id, &workers[1].id, &workers[2].id);
    set_last_activity(&harness, idle_45, 45).await;
    set_last_activity(&harness, idle_90, 90).await;
    set_last_activity(&harness, idle_10, 10).await;

    // Below the memory threshold only workers idle for twice the timeout go
    harness.memory.set(1_024.0);
    let stopped = harness.fleet.monitor().memory_sweep_once().await.unwrap();
    assert_eq!(stopped, 1);
    assert_eq!(harness.worker(idle_90).await.status, WorkerState::Idle);
    assert_eq!(harness.worker(idle_45).await.status, WorkerState::Running);

    // Above it every worker idle beyond the timeout goes
    harness.memory.set(5_000.0);
    let stopped = harness.fleet.monitor().memory_sweep_once().await.unwrap();
    assert_eq!(stopped, 1);
    assert_eq!(harness.worker(idle_45).await.status, WorkerState::Idle);
    assert_eq!(harness.worker(idle_10).await.status, WorkerState::Running);

    let metrics = harness.fleet.monitor_metrics();
    assert_eq!(metrics.sweeps, 2);
    assert_eq!(metrics.workers_stopped, 2);
    assert_eq!(harness.driver.live_sessions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_process_memory_only_stops_very_idle_workers() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;
    set_last_activity(&harness, &worker.id, 45).await;

    let stopped = harness.fleet.monitor().memory_sweep_once().await.unwrap();
    assert_eq!(stopped, 0);
    assert_eq!(harness.worker(&worker.id).await.status, WorkerState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_sampling_records_usage_and_playback() {
    let harness = FleetHarness::new();
    let (fleet_box, worker) = harness.running_worker(2).await;
    set_last_activity(&harness, &worker.id, 20).await;

    harness.fleet.monitor().sample_once().await.unwrap();

    let sampled = harness.worker(&worker.id).await;
    assert!(!sampled.resource_usage.estimated);
    assert_eq!(sampled.resource_usage.memory_mb, 350.0);
    assert!(sampled.playback.as_ref().is_some_and(|p| p.is_playing));
    assert!(sampled.tabs.iter().all(|t| t.playback.is_some()));
    // A playing tab counts as activity
    let activity = sampled.last_activity_at.expect("activity");
    assert!(Utc::now() - activity < ChronoDuration::minutes(1));

    let sampled_box = harness.fleet_box(&fleet_box.id).await;
    assert_eq!(sampled_box.resource_usage.memory_mb, 350.0);
    assert_eq!(harness.fleet.monitor_metrics().checks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_usage_falls_back_to_estimate_then_last_known() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(2).await;
    let monitor = harness.fleet.monitor();

    harness.driver.set_usage_unavailable(true);
    monitor.sample_once().await.unwrap();
    let estimated = harness.worker(&worker.id).await.resource_usage;
    assert!(estimated.estimated);
    assert_eq!(estimated.memory_mb, 180.0 + 2.0 * 120.0);

    harness.driver.set_usage_unavailable(false);
    monitor.sample_once().await.unwrap();
    let measured = harness.worker(&worker.id).await.resource_usage;
    assert!(!measured.estimated);
    assert_eq!(measured.memory_mb, 350.0);

    harness.driver.set_usage_unavailable(true);
    monitor.sample_once().await.unwrap();
    let carried = harness.worker(&worker.id).await.resource_usage;
    assert!(carried.estimated);
    assert_eq!(carried.memory_mb, 350.0);
}

#[tokio::test(start_paused = true)]
async fn test_hard_limit_eviction_rotates_identity_after_cooldown() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;
    harness
        .fleet
        .coordinator()
        .update::<Worker, _>(&worker.id, |w| {
            w.failure_count = 4;
            Ok(())
        })
        .await
        .unwrap();

    // Worker limit is 1024 MB; 2000 MB is beyond the 1.5x hard multiplier
    harness.driver.set_memory(&worker.id, 2_000.0);
    let began = tokio::time::Instant::now();
    harness.fleet.monitor().sample_once().await.unwrap();

    let logged = harness.worker(&worker.id).await;
    assert!(logged.logs.iter().any(|e| e.message.contains("exceeds limit")));

    let restarted = wait_for_eviction(&harness, &worker.id, worker.start_attempt).await;
    assert!(began.elapsed() >= Duration::from_secs(5));
    assert_eq!(restarted.status, WorkerState::Running);
    assert_eq!(restarted.failure_count, 0);
    assert_eq!(
        harness.driver.launched_identities(&worker.id),
        vec!["identity-1", "identity-2"]
    );

    let metrics = harness.fleet.monitor_metrics();
    assert_eq!(metrics.evictions, 1);
    assert_eq!(metrics.workers_stopped, 1);
    assert_eq!(metrics.memory_recovered_mb, 2_000.0);
}

#[tokio::test(start_paused = true)]
async fn test_soft_violation_only_warns() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;

    harness.driver.set_memory(&worker.id, 1_200.0);
    harness.fleet.monitor().sample_once().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let sampled = harness.worker(&worker.id).await;
    assert_eq!(sampled.status, WorkerState::Running);
    assert_eq!(sampled.start_attempt, worker.start_attempt);
    assert!(sampled.logs.iter().any(|e| e.message.contains("exceeds limit")));
    assert_eq!(harness.fleet.monitor_metrics().evictions, 0);
}

#[tokio::test(start_paused = true)]
async fn test_blocked_probe_routes_into_recovery() {
    let harness = FleetHarness::new();
    let (_, worker) = harness.running_worker(1).await;

    harness
        .driver
        .inject_probe_fault(&worker.id, DriverFault::blocked("challenge page"));
    harness.fleet.monitor().sample_once().await.unwrap();

    let flagged = harness.worker(&worker.id).await;
    assert_eq!(flagged.failure_count, 1);
    assert!(harness.fleet.workers().has_pending_restart(&worker.id));
}

#[tokio::test(start_paused = true)]
async fn test_box_over_hard_limit_evicts_heaviest_worker() {
    let harness = FleetHarness::new();
    let fleet_box = harness.create_box("crowded", 3).await;
    harness
        .fleet
        .update_box(
            &fleet_box.id,
            BoxUpdate {
                resource_limits: Some(ResourceLimits {
                    cpu_percent: 400.0,
                    memory_mb: 500.0,
                    network_mbps: 100.0,
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    harness.start_box_and_settle(&fleet_box.id).await;

    let workers = harness.fleet.list_workers(&fleet_box.id).await.unwrap();
    let heaviest = workers[1].clone();
    harness.driver.set_memory(&heaviest.id, 600.0);

    harness.fleet.monitor().sample_once().await.unwrap();
    let sampled_box = harness.fleet_box(&fleet_box.id).await;
    assert_eq!(sampled_box.resource_usage.memory_mb, 250.0 + 600.0 + 250.0);

    let restarted = wait_for_eviction(&harness, &heaviest.id, heaviest.start_attempt).await;
    assert_eq!(restarted.status, WorkerState::Running);
    assert_eq!(harness.fleet.monitor_metrics().evictions, 1);

    for other in workers.iter().filter(|w| w.id != heaviest.id) {
        assert_eq!(harness.worker(&other.id).await.start_attempt, other.start_attempt);
    }
}
