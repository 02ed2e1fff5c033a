//! Persistence coordinator behaviour under concurrent writers

mod common;

use common::FleetHarness;
use fleet_core::constants::WORKER_LOG_CAPACITY;
use fleet_core::models::{LogLevel, Worker};
use fleet_core::FleetError;
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn test_stale_copy_merges_onto_concurrent_write() {
    let harness = FleetHarness::new();
    let coordinator = harness.fleet.coordinator().clone();
    let worker = coordinator
        .insert(Worker::new("box-1", false))
        .await
        .expect("inserted");

    let mut stale = coordinator.load::<Worker>(&worker.id).await.expect("loaded");
    stale.requested_tabs = 3;
    stale.push_log(LogLevel::Info, "from stale writer");

    coordinator
        .update::<Worker, _>(&worker.id, |w| {
            w.target = Some("stream-b".to_string());
            w.push_log(LogLevel::Info, "from concurrent writer");
            Ok(())
        })
        .await
        .expect("concurrent update");

    let saved = coordinator.save(stale).await.expect("merged save");
    assert_eq!(saved.requested_tabs, 3);
    assert_eq!(saved.target.as_deref(), Some("stream-b"));

    let messages: Vec<&str> = saved.logs.iter().map(|e| e.message.as_str()).collect();
    assert!(messages.contains(&"from stale writer"));
    assert!(messages.contains(&"from concurrent writer"));
    assert!(coordinator.stats().conflicts_merged >= 1);
}

#[tokio::test]
async fn test_concurrent_saves_keep_every_change_and_bound_logs() {
    let harness = FleetHarness::new();
    let coordinator = harness.fleet.coordinator().clone();
    let worker = coordinator
        .insert(Worker::new("box-1", false))
        .await
        .expect("inserted");

    let mut writers = Vec::new();
    for writer in 0..15u32 {
        let coordinator = Arc::clone(&coordinator);
        let id = worker.id.clone();
        writers.push(tokio::spawn(async move {
            coordinator
                .update::<Worker, _>(&id, |w| {
                    for entry in 0..10 {
                        w.push_log(LogLevel::Info, format!("writer {writer} entry {entry}"));
                    }
                    if writer == 7 {
                        w.requested_tabs = 2;
                    }
                    if writer == 11 {
                        w.target = Some("stream-c".to_string());
                    }
                    Ok(())
                })
                .await
        }));
    }
    for writer in writers {
        writer.await.expect("joined").expect("update succeeded");
    }

    coordinator
        .update::<Worker, _>(&worker.id, |w| {
            w.push_log(LogLevel::Warn, "final");
            Ok(())
        })
        .await
        .expect("final update");

    let stored: Worker = coordinator.require(&worker.id).await.expect("stored");
    assert_eq!(stored.logs.len(), WORKER_LOG_CAPACITY);
    assert_eq!(stored.logs.last().map(|e| e.message.as_str()), Some("final"));
    let unique: HashSet<&str> = stored.logs.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(unique.len(), WORKER_LOG_CAPACITY);

    assert_eq!(stored.requested_tabs, 2);
    assert_eq!(stored.target.as_deref(), Some("stream-c"));
    // One touch for the insert plus one per committed update
    assert_eq!(stored.update_count, 17);

    let stats = coordinator.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.locked_entities, 0);
}

#[tokio::test(start_paused = true)]
async fn test_injected_conflicts_are_retried_transparently() {
    let harness = FleetHarness::new();
    let coordinator = harness.fleet.coordinator().clone();
    let worker = coordinator
        .insert(Worker::new("box-1", false))
        .await
        .expect("inserted");

    harness.store.conflict_next_writes(2);
    let updated = coordinator
        .update::<Worker, _>(&worker.id, |w| {
            w.requested_tabs = 2;
            Ok(())
        })
        .await
        .expect("retried update");

    assert_eq!(updated.requested_tabs, 2);
    let stats = coordinator.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.exhausted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_conflict_budget_exhaustion_surfaces_conflict() {
    let harness = FleetHarness::new();
    let coordinator = harness.fleet.coordinator().clone();
    let worker = coordinator
        .insert(Worker::new("box-1", false))
        .await
        .expect("inserted");

    harness.store.conflict_next_writes(50);
    let result = coordinator
        .update::<Worker, _>(&worker.id, |w| {
            w.requested_tabs = 2;
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(FleetError::Conflict { attempts: 5, .. })));
    let unchanged: Worker = coordinator.require(&worker.id).await.expect("stored");
    assert_eq!(unchanged.requested_tabs, 0);
}
