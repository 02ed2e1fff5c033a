//! # Persistence Coordinator
//!
//! Serializes writes per entity id and resolves version conflicts by merging the
//! caller's changes onto the reloaded record. Writers for the same id queue behind a
//! fair mutex and are served in arrival order; writers for different ids never wait on
//! each other.
//!
//! ```rust
//! use fleet_core::config::PersistenceConfig;
//! use fleet_core::models::Worker;
//! use fleet_core::persistence::PersistenceCoordinator;
//! use fleet_core::store::{EntityStore, MemoryDocumentStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let store = EntityStore::new(Arc::new(MemoryDocumentStore::new()), Duration::from_secs(5));
//! let coordinator = PersistenceCoordinator::new(store, PersistenceConfig::default());
//!
//! let worker = coordinator.insert(Worker::new("box-1", true)).await?;
//! let updated = coordinator
//!     .update::<Worker, _>(&worker.id, |w| {
//!         w.requested_tabs = 2;
//!         Ok(())
//!     })
//!     .await?;
//! assert_eq!(updated.requested_tabs, 2);
//! # Ok::<(), fleet_core::FleetError>(())
//! # }).unwrap();
//! ```

use super::merge::Mergeable;
use crate::config::PersistenceConfig;
use crate::error::{FleetError, Result};
use crate::store::{DocumentFilter, Entity, EntityStore, StoreError};
use dashmap::DashMap;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

/// A loaded record together with the copy it was loaded as
///
/// Mutate through `DerefMut`; on conflict the coordinator replays the difference
/// between the two copies onto the current stored record.
#[derive(Debug, Clone)]
pub struct Tracked<E> {
    original: E,
    current: E,
}

impl<E: Clone> Tracked<E> {
    pub fn new(loaded: E) -> Self {
        Self {
            original: loaded.clone(),
            current: loaded,
        }
    }

    pub fn original(&self) -> &E {
        &self.original
    }

    pub fn into_inner(self) -> E {
        self.current
    }
}

impl<E> Deref for Tracked<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.current
    }
}

impl<E> DerefMut for Tracked<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.current
    }
}

/// Per-entity write serialization token plus the number of writers queued on it
#[derive(Debug, Default)]
struct EntityLock {
    gate: Arc<Mutex<()>>,
    waiting: AtomicUsize,
}

struct EntityGuard {
    key: String,
    lock: Arc<EntityLock>,
    _permit: OwnedMutexGuard<()>,
}

#[derive(Debug, Default)]
struct CoordinatorCounters {
    saves: AtomicU64,
    conflicts_merged: AtomicU64,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

/// Read-only coordinator statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub saves: u64,
    pub conflicts_merged: u64,
    pub retries: u64,
    pub exhausted: u64,
    /// Writers currently waiting behind another writer of the same entity
    pub queue_depth: usize,
    pub locked_entities: usize,
}

pub struct PersistenceCoordinator {
    store: EntityStore,
    policy: PersistenceConfig,
    locks: DashMap<String, Arc<EntityLock>>,
    counters: CoordinatorCounters,
}

impl std::fmt::Debug for PersistenceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceCoordinator")
            .field("policy", &self.policy)
            .field("locked_entities", &self.locks.len())
            .finish()
    }
}

impl PersistenceCoordinator {
    pub fn new(store: EntityStore, policy: PersistenceConfig) -> Self {
        Self {
            store,
            policy,
            locks: DashMap::new(),
            counters: CoordinatorCounters::default(),
        }
    }

    pub async fn get<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        Ok(self.store.get(id).await?)
    }

    /// Load a record for modification, failing with `NotFound` if it is absent
    pub async fn load<E: Entity>(&self, id: &str) -> Result<Tracked<E>> {
        self.require::<E>(id).await.map(Tracked::new)
    }

    pub async fn require<E: Entity>(&self, id: &str) -> Result<E> {
        self.store
            .get::<E>(id)
            .await?
            .ok_or_else(|| FleetError::not_found(E::KIND, id))
    }

    pub async fn query<E: Entity>(&self, filter: &DocumentFilter) -> Result<Vec<E>> {
        Ok(self.store.query(filter).await?)
    }

    pub async fn all<E: Entity>(&self) -> Result<Vec<E>> {
        Ok(self.store.all().await?)
    }

    pub async fn insert<E: Entity>(&self, entity: E) -> Result<E> {
        let guard = self.acquire(E::KIND, entity.id()).await;
        let mut entity = entity;
        entity.touch();
        let result = self.store.insert(&entity).await.map_err(|e| match e {
            StoreError::VersionConflict { .. } => {
                FleetError::validation(format!("{} '{}' already exists", E::KIND, entity.id()))
            }
            other => other.into(),
        });
        self.release(guard);
        result
    }

    pub async fn delete<E: Entity>(&self, id: &str) -> Result<bool> {
        let guard = self.acquire(E::KIND, id).await;
        let result = self.store.delete::<E>(id).await.map_err(FleetError::from);
        self.release(guard);
        result
    }

    /// Write a tracked record, merging onto concurrent writes on conflict
    pub async fn save<E: Entity + Mergeable>(&self, tracked: Tracked<E>) -> Result<E> {
        let guard = self.acquire(E::KIND, tracked.id()).await;
        let result = self.save_locked(tracked).await;
        self.release(guard);
        result
    }

    /// Load, mutate and save a record while holding its lock
    ///
    /// A mutation that returns an error aborts without writing. A mutation that
    /// leaves the record unchanged skips the write.
    pub async fn update<E, F>(&self, id: &str, mutate: F) -> Result<E>
    where
        E: Entity + Mergeable + PartialEq,
        F: FnOnce(&mut E) -> Result<()>,
    {
        let guard = self.acquire(E::KIND, id).await;
        let result = async {
            let mut tracked = self.load::<E>(id).await?;
            mutate(&mut *tracked)?;
            if *tracked == *tracked.original() {
                return Ok(tracked.into_inner());
            }
            self.save_locked(tracked).await
        }
        .await;
        self.release(guard);
        result
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            saves: self.counters.saves.load(Ordering::Relaxed),
            conflicts_merged: self.counters.conflicts_merged.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            queue_depth: self
                .locks
                .iter()
                .map(|entry| entry.value().waiting.load(Ordering::Relaxed))
                .sum(),
            locked_entities: self.locks.len(),
        }
    }

    #[instrument(skip(self, tracked), fields(kind = E::KIND, id = %tracked.id()))]
    async fn save_locked<E: Entity + Mergeable>(&self, tracked: Tracked<E>) -> Result<E> {
        let Tracked { original, current } = tracked;
        let id = current.id().to_string();
        let mut candidate = current.clone();
        let mut attempt: u32 = 1;

        loop {
            candidate.touch();
            match self.store.put(&candidate).await {
                Ok(written) => {
                    self.counters.saves.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        debug!(attempt, "💾 PERSISTENCE: Write succeeded after merge");
                    }
                    return Ok(written);
                }
                Err(err) if err.is_conflict() => {
                    if attempt >= self.policy.max_attempts {
                        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                        warn!(attempts = attempt, "💾 PERSISTENCE: Conflict retry budget exhausted");
                        return Err(FleetError::Conflict {
                            kind: E::KIND,
                            id,
                            attempts: attempt,
                        });
                    }

                    let backoff = self.policy.backoff_for_attempt(attempt);
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "💾 PERSISTENCE: Version conflict, reloading and merging"
                    );
                    tokio::time::sleep(backoff).await;

                    let fresh = self.require::<E>(&id).await?;
                    candidate = current.merge_onto(&original, fresh);
                    self.counters.conflicts_merged.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                }
                Err(StoreError::NotFound { .. }) => {
                    return Err(FleetError::not_found(E::KIND, id));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn acquire(&self, kind: &str, id: &str) -> EntityGuard {
        let key = format!("{kind}:{id}");
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(EntityLock::default()))
            .clone();

        lock.waiting.fetch_add(1, Ordering::Relaxed);
        let permit = lock.gate.clone().lock_owned().await;
        lock.waiting.fetch_sub(1, Ordering::Relaxed);

        EntityGuard {
            key,
            lock,
            _permit: permit,
        }
    }

    fn release(&self, guard: EntityGuard) {
        let EntityGuard {
            key,
            lock,
            _permit: permit,
        } = guard;
        drop(permit);
        drop(lock);
        // New writers clone the lock under the shard lock, so a count of one means idle
        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
