//! # Startup Scheduler
//!
//! Brings workers online in consecutive batches. Starts within a batch are issued
//! concurrently, each after `index * stagger`; the next batch begins only after every
//! start of the current one reached an outcome, plus the inter-batch delay. A failed
//! start never aborts the schedule.

use crate::config::SchedulerConfig;
use crate::state_machine::WorkerState;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Outcome of one scheduled start
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    /// The worker reached running or partial
    Started { worker_id: String, state: WorkerState },
    /// The start was refused or ended in error
    Failed { worker_id: String, error: String },
    /// The schedule was cancelled before this start was issued
    Skipped { worker_id: String },
}

impl StartOutcome {
    pub fn worker_id(&self) -> &str {
        match self {
            Self::Started { worker_id, .. }
            | Self::Failed { worker_id, .. }
            | Self::Skipped { worker_id } => worker_id,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Anything able to start a worker and wait for its start outcome
#[async_trait]
pub trait WorkerStarter: Send + Sync {
    async fn start_worker(&self, worker_id: &str) -> StartOutcome;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub outcomes: Vec<StartOutcome>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub batches: Vec<BatchReport>,
    pub cancelled: bool,
}

impl StartupReport {
    pub fn outcomes(&self) -> impl Iterator<Item = &StartOutcome> {
        self.batches.iter().flat_map(|b| b.outcomes.iter())
    }

    pub fn started(&self) -> usize {
        self.outcomes().filter(|o| o.is_started()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes().filter(|o| o.is_failed()).count()
    }
}

#[derive(Debug, Clone)]
pub struct StartupScheduler {
    config: SchedulerConfig,
}

impl StartupScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Partition worker ids into consecutive batches
    pub fn plan(worker_ids: &[String], batch_size: usize) -> Vec<Vec<String>> {
        worker_ids
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    #[instrument(skip(self, worker_ids, starter, cancel), fields(workers = worker_ids.len()))]
    pub async fn schedule_startup(
        &self,
        worker_ids: Vec<String>,
        starter: &dyn WorkerStarter,
        cancel: &CancellationToken,
    ) -> StartupReport {
        let batches = Self::plan(&worker_ids, self.config.batch_size);
        let total_batches = batches.len();
        let stagger = self.config.intra_batch_stagger();
        let mut report = StartupReport::default();

        info!(
            workers = worker_ids.len(),
            batches = total_batches,
            batch_size = self.config.batch_size,
            "🚦 SCHEDULER: Starting workers in batches"
        );

        for (index, batch) in batches.into_iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.batches.push(BatchReport {
                    index,
                    outcomes: batch
                        .into_iter()
                        .map(|worker_id| StartOutcome::Skipped { worker_id })
                        .collect(),
                });
                continue;
            }

            debug!(batch = index + 1, size = batch.len(), "🚦 SCHEDULER: Issuing batch");
            let starts = batch.into_iter().enumerate().map(|(position, worker_id)| {
                let offset = stagger * position as u32;
                async move {
                    if !offset.is_zero() {
                        tokio::time::sleep(offset).await;
                    }
                    if cancel.is_cancelled() {
                        return StartOutcome::Skipped { worker_id };
                    }
                    starter.start_worker(&worker_id).await
                }
            });
            let outcomes = join_all(starts).await;

            for outcome in outcomes.iter().filter(|o| o.is_failed()) {
                if let StartOutcome::Failed { worker_id, error } = outcome {
                    warn!(worker_id = %worker_id, error = %error, "🚦 SCHEDULER: Worker failed to start");
                }
            }
            report.batches.push(BatchReport { index, outcomes });

            let is_last = index + 1 == total_batches;
            if !is_last && !self.pause(self.config.inter_batch_delay(), cancel).await {
                report.cancelled = true;
            }
        }

        info!(
            started = report.started(),
            failed = report.failed(),
            cancelled = report.cancelled,
            "🚦 SCHEDULER: Startup schedule finished"
        );
        report
    }

    /// Sleep unless cancelled first; returns false on cancellation
    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
