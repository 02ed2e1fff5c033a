//! Stream records: which workers are currently attached to which target

use crate::error::Result;
use crate::models::StreamRecord;
use crate::persistence::PersistenceCoordinator;
use crate::store::DocumentFilter;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
pub struct StreamDirectory {
    coordinator: Arc<PersistenceCoordinator>,
    /// Serializes find-or-create so one target never gets two records
    creation: Mutex<()>,
}

impl StreamDirectory {
    pub fn new(coordinator: Arc<PersistenceCoordinator>) -> Self {
        Self {
            coordinator,
            creation: Mutex::new(()),
        }
    }

    pub async fn find(&self, target: &str) -> Result<Option<StreamRecord>> {
        let mut matches: Vec<StreamRecord> = self
            .coordinator
            .query(&DocumentFilter::new().eq("target", target))
            .await?;
        Ok(matches.pop())
    }

    pub async fn find_or_create(&self, target: &str) -> Result<StreamRecord> {
        let _creating = self.creation.lock().await;
        if let Some(existing) = self.find(target).await? {
            return Ok(existing);
        }
        debug!(target_stream = %target, "📡 STREAM: Creating stream record");
        self.coordinator.insert(StreamRecord::new(target)).await
    }

    pub async fn attach(&self, target: &str, worker_id: &str) -> Result<StreamRecord> {
        let stream = self.find_or_create(target).await?;
        self.coordinator
            .update::<StreamRecord, _>(&stream.id, |record| {
                record.attach(worker_id);
                Ok(())
            })
            .await
    }

    /// Remove a worker from its stream's active viewers, if it was attached
    pub async fn detach(&self, target: &str, worker_id: &str) -> Result<()> {
        if let Some(stream) = self.find(target).await? {
            self.coordinator
                .update::<StreamRecord, _>(&stream.id, |record| {
                    record.detach(worker_id);
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }
}
