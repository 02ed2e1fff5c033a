use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A remote content stream and the workers currently attached to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: String,
    pub target: String,
    pub active_worker_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl StreamRecord {
    pub fn new(target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            target: target.into(),
            active_worker_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn attach(&mut self, worker_id: &str) {
        if !self.active_worker_ids.iter().any(|id| id == worker_id) {
            self.active_worker_ids.push(worker_id.to_string());
        }
    }

    pub fn detach(&mut self, worker_id: &str) -> bool {
        let before = self.active_worker_ids.len();
        self.active_worker_ids.retain(|id| id != worker_id);
        before != self.active_worker_ids.len()
    }
}
