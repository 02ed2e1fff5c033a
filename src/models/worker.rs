use super::log_entry::{push_bounded, LogEntry, LogLevel};
use super::resources::{ResourceLimits, ResourceSnapshot};
use crate::constants::{kinds, MAX_TABS, WORKER_LOG_CAPACITY};
use crate::state_machine::{TabState, WorkerState};
use crate::upstream::{ClientIdentity, PlaybackStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Last observed playback state of a tab (or, mirrored from tab 0, of a worker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    pub is_playing: bool,
    pub is_buffering: bool,
    pub error: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl PlaybackSnapshot {
    pub fn from_status(status: &PlaybackStatus) -> Self {
        Self {
            is_playing: status.is_playing,
            is_buffering: status.is_buffering,
            error: status.error.clone(),
            observed_at: Utc::now(),
        }
    }

    /// Tab state implied by this observation
    pub fn tab_state(&self) -> TabState {
        if self.error.is_some() {
            TabState::Error
        } else if self.is_buffering {
            TabState::Buffering
        } else if self.is_playing {
            TabState::Playing
        } else {
            TabState::Paused
        }
    }
}

/// One sub-session of a worker, attached to the worker's target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    pub index: u32,
    pub status: TabState,
    /// Reference to the most recent capture artifact
    pub last_capture: Option<String>,
    pub playback: Option<PlaybackSnapshot>,
    pub error: Option<String>,
}

impl Tab {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            status: TabState::Idle,
            last_capture: None,
            playback: None,
            error: None,
        }
    }

    pub fn mark_ready(&mut self) {
        self.status = TabState::Running;
        self.error = None;
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = TabState::Error;
        self.error = Some(message.into());
    }

    pub fn mark_closed(&mut self) {
        self.status = TabState::Closed;
        self.playback = None;
        self.error = None;
    }
}

/// One automated viewing session owned by exactly one box
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub box_id: String,
    pub status: WorkerState,
    /// Stream the worker is attached to; required while running
    pub target: Option<String>,
    /// At most one worker per box carries this flag
    pub is_parse_chat_enabled: bool,
    pub tabs: Vec<Tab>,
    /// Indices of tabs currently attached to the target
    pub active_tabs: Vec<u32>,
    /// Tab count requested by the most recent start
    pub requested_tabs: u32,
    /// Mirror of tab 0's playback snapshot
    pub playback: Option<PlaybackSnapshot>,
    #[serde(default)]
    pub resource_usage: ResourceSnapshot,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub logs: Vec<LogEntry>,
    pub update_count: u64,
    /// Blocked-classified faults since the last successful start
    pub failure_count: u32,
    pub identity: Option<ClientIdentity>,
    /// Incremented on every start; lets a stale bring-up detect that it was superseded
    pub start_attempt: u64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Worker {
    pub fn new(box_id: impl Into<String>, is_parse_chat_enabled: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            box_id: box_id.into(),
            status: WorkerState::Idle,
            target: None,
            is_parse_chat_enabled,
            tabs: Vec::new(),
            active_tabs: Vec::new(),
            requested_tabs: 0,
            playback: None,
            resource_usage: ResourceSnapshot::default(),
            resource_limits: ResourceLimits::worker_defaults(),
            last_activity_at: None,
            logs: Vec::new(),
            update_count: 0,
            failure_count: 0,
            identity: None,
            start_attempt: 0,
            error_message: None,
            started_at: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn kind() -> &'static str {
        kinds::WORKER
    }

    pub fn push_log(&mut self, level: LogLevel, message: impl Into<String>) {
        push_bounded(&mut self.logs, LogEntry::new(level, message), WORKER_LOG_CAPACITY);
    }

    /// Make sure tabs `0..count` exist (idle), never exceeding the hard tab bound
    pub fn ensure_tabs(&mut self, count: u32) {
        let count = count.min(MAX_TABS);
        while (self.tabs.len() as u32) < count {
            let index = self.tabs.len() as u32;
            self.tabs.push(Tab::new(index));
        }
    }

    pub fn tab(&self, index: u32) -> Option<&Tab> {
        self.tabs.get(index as usize)
    }

    pub fn tab_mut(&mut self, index: u32) -> Option<&mut Tab> {
        self.tabs.get_mut(index as usize)
    }

    pub fn open_tab_count(&self) -> usize {
        self.tabs.iter().filter(|t| t.status.is_open()).count()
    }

    pub fn live_tab_count(&self) -> usize {
        self.tabs.iter().filter(|t| t.status.is_live()).count()
    }

    /// Record a tab as attached to the target
    pub fn activate_tab(&mut self, index: u32) {
        if !self.active_tabs.contains(&index) {
            self.active_tabs.push(index);
        }
    }

    pub fn deactivate_tab(&mut self, index: u32) {
        self.active_tabs.retain(|i| *i != index);
    }

    /// Copy tab 0's playback snapshot onto the worker
    pub fn mirror_primary_tab(&mut self) {
        self.playback = self.tabs.first().and_then(|t| t.playback.clone());
    }

    /// Drop everything that only exists while a session is live
    pub fn clear_session_state(&mut self) {
        self.tabs.clear();
        self.active_tabs.clear();
        self.playback = None;
        self.started_at = None;
    }

    /// Running workers must have a target
    pub fn target_consistent(&self) -> bool {
        self.status != WorkerState::Running || self.target.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_ring_is_bounded() {
        let mut worker = Worker::new("box-1", false);
        for i in 0..(WORKER_LOG_CAPACITY + 20) {
            worker.push_log(LogLevel::Info, format!("entry {i}"));
        }
        assert_eq!(worker.logs.len(), WORKER_LOG_CAPACITY);
        assert_eq!(worker.logs[0].message, "entry 20");
        assert_eq!(
            worker.logs.last().map(|e| e.message.as_str()),
            Some("entry 119")
        );
    }

    #[test]
    fn test_ensure_tabs_respects_hard_bound() {
        let mut worker = Worker::new("box-1", false);
        worker.ensure_tabs(15);
        assert_eq!(worker.tabs.len(), MAX_TABS as usize);
        assert!(worker.tabs.iter().enumerate().all(|(i, t)| t.index == i as u32));
    }

    #[test]
    fn test_primary_tab_mirrors_playback() {
        let mut worker = Worker::new("box-1", false);
        worker.ensure_tabs(2);
        let snapshot = PlaybackSnapshot::from_status(&PlaybackStatus {
            is_playing: true,
            is_buffering: false,
            error: None,
        });
        worker.tabs[0].playback = Some(snapshot.clone());
        worker.mirror_primary_tab();
        assert_eq!(worker.playback, Some(snapshot));
    }

    #[test]
    fn test_closed_tabs_do_not_count_as_open() {
        let mut worker = Worker::new("box-1", false);
        worker.ensure_tabs(3);
        worker.tabs[1].mark_closed();
        assert_eq!(worker.open_tab_count(), 2);
    }
}
