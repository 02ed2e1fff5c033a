//! Worker Session Driver interface
//!
//! The driver owns everything browser-shaped: launching a session for an identity,
//! attaching tabs to a target, probing playback and capturing artifacts. The
//! orchestrator only sees opaque handles and structured faults.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Synthetic client identity a session is launched with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub id: String,
    /// Driver-defined attributes; opaque to the orchestrator
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Opaque reference to a live session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub session_id: String,
    pub worker_id: String,
}

/// Reference to a capture artifact produced by the driver
pub type ArtifactRef = String;

/// Result of probing a tab's playback
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub is_playing: bool,
    pub is_buffering: bool,
    pub error: Option<String>,
}

/// Live resource usage reported by the driver for one session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub network_rx_mbps: f64,
    pub network_tx_mbps: f64,
    pub disk_mb: Option<f64>,
}

/// Structured classification of a driver failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The target refused or blocked the session
    Blocked,
    /// The session process died
    Crashed,
    /// The operation did not finish in time
    Timeout,
    Other,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked => write!(f, "blocked"),
            Self::Crashed => write!(f, "crashed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} fault: {message}")]
pub struct DriverFault {
    pub kind: FaultKind,
    pub message: String,
}

impl DriverFault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Blocked, message)
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Crashed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Other, message)
    }
}

/// Notifications flowing from the driver back into the worker lifecycle manager
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The session ended without being asked to
    Disconnected {
        worker_id: String,
        session_id: String,
        reason: String,
    },
}

pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Everything the driver needs to launch a session
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub worker_id: String,
    pub identity: ClientIdentity,
    pub target: String,
    /// Channel on which the driver reports unexpected disconnects
    pub events: SessionEventSender,
}

#[async_trait]
pub trait SessionDriver: Send + Sync + 'static {
    /// Produce a fresh synthetic client identity
    async fn generate_identity(&self) -> ClientIdentity;

    async fn launch(&self, request: LaunchRequest) -> Result<SessionHandle, DriverFault>;

    /// Attach tab `index` of the session to `target`
    async fn open_tab(
        &self,
        handle: &SessionHandle,
        index: u32,
        target: &str,
    ) -> Result<(), DriverFault>;

    async fn close_tab(&self, handle: &SessionHandle, index: u32) -> Result<(), DriverFault>;

    async fn probe(&self, handle: &SessionHandle, index: u32) -> Result<PlaybackStatus, DriverFault>;

    async fn capture(&self, handle: &SessionHandle, index: u32) -> Result<ArtifactRef, DriverFault>;

    async fn resource_usage(&self, handle: &SessionHandle) -> Result<ResourceSample, DriverFault>;

    async fn terminate(&self, handle: &SessionHandle) -> Result<(), DriverFault>;
}
