use serde::{Deserialize, Serialize};

/// Events that can trigger box state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BoxEvent {
    /// Begin acquiring egress for the box
    Start,
    /// Egress connected and workers provisioned
    EgressReady,
    /// Start or stop failed with the given message
    Fail(String),
    /// Begin tearing the box down
    Stop,
    /// Teardown finished and egress released
    Stopped,
}

impl BoxEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::EgressReady => "egress_ready",
            Self::Fail(_) => "fail",
            Self::Stop => "stop",
            Self::Stopped => "stopped",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Events that can trigger worker state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkerEvent {
    /// Start (or restart) a session
    Start,
    /// Tab initialisation finished: `ready` of `requested` tabs came up
    TabsInitialized { ready: u32, requested: u32 },
    /// Unrecoverable fault with the given message
    Fail(String),
    /// Begin tearing the session down
    Stop,
    /// Session torn down and transient state cleared
    Stopped,
}

impl WorkerEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::TabsInitialized { .. } => "tabs_initialized",
            Self::Fail(_) => "fail",
            Self::Stop => "stop",
            Self::Stopped => "stopped",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
