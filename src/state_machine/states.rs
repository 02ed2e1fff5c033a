use serde::{Deserialize, Serialize};
use std::fmt;

/// Box lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoxState {
    /// Created, or fully stopped with egress released
    #[default]
    Idle,
    /// Egress is being acquired and workers provisioned
    Starting,
    /// Egress established; address and location are assigned
    Running,
    /// Workers and egress are being torn down
    Stopping,
    /// Start or stop failed; see the box's error message
    Error,
}

impl BoxState {
    /// States from which the box may be updated or deleted
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    /// States in which the worker-count target and egress profile are frozen
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for BoxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for BoxState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid box state: {s}")),
        }
    }
}

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    Starting,
    /// Every requested tab initialised
    Running,
    /// Some but not all requested tabs initialised
    Partial,
    Stopping,
    Error,
}

impl WorkerState {
    /// States holding (or acquiring) a live session
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Partial)
    }

    /// States in which tabs may be added or closed
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Running | Self::Partial)
    }

    /// Outcome states of a start attempt
    pub fn is_start_outcome(&self) -> bool {
        matches!(self, Self::Running | Self::Partial | Self::Error)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Partial => write!(f, "partial"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "partial" => Ok(Self::Partial),
            "stopping" => Ok(Self::Stopping),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid worker state: {s}")),
        }
    }
}

/// Tab sub-lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TabState {
    #[default]
    Idle,
    Running,
    Playing,
    Paused,
    Buffering,
    Closed,
    Error,
}

impl TabState {
    /// Whether the tab still occupies a slot in its worker's session
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Closed)
    }

    /// Whether the tab initialised and is attached to its target
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Playing | Self::Paused | Self::Buffering
        )
    }
}

impl fmt::Display for TabState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::Buffering => write!(f, "buffering"),
            Self::Closed => write!(f, "closed"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_state_groups() {
        assert!(BoxState::Idle.is_settled());
        assert!(BoxState::Error.is_settled());
        assert!(!BoxState::Stopping.is_settled());
        assert!(BoxState::Running.is_active());
        assert!(BoxState::Starting.is_active());
        assert!(!BoxState::Stopping.is_active());
    }

    #[test]
    fn test_worker_state_groups() {
        assert!(WorkerState::Partial.is_serving());
        assert!(!WorkerState::Starting.is_serving());
        assert!(WorkerState::Starting.is_active());
        assert!(WorkerState::Error.is_start_outcome());
        assert!(!WorkerState::Starting.is_start_outcome());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(WorkerState::Partial.to_string(), "partial");
        assert_eq!("stopping".parse::<BoxState>().unwrap(), BoxState::Stopping);
        assert!("paused".parse::<WorkerState>().is_err());
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&TabState::Buffering).unwrap();
        assert_eq!(json, "\"buffering\"");
        let parsed: WorkerState = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, WorkerState::Running);
    }
}
