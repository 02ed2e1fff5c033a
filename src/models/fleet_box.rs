use super::resources::{ResourceLimits, ResourceSnapshot};
use crate::constants::kinds;
use crate::state_machine::BoxState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named, network-isolated group of workers sharing one egress identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetBox {
    pub id: String,
    pub name: String,
    /// Egress profile handed to the network egress provider
    pub egress_profile: String,
    pub status: BoxState,
    /// Assigned egress address; present iff the box is running
    pub address: Option<String>,
    /// Assigned egress location; present iff the box is running
    pub location: Option<String>,
    /// Number of workers provisioned on start (1-50)
    pub worker_count: u32,
    /// Stream every worker of this box is attached to
    pub target: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_usage: ResourceSnapshot,
    #[serde(default = "ResourceLimits::box_defaults")]
    pub resource_limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl FleetBox {
    pub fn new(name: impl Into<String>, egress_profile: impl Into<String>, worker_count: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            egress_profile: egress_profile.into(),
            status: BoxState::Idle,
            address: None,
            location: None,
            worker_count,
            target: None,
            error_message: None,
            started_at: None,
            resource_usage: ResourceSnapshot::default(),
            resource_limits: ResourceLimits::box_defaults(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn kind() -> &'static str {
        kinds::BOX
    }

    pub fn assign_egress(&mut self, address: String, location: String) {
        self.address = Some(address);
        self.location = Some(location);
    }

    pub fn clear_egress(&mut self) {
        self.address = None;
        self.location = None;
        self.started_at = None;
    }

    /// Address/location are set exactly when the box is running
    pub fn egress_consistent(&self) -> bool {
        let assigned = self.address.is_some() && self.location.is_some();
        let cleared = self.address.is_none() && self.location.is_none();
        if self.status == BoxState::Running {
            assigned
        } else {
            cleared
        }
    }
}
