//! Network Egress Provider interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Address and location a box's traffic appears to originate from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressAssignment {
    pub address: String,
    pub location: String,
}

/// Name of the network interface carrying a box's tunnel
pub type InterfaceRef = String;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EgressError {
    pub message: String,
}

impl EgressError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait EgressProvider: Send + Sync + 'static {
    /// Establish the tunnel for a box using the named profile
    async fn connect(&self, box_id: &str, profile: &str) -> Result<EgressAssignment, EgressError>;

    async fn disconnect(&self, box_id: &str) -> Result<(), EgressError>;

    /// Re-query the address and location of an established tunnel
    async fn lookup(&self, box_id: &str) -> Result<EgressAssignment, EgressError>;

    async fn current_interface(&self, box_id: &str) -> Option<InterfaceRef>;
}
