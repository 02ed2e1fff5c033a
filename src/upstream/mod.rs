//! # Upstream Interfaces
//!
//! Traits for the external collaborators the orchestrator drives. Implementations live
//! outside this crate; [`crate::simulation`] provides in-process stand-ins.

pub mod egress;
pub mod session;

pub use egress::{EgressAssignment, EgressError, EgressProvider, InterfaceRef};
pub use session::{
    ArtifactRef, ClientIdentity, DriverFault, FaultKind, LaunchRequest, PlaybackStatus,
    ResourceSample, SessionDriver, SessionEvent, SessionEventReceiver, SessionEventSender,
    SessionHandle,
};
