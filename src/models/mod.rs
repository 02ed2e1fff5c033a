//! # Fleet Models
//!
//! Persisted record types. Every record carries a `version` used by the persistence
//! coordinator's conflict detection; the store adapter keeps it authoritative.

pub mod fleet_box;
pub mod log_entry;
pub mod resources;
pub mod stream;
pub mod worker;

pub use fleet_box::FleetBox;
pub use log_entry::{LogEntry, LogLevel};
pub use resources::{LimitViolation, ResourceLimits, ResourceSnapshot};
pub use stream::StreamRecord;
pub use worker::{PlaybackSnapshot, Tab, Worker};
