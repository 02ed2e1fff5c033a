//! # Persistence Coordination
//!
//! Every mutation of a box, worker or stream record goes through the
//! [`PersistenceCoordinator`]. It guarantees at most one in-flight write per record
//! and replays a losing writer's changes onto the winner's record using the per-field
//! policies in [`merge`].

pub mod coordinator;
pub mod merge;

pub use coordinator::{CoordinatorStats, PersistenceCoordinator, Tracked};
pub use merge::{MergePolicy, Mergeable};
