//! # Lifecycle State Machines
//!
//! Pure transition tables for boxes and workers. The lifecycle managers apply these
//! to records inside a persistence-coordinated update, so a rejected transition never
//! produces a write.

pub mod box_state_machine;
pub mod errors;
pub mod events;
pub mod states;
pub mod worker_state_machine;

pub use box_state_machine::BoxStateMachine;
pub use errors::{StateMachineError, StateMachineResult};
pub use events::{BoxEvent, WorkerEvent};
pub use states::{BoxState, TabState, WorkerState};
pub use worker_state_machine::WorkerStateMachine;
