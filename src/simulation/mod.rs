//! # In-Process Simulation
//!
//! Stand-in implementations of the upstream interfaces. `fleetd --simulate` runs
//! against them, and the test suite uses their fault-injection knobs to drive the
//! lifecycle managers through blocked launches, failing tabs, disconnects and
//! memory pressure.

pub mod egress;
pub mod session;

pub use egress::SimulatedEgressProvider;
pub use session::SimulatedSessionDriver;

use std::sync::atomic::{AtomicU32, Ordering};

/// Consume one unit of an injected-fault budget
pub(crate) fn take_one(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
