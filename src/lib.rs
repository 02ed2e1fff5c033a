#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Fleet Core
//!
//! Orchestration core for fleets of long-lived, browser-like worker sessions grouped
//! into network-isolated boxes.
//!
//! ## Overview
//!
//! A **box** owns one network egress identity and a set of **workers**. Each worker
//! drives one remote session with up to ten **tabs**, all attached to the same
//! target stream. The orchestrator brings boxes and workers up and down, staggers
//! startups, samples resource usage, evicts workers that misbehave and recovers
//! from session faults, all while many operations mutate the same records
//! concurrently.
//!
//! ## Module Organization
//!
//! - [`models`] - Box, worker, tab and stream records
//! - [`state_machine`] - Box and worker lifecycle transition tables
//! - [`store`] - Versioned document store adapters (memory, PostgreSQL)
//! - [`persistence`] - Per-entity serialized writes with merge-on-conflict
//! - [`upstream`] - Session driver and egress provider interfaces
//! - [`orchestration`] - Lifecycle managers, scheduler, recovery, monitor, facade
//! - [`simulation`] - In-process upstream implementations
//! - [`config`] - YAML configuration with environment overrides
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fleet_core::config::FleetConfig;
//! use fleet_core::orchestration::{FleetOrchestrator, NewBox};
//! use fleet_core::simulation::{SimulatedEgressProvider, SimulatedSessionDriver};
//! use fleet_core::store::MemoryDocumentStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> fleet_core::Result<()> {
//! let fleet = FleetOrchestrator::new(
//!     FleetConfig::default(),
//!     Arc::new(MemoryDocumentStore::new()),
//!     Arc::new(SimulatedSessionDriver::new()),
//!     Arc::new(SimulatedEgressProvider::new()),
//! );
//! fleet.start();
//!
//! let fleet_box = fleet
//!     .create_box(NewBox {
//!         name: "alpha".into(),
//!         egress_profile: "eu-west".into(),
//!         target: Some("stream-a".into()),
//!         ..Default::default()
//!     })
//!     .await?;
//! fleet.start_box(&fleet_box.id).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod simulation;
pub mod state_machine;
pub mod store;
pub mod upstream;

pub use config::{ConfigManager, FleetConfig};
pub use error::{FleetError, Result};
pub use orchestration::FleetOrchestrator;
