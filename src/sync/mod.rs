//! Device Synchronization Module
//!
//! This module reconciles mutations made on this device with the shared backend.
//! It is composed of several submodules, each responsible for a specific aspect of the sync process:
//!
//! - `orchestrator`: The sync coordinator. It owns the state machine and runs cycles on a worker task.
//! - `clock`: The per-device logical clock and the version stamps it hands out.
//! - `conflict`: Remote change records and the last-writer-wins rule on `(counter, device_id)`.
//! - `apply`: Applies remote changes to the local entity store through the conflict rule.
//! - `events`: Status stream and handler registration.
//! - `strategies`: Upload paths, either through the broker or directly to the backend.
//! - `triggers`: Connectivity and host background-task seams.
//!
//! A cycle uploads pending operations, confirms what was acknowledged, pulls remote changes
//! since the last watermark and applies the winners. Failures leave unconfirmed operations
//! queued for the next trigger.

/// Applies remote changes through the conflict rule
pub mod apply;
/// Logical clock
pub mod clock;
/// Conflict resolution between local and remote versions
pub mod conflict;
/// Status stream and handler registration
pub mod events;
/// Local entity storage seam
pub mod local_store;
/// Main coordinator for the sync process
pub mod orchestrator;
/// Per-cycle counters
pub mod progress_tracker;
/// Repositories for coordinator state
pub mod repositories;
/// Saving and restoring the clock and watermark
pub mod state_persistence;
/// Pluggable upload strategies
pub mod strategies;
/// Connectivity and background scheduling seams
pub mod triggers;
pub mod types;

pub use orchestrator::*;
pub use types::*;
