//! Fleetops Controller
//!
//! Control loop that runs batch operations (addon upgrades, preflight
//! checks, diagnostics, reboots) over a fleet of GPU nodes.
//!
//! Architecture:
//! - Store: resource store trait, in-memory implementation and status writes
//! - State: per-job node phases, batch limits and failure threshold
//! - Executors: the per-node action of each operation type
//! - Reconciler: job lifecycle shared by all operation types
//! - Events: node and workload notifications feeding job state
//! - Controller: work queue and workers driving the reconcilers

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod executor;
pub mod fault;
pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod store;
pub mod threshold;

#[cfg(test)]
mod test_support;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::{OpsError, Result};
