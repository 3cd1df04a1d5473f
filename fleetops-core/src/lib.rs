//! Fleetops Core
//!
//! Core types for the fleet operations controller.
//!
//! This crate contains the domain objects that the controller reads from and
//! writes to the resource store: ops jobs, nodes, faults, workloads and addon
//! templates. Orchestration logic lives in `fleetops-controller`.

pub mod domain;

pub use domain::addon::{AddonTemplate, GpuChip};
pub use domain::condition::{Condition, ConditionStatus, set_condition};
pub use domain::fault::{Fault, FaultConfig, FaultNode};
pub use domain::job::{OpsJob, OpsJobPhase, OpsJobSpec, OpsJobStatus, OpsJobType, Parameter};
pub use domain::meta::ObjectMeta;
pub use domain::node::{Node, Resources, Taint};
pub use domain::workload::{Workload, WorkloadPhase, WorkloadSpec, WorkloadStatus};
