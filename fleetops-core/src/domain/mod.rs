//! Core domain types
//!
//! These types mirror the objects held by the resource store. The controller
//! treats them as plain data: every mutation goes back through the store.

pub mod addon;
pub mod condition;
pub mod fault;
pub mod job;
pub mod meta;
pub mod node;
pub mod workload;
