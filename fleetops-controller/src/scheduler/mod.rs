//! Scheduling layer for ops jobs
//!
//! Picks which keys of a job run next and fans a batch out to a bounded set
//! of workers.

pub mod batch;
pub mod pool;

pub use batch::next_batch;
pub use pool::run_batch;
