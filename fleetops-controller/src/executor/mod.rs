//! Action executors
//!
//! One executor per operation type performs the per-node action of a job.
//! The batch operation drives executors without knowing what they do:
//! it validates the job once, computes the per-cycle context, then runs
//! `execute` for every key of the batch on the worker pool.
//!
//! - [`AddonExecutor`] runs addon scripts over a remote session
//! - [`WorkloadExecutor`] creates a workload per node (Preflight, Diagnose)
//! - [`RebootExecutor`] fires a reboot and records the node as processed

mod addon;
mod reboot;
mod workload;

pub use addon::AddonExecutor;
pub use reboot::RebootExecutor;
pub use workload::{WorkloadExecutor, workload_name, workload_phase};

use async_trait::async_trait;
use fleetops_core::{Node, OpsJob, OpsJobPhase, OpsJobType};
use std::collections::HashSet;

use crate::error::{OpsError, Result};
use crate::store::ResourceStore;

/// Result of one `execute` call for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action finished successfully on the node
    Succeeded,
    /// The node cannot be worked on yet; it goes back to `Pending`
    Deferred,
    /// The action was handed off; its outcome arrives as an event
    Dispatched,
}

/// State shared by every node of one handle cycle
#[derive(Debug, Clone, Default)]
pub struct CycleContext {
    /// Nodes currently running workloads that must not be disturbed
    pub nodes_in_use: HashSet<String>,
}

#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    fn job_type(&self) -> OpsJobType;

    /// Checks the job inputs before any node is touched
    ///
    /// Errors returned here are expected to be non-retryable and fail the
    /// job as a whole.
    async fn validate(&self, job: &OpsJob) -> Result<()> {
        if job.node_names().is_empty() {
            return Err(OpsError::BadRequest("no input nodes found".to_string()));
        }
        Ok(())
    }

    /// Computes the context shared by the nodes of one cycle
    async fn prepare(&self, _job: &OpsJob) -> Result<CycleContext> {
        Ok(CycleContext::default())
    }

    /// Runs the action for `node`
    async fn execute(
        &self,
        job: &OpsJob,
        node: &str,
        cycle: &CycleContext,
    ) -> Result<ActionOutcome>;

    /// Phase of `node` derived from persisted state, used after a restart
    ///
    /// `None` leaves the node `Pending`.
    async fn recover(&self, _job: &OpsJob, _node: &str) -> Result<Option<OpsJobPhase>> {
        Ok(None)
    }

    /// Removes objects the executor created for the job
    async fn cleanup(&self, _job: &OpsJob) -> Result<()> {
        Ok(())
    }
}

/// Fetches `name` and rejects it unless it is a live member of the job's cluster
///
/// A node that is being deleted or has left the cluster fails for good.
pub(crate) async fn managed_node(
    store: &dyn ResourceStore,
    job: &OpsJob,
    name: &str,
) -> Result<Node> {
    let node = store.get_node(name).await?;
    if node.metadata.is_deleting() {
        return Err(OpsError::Internal("the node is deleting".to_string()));
    }
    if node.cluster().is_empty() {
        return Err(OpsError::Internal("the node is unmanaged".to_string()));
    }
    if node.cluster() != job.spec.cluster {
        return Err(OpsError::Internal(format!(
            "the node belongs to cluster {}, not {}",
            node.cluster(),
            job.spec.cluster
        )));
    }
    Ok(node)
}

/// Maps a claim failure to a deferral
///
/// A node owned by another job is busy, not broken: the node is retried on a
/// later cycle.
pub(crate) fn defer_if_in_use<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(OpsError::NodeInUse { node, owner }) => {
            tracing::info!(
                "another ops job ({}) is running on node {}, retry later",
                owner,
                node
            );
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
