//! Resource store layer
//!
//! The resource store persists and streams jobs, nodes, faults and workloads.
//! The controller only talks to it through the [`ResourceStore`] trait so the
//! backing implementation can be swapped (an API server client in
//! production, [`InMemoryStore`] for standalone runs and tests).

pub mod memory;

use async_trait::async_trait;
use fleetops_core::{AddonTemplate, Fault, FaultConfig, Node, OpsJob, OpsJobType, Workload};
use tokio::sync::broadcast;

use crate::error::Result;

const MAX_CONFLICT_RETRIES: usize = 10;

pub use memory::{InMemoryStore, Snapshot};

/// Change notification delivered to watchers
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A job was created, updated or deleted
    Job { name: String },
    /// A node changed; `old` is `None` on creation
    Node { old: Option<Node>, new: Node },
    /// A workload changed; `old` is `None` on creation
    Workload {
        old: Option<Workload>,
        new: Workload,
    },
}

/// Storage and watch interface consumed by the controller
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_job(&self, name: &str) -> Result<OpsJob>;

    async fn list_jobs(&self) -> Result<Vec<OpsJob>>;

    async fn create_job(&self, job: OpsJob) -> Result<OpsJob>;

    /// Writes the job back; fails with `Conflict` if `resource_version` is stale
    async fn update_job(&self, job: &OpsJob) -> Result<OpsJob>;

    /// Requests deletion; the object stays while finalizers remain
    async fn delete_job(&self, name: &str) -> Result<()>;

    async fn remove_job_finalizer(&self, name: &str, finalizer: &str) -> Result<()>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Writes the node back; fails with `Conflict` if `resource_version` is stale
    async fn update_node(&self, node: &Node) -> Result<Node>;

    async fn get_fault(&self, name: &str) -> Result<Fault>;

    async fn list_faults(&self) -> Result<Vec<Fault>>;

    async fn create_fault(&self, fault: Fault) -> Result<Fault>;

    async fn delete_fault(&self, name: &str) -> Result<()>;

    /// Configuration of a fault kind, `None` if it is not configured
    async fn fault_config(&self, monitor_id: &str) -> Result<Option<FaultConfig>>;

    async fn get_addon_template(&self, name: &str) -> Result<AddonTemplate>;

    async fn get_workload(&self, name: &str) -> Result<Workload>;

    async fn list_workloads(&self) -> Result<Vec<Workload>>;

    async fn create_workload(&self, workload: Workload) -> Result<Workload>;

    async fn update_workload(&self, workload: &Workload) -> Result<Workload>;

    async fn delete_workload(&self, name: &str) -> Result<()>;

    /// Subscribes to change notifications
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Lists the jobs of `job_type` in `cluster` that have not finished yet
pub async fn list_active_jobs(
    store: &dyn ResourceStore,
    cluster: &str,
    job_type: OpsJobType,
) -> Result<Vec<OpsJob>> {
    let jobs = store.list_jobs().await?;
    Ok(jobs
        .into_iter()
        .filter(|j| j.spec.cluster == cluster && j.spec.job_type == job_type && !j.is_end())
        .collect())
}

/// Re-reads `name`, applies `mutate` and writes the node back, retrying on
/// conflicts
///
/// `mutate` returns `Ok(false)` when nothing changed, in which case no write
/// is issued. Errors from `mutate` abort the update.
pub async fn modify_node<F>(store: &dyn ResourceStore, name: &str, mut mutate: F) -> Result<Node>
where
    F: FnMut(&mut Node) -> Result<bool> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut node = store.get_node(name).await?;
        if !mutate(&mut node)? {
            return Ok(node);
        }
        match store.update_node(&node).await {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() && attempt < MAX_CONFLICT_RETRIES => continue,
            Err(e) => return Err(e),
        }
    }
}
