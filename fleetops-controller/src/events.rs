//! Event feedback
//!
//! Store notifications that move job state outside the reconcile loop. Node
//! removal fails the node for every active job listing it, and a finished
//! workload reports the outcome of its node. Both only re-enqueue the job
//! when the node phase actually changed, so duplicate events do not cause
//! reconcile storms.

use fleetops_core::{Node, OpsJob, OpsJobPhase, OpsJobType, Workload};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, ignore_not_found};
use crate::executor::workload_phase;
use crate::fault::{FaultGuard, monitor_for};
use crate::queue::WorkQueue;
use crate::state::JobStateStore;
use crate::status;
use crate::store::{ResourceStore, StoreEvent, list_active_jobs};

const UNKNOWN_REASON: &str = "unknown reason";

/// Job types whose nodes are failed when the node leaves the fleet
const NODE_JOB_TYPES: [OpsJobType; 4] = [
    OpsJobType::Addon,
    OpsJobType::Preflight,
    OpsJobType::Diagnose,
    OpsJobType::Reboot,
];

/// Why a node stopped being usable, if the change removed it
fn removal_message(old: &Node, new: &Node) -> Option<&'static str> {
    if old.cluster().is_empty() {
        return None;
    }
    if new.cluster().is_empty() {
        Some("The node is unmanaged")
    } else if !old.metadata.is_deleting() && new.metadata.is_deleting() {
        Some("The node is deleted")
    } else {
        None
    }
}

pub struct EventFeedback {
    store: Arc<dyn ResourceStore>,
    state: Arc<JobStateStore>,
    guard: FaultGuard,
    queue: Arc<WorkQueue>,
}

impl EventFeedback {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        state: Arc<JobStateStore>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            guard: FaultGuard::new(Arc::clone(&store)),
            store,
            state,
            queue,
        }
    }

    pub async fn dispatch(&self, event: StoreEvent) -> Result<()> {
        match event {
            StoreEvent::Job { name } => {
                self.queue.add(&name);
                Ok(())
            }
            StoreEvent::Node { old, new } => match old {
                Some(old) => self.on_node_changed(&old, &new).await,
                None => Ok(()),
            },
            StoreEvent::Workload { old, new } => {
                let was_end = old.as_ref().is_some_and(Workload::is_end);
                if was_end || !new.is_end() {
                    return Ok(());
                }
                match new.owner_job() {
                    Some(job_id) => self.on_workload_finished(job_id, &new).await,
                    None => self.on_foreign_workload_finished(&new).await,
                }
            }
        }
    }

    async fn on_node_changed(&self, old: &Node, new: &Node) -> Result<()> {
        if let Some(message) = removal_message(old, new) {
            for job in self.jobs_using(old, new).await? {
                self.on_node_removed(&job, new.name(), message).await?;
            }
        }

        if !old.is_template_installed() && new.is_template_installed() {
            for job in list_active_jobs(self.store.as_ref(), new.cluster(), OpsJobType::Preflight)
                .await?
            {
                debug!(
                    "node template installed on {}, requeue ops job {}",
                    new.name(),
                    job.name()
                );
                self.queue.add(job.name());
            }
        }
        Ok(())
    }

    /// Active jobs of the node's former cluster that list it, plus its owner
    async fn jobs_using(&self, old: &Node, new: &Node) -> Result<Vec<OpsJob>> {
        let node = new.name();
        let mut jobs = Vec::new();
        for job_type in NODE_JOB_TYPES {
            for job in list_active_jobs(self.store.as_ref(), old.cluster(), job_type).await? {
                if job.node_names().iter().any(|n| n == node) {
                    jobs.push(job);
                }
            }
        }

        // The label may already be gone from `new` when the node was unmanaged
        if let Some(owner) = new.owner_job().or(old.owner_job()) {
            if !jobs.iter().any(|j| j.name() == owner) {
                if let Some(job) = ignore_not_found(self.store.get_job(owner).await)? {
                    if !job.is_end() {
                        jobs.push(job);
                    }
                }
            }
        }
        Ok(jobs)
    }

    async fn on_node_removed(&self, job: &OpsJob, node: &str, message: &str) -> Result<()> {
        let job_id = job.name();
        if self.state.is_tracked(job_id) {
            if !self.state.set_phase(job_id, node, OpsJobPhase::Failed) {
                return Ok(());
            }
        } else if job.node_condition(node).is_some() {
            return Ok(());
        } else {
            // Recorded as a condition so tracking the job recovers the failure
            debug!(
                "ops job {} is not tracked, record the removal of node {}",
                job_id, node
            );
        }
        info!("{}, ops job {} fails node {}", message, job_id, node);

        let condition = status::node_condition(job.spec.job_type, node, false, message);
        status::update_condition(self.store.as_ref(), job_id, condition).await?;
        if let Some(monitor) = monitor_for(job.spec.job_type) {
            self.guard.delete_fault(node, monitor).await?;
        }
        self.guard.release_node(job_id, node).await?;
        self.queue.add(job_id);
        Ok(())
    }

    async fn on_workload_finished(&self, job_id: &str, workload: &Workload) -> Result<()> {
        let Some(phase) = workload_phase(workload) else {
            return Ok(());
        };
        let Some(job) = ignore_not_found(self.store.get_job(job_id).await)? else {
            return Ok(());
        };
        let node = workload.spec.node.as_str();

        let applied = self.state.set_phase(job_id, node, phase);
        if applied {
            let message = match phase {
                OpsJobPhase::Succeeded => String::new(),
                _ if workload.status.message.is_empty() => UNKNOWN_REASON.to_string(),
                _ => workload.status.message.clone(),
            };
            let condition = status::node_condition(
                job.spec.job_type,
                node,
                phase == OpsJobPhase::Succeeded,
                &message,
            );
            status::update_condition(self.store.as_ref(), job_id, condition).await?;
        }

        if let Some(monitor) = monitor_for(job.spec.job_type) {
            self.guard.delete_fault(node, monitor).await?;
        }
        self.guard.release_node(job_id, node).await?;

        if applied {
            info!(
                "workload {} finished ({}), requeue ops job {}",
                workload.name(),
                phase,
                job_id
            );
            self.queue.add(job_id);
        }
        Ok(())
    }

    /// A user workload ending may free nodes a security upgrade waits for
    async fn on_foreign_workload_finished(&self, workload: &Workload) -> Result<()> {
        let jobs =
            list_active_jobs(self.store.as_ref(), &workload.spec.cluster, OpsJobType::Addon)
                .await?;
        for job in jobs.iter().filter(|j| j.is_security_upgrade()) {
            self.queue.add(job.name());
        }
        Ok(())
    }
}
