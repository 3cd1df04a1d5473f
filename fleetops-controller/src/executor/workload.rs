//! Workload executor
//!
//! Preflight and diagnose jobs do not run commands themselves. They create
//! one workload per node and return; the workload's terminal phase arrives
//! later through the event feedback handlers.

use async_trait::async_trait;
use fleetops_core::domain::job::{PARAMETER_ENTRYPOINT, PARAMETER_IMAGE, PARAMETER_NODE_TEMPLATE};
use fleetops_core::domain::meta::{
    CLUSTER_ID_LABEL, NODE_FLAVOR_LABEL, NODE_ID_LABEL, OPS_JOB_ID_LABEL, OPS_JOB_TYPE_LABEL,
    SCHEDULE_IMMEDIATELY_ANNOTATION,
};
use fleetops_core::{
    Node, ObjectMeta, OpsJob, OpsJobPhase, OpsJobType, Workload, WorkloadPhase, WorkloadSpec,
};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{OpsError, Result, ignore_not_found};
use crate::executor::{
    ActionExecutor, ActionOutcome, CycleContext, defer_if_in_use, managed_node,
};
use crate::fault::{FaultGuard, monitor_for};
use crate::store::ResourceStore;

/// Name of the workload a job runs on `node`
///
/// A single-node job reuses the job name.
pub fn workload_name(job: &OpsJob, node: &str) -> String {
    if job.node_names().len() <= 1 {
        job.name().to_string()
    } else {
        format!("{}-{}", job.name(), node)
    }
}

/// Node phase for a finished workload, `None` while it is still running
pub fn workload_phase(workload: &Workload) -> Option<OpsJobPhase> {
    match workload.status.phase {
        WorkloadPhase::Succeeded => Some(OpsJobPhase::Succeeded),
        WorkloadPhase::Failed | WorkloadPhase::Stopped => Some(OpsJobPhase::Failed),
        WorkloadPhase::Pending | WorkloadPhase::Running => None,
    }
}

pub struct WorkloadExecutor {
    job_type: OpsJobType,
    store: Arc<dyn ResourceStore>,
    guard: FaultGuard,
    default_image: String,
}

impl WorkloadExecutor {
    pub fn new(
        job_type: OpsJobType,
        store: Arc<dyn ResourceStore>,
        default_image: impl Into<String>,
    ) -> Self {
        Self {
            job_type,
            guard: FaultGuard::new(Arc::clone(&store)),
            store,
            default_image: default_image.into(),
        }
    }

    fn build_workload(&self, job: &OpsJob, node: &Node) -> Workload {
        let mut metadata = ObjectMeta::named(workload_name(job, node.name()));
        metadata.set_label(OPS_JOB_ID_LABEL, job.name());
        metadata.set_label(OPS_JOB_TYPE_LABEL, &job.spec.job_type.to_string());
        metadata.set_label(CLUSTER_ID_LABEL, &job.spec.cluster);
        metadata.set_label(NODE_ID_LABEL, node.name());
        if let Some(flavor) = &node.spec.node_flavor {
            metadata.set_label(NODE_FLAVOR_LABEL, flavor);
        }
        metadata.set_annotation(SCHEDULE_IMMEDIATELY_ANNOTATION, "true");

        let image = job
            .parameter(PARAMETER_IMAGE)
            .map(|p| p.value.clone())
            .unwrap_or_else(|| self.default_image.clone());
        let entrypoint = job
            .parameter(PARAMETER_ENTRYPOINT)
            .map(|p| p.value.clone())
            .unwrap_or_default();

        Workload {
            metadata,
            spec: WorkloadSpec {
                cluster: job.spec.cluster.clone(),
                node: node.name().to_string(),
                image,
                entrypoint,
                resources: node.status.allocatable.clone(),
            },
            status: Default::default(),
        }
    }

    /// Preflight jobs that depend on a node template wait for it
    fn is_eligible(&self, job: &OpsJob, node: &Node) -> bool {
        self.job_type != OpsJobType::Preflight
            || job.parameter(PARAMETER_NODE_TEMPLATE).is_none()
            || node.is_template_installed()
    }
}

#[async_trait]
impl ActionExecutor for WorkloadExecutor {
    fn job_type(&self) -> OpsJobType {
        self.job_type
    }

    async fn execute(
        &self,
        job: &OpsJob,
        node_name: &str,
        _cycle: &CycleContext,
    ) -> Result<ActionOutcome> {
        let node = managed_node(self.store.as_ref(), job, node_name).await?;
        if !node.status.machine_ready {
            return Err(OpsError::NotReady(node_name.to_string()));
        }
        if !self.is_eligible(job, &node) {
            debug!(
                "node {} has no node template installed yet, ops job {} waits",
                node_name,
                job.name()
            );
            return Ok(ActionOutcome::Deferred);
        }
        let Some(node) = defer_if_in_use(self.guard.claim_node(job, node_name).await)? else {
            return Ok(ActionOutcome::Deferred);
        };

        if let Some(monitor) = monitor_for(self.job_type) {
            self.guard
                .create_fault(
                    job,
                    &node,
                    monitor,
                    &format!("ops job {} is running {} on the node", job.name(), self.job_type),
                )
                .await?;
        }

        let workload = self.build_workload(job, &node);
        let name = workload.metadata.name.clone();
        match self.store.create_workload(workload).await {
            Ok(_) => info!("create workload {} for ops job {}", name, job.name()),
            Err(e) if e.is_already_exists() => debug!("workload {} already exists", name),
            Err(e) => return Err(e),
        }
        Ok(ActionOutcome::Dispatched)
    }

    /// A node whose workload exists is running or finished
    async fn recover(&self, job: &OpsJob, node: &str) -> Result<Option<OpsJobPhase>> {
        let name = workload_name(job, node);
        let Some(workload) = ignore_not_found(self.store.get_workload(&name).await)? else {
            return Ok(None);
        };
        if workload.owner_job() != Some(job.name()) {
            return Ok(None);
        }
        Ok(Some(
            workload_phase(&workload).unwrap_or(OpsJobPhase::Running),
        ))
    }

    async fn cleanup(&self, job: &OpsJob) -> Result<()> {
        for workload in self.store.list_workloads().await? {
            if workload.owner_job() != Some(job.name()) {
                continue;
            }
            ignore_not_found(self.store.delete_workload(workload.name()).await)?;
            info!("delete workload {} of ops job {}", workload.name(), job.name());
        }
        Ok(())
    }
}
