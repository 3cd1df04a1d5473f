//! Addon executor
//!
//! Installs or upgrades addons by running their base64 encoded scripts on the
//! node over a remote session. Scripts passed inline as `script` parameters
//! always run; addon templates run when their GPU chip matches the node.

use async_trait::async_trait;
use fleetops_core::domain::fault::{ADDON_MONITOR_ID, NODE_NOT_READY_MONITOR_ID, taint_key};
use fleetops_core::domain::job::{
    PARAMETER_ADDON_TEMPLATE, PARAMETER_NODE_TEMPLATE, PARAMETER_SCRIPT,
};
use fleetops_core::domain::meta::NODE_TEMPLATE_INSTALLED_ANNOTATION;
use fleetops_core::{GpuChip, Node, OpsJob, OpsJobType};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backoff::{RetryPolicy, retry};
use crate::error::{OpsError, Result};
use crate::executor::{
    ActionExecutor, ActionOutcome, CycleContext, defer_if_in_use, managed_node,
};
use crate::fault::FaultGuard;
use crate::remote::{RemoteShell, base64_script_command};
use crate::store::{ResourceStore, modify_node};

struct AddonAction {
    name: String,
    command: String,
    chip: GpuChip,
    required: bool,
}

pub struct AddonExecutor {
    store: Arc<dyn ResourceStore>,
    guard: FaultGuard,
    shell: Arc<dyn RemoteShell>,
    retry: RetryPolicy,
}

impl AddonExecutor {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        shell: Arc<dyn RemoteShell>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            guard: FaultGuard::new(Arc::clone(&store)),
            store,
            shell,
            retry,
        }
    }

    /// Resolves the scripts and templates the job applies
    async fn actions(&self, job: &OpsJob) -> Result<Vec<AddonAction>> {
        let mut actions = Vec::new();
        for (i, param) in job.parameters(PARAMETER_SCRIPT).enumerate() {
            actions.push(AddonAction {
                name: format!("script-{}", i),
                command: base64_script_command(&param.value)?,
                chip: GpuChip::Any,
                required: true,
            });
        }
        for param in job.parameters(PARAMETER_ADDON_TEMPLATE) {
            let template = match self.store.get_addon_template(&param.value).await {
                Ok(template) => template,
                Err(e) if e.is_not_found() => {
                    return Err(OpsError::BadRequest(format!(
                        "addon template {} is not found",
                        param.value
                    )));
                }
                Err(e) => return Err(e),
            };
            let command = base64_script_command(&template.spec.action).map_err(|_| {
                OpsError::BadRequest(format!(
                    "the action of addon template {} is not valid base64",
                    template.name()
                ))
            })?;
            actions.push(AddonAction {
                name: template.name().to_string(),
                command,
                chip: template.spec.gpu_chip,
                required: template.spec.required,
            });
        }
        if actions.is_empty() {
            return Err(OpsError::BadRequest(
                "no addon templates or scripts found".to_string(),
            ));
        }
        Ok(actions)
    }

    async fn run(&self, node: &Node, command: &str) -> Result<()> {
        let session = self.shell.connect(node).await?;
        session.run(command).await?;
        Ok(())
    }

    /// Runs every matching action on the node
    async fn apply(&self, job: &OpsJob, node: &Node) -> Result<()> {
        let actions = self.actions(job).await?;
        let gpu = node.spec.gpu_resource_name.as_deref();
        let matched: Vec<&AddonAction> = actions.iter().filter(|a| a.chip.matches(gpu)).collect();
        if matched.is_empty() {
            return Err(OpsError::Internal("nothing to do on the node".to_string()));
        }

        for action in matched {
            let what = format!("addon {} on node {}", action.name, node.name());
            match retry(self.retry, &what, || self.run(node, &action.command)).await {
                Ok(()) => info!("{} applied, job: {}", what, job.name()),
                Err(e) if !action.required => {
                    warn!("{} failed and is skipped: {}", what, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Records the outcome on the node after a successful run
    async fn finish(&self, job: &OpsJob, node: &str) -> Result<()> {
        if job.parameter(PARAMETER_NODE_TEMPLATE).is_some() {
            modify_node(self.store.as_ref(), node, |n| {
                Ok(n.metadata
                    .set_annotation(NODE_TEMPLATE_INSTALLED_ANNOTATION, "true"))
            })
            .await?;
        }
        self.guard.delete_fault(node, ADDON_MONITOR_ID).await
    }
}

#[async_trait]
impl ActionExecutor for AddonExecutor {
    fn job_type(&self) -> OpsJobType {
        OpsJobType::Addon
    }

    async fn validate(&self, job: &OpsJob) -> Result<()> {
        if job.node_names().is_empty() {
            return Err(OpsError::BadRequest("no input nodes found".to_string()));
        }
        self.actions(job).await.map(|_| ())
    }

    /// Security upgrades stay away from nodes running user workloads
    async fn prepare(&self, job: &OpsJob) -> Result<CycleContext> {
        let mut cycle = CycleContext::default();
        if !job.is_security_upgrade() {
            return Ok(cycle);
        }
        for workload in self.store.list_workloads().await? {
            if workload.owner_job().is_none()
                && !workload.is_end()
                && workload.spec.cluster == job.spec.cluster
            {
                cycle.nodes_in_use.insert(workload.spec.node.clone());
            }
        }
        Ok(cycle)
    }

    async fn execute(
        &self,
        job: &OpsJob,
        node_name: &str,
        cycle: &CycleContext,
    ) -> Result<ActionOutcome> {
        let node = managed_node(self.store.as_ref(), job, node_name).await?;
        if !node.status.ready
            || !node.status.machine_ready
            || node.has_taint(&taint_key(NODE_NOT_READY_MONITOR_ID))
        {
            return Err(OpsError::NotReady(node_name.to_string()));
        }
        if cycle.nodes_in_use.contains(node_name) {
            info!(
                "node {} is running workloads, ops job {} waits for it",
                node_name,
                job.name()
            );
            return Ok(ActionOutcome::Deferred);
        }
        let Some(node) = defer_if_in_use(self.guard.claim_node(job, node_name).await)? else {
            return Ok(ActionOutcome::Deferred);
        };

        let mut result = self
            .guard
            .create_fault(
                job,
                &node,
                ADDON_MONITOR_ID,
                &format!("ops job {} is applying addons", job.name()),
            )
            .await;
        if result.is_ok() {
            result = self.apply(job, &node).await;
        }
        if result.is_ok() {
            result = self.finish(job, node_name).await;
        }

        if let Err(e) = self.guard.release_node(job.name(), node_name).await {
            warn!("failed to release node {}: {}", node_name, e);
        }
        result.map(|_| ActionOutcome::Succeeded)
    }
}
