//! Reboot executor
//!
//! Fire-and-forget: the reboot command is sent once and its result ignored,
//! since the session drops as the node goes down. Opening the session is
//! retried within the retry budget.

use async_trait::async_trait;
use fleetops_core::domain::job::PARAMETER_NODE;
use fleetops_core::{OpsJob, OpsJobPhase, OpsJobType, Parameter};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backoff::{RetryPolicy, retry};
use crate::error::Result;
use crate::executor::{
    ActionExecutor, ActionOutcome, CycleContext, defer_if_in_use, managed_node,
};
use crate::fault::FaultGuard;
use crate::remote::RemoteShell;
use crate::status;
use crate::store::ResourceStore;

const REBOOT_COMMAND: &str = "sudo reboot";

pub struct RebootExecutor {
    store: Arc<dyn ResourceStore>,
    guard: FaultGuard,
    shell: Arc<dyn RemoteShell>,
    retry: RetryPolicy,
}

impl RebootExecutor {
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

    fn is_processed(job: &OpsJob, node: &str) -> bool {
        job.output_values(PARAMETER_NODE).contains(&node)
    }
}

#[async_trait]
impl ActionExecutor for RebootExecutor {
    fn job_type(&self) -> OpsJobType {
        OpsJobType::Reboot
    }

    async fn execute(
        &self,
        job: &OpsJob,
        node_name: &str,
        _cycle: &CycleContext,
    ) -> Result<ActionOutcome> {
        if Self::is_processed(job, node_name) {
            return Ok(ActionOutcome::Succeeded);
        }
        managed_node(self.store.as_ref(), job, node_name).await?;
        let Some(node) = defer_if_in_use(self.guard.claim_node(job, node_name).await)? else {
            return Ok(ActionOutcome::Deferred);
        };

        let what = format!("reboot session on node {}", node_name);
        let (shell, target) = (&self.shell, &node);
        let session = retry(self.retry, &what, || async move {
            Ok(shell.connect(target).await?)
        })
        .await;
        let session = match session {
            Ok(session) => session,
            Err(e) => {
                if let Err(release_err) = self.guard.release_node(job.name(), node_name).await {
                    warn!("failed to release node {}: {}", node_name, release_err);
                }
                return Err(e);
            }
        };

        if let Err(e) = session.run(REBOOT_COMMAND).await {
            debug!("reboot command on {} returned: {}", node_name, e);
        }
        info!("node {} rebooted by ops job {}", node_name, job.name());

        status::append_output(
            self.store.as_ref(),
            job.name(),
            Parameter::new(PARAMETER_NODE, node_name),
        )
        .await?;
        self.guard.release_node(job.name(), node_name).await?;
        Ok(ActionOutcome::Succeeded)
    }

    /// Nodes already listed in the outputs were rebooted before a restart
    async fn recover(&self, job: &OpsJob, node: &str) -> Result<Option<OpsJobPhase>> {
        Ok(Self::is_processed(job, node).then_some(OpsJobPhase::Succeeded))
    }
}
