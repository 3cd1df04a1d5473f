//! Node exclusion: fault records and node ownership labels
//!
//! Two mechanisms keep operations off each other's nodes. The ownership
//! label on the node (`OPS_JOB_ID_LABEL`) is authoritative: a node owned by
//! one job is never claimed by another. Fault records are the externally
//! visible signal that tells schedulers to stay away while a job works on a
//! node; they are best-effort and never used as proof that a node is idle.

use fleetops_core::domain::fault::{
    ADDON_MONITOR_ID, DIAGNOSE_MONITOR_ID, FaultSpec, PREFLIGHT_MONITOR_ID, fault_id, taint_key,
};
use fleetops_core::domain::meta::{
    CLUSTER_ID_LABEL, NODE_ID_LABEL, OPS_JOB_ID_LABEL, OPS_JOB_TYPE_LABEL,
};
use fleetops_core::{Fault, FaultConfig, FaultNode, Node, ObjectMeta, OpsJob, OpsJobType};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{OpsError, Result, ignore_not_found};
use crate::store::{ResourceStore, modify_node};

/// Fault kind raised on a node while a job of `job_type` works on it
pub fn monitor_for(job_type: OpsJobType) -> Option<&'static str> {
    match job_type {
        OpsJobType::Addon => Some(ADDON_MONITOR_ID),
        OpsJobType::Preflight => Some(PREFLIGHT_MONITOR_ID),
        OpsJobType::Diagnose => Some(DIAGNOSE_MONITOR_ID),
        OpsJobType::Reboot | OpsJobType::DumpLog => None,
    }
}

#[derive(Clone)]
pub struct FaultGuard {
    store: Arc<dyn ResourceStore>,
}

impl FaultGuard {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Configuration of fault kind `monitor_id`, which must exist and be enabled
    pub async fn enabled_config(&self, monitor_id: &str) -> Result<FaultConfig> {
        let config = self
            .store
            .fault_config(monitor_id)
            .await?
            .ok_or_else(|| {
                OpsError::FaultConfig(format!("fault config {} is not found", monitor_id))
            })?;
        if !config.enabled {
            return Err(OpsError::FaultConfig(format!(
                "fault config {} is disabled",
                monitor_id
            )));
        }
        Ok(config)
    }

    /// Creates the fault excluding `node` while `job` works on it
    ///
    /// The fault kind must be configured and enabled. An existing fault with
    /// the same name is kept.
    pub async fn create_fault(
        &self,
        job: &OpsJob,
        node: &Node,
        monitor_id: &str,
        message: &str,
    ) -> Result<()> {
        let config = self.enabled_config(monitor_id).await?;

        let name = fault_id(node.name(), monitor_id);
        let mut metadata = ObjectMeta::named(&name);
        metadata.set_label(OPS_JOB_ID_LABEL, job.name());
        metadata.set_label(NODE_ID_LABEL, node.name());
        metadata.set_label(CLUSTER_ID_LABEL, node.cluster());

        let fault = Fault {
            metadata,
            spec: FaultSpec {
                monitor_id: monitor_id.to_string(),
                message: message.to_string(),
                action: config.action,
                node: Some(FaultNode {
                    cluster_name: node.cluster().to_string(),
                    admin_name: node.name().to_string(),
                    platform_name: node.platform_name().to_string(),
                }),
            },
        };

        match self.store.create_fault(fault).await {
            Ok(_) => {
                info!(
                    "create fault {}, job: {}, taint: {}",
                    name,
                    job.name(),
                    taint_key(monitor_id)
                );
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!("fault {} already exists", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes the fault of kind `monitor_id` on `node`, if present
    pub async fn delete_fault(&self, node: &str, monitor_id: &str) -> Result<()> {
        let name = fault_id(node, monitor_id);
        if ignore_not_found(self.store.delete_fault(&name).await)?.is_some() {
            info!("delete fault {}", name);
        }
        Ok(())
    }

    pub async fn has_fault(&self, node: &str, monitor_id: &str) -> Result<bool> {
        let name = fault_id(node, monitor_id);
        Ok(ignore_not_found(self.store.get_fault(&name).await)?.is_some())
    }

    /// Labels `node` as owned by `job`
    ///
    /// Fails with `NodeInUse` if another job owns it. Claiming a node the
    /// job already owns is a no-op.
    pub async fn claim_node(&self, job: &OpsJob, node: &str) -> Result<Node> {
        let job_type = job.spec.job_type.to_string();
        let claimed = modify_node(self.store.as_ref(), node, |current| {
            match current.owner_job() {
                Some(owner) if owner == job.name() => Ok(false),
                Some(owner) => Err(OpsError::NodeInUse {
                    node: node.to_string(),
                    owner: owner.to_string(),
                }),
                None => {
                    current.metadata.set_label(OPS_JOB_ID_LABEL, job.name());
                    current.metadata.set_label(OPS_JOB_TYPE_LABEL, &job_type);
                    Ok(true)
                }
            }
        })
        .await?;
        debug!("node {} is owned by ops job {}", node, job.name());
        Ok(claimed)
    }

    /// Removes `job_id`'s ownership labels from `node`
    ///
    /// Missing nodes and nodes owned by someone else are left alone.
    pub async fn release_node(&self, job_id: &str, node: &str) -> Result<()> {
        let released = modify_node(self.store.as_ref(), node, |current| {
            if current.owner_job() != Some(job_id) {
                return Ok(false);
            }
            current.metadata.remove_label(OPS_JOB_ID_LABEL);
            current.metadata.remove_label(OPS_JOB_TYPE_LABEL);
            Ok(true)
        })
        .await;
        if ignore_not_found(released)?.is_some() {
            debug!("node {} is released by ops job {}", node, job_id);
        }
        Ok(())
    }

    /// Removes every fault and node label left behind by a job
    pub async fn cleanup_job(&self, job_id: &str) -> Result<()> {
        for fault in self.store.list_faults().await? {
            if fault.metadata.label(OPS_JOB_ID_LABEL) != Some(job_id) {
                continue;
            }
            if let Err(e) = ignore_not_found(self.store.delete_fault(&fault.metadata.name).await) {
                warn!("failed to delete fault {}: {}", fault.metadata.name, e);
                return Err(e);
            }
            info!("delete fault {} of ops job {}", fault.metadata.name, job_id);
        }
        for node in self.store.list_nodes().await? {
            if node.owner_job() == Some(job_id) {
                self.release_node(job_id, node.name()).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use fleetops_core::FaultConfig;

    fn setup() -> (Arc<InMemoryStore>, FaultGuard) {
        let store = Arc::new(InMemoryStore::new());
        store.put_fault_config(FaultConfig {
            monitor_id: ADDON_MONITOR_ID.to_string(),
            action: "taint".to_string(),
            enabled: true,
        });
        store.put_node(Node::new("n1", "c1"));
        let guard = FaultGuard::new(store.clone());
        (store, guard)
    }

    #[tokio::test]
    async fn test_create_and_delete_fault() {
        let (store, guard) = setup();
        let job = OpsJob::new("job-a", OpsJobType::Addon, "c1");
        let node = store.get_node("n1").await.unwrap();

        guard
            .create_fault(&job, &node, ADDON_MONITOR_ID, "upgrading addon")
            .await
            .unwrap();
        // Second creation is tolerated
        guard
            .create_fault(&job, &node, ADDON_MONITOR_ID, "upgrading addon")
            .await
            .unwrap();

        let fault = store.get_fault("n1-addon").await.unwrap();
        assert_eq!(fault.spec.action, "taint");
        assert_eq!(fault.spec.node.unwrap().admin_name, "n1");
        assert!(guard.has_fault("n1", ADDON_MONITOR_ID).await.unwrap());

        guard.delete_fault("n1", ADDON_MONITOR_ID).await.unwrap();
        guard.delete_fault("n1", ADDON_MONITOR_ID).await.unwrap();
        assert!(!guard.has_fault("n1", ADDON_MONITOR_ID).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_or_missing_fault_config_is_non_retryable() {
        let (store, guard) = setup();
        store.put_fault_config(FaultConfig {
            monitor_id: ADDON_MONITOR_ID.to_string(),
            action: "taint".to_string(),
            enabled: false,
        });
        let job = OpsJob::new("job-a", OpsJobType::Addon, "c1");
        let node = store.get_node("n1").await.unwrap();

        let err = guard
            .create_fault(&job, &node, ADDON_MONITOR_ID, "")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        let err = guard
            .create_fault(&job, &node, "unknown-monitor", "")
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_node_is_never_claimed_by_two_jobs() {
        let (store, guard) = setup();
        let job_a = OpsJob::new("job-a", OpsJobType::Addon, "c1");
        let job_b = OpsJob::new("job-b", OpsJobType::Reboot, "c1");

        guard.claim_node(&job_a, "n1").await.unwrap();
        guard.claim_node(&job_a, "n1").await.unwrap();

        let err = guard.claim_node(&job_b, "n1").await.unwrap_err();
        assert!(matches!(err, OpsError::NodeInUse { .. }));
        assert!(err.is_retryable());

        // Releasing for the wrong job changes nothing
        guard.release_node("job-b", "n1").await.unwrap();
        assert_eq!(
            store.get_node("n1").await.unwrap().owner_job(),
            Some("job-a")
        );

        guard.release_node("job-a", "n1").await.unwrap();
        guard.claim_node(&job_b, "n1").await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_job_removes_faults_and_labels() {
        let (store, guard) = setup();
        let job = OpsJob::new("job-a", OpsJobType::Addon, "c1");
        let node = guard.claim_node(&job, "n1").await.unwrap();
        guard
            .create_fault(&job, &node, ADDON_MONITOR_ID, "")
            .await
            .unwrap();

        guard.cleanup_job("job-a").await.unwrap();

        assert!(store.list_faults().await.unwrap().is_empty());
        assert_eq!(store.get_node("n1").await.unwrap().owner_job(), None);
    }
}
