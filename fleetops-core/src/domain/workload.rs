//! Workload domain model
//!
//! A workload is an ephemeral execution unit bound to exactly one
//! (job, node) pair. Its terminal phase is the outcome of that node.

use serde::{Deserialize, Serialize};

use crate::domain::meta::{OPS_JOB_ID_LABEL, ObjectMeta};
use crate::domain::node::Resources;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub metadata: ObjectMeta,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    pub cluster: String,
    /// Admin node the workload is pinned to
    pub node: String,
    pub image: String,
    pub entrypoint: String,
    pub resources: Resources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(default)]
    pub phase: WorkloadPhase,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl Workload {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Ops job that created the workload
    pub fn owner_job(&self) -> Option<&str> {
        self.metadata.label(OPS_JOB_ID_LABEL)
    }

    pub fn is_end(&self) -> bool {
        matches!(
            self.status.phase,
            WorkloadPhase::Succeeded | WorkloadPhase::Failed | WorkloadPhase::Stopped
        )
    }
}
