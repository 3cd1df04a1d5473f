//! Node domain model
//!
//! An admin node is a managed fleet member on which operations run.

use serde::{Deserialize, Serialize};

use crate::domain::meta::{NODE_TEMPLATE_INSTALLED_ANNOTATION, OPS_JOB_ID_LABEL, ObjectMeta};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Cluster the node is managed by; `None` means unmanaged
    pub cluster: Option<String>,

    pub node_flavor: Option<String>,

    /// Address used for remote commands
    pub address: String,

    /// GPU resource name advertised by the node, e.g. `amd.com/gpu`
    pub gpu_resource_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// The machine is reachable and provisioned
    #[serde(default)]
    pub machine_ready: bool,

    /// The node is ready to run workloads
    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub taints: Vec<Taint>,

    #[serde(default)]
    pub allocatable: Resources,

    /// Name of the node in the underlying platform
    pub platform_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub effect: String,
}

/// Schedulable capacity of a node or request of a workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    /// Millicores
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub ephemeral_storage_bytes: u64,
    #[serde(default)]
    pub gpu: u64,
}

impl Node {
    pub fn new(name: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: NodeSpec {
                cluster: Some(cluster.into()),
                ..Default::default()
            },
            status: NodeStatus {
                machine_ready: true,
                ready: true,
                ..Default::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Cluster membership; empty when unmanaged
    pub fn cluster(&self) -> &str {
        self.spec.cluster.as_deref().unwrap_or("")
    }

    pub fn platform_name(&self) -> &str {
        self.status
            .platform_name
            .as_deref()
            .unwrap_or(&self.metadata.name)
    }

    /// Job currently owning the node
    pub fn owner_job(&self) -> Option<&str> {
        self.metadata.label(OPS_JOB_ID_LABEL)
    }

    pub fn has_taint(&self, key: &str) -> bool {
        self.status.taints.iter().any(|t| t.key == key)
    }

    pub fn is_template_installed(&self) -> bool {
        self.metadata.annotation(NODE_TEMPLATE_INSTALLED_ANNOTATION) == Some("true")
    }
}
