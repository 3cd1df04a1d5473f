//! Object metadata and well-known keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the ops job that currently owns an object (node, fault, workload)
pub const OPS_JOB_ID_LABEL: &str = "fleetops.io/ops-job-id";
/// Label carrying the type of the owning ops job
pub const OPS_JOB_TYPE_LABEL: &str = "fleetops.io/ops-job-type";
/// Label carrying the cluster an object belongs to
pub const CLUSTER_ID_LABEL: &str = "fleetops.io/cluster-id";
/// Label carrying the admin node an object refers to
pub const NODE_ID_LABEL: &str = "fleetops.io/node-id";
/// Label carrying the node flavor of a workload's target
pub const NODE_FLAVOR_LABEL: &str = "fleetops.io/node-flavor-id";

/// Node annotation recording whether the node template addon is installed
pub const NODE_TEMPLATE_INSTALLED_ANNOTATION: &str = "fleetops.io/node-template-installed";
/// Job annotation marking an addon job as a security upgrade
pub const SECURITY_UPGRADE_ANNOTATION: &str = "fleetops.io/security-upgrade";
/// Workload annotation that bypasses the scheduling queue
pub const SCHEDULE_IMMEDIATELY_ANNOTATION: &str = "fleetops.io/schedule-immediately";

/// Finalizer that blocks job deletion until cleanup has run
pub const OPS_JOB_FINALIZER: &str = "fleetops.io/ops-job-finalizer";

/// Metadata shared by every stored object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub finalizers: Vec<String>,

    pub creation_timestamp: Option<DateTime<Utc>>,

    pub deletion_timestamp: Option<DateTime<Utc>>,

    /// Bumped by the store on every write; stale writes are rejected
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            creation_timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Sets a label, returning true if the value changed
    pub fn set_label(&mut self, key: &str, value: &str) -> bool {
        if self.label(key) == Some(value) {
            return false;
        }
        self.labels.insert(key.to_string(), value.to_string());
        true
    }

    /// Removes a label, returning true if it was present
    pub fn remove_label(&mut self, key: &str) -> bool {
        self.labels.remove(key).is_some()
    }

    /// Sets an annotation, returning true if the value changed
    pub fn set_annotation(&mut self, key: &str, value: &str) -> bool {
        if self.annotation(key) == Some(value) {
            return false;
        }
        self.annotations.insert(key.to_string(), value.to_string());
        true
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}
