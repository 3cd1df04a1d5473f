//! Fault domain model
//!
//! A fault is an exclusion record that keeps schedulers away from a node.

use serde::{Deserialize, Serialize};

use crate::domain::meta::ObjectMeta;

/// Fault kind raised while an addon is being applied
pub const ADDON_MONITOR_ID: &str = "addon";
/// Fault kind raised while a preflight check runs
pub const PREFLIGHT_MONITOR_ID: &str = "preflight";
/// Fault kind raised while a diagnostic runs
pub const DIAGNOSE_MONITOR_ID: &str = "diagnose";
/// Fault kind raised by the platform when a node stops being ready
pub const NODE_NOT_READY_MONITOR_ID: &str = "node-not-ready";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub metadata: ObjectMeta,
    pub spec: FaultSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultSpec {
    pub monitor_id: String,
    pub message: String,
    pub action: String,
    pub node: Option<FaultNode>,
}

/// Back reference from a fault to the node it excludes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultNode {
    pub cluster_name: String,
    pub admin_name: String,
    pub platform_name: String,
}

/// Per fault-kind configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    pub monitor_id: String,
    pub action: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Name of the fault excluding `node` for `monitor_id`
pub fn fault_id(node: &str, monitor_id: &str) -> String {
    format!("{}-{}", node, monitor_id).to_lowercase()
}

/// Taint key a fault of kind `monitor_id` puts on its node
pub fn taint_key(monitor_id: &str) -> String {
    format!("fleetops.io/{}", monitor_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_id_is_stable_and_lowercase() {
        assert_eq!(fault_id("Node-A", ADDON_MONITOR_ID), "node-a-addon");
        assert_eq!(fault_id("node-a", "addon"), fault_id("NODE-A", "ADDON"));
    }
}
