//! Shared fixtures for controller tests

use fleetops_core::domain::fault::{ADDON_MONITOR_ID, DIAGNOSE_MONITOR_ID, PREFLIGHT_MONITOR_ID};
use fleetops_core::{FaultConfig, Node, OpsJob};
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::store::{InMemoryStore, ResourceStore};

pub const CLUSTER: &str = "cluster-a";

/// Store with every fault kind enabled
pub fn store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for monitor in [ADDON_MONITOR_ID, PREFLIGHT_MONITOR_ID, DIAGNOSE_MONITOR_ID] {
        store.put_fault_config(FaultConfig {
            monitor_id: monitor.to_string(),
            action: "taint".to_string(),
            enabled: true,
        });
    }
    store
}

/// Ready nodes `node-00 .. node-{n-1}` in [`CLUSTER`]
pub fn node_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("node-{:02}", i)).collect()
}

pub fn add_nodes(store: &InMemoryStore, names: &[String]) {
    for name in names {
        let mut node = Node::new(name.as_str(), CLUSTER);
        node.spec.address = format!("10.0.0.{}", name.len());
        node.status.allocatable.cpu_millis = 96_000;
        node.status.allocatable.memory_bytes = 1 << 40;
        node.status.allocatable.gpu = 8;
        store.put_node(node);
    }
}

/// Retry budget small enough to exhaust quickly in tests
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(10))
}

pub async fn create_job(store: &InMemoryStore, job: OpsJob) -> OpsJob {
    store.create_job(job).await.unwrap()
}
