//! In-memory resource store
//!
//! Keeps every object in `RwLock`-guarded maps and broadcasts a
//! [`StoreEvent`] after each write. Used by the standalone binary (seeded
//! from a JSON snapshot) and by tests.

use async_trait::async_trait;
use chrono::Utc;
use fleetops_core::{AddonTemplate, Fault, FaultConfig, Node, OpsJob, Workload};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{OpsError, Result};
use crate::store::{ResourceStore, StoreEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Serializable content of a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub jobs: Vec<OpsJob>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub faults: Vec<Fault>,
    #[serde(default)]
    pub fault_configs: Vec<FaultConfig>,
    #[serde(default)]
    pub addon_templates: Vec<AddonTemplate>,
    #[serde(default)]
    pub workloads: Vec<Workload>,
}

#[derive(Default)]
struct Objects {
    jobs: HashMap<String, OpsJob>,
    nodes: HashMap<String, Node>,
    faults: HashMap<String, Fault>,
    fault_configs: HashMap<String, FaultConfig>,
    addon_templates: HashMap<String, AddonTemplate>,
    workloads: HashMap<String, Workload>,
}

pub struct InMemoryStore {
    objects: RwLock<Objects>,
    events: broadcast::Sender<StoreEvent>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(Objects::default()),
            events,
        }
    }

    /// Creates a store holding the objects of `snapshot`
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let store = Self::new();
        {
            let mut objects = store.write();
            for job in snapshot.jobs {
                objects.jobs.insert(job.metadata.name.clone(), job);
            }
            for node in snapshot.nodes {
                objects.nodes.insert(node.metadata.name.clone(), node);
            }
            for fault in snapshot.faults {
                objects.faults.insert(fault.metadata.name.clone(), fault);
            }
            for config in snapshot.fault_configs {
                objects
                    .fault_configs
                    .insert(config.monitor_id.clone(), config);
            }
            for template in snapshot.addon_templates {
                objects
                    .addon_templates
                    .insert(template.metadata.name.clone(), template);
            }
            for workload in snapshot.workloads {
                objects
                    .workloads
                    .insert(workload.metadata.name.clone(), workload);
            }
        }
        store
    }

    /// Parses a JSON snapshot
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn put_node(&self, mut node: Node) {
        node.metadata.resource_version += 1;
        let old = self
            .write()
            .nodes
            .insert(node.metadata.name.clone(), node.clone());
        self.emit(StoreEvent::Node { old, new: node });
    }

    pub fn put_fault_config(&self, config: FaultConfig) {
        self.write()
            .fault_configs
            .insert(config.monitor_id.clone(), config);
    }

    pub fn put_addon_template(&self, template: AddonTemplate) {
        self.write()
            .addon_templates
            .insert(template.metadata.name.clone(), template);
    }

    /// Marks a node as being deleted
    pub fn delete_node(&self, name: &str) -> Result<()> {
        let (old, new) = {
            let mut objects = self.write();
            let node = objects
                .nodes
                .get_mut(name)
                .ok_or_else(|| OpsError::not_found("node", name))?;
            let old = node.clone();
            node.metadata.deletion_timestamp.get_or_insert_with(Utc::now);
            node.metadata.resource_version += 1;
            (old, node.clone())
        };
        self.emit(StoreEvent::Node {
            old: Some(old),
            new,
        });
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Objects> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Objects> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_job(&self, name: &str) -> Result<OpsJob> {
        self.read()
            .jobs
            .get(name)
            .cloned()
            .ok_or_else(|| OpsError::not_found("job", name))
    }

    async fn list_jobs(&self) -> Result<Vec<OpsJob>> {
        let mut jobs: Vec<OpsJob> = self.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(jobs)
    }

    async fn create_job(&self, mut job: OpsJob) -> Result<OpsJob> {
        {
            let mut objects = self.write();
            if objects.jobs.contains_key(&job.metadata.name) {
                return Err(OpsError::already_exists("job", &job.metadata.name));
            }
            job.metadata.creation_timestamp.get_or_insert_with(Utc::now);
            job.metadata.resource_version = 1;
            objects.jobs.insert(job.metadata.name.clone(), job.clone());
        }
        self.emit(StoreEvent::Job {
            name: job.metadata.name.clone(),
        });
        Ok(job)
    }

    async fn update_job(&self, job: &OpsJob) -> Result<OpsJob> {
        let updated = {
            let mut objects = self.write();
            let name = &job.metadata.name;
            let current = objects
                .jobs
                .get_mut(name)
                .ok_or_else(|| OpsError::not_found("job", name))?;
            if current.metadata.resource_version != job.metadata.resource_version {
                return Err(OpsError::conflict("job", name));
            }
            let mut updated = job.clone();
            updated.metadata.resource_version += 1;
            *current = updated.clone();
            updated
        };
        self.emit(StoreEvent::Job {
            name: updated.metadata.name.clone(),
        });
        Ok(updated)
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        {
            let mut objects = self.write();
            let job = objects
                .jobs
                .get_mut(name)
                .ok_or_else(|| OpsError::not_found("job", name))?;
            if job.metadata.finalizers.is_empty() {
                objects.jobs.remove(name);
                debug!("Job {} removed from store", name);
            } else {
                job.metadata.deletion_timestamp.get_or_insert_with(Utc::now);
                job.metadata.resource_version += 1;
            }
        }
        self.emit(StoreEvent::Job {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn remove_job_finalizer(&self, name: &str, finalizer: &str) -> Result<()> {
        {
            let mut objects = self.write();
            let job = objects
                .jobs
                .get_mut(name)
                .ok_or_else(|| OpsError::not_found("job", name))?;
            if !job.metadata.has_finalizer(finalizer) {
                return Ok(());
            }
            job.metadata.finalizers.retain(|f| f != finalizer);
            job.metadata.resource_version += 1;
            if job.metadata.is_deleting() && job.metadata.finalizers.is_empty() {
                objects.jobs.remove(name);
                debug!("Job {} removed from store", name);
            }
        }
        self.emit(StoreEvent::Job {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.read()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| OpsError::not_found("node", name))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.read().nodes.values().cloned().collect())
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let (old, updated) = {
            let mut objects = self.write();
            let name = &node.metadata.name;
            let current = objects
                .nodes
                .get_mut(name)
                .ok_or_else(|| OpsError::not_found("node", name))?;
            if current.metadata.resource_version != node.metadata.resource_version {
                return Err(OpsError::conflict("node", name));
            }
            let old = current.clone();
            let mut updated = node.clone();
            updated.metadata.resource_version += 1;
            *current = updated.clone();
            (old, updated)
        };
        self.emit(StoreEvent::Node {
            old: Some(old),
            new: updated.clone(),
        });
        Ok(updated)
    }

    async fn get_fault(&self, name: &str) -> Result<Fault> {
        self.read()
            .faults
            .get(name)
            .cloned()
            .ok_or_else(|| OpsError::not_found("fault", name))
    }

    async fn list_faults(&self) -> Result<Vec<Fault>> {
        Ok(self.read().faults.values().cloned().collect())
    }

    async fn create_fault(&self, mut fault: Fault) -> Result<Fault> {
        let mut objects = self.write();
        if objects.faults.contains_key(&fault.metadata.name) {
            return Err(OpsError::already_exists("fault", &fault.metadata.name));
        }
        fault.metadata.creation_timestamp.get_or_insert_with(Utc::now);
        fault.metadata.resource_version = 1;
        objects
            .faults
            .insert(fault.metadata.name.clone(), fault.clone());
        Ok(fault)
    }

    async fn delete_fault(&self, name: &str) -> Result<()> {
        self.write()
            .faults
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| OpsError::not_found("fault", name))
    }

    async fn fault_config(&self, monitor_id: &str) -> Result<Option<FaultConfig>> {
        Ok(self.read().fault_configs.get(monitor_id).cloned())
    }

    async fn get_addon_template(&self, name: &str) -> Result<AddonTemplate> {
        self.read()
            .addon_templates
            .get(name)
            .cloned()
            .ok_or_else(|| OpsError::not_found("addon template", name))
    }

    async fn get_workload(&self, name: &str) -> Result<Workload> {
        self.read()
            .workloads
            .get(name)
            .cloned()
            .ok_or_else(|| OpsError::not_found("workload", name))
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>> {
        Ok(self.read().workloads.values().cloned().collect())
    }

    async fn create_workload(&self, mut workload: Workload) -> Result<Workload> {
        {
            let mut objects = self.write();
            if objects.workloads.contains_key(&workload.metadata.name) {
                return Err(OpsError::already_exists("workload", &workload.metadata.name));
            }
            workload
                .metadata
                .creation_timestamp
                .get_or_insert_with(Utc::now);
            workload.metadata.resource_version = 1;
            objects
                .workloads
                .insert(workload.metadata.name.clone(), workload.clone());
        }
        self.emit(StoreEvent::Workload {
            old: None,
            new: workload.clone(),
        });
        Ok(workload)
    }

    async fn update_workload(&self, workload: &Workload) -> Result<Workload> {
        let (old, updated) = {
            let mut objects = self.write();
            let name = &workload.metadata.name;
            let current = objects
                .workloads
                .get_mut(name)
                .ok_or_else(|| OpsError::not_found("workload", name))?;
            if current.metadata.resource_version != workload.metadata.resource_version {
                return Err(OpsError::conflict("workload", name));
            }
            let old = current.clone();
            let mut updated = workload.clone();
            updated.metadata.resource_version += 1;
            *current = updated.clone();
            (old, updated)
        };
        self.emit(StoreEvent::Workload {
            old: Some(old),
            new: updated.clone(),
        });
        Ok(updated)
    }

    async fn delete_workload(&self, name: &str) -> Result<()> {
        self.write()
            .workloads
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| OpsError::not_found("workload", name))
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
