//! Ops job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::condition::Condition;
use crate::domain::meta::{OPS_JOB_FINALIZER, ObjectMeta, SECURITY_UPGRADE_ANNOTATION};

/// Parameter name for a target node. Repeated once per node.
pub const PARAMETER_NODE: &str = "node";
/// Parameter name for an addon template reference
pub const PARAMETER_ADDON_TEMPLATE: &str = "addon.template";
/// Parameter name for the node template a job installs or depends on
pub const PARAMETER_NODE_TEMPLATE: &str = "node.template";
/// Parameter name for an inline (base64 encoded) script
pub const PARAMETER_SCRIPT: &str = "script";
/// Parameter name for the image a workload-based job runs
pub const PARAMETER_IMAGE: &str = "image";
/// Parameter name for the entrypoint a workload-based job runs
pub const PARAMETER_ENTRYPOINT: &str = "entrypoint";

/// Availability ratio used when a job does not set one
pub const DEFAULT_AVAILABILITY_RATIO: f64 = 1.0;

/// A declarative fleet operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpsJob {
    pub metadata: ObjectMeta,
    pub spec: OpsJobSpec,
    #[serde(default)]
    pub status: OpsJobStatus,
}

/// Operation type of a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpsJobType {
    #[default]
    Addon,
    Preflight,
    Reboot,
    Diagnose,
    DumpLog,
}

impl std::fmt::Display for OpsJobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpsJobType::Addon => write!(f, "addon"),
            OpsJobType::Preflight => write!(f, "preflight"),
            OpsJobType::Reboot => write!(f, "reboot"),
            OpsJobType::Diagnose => write!(f, "diagnose"),
            OpsJobType::DumpLog => write!(f, "dumplog"),
        }
    }
}

impl std::str::FromStr for OpsJobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "addon" => Ok(OpsJobType::Addon),
            "preflight" => Ok(OpsJobType::Preflight),
            "reboot" => Ok(OpsJobType::Reboot),
            "diagnose" => Ok(OpsJobType::Diagnose),
            "dumplog" => Ok(OpsJobType::DumpLog),
            _ => Err(format!("unknown ops job type: {}", s)),
        }
    }
}

/// Phase of a job, and of a single node within a job
///
/// Transitions are monotonic: `Unset -> Pending -> Running -> {Succeeded | Failed}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpsJobPhase {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl OpsJobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, OpsJobPhase::Succeeded | OpsJobPhase::Failed)
    }
}

impl std::fmt::Display for OpsJobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpsJobPhase::Unset => write!(f, ""),
            OpsJobPhase::Pending => write!(f, "Pending"),
            OpsJobPhase::Running => write!(f, "Running"),
            OpsJobPhase::Succeeded => write!(f, "Succeeded"),
            OpsJobPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// A named input or output value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsJobSpec {
    #[serde(rename = "type")]
    pub job_type: OpsJobType,

    pub cluster: String,

    #[serde(default)]
    pub inputs: Vec<Parameter>,

    /// Wall-clock deadline counted from creation; 0 disables it
    #[serde(default)]
    pub timeout_second: u64,

    /// Delete the job this long after it finished; 0 keeps it forever
    #[serde(default)]
    pub ttl_seconds_after_finished: u64,

    /// Fraction of nodes that must succeed, in `[0, 1]`
    pub availability_ratio: Option<f64>,

    /// Explicit number of nodes processed concurrently
    pub batch_count: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsJobStatus {
    #[serde(default)]
    pub phase: OpsJobPhase,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// One condition per affected node (type = node name) plus summary conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default)]
    pub outputs: Vec<Parameter>,
}

impl OpsJob {
    /// Builds a job the way the admission layer would: labelled and finalized
    pub fn new(name: impl Into<String>, job_type: OpsJobType, cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        let mut metadata = ObjectMeta::named(name);
        metadata.set_label(crate::domain::meta::CLUSTER_ID_LABEL, &cluster);
        metadata.set_label(
            crate::domain::meta::OPS_JOB_TYPE_LABEL,
            &job_type.to_string(),
        );
        metadata.finalizers.push(OPS_JOB_FINALIZER.to_string());

        Self {
            metadata,
            spec: OpsJobSpec {
                job_type,
                cluster,
                ..Default::default()
            },
            status: OpsJobStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn with_input(mut self, name: &str, value: &str) -> Self {
        self.spec.inputs.push(Parameter::new(name, value));
        self
    }

    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for node in nodes {
            self.spec
                .inputs
                .push(Parameter::new(PARAMETER_NODE, node.as_ref()));
        }
        self
    }

    /// True once the job reached Succeeded or Failed
    pub fn is_end(&self) -> bool {
        self.status.phase.is_terminal()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status.phase, OpsJobPhase::Unset | OpsJobPhase::Pending)
    }

    /// True if `timeout_second` has elapsed since creation
    pub fn is_timeout(&self, now: DateTime<Utc>) -> bool {
        if self.spec.timeout_second == 0 {
            return false;
        }
        let Some(created) = self.metadata.creation_timestamp else {
            return false;
        };
        let deadline = created + chrono::Duration::seconds(self.spec.timeout_second as i64);
        now >= deadline
    }

    /// Time left before the deadline; `None` when no timeout is set
    pub fn timeout_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.spec.timeout_second == 0 {
            return None;
        }
        let created = self.metadata.creation_timestamp?;
        let deadline = created + chrono::Duration::seconds(self.spec.timeout_second as i64);
        Some((deadline - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Time left before the finished job should be deleted
    ///
    /// Returns `None` when no TTL applies (job not finished or TTL disabled),
    /// and `Some(Duration::ZERO)` once the TTL has elapsed.
    pub fn ttl_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.spec.ttl_seconds_after_finished == 0 || !self.is_end() {
            return None;
        }
        let finished = self.status.finished_at?;
        let expires =
            finished + chrono::Duration::seconds(self.spec.ttl_seconds_after_finished as i64);
        Some((expires - now).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn parameters(&self, name: &str) -> impl Iterator<Item = &Parameter> {
        self.spec.inputs.iter().filter(move |p| p.name == name)
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters(name).next()
    }

    /// Target node names in input order, duplicates removed
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for p in self.parameters(PARAMETER_NODE) {
            if !names.contains(&p.value) {
                names.push(p.value.clone());
            }
        }
        names
    }

    /// Availability ratio clamped to `[0, 1]`
    pub fn availability_ratio(&self) -> f64 {
        self.spec
            .availability_ratio
            .unwrap_or(DEFAULT_AVAILABILITY_RATIO)
            .clamp(0.0, 1.0)
    }

    /// Explicit batch width, ignoring a zero value
    pub fn batch_count(&self) -> Option<usize> {
        self.spec.batch_count.filter(|n| *n > 0)
    }

    pub fn is_security_upgrade(&self) -> bool {
        self.metadata.annotation(SECURITY_UPGRADE_ANNOTATION) == Some("true")
    }

    /// Node-keyed condition for `node`, if one was recorded
    pub fn node_condition(&self, node: &str) -> Option<&Condition> {
        self.status.conditions.iter().find(|c| c.type_ == node)
    }

    /// Output values with the given name
    pub fn output_values(&self, name: &str) -> Vec<&str> {
        self.status
            .outputs
            .iter()
            .filter(|p| p.name == name)
            .map(|p| p.value.as_str())
            .collect()
    }
}
